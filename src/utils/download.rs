use std::path::PathBuf;

/// Root of the on-disk HTTP cache.
pub fn bioquery_cache_dir() -> PathBuf {
    match dirs::cache_dir() {
        Some(dir) => dir.join("bioquery"),
        None => std::env::temp_dir().join("bioquery"),
    }
}

/// Only place the MCP server reads resume tokens from.
pub fn bioquery_token_dir() -> PathBuf {
    bioquery_cache_dir().join("tokens")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_dir_is_namespaced() {
        assert!(bioquery_cache_dir().ends_with("bioquery"));
        assert!(bioquery_token_dir().starts_with(bioquery_cache_dir()));
    }
}
