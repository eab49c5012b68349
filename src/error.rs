#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum BioQueryError {
    #[error("HTTP client initialization failed: {0}")]
    HttpClientInit(reqwest::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    #[error("API error from {api}: {message}")]
    Api { api: String, message: String },

    #[error("API error from {api}: HTTP {status}: {message}")]
    ApiStatus {
        api: String,
        status: u16,
        message: String,
    },

    #[error("API JSON error from {api}: {source}")]
    ApiJson {
        api: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{entity} '{id}' not found.\n\n{suggestion}")]
    NotFound {
        entity: String,
        id: String,
        suggestion: String,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid synonym index: {0}")]
    InvalidSynonymIndex(String),

    #[error("Source unavailable: {source_name} is not available. {reason}\n\nTry: {suggestion}")]
    SourceUnavailable {
        source_name: String,
        reason: String,
        suggestion: String,
    },

    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
