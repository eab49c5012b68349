//! Source collaborators and shared HTTP utilities for upstream biomedical APIs.

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use http_cache_reqwest::{
    CACacheManager, Cache, CacheMode, CacheOptions, HttpCache, HttpCacheOptions,
};
use reqwest::header::{CACHE_CONTROL, HeaderMap, HeaderValue};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::entities::ResolvedEntities;
use crate::error::BioQueryError;
use crate::intent::IntentKind;

pub(crate) mod chembl;
pub(crate) mod clinicaltrials;
pub(crate) mod fixtures;
pub(crate) mod hpa;
pub(crate) mod opentargets;
pub(crate) mod rate_limit;
pub mod registry;

pub use registry::SourceRegistry;

const ERROR_BODY_MAX_BYTES: usize = 2048;
pub(crate) const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// One upstream record, keyed by the source's own field names.
pub type NativeRecord = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    #[serde(rename = "OpenTargets", alias = "opentargets")]
    OpenTargets,
    #[serde(
        rename = "ClinicalTrials.gov",
        alias = "clinicaltrials",
        alias = "ctgov"
    )]
    ClinicalTrials,
    #[serde(rename = "ChEMBL", alias = "chembl")]
    Chembl,
    #[serde(rename = "Human Protein Atlas", alias = "hpa")]
    ProteinAtlas,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::OpenTargets,
        SourceKind::ClinicalTrials,
        SourceKind::Chembl,
        SourceKind::ProteinAtlas,
    ];

    /// Name shown to users and used as the `source` provenance tag.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::OpenTargets => "OpenTargets",
            Self::ClinicalTrials => "ClinicalTrials.gov",
            Self::Chembl => "ChEMBL",
            Self::ProteinAtlas => "Human Protein Atlas",
        }
    }

    /// Short machine key used in logs, errors and rate-limit policies.
    pub fn api_name(self) -> &'static str {
        match self {
            Self::OpenTargets => "opentargets",
            Self::ClinicalTrials => "clinicaltrials",
            Self::Chembl => "chembl",
            Self::ProteinAtlas => "hpa",
        }
    }

    pub(crate) fn default_base(self) -> &'static str {
        match self {
            Self::OpenTargets => "https://api.platform.opentargets.org/api/v4",
            Self::ClinicalTrials => "https://clinicaltrials.gov/api/v2",
            Self::Chembl => "https://www.ebi.ac.uk/chembl/api/data",
            Self::ProteinAtlas => "https://www.proteinatlas.org",
        }
    }

    pub(crate) fn base_env(self) -> &'static str {
        match self {
            Self::OpenTargets => "BIOQUERY_OPENTARGETS_BASE",
            Self::ClinicalTrials => "BIOQUERY_CLINICALTRIALS_BASE",
            Self::Chembl => "BIOQUERY_CHEMBL_BASE",
            Self::ProteinAtlas => "BIOQUERY_HPA_BASE",
        }
    }

    /// Intents this source can answer; anything else yields zero rows.
    pub fn supports(self, intent: IntentKind) -> bool {
        match self {
            Self::OpenTargets => true,
            Self::ClinicalTrials => {
                matches!(intent, IntentKind::ListDiseases | IntentKind::ListDrugs)
            }
            Self::Chembl => matches!(
                intent,
                IntentKind::ListDiseases | IntentKind::ListDrugs | IntentKind::ListTargets
            ),
            Self::ProteinAtlas => intent == IntentKind::ListExpression,
        }
    }

    pub fn parse(value: &str) -> Result<Self, BioQueryError> {
        let normalized = value.trim().to_ascii_lowercase().replace([' ', '_', '-'], "");
        match normalized.as_str() {
            "opentargets" | "ot" => Ok(Self::OpenTargets),
            "clinicaltrials.gov" | "clinicaltrials" | "ctgov" => Ok(Self::ClinicalTrials),
            "chembl" => Ok(Self::Chembl),
            "humanproteinatlas" | "proteinatlas" | "hpa" => Ok(Self::ProteinAtlas),
            _ => Err(BioQueryError::InvalidArgument(format!(
                "Unsupported database '{}'. Expected one of: {}",
                value.trim(),
                SourceKind::ALL.map(SourceKind::display_name).join(", ")
            ))),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceErrorReason {
    Timeout,
    RateLimited,
    MalformedResponse,
    NotFound,
    Unavailable,
}

impl SourceErrorReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::MalformedResponse => "malformed_response",
            Self::NotFound => "not_found",
            Self::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for SourceErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-source failure. Never aborts sibling sources.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{reason}: {detail}")]
pub struct SourceError {
    pub reason: SourceErrorReason,
    pub detail: String,
}

impl SourceError {
    pub fn new(reason: SourceErrorReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            SourceErrorReason::Timeout,
            format!("no response within {}s", after.as_secs_f64()),
        )
    }
}

fn classify_reqwest(err: &reqwest::Error) -> SourceErrorReason {
    if err.is_timeout() {
        return SourceErrorReason::Timeout;
    }
    match err.status().map(|s| s.as_u16()) {
        Some(429) => SourceErrorReason::RateLimited,
        Some(404) => SourceErrorReason::NotFound,
        _ if err.is_decode() => SourceErrorReason::MalformedResponse,
        _ => SourceErrorReason::Unavailable,
    }
}

impl From<BioQueryError> for SourceError {
    fn from(err: BioQueryError) -> Self {
        let reason = match &err {
            BioQueryError::ApiStatus { status: 429, .. } => SourceErrorReason::RateLimited,
            BioQueryError::ApiStatus { status: 404, .. } | BioQueryError::NotFound { .. } => {
                SourceErrorReason::NotFound
            }
            BioQueryError::ApiJson { .. } | BioQueryError::Json(_) | BioQueryError::Api { .. } => {
                SourceErrorReason::MalformedResponse
            }
            BioQueryError::Http(inner) => classify_reqwest(inner),
            BioQueryError::HttpMiddleware(reqwest_middleware::Error::Reqwest(inner)) => {
                classify_reqwest(inner)
            }
            _ => SourceErrorReason::Unavailable,
        };
        Self::new(reason, err.to_string())
    }
}

/// Collaborator contract every data source implements.
///
/// An intent the source cannot answer, or a query missing the entity the
/// source needs, is a valid empty result rather than an error.
#[async_trait]
pub trait BiomedicalSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn query(
        &self,
        entities: &ResolvedEntities,
        intent: IntentKind,
    ) -> Result<Vec<NativeRecord>, SourceError>;
}

/// Inserts `value` under `key` only when present, so missing upstream
/// fields stay missing instead of becoming empty strings.
pub(crate) fn put(record: &mut NativeRecord, key: &str, value: Option<impl Into<Value>>) {
    if let Some(value) = value {
        record.insert(key.to_string(), value.into());
    }
}

pub(crate) fn clean(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

static HTTP_CLIENT: OnceLock<ClientWithMiddleware> = OnceLock::new();

tokio::task_local! {
    static NO_CACHE: bool;
}

pub(crate) async fn with_no_cache<R, F>(no_cache: bool, fut: F) -> R
where
    F: Future<Output = R>,
{
    NO_CACHE.scope(no_cache, fut).await
}

pub(crate) fn apply_cache_mode(req: RequestBuilder) -> RequestBuilder {
    match NO_CACHE.try_with(|v| *v) {
        Ok(true) => req.with_extension(CacheMode::NoStore),
        _ => req,
    }
}

pub(crate) fn env_base(default: &'static str, env_var: &str) -> Cow<'static, str> {
    std::env::var(env_var)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(Cow::Owned)
        .unwrap_or_else(|| Cow::Borrowed(default))
}

pub(crate) fn source_base(kind: SourceKind) -> Cow<'static, str> {
    env_base(kind.default_base(), kind.base_env())
}

pub(crate) fn join_endpoint(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

pub(crate) fn is_valid_gene_symbol(symbol: &str) -> bool {
    !symbol.is_empty()
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Returns a shared HTTP client with retry and caching middleware.
///
/// - Retry: 3 attempts with exponential backoff for transient errors
/// - Cache: Disk-based HTTP cache in XDG cache directory
/// - Cache TTL: `Cache-Control: max-stale=86400` makes “no caching headers” responses usable for 24h
pub(crate) fn shared_client() -> Result<ClientWithMiddleware, BioQueryError> {
    if let Some(client) = HTTP_CLIENT.get() {
        return Ok(client.clone());
    }

    let mut default_headers = HeaderMap::new();
    default_headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-stale=86400"));

    let base_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("bioquery/", env!("CARGO_PKG_VERSION")))
        .default_headers(default_headers)
        .build()
        .map_err(BioQueryError::HttpClientInit)?;

    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

    let cache_path = crate::utils::download::bioquery_cache_dir().join("http-cacache");
    std::fs::create_dir_all(&cache_path)?;

    let cache_options = HttpCacheOptions {
        cache_options: Some(CacheOptions {
            shared: true,
            ..CacheOptions::default()
        }),
        ..HttpCacheOptions::default()
    };

    let client = ClientBuilder::new(base_client)
        .with(Cache(HttpCache {
            mode: CacheMode::Default,
            manager: CACacheManager { path: cache_path },
            options: cache_options,
        }))
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .with(rate_limit::RateLimitMiddleware::new())
        .build();

    match HTTP_CLIENT.set(client.clone()) {
        Ok(()) => Ok(client),
        Err(_) => HTTP_CLIENT.get().cloned().ok_or_else(|| BioQueryError::Api {
            api: "http-client".into(),
            message: "Shared HTTP client initialization race".into(),
        }),
    }
}

pub(crate) fn body_excerpt(bytes: &[u8]) -> String {
    let full = String::from_utf8_lossy(bytes);

    let truncated: &str = if full.len() > ERROR_BODY_MAX_BYTES {
        let mut end = ERROR_BODY_MAX_BYTES;
        while end > 0 && !full.is_char_boundary(end) {
            end -= 1;
        }
        &full[..end]
    } else {
        full.as_ref()
    };

    let mut s = truncated.trim().replace(['\n', '\r', '\t'], " ");
    if full.len() > ERROR_BODY_MAX_BYTES {
        s.push_str(" …");
    }
    s
}

pub(crate) fn ensure_json_content_type(
    api: &str,
    content_type: Option<&HeaderValue>,
    body: &[u8],
) -> Result<(), BioQueryError> {
    let Some(content_type) = content_type else {
        return Ok(());
    };

    let raw = match content_type.to_str() {
        Ok(v) => v.trim(),
        Err(_) => {
            warn!(
                source = api,
                "Response content-type header was not valid UTF-8; attempting JSON parse"
            );
            return Ok(());
        }
    };
    if raw.is_empty() {
        return Ok(());
    }

    let media_type = raw
        .split(';')
        .next()
        .map(str::trim)
        .unwrap_or_default()
        .to_ascii_lowercase();
    let is_html = matches!(media_type.as_str(), "text/html" | "application/xhtml+xml");
    if is_html {
        return Err(BioQueryError::Api {
            api: api.to_string(),
            message: format!(
                "Unexpected HTML response (content-type: {raw}): {}",
                body_excerpt(body)
            ),
        });
    }

    let is_json = media_type == "application/json"
        || media_type == "text/json"
        || media_type.ends_with("+json");
    if !is_json {
        warn!(
            source = api,
            content_type = raw,
            "Unexpected non-JSON content type; attempting JSON parse for compatibility"
        );
    }

    Ok(())
}

pub(crate) async fn read_limited_body(
    mut resp: reqwest::Response,
    api: &str,
) -> Result<Vec<u8>, BioQueryError> {
    let mut body: Vec<u8> = Vec::new();

    while let Some(chunk) = resp.chunk().await? {
        let next_len = body.len().saturating_add(chunk.len());
        if next_len > DEFAULT_MAX_BODY_BYTES {
            return Err(BioQueryError::Api {
                api: api.to_string(),
                message: format!("Response body exceeded {DEFAULT_MAX_BODY_BYTES} bytes"),
            });
        }
        body.extend_from_slice(&chunk);
    }

    Ok(body)
}

/// Sends `req` and decodes a JSON body, keeping the HTTP status on failure
/// so callers can tell rate limiting from a missing resource.
pub(crate) async fn send_json<T: DeserializeOwned>(
    kind: SourceKind,
    req: RequestBuilder,
) -> Result<T, BioQueryError> {
    let api = kind.api_name();
    let resp = apply_cache_mode(req.with_extension(kind)).send().await?;
    let status = resp.status();
    let content_type = resp.headers().get(reqwest::header::CONTENT_TYPE).cloned();
    let bytes = read_limited_body(resp, api).await?;
    if !status.is_success() {
        return Err(BioQueryError::ApiStatus {
            api: api.to_string(),
            status: status.as_u16(),
            message: body_excerpt(&bytes),
        });
    }
    ensure_json_content_type(api, content_type.as_ref(), &bytes)?;
    serde_json::from_slice(&bytes).map_err(|source| BioQueryError::ApiJson {
        api: api.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn ensure_json_content_type_rejects_html() {
        let err = ensure_json_content_type(
            "chembl",
            Some(&HeaderValue::from_static("text/html; charset=utf-8")),
            b"<html><body>upstream error</body></html>",
        )
        .expect_err("html should be rejected");
        let msg = err.to_string();
        assert!(msg.contains("chembl"));
        assert!(msg.contains("HTML"));
    }

    #[test]
    fn ensure_json_content_type_allows_non_json_compat_mode() {
        let ok = ensure_json_content_type(
            "chembl",
            Some(&HeaderValue::from_static("text/plain")),
            b"{\"ok\":true}",
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn source_kind_parses_display_names_and_aliases() {
        assert_eq!(SourceKind::parse("OpenTargets").unwrap(), SourceKind::OpenTargets);
        assert_eq!(
            SourceKind::parse("ClinicalTrials.gov").unwrap(),
            SourceKind::ClinicalTrials
        );
        assert_eq!(SourceKind::parse("ctgov").unwrap(), SourceKind::ClinicalTrials);
        assert_eq!(SourceKind::parse("chembl").unwrap(), SourceKind::Chembl);
        assert_eq!(
            SourceKind::parse("Human Protein Atlas").unwrap(),
            SourceKind::ProteinAtlas
        );
        assert_eq!(SourceKind::parse("HPA").unwrap(), SourceKind::ProteinAtlas);
        let err = SourceKind::parse("ClinVar").unwrap_err();
        assert!(err.to_string().contains("Unsupported database 'ClinVar'"));
    }

    #[test]
    fn source_kind_serializes_as_display_name() {
        let json = serde_json::to_string(&SourceKind::ClinicalTrials).unwrap();
        assert_eq!(json, "\"ClinicalTrials.gov\"");
        let parsed: SourceKind = serde_json::from_str("\"hpa\"").unwrap();
        assert_eq!(parsed, SourceKind::ProteinAtlas);
    }

    #[test]
    fn api_errors_classify_into_source_reasons() {
        let cases = [
            (
                BioQueryError::ApiStatus {
                    api: "opentargets".into(),
                    status: 429,
                    message: String::new(),
                },
                SourceErrorReason::RateLimited,
            ),
            (
                BioQueryError::ApiStatus {
                    api: "chembl".into(),
                    status: 404,
                    message: String::new(),
                },
                SourceErrorReason::NotFound,
            ),
            (
                BioQueryError::ApiStatus {
                    api: "chembl".into(),
                    status: 503,
                    message: String::new(),
                },
                SourceErrorReason::Unavailable,
            ),
            (
                BioQueryError::Api {
                    api: "hpa".into(),
                    message: "Unexpected HTML response".into(),
                },
                SourceErrorReason::MalformedResponse,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(SourceError::from(err).reason, expected);
        }

        let json_err = serde_json::from_str::<Value>("{").unwrap_err();
        let err = BioQueryError::ApiJson {
            api: "opentargets".into(),
            source: json_err,
        };
        let classified = SourceError::from(err);
        assert_eq!(classified.reason, SourceErrorReason::MalformedResponse);
        assert!(classified.detail.contains("opentargets"));
    }

    #[test]
    fn put_skips_missing_values() {
        let mut record = NativeRecord::new();
        put(&mut record, "a", Some("x"));
        put(&mut record, "b", None::<String>);
        assert_eq!(record.len(), 1);
        assert_eq!(clean(Some("  ")), None);
    }

    #[tokio::test]
    async fn send_json_keeps_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let client = reqwest_middleware::ClientBuilder::new(reqwest::Client::new()).build();
        let req = client.get(format!("{}/limited", server.uri()));
        let err = send_json::<Value>(SourceKind::Chembl, req)
            .await
            .expect_err("429 should fail");
        assert!(matches!(err, BioQueryError::ApiStatus { status: 429, .. }));
        assert_eq!(SourceError::from(err).reason, SourceErrorReason::RateLimited);
    }
}
