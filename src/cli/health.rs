use std::sync::OnceLock;
use std::time::{Duration, Instant};

use futures::future::join_all;

use crate::error::BioQueryError;
use crate::sources::{SourceKind, join_endpoint, source_base};

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthRow {
    pub api: String,
    pub status: String,
    pub latency: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub healthy: usize,
    pub total: usize,
    pub rows: Vec<HealthRow>,
}

impl HealthReport {
    pub fn all_healthy(&self) -> bool {
        self.healthy == self.total
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# bioquery Health Check\n\n");
        out.push_str("| API | Status | Latency |\n");
        out.push_str("|-----|--------|---------|\n");
        for row in &self.rows {
            out.push_str(&format!(
                "| {} | {} | {} |\n",
                row.api, row.status, row.latency
            ));
        }
        out.push_str(&format!(
            "\nStatus: {}/{} APIs healthy\n",
            self.healthy, self.total
        ));
        out
    }
}

/// Cheapest request each upstream answers with a 2xx.
fn probe_url(kind: SourceKind) -> String {
    let base = source_base(kind);
    match kind {
        SourceKind::OpenTargets => format!(
            "{}?query=%7Bmeta%7Bname%7D%7D",
            join_endpoint(&base, "graphql")
        ),
        SourceKind::ClinicalTrials => join_endpoint(&base, "version"),
        SourceKind::Chembl => join_endpoint(&base, "status.json"),
        SourceKind::ProteinAtlas => format!(
            "{}?search=TP53&format=json&columns=g&compress=no",
            join_endpoint(&base, "api/search_download.php")
        ),
    }
}

async fn check_one(client: reqwest::Client, api: &str, url: &str) -> HealthRow {
    let start = Instant::now();
    let resp = client
        .get(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await;

    match resp {
        Ok(resp) => {
            let status = resp.status();
            let elapsed = start.elapsed().as_millis();
            if status.is_success() {
                HealthRow {
                    api: api.to_string(),
                    status: "ok".into(),
                    latency: format!("{elapsed}ms"),
                }
            } else {
                HealthRow {
                    api: api.to_string(),
                    status: "error".into(),
                    latency: format!("{elapsed}ms (HTTP {})", status.as_u16()),
                }
            }
        }
        Err(err) => {
            let reason = if err.is_timeout() {
                "timeout"
            } else if err.is_connect() {
                "connect"
            } else {
                "error"
            };
            HealthRow {
                api: api.to_string(),
                status: "error".into(),
                latency: reason.into(),
            }
        }
    }
}

fn health_http_client() -> Result<reqwest::Client, BioQueryError> {
    static HEALTH_HTTP_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

    if let Some(client) = HEALTH_HTTP_CLIENT.get() {
        return Ok(client.clone());
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .connect_timeout(Duration::from_secs(5))
        .user_agent(concat!("bioquery/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(BioQueryError::HttpClientInit)?;

    match HEALTH_HTTP_CLIENT.set(client.clone()) {
        Ok(()) => Ok(client),
        Err(_) => HEALTH_HTTP_CLIENT
            .get()
            .cloned()
            .ok_or_else(|| BioQueryError::Api {
                api: "health".into(),
                message: "Health HTTP client initialization race".into(),
            }),
    }
}

async fn check_cache_dir() -> HealthRow {
    let start = Instant::now();
    let dir = crate::utils::download::bioquery_cache_dir();
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let probe = dir.join(format!(".bioquery-healthcheck-{suffix}.tmp"));

    let result = async {
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(&probe, b"ok").await?;
        match tokio::fs::remove_file(&probe).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
    .await;

    match result {
        Ok(()) => HealthRow {
            api: format!("Cache dir ({})", dir.display()),
            status: "ok".into(),
            latency: format!("{}ms", start.elapsed().as_millis()),
        },
        Err(err) => HealthRow {
            api: format!("Cache dir ({})", dir.display()),
            status: "error".into(),
            latency: format!("{:?}", err.kind()),
        },
    }
}

/// Connectivity checks for every upstream database and the local cache directory.
///
/// # Errors
///
/// Returns an error when the health HTTP client cannot be created.
pub async fn check(apis_only: bool) -> Result<HealthReport, BioQueryError> {
    let client = health_http_client()?;

    let probes = SourceKind::ALL.map(|kind| (kind, probe_url(kind)));
    let mut rows = join_all(
        probes
            .iter()
            .map(|(kind, url)| check_one(client.clone(), kind.display_name(), url)),
    )
    .await;

    if !apis_only {
        rows.push(check_cache_dir().await);
    }
    let healthy = rows.iter().filter(|r| r.status == "ok").count();
    Ok(HealthReport {
        healthy,
        total: rows.len(),
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn every_source_has_a_probe_under_its_base() {
        for kind in SourceKind::ALL {
            let url = probe_url(kind);
            assert!(url.starts_with(&*source_base(kind)), "{url}");
        }
    }

    #[tokio::test]
    async fn check_one_reports_status_codes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/up"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = health_http_client().unwrap();
        let up = check_one(client.clone(), "up", &format!("{}/up", server.uri())).await;
        assert_eq!(up.status, "ok");
        let down = check_one(client, "down", &format!("{}/down", server.uri())).await;
        assert_eq!(down.status, "error");
        assert!(down.latency.contains("HTTP 503"));
    }

    #[test]
    fn markdown_summarizes_health() {
        let report = HealthReport {
            healthy: 1,
            total: 2,
            rows: vec![
                HealthRow {
                    api: "ChEMBL".into(),
                    status: "ok".into(),
                    latency: "12ms".into(),
                },
                HealthRow {
                    api: "Human Protein Atlas".into(),
                    status: "error".into(),
                    latency: "timeout".into(),
                },
            ],
        };
        assert!(!report.all_healthy());
        let md = report.to_markdown();
        assert!(md.contains("| ChEMBL | ok | 12ms |"));
        assert!(md.contains("Status: 1/2 APIs healthy"));
    }
}
