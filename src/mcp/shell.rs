use std::future::Future;
use std::path::{Component, Path};

use rmcp::model::{
    AnnotateAble, Implementation, ListResourcesResult, PaginatedRequestParam, RawResource,
    ReadResourceRequestParam, ReadResourceResult, ResourceContents, ServerCapabilities, ServerInfo,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{Error as McpError, ServerHandler, ServiceExt, tool};
use tokio_util::sync::CancellationToken;

use crate::cli::{Cli, Commands};
use crate::sources::SourceKind;

#[derive(Debug, Clone)]
pub struct BioQueryServer;

const RESOURCE_HELP_URI: &str = "bioquery://help";
const RESOURCE_SOURCES_URI: &str = "bioquery://sources";
const MAX_COMMAND_LEN: usize = 1024;

const SHELL_DESCRIPTION: &str = "\
Run a bioquery CLI command. Output is Markdown unless --json is given.

COMMANDS:
  query <text> [-d db1,db2] [--select class=name|#] [--cancel] [--csv] [--offline] [--timeout secs]
  resume <token file name in the bioquery tokens cache dir> [--select class=name|#] [--cancel]
  parse <text>
  sources
  synonyms [drug|target|disease] [name]
  health [--apis-only]
  version

DATABASES: OpenTargets, ClinicalTrials.gov, ChEMBL, Human Protein Atlas (default: all).

AGENT GUIDANCE:
- Ask one question per query, e.g. `query List diseases in Phase-2 for Imatinib`.
- When the answer asks which entity was meant, repeat the same query with
  `--select drug=<name or number>` (or `--cancel`).
- Status `source_unavailable` means some databases failed; the rows shown are still valid.
- Use `parse` to check what was recognized before querying.";

const HELP_MARKDOWN: &str = "\
# bioquery

Plain-English questions over biomedical databases. Each query is resolved to
canonical drugs, targets and diseases, sent to the selected databases in
parallel, and returned as one harmonized table.

## Intents

| Ask for | Intent |
|---|---|
| diseases / indications | `list_diseases` |
| toxicities / adverse events | `list_toxicities` |
| drugs / treatments | `list_drugs` |
| targets / mechanisms | `list_targets` |
| interactions | `list_interactions` |
| expression / tissues | `list_expression` |

## Examples

- `bioquery query List diseases in Phase-2 for Imatinib -d OpenTargets`
- `bioquery query List toxicities for Dasatinib`
- `bioquery query Which drugs treat alopecia --csv`
- `bioquery parse Show expression of TP53`
";

fn is_allowed_mcp_command(args: &[String]) -> bool {
    // args[0] is the binary name ("bioquery")
    let Some(cmd) = args.get(1).map(|s| s.trim().to_ascii_lowercase()) else {
        return false;
    };
    matches!(
        cmd.as_str(),
        "query" | "resume" | "parse" | "sources" | "synonyms" | "health" | "version"
    )
}

/// Keeps MCP clients away from local files: no custom synonym tables, and
/// resume tokens are bare file names looked up in `token_dir`.
fn confine_to_server_files(mut cli: Cli, token_dir: &Path) -> Result<Cli, String> {
    let synonyms = match &cli.command {
        Commands::Query(args) => args.run.synonyms.is_some(),
        Commands::Resume(args) => args.run.synonyms.is_some(),
        Commands::Parse { synonyms, .. } | Commands::Synonyms { synonyms, .. } => {
            synonyms.is_some()
        }
        _ => false,
    };
    if synonyms {
        return Err("Error: --synonyms is not available over MCP".to_string());
    }

    if let Commands::Resume(args) = &mut cli.command {
        let mut components = args.token.components();
        let bare_name = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if args.token.as_os_str() == "-" || !bare_name {
            return Err(format!(
                "Error: resume over MCP takes a token file name inside {}",
                token_dir.display()
            ));
        }
        args.token = token_dir.join(&args.token);
    }
    Ok(cli)
}

#[tool(tool_box)]
impl BioQueryServer {
    #[tool(description = SHELL_DESCRIPTION)]
    async fn shell(&self, #[tool(param)] command: String) -> Result<String, String> {
        if command.len() > MAX_COMMAND_LEN {
            return Err("Error: command is too long".to_string());
        }

        let split = match shlex::split(&command) {
            Some(args) => args,
            None => return Err(format!("Error: Invalid command syntax: {command}")),
        };

        let mut args = vec!["bioquery".to_string()];
        if split.first().is_some_and(|s| s == "bioquery") {
            args.extend(split.into_iter().skip(1));
        } else {
            args.extend(split);
        }

        if !is_allowed_mcp_command(&args) {
            return Err(
                "Error: MCP shell allows read-only commands only (query/resume/parse/sources/synonyms/health/version)."
                    .to_string(),
            );
        }

        let cli = <Cli as clap::Parser>::try_parse_from(args).map_err(|e| format!("Error: {e}"))?;
        let cli = confine_to_server_files(cli, &crate::utils::download::bioquery_token_dir())?;

        crate::cli::execute_parsed(cli)
            .await
            .map_err(|e| format!("Error: {e}"))
    }
}

#[tool(tool_box)]
impl ServerHandler for BioQueryServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
            server_info: Implementation {
                name: "bioquery".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: Some(
                "bioquery answers plain-English biomedical questions from OpenTargets, \
                 ClinicalTrials.gov, ChEMBL and the Human Protein Atlas as one harmonized table. \
                 Use the `shell` tool to run bioquery CLI commands, \
                 starting with `query <question>` or `parse <question>`."
                    .to_string(),
            ),
            ..Default::default()
        }
    }

    fn list_resources(
        &self,
        _request: PaginatedRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListResourcesResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListResourcesResult {
            next_cursor: None,
            resources: build_resource_list()
                .into_iter()
                .map(|r| r.no_annotation())
                .collect(),
        }))
    }

    fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ReadResourceResult, McpError>> + Send + '_ {
        std::future::ready(read_resource_markdown(&request.uri))
    }
}

fn read_resource_markdown(uri: &str) -> Result<ReadResourceResult, McpError> {
    match uri {
        RESOURCE_HELP_URI => Ok(to_resource_result(uri, HELP_MARKDOWN.to_string())),
        RESOURCE_SOURCES_URI => {
            let content = crate::render::markdown::sources_markdown(&SourceKind::ALL).map_err(
                |e| McpError::internal_error(format!("Failed to render {uri}: {e}"), None),
            )?;
            Ok(to_resource_result(uri, content))
        }
        _ => Err(McpError::resource_not_found(
            format!("Unknown resource: {uri}"),
            None,
        )),
    }
}

fn build_resource_list() -> Vec<RawResource> {
    [
        (RESOURCE_HELP_URI, "bioquery Overview"),
        (RESOURCE_SOURCES_URI, "Supported Databases"),
    ]
    .into_iter()
    .map(|(uri, name)| RawResource {
        uri: uri.to_string(),
        name: name.to_string(),
        description: None,
        mime_type: Some("text/markdown".to_string()),
        size: None,
    })
    .collect()
}

fn to_resource_result(uri: &str, content: String) -> ReadResourceResult {
    ReadResourceResult {
        contents: vec![ResourceContents::TextResourceContents {
            uri: uri.to_string(),
            mime_type: Some("text/markdown".to_string()),
            text: content,
        }],
    }
}

pub async fn run_stdio() -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    let cancel = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let running = BioQueryServer
        .serve_with_ct(rmcp::transport::stdio(), shutdown)
        .await?;
    let _reason = running.waiting().await?;
    Ok(())
}

pub async fn run_http(host: &str, port: u16) -> anyhow::Result<()> {
    use rmcp::transport::sse_server::SseServer;

    let ip: std::net::IpAddr = host
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid host address: {e}"))?;
    let bind = std::net::SocketAddr::new(ip, port);

    tracing::info!("bioquery HTTP server listening on http://{bind}");
    tracing::info!("  SSE endpoint:  GET  http://{bind}/sse");
    tracing::info!("  Post endpoint: POST http://{bind}/message");

    let ct = SseServer::serve(bind)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind HTTP server: {e}"))?
        .with_service(|| BioQueryServer);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down…");
    ct.cancel();
    Ok(())
}
