//! Command-line surface over the query pipeline.

use std::collections::BTreeMap;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::entities::EntityClass;
use crate::entities::resolve::DisambiguationOption;
use crate::entities::synonyms::{SharedSynonymIndex, SynonymEntry, SynonymLoader, SynonymProvider};
use crate::error::BioQueryError;
use crate::intent::IntentKind;
use crate::pipeline::{
    PendingDisambiguation, QueryOutcome, QueryPipeline, QueryRequest, QueryResult, Selection,
};
use crate::render;
use crate::sources::{SourceKind, SourceRegistry};

pub mod health;

#[derive(Parser, Debug)]
#[command(
    name = "bioquery",
    version,
    about = "Ask biomedical databases questions in plain English"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Print JSON instead of Markdown
    #[arg(long, global = true)]
    pub json: bool,

    /// Skip the HTTP cache for this run
    #[arg(long, global = true)]
    pub no_cache: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a plain-English query against one or more databases
    Query(QueryArgs),

    /// Continue a query that stopped to ask which entity was meant
    Resume(ResumeArgs),

    /// Show the entities and intent recognized in a query without running it
    Parse {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,

        /// Synonym table JSON (default: $BIOQUERY_SYNONYMS or the builtin table)
        #[arg(long)]
        synonyms: Option<PathBuf>,
    },

    /// List supported databases and the intents each answers
    Sources,

    /// Browse the synonym table
    Synonyms {
        /// drug, target or disease (default: all)
        class: Option<String>,

        /// Canonical name or synonym to look up
        name: Option<String>,

        /// Synonym table JSON (default: $BIOQUERY_SYNONYMS or the builtin table)
        #[arg(long)]
        synonyms: Option<PathBuf>,
    },

    /// Check connectivity to every database
    Health {
        /// Skip the local cache directory check
        #[arg(long)]
        apis_only: bool,
    },

    /// Run the MCP server over stdio
    Mcp,

    /// Alias for `mcp`
    Serve,

    /// Run the MCP server over HTTP (SSE transport)
    ServeHttp {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value_t = 8080)]
        port: u16,
    },

    /// Print version
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct QueryArgs {
    /// The question, e.g. "List diseases in Phase-2 for Imatinib"
    #[arg(required = true, num_args = 1..)]
    pub text: Vec<String>,

    /// Databases to query, comma-separated (default: all)
    #[arg(short = 'd', long = "database", value_delimiter = ',')]
    pub databases: Vec<String>,

    #[command(flatten)]
    pub run: RunOptions,
}

#[derive(Args, Debug, Clone)]
pub struct ResumeArgs {
    /// Pending-disambiguation JSON printed by `query --json` ("-" for stdin)
    pub token: PathBuf,

    #[command(flatten)]
    pub run: RunOptions,
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunOptions {
    /// Per-database timeout in seconds (default: $BIOQUERY_SOURCE_TIMEOUT_SECS or 20)
    #[arg(long)]
    pub timeout: Option<f64>,

    /// Synonym table JSON (default: $BIOQUERY_SYNONYMS or the builtin table)
    #[arg(long)]
    pub synonyms: Option<PathBuf>,

    /// Answer from the bundled demo dataset instead of the live databases
    #[arg(long)]
    pub offline: bool,

    /// Answer a disambiguation question up front, e.g. `--select drug=Imatinib` or `--select drug=2`
    #[arg(long = "select", value_name = "CLASS=NAME|#")]
    pub select: Vec<String>,

    /// Cancel instead of choosing when the query turns out to be ambiguous
    #[arg(long)]
    pub cancel: bool,

    /// Print result rows as CSV
    #[arg(long)]
    pub csv: bool,
}

fn synonym_provider(path: Option<PathBuf>) -> Result<Arc<SharedSynonymIndex>, BioQueryError> {
    let loader = path
        .map(SynonymLoader::File)
        .unwrap_or_else(SynonymLoader::from_env);
    Ok(Arc::new(SharedSynonymIndex::new(loader)?))
}

fn build_pipeline(opts: &RunOptions) -> Result<QueryPipeline, BioQueryError> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(secs) = opts.timeout {
        config = config.with_timeout_secs(secs)?;
    }
    let registry = if opts.offline {
        SourceRegistry::fixtures()?
    } else {
        SourceRegistry::live()?
    };
    QueryPipeline::new(synonym_provider(opts.synonyms.clone())?, registry, config)
}

fn parse_databases(values: &[String]) -> Result<Vec<SourceKind>, BioQueryError> {
    let values = values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>();
    if values.is_empty() {
        return Ok(SourceKind::ALL.to_vec());
    }
    values.into_iter().map(SourceKind::parse).collect()
}

fn parse_selections(values: &[String]) -> Result<BTreeMap<EntityClass, String>, BioQueryError> {
    let mut out = BTreeMap::new();
    for value in values {
        let Some((class, choice)) = value.split_once('=') else {
            return Err(BioQueryError::InvalidArgument(format!(
                "--select expects CLASS=NAME or CLASS=NUMBER, got '{value}'"
            )));
        };
        let class = EntityClass::parse(class)?;
        let choice = choice.trim();
        if choice.is_empty() {
            return Err(BioQueryError::InvalidArgument(format!(
                "--select {class}= needs a name or number"
            )));
        }
        if out.insert(class, choice.to_string()).is_some() {
            return Err(BioQueryError::InvalidArgument(format!(
                "--select given more than once for {class}"
            )));
        }
    }
    Ok(out)
}

/// Where disambiguation answers come from, in order: `--cancel`, `--select`,
/// then an interactive prompt when a person is at the terminal.
struct Chooser {
    preselected: BTreeMap<EntityClass, String>,
    cancel: bool,
    interactive: bool,
}

impl Chooser {
    fn new(opts: &RunOptions, interactive: bool) -> Result<Self, BioQueryError> {
        Ok(Self {
            preselected: parse_selections(&opts.select)?,
            cancel: opts.cancel,
            interactive,
        })
    }

    async fn choose(&mut self, pending: &PendingDisambiguation) -> anyhow::Result<Option<Selection>> {
        if self.cancel {
            return Ok(Some(Selection::Cancel));
        }
        if let Some(choice) = self.preselected.remove(&pending.request.entity_class) {
            return Ok(Some(Selection::Candidate(choice)));
        }
        if self.interactive {
            return prompt(pending).await.map(Some);
        }
        Ok(None)
    }
}

async fn read_line() -> anyhow::Result<String> {
    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await??;
    Ok(line.trim().to_string())
}

async fn prompt(pending: &PendingDisambiguation) -> anyhow::Result<Selection> {
    let menu = render::markdown::disambiguation_markdown(pending)?;
    let count = pending.request.candidates.len();
    let mut stderr = std::io::stderr();
    writeln!(stderr, "{menu}")?;
    loop {
        write!(stderr, "Choose 1-{count} or a name (blank to cancel): ")?;
        stderr.flush()?;
        let line = read_line().await?;
        if line.is_empty() {
            return Ok(Selection::Cancel);
        }
        match pending.request.choose(&line) {
            Ok(_) => return Ok(Selection::Candidate(line)),
            Err(err) => writeln!(stderr, "{err}")?,
        }
    }
}

async fn drive(
    pipeline: &QueryPipeline,
    mut outcome: QueryOutcome,
    chooser: &mut Chooser,
    cancel: &CancellationToken,
) -> anyhow::Result<QueryOutcome> {
    while let QueryOutcome::Pending(pending) = outcome {
        let Some(selection) = chooser.choose(&pending).await? else {
            return Ok(QueryOutcome::Pending(pending));
        };
        outcome = pipeline.resume_query(pending, selection, cancel).await?;
    }
    Ok(outcome)
}

#[derive(Serialize)]
struct QueryResponse<'a> {
    #[serde(flatten)]
    result: &'a QueryResult,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    errors_per_source: BTreeMap<SourceKind, String>,
}

#[derive(Serialize, serde::Deserialize)]
struct PendingResponse {
    status: String,
    entity_class: EntityClass,
    #[serde(default, skip_deserializing)]
    options: Vec<DisambiguationOption>,
    token: PendingDisambiguation,
}

const NEEDS_DISAMBIGUATION: &str = "needs_disambiguation";

fn render_outcome(outcome: &QueryOutcome, json: bool, csv: bool) -> anyhow::Result<String> {
    match outcome {
        QueryOutcome::Complete(result) if csv => {
            Ok(render::csv::to_csv(&result.records, result.intent())?)
        }
        QueryOutcome::Complete(result) if json => Ok(render::json::to_pretty(&QueryResponse {
            result,
            errors_per_source: result.errors_per_source(),
        })?),
        QueryOutcome::Complete(result) => Ok(render::markdown::query_result_markdown(result)?),
        QueryOutcome::Pending(pending) if json => Ok(render::json::to_pretty(&PendingResponse {
            status: NEEDS_DISAMBIGUATION.to_string(),
            entity_class: pending.request.entity_class,
            options: pending.request.options(),
            token: pending.clone(),
        })?),
        QueryOutcome::Pending(pending) => Ok(render::markdown::disambiguation_markdown(pending)?),
    }
}

/// Accepts either the full `query --json` output or a bare token.
fn parse_token(raw: &str) -> Result<PendingDisambiguation, BioQueryError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    if value.get("token").is_some() {
        let response: PendingResponse = serde_json::from_value(value)?;
        return Ok(response.token);
    }
    Ok(serde_json::from_value(value)?)
}

async fn read_token(path: &Path) -> anyhow::Result<PendingDisambiguation> {
    let raw = if path.as_os_str() == "-" {
        tokio::task::spawn_blocking(|| std::io::read_to_string(std::io::stdin())).await??
    } else {
        tokio::fs::read_to_string(path).await?
    };
    Ok(parse_token(&raw)?)
}

/// Ctrl-C cancels in-flight database calls; the watcher stops with the guard.
struct InterruptGuard(tokio::task::JoinHandle<()>);

impl InterruptGuard {
    fn watch(cancel: &CancellationToken) -> Self {
        let cancel = cancel.clone();
        Self(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }))
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn person_at_terminal(json: bool) -> bool {
    !json && std::io::stdin().is_terminal() && std::io::stderr().is_terminal()
}

async fn run_query(args: QueryArgs, json: bool, interactive: bool) -> anyhow::Result<String> {
    let pipeline = build_pipeline(&args.run)?;
    let request = QueryRequest::new(args.text.join(" "), parse_databases(&args.databases)?);
    let mut chooser = Chooser::new(&args.run, interactive && person_at_terminal(json))?;

    let cancel = CancellationToken::new();
    let _guard = interactive.then(|| InterruptGuard::watch(&cancel));

    let first = pipeline.begin_query(&request, &cancel).await?;
    let outcome = drive(&pipeline, first, &mut chooser, &cancel).await?;
    render_outcome(&outcome, json, args.run.csv)
}

async fn run_resume(args: ResumeArgs, json: bool, interactive: bool) -> anyhow::Result<String> {
    let pending = read_token(&args.token).await?;
    let pipeline = build_pipeline(&args.run)?;
    let prompt_ok = interactive && args.token.as_os_str() != "-" && person_at_terminal(json);
    let mut chooser = Chooser::new(&args.run, prompt_ok)?;

    let cancel = CancellationToken::new();
    let _guard = interactive.then(|| InterruptGuard::watch(&cancel));

    let outcome = drive(&pipeline, QueryOutcome::Pending(pending), &mut chooser, &cancel).await?;
    render_outcome(&outcome, json, args.run.csv)
}

fn run_parse(text: &[String], synonyms: Option<PathBuf>, json: bool) -> anyhow::Result<String> {
    let pipeline = QueryPipeline::new(
        synonym_provider(synonyms)?,
        SourceRegistry::new(),
        PipelineConfig::default(),
    )?;
    let parsed = pipeline.parse(&text.join(" "));
    if json {
        return Ok(render::json::to_pretty(&parsed)?);
    }
    Ok(render::markdown::parsed_query_markdown(&parsed)?)
}

#[derive(Serialize)]
struct SourceInfo {
    name: &'static str,
    key: &'static str,
    intents: Vec<IntentKind>,
    base_url: String,
}

fn run_sources(json: bool) -> anyhow::Result<String> {
    if !json {
        return Ok(render::markdown::sources_markdown(&SourceKind::ALL)?);
    }
    let sources = SourceKind::ALL
        .iter()
        .map(|kind| SourceInfo {
            name: kind.display_name(),
            key: kind.api_name(),
            intents: IntentKind::ALL
                .into_iter()
                .filter(|intent| kind.supports(*intent))
                .collect(),
            base_url: crate::sources::source_base(*kind).into_owned(),
        })
        .collect::<Vec<_>>();
    Ok(render::json::to_pretty(&sources)?)
}

fn synonym_table(class: EntityClass, entries: &[SynonymEntry]) -> String {
    let mut out = format!("## {class}\n\n");
    out.push_str("| Name | Synonyms | Identifiers |\n");
    out.push_str("|---|---|---|\n");
    for entry in entries {
        let synonyms = entry.synonyms.iter().cloned().collect::<Vec<_>>().join(", ");
        let ids = entry
            .external_ids
            .iter()
            .map(|(ns, id)| format!("{ns}:{id}"))
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!(
            "| {} | {} | {} |\n",
            entry.canonical_name,
            if synonyms.is_empty() { "-" } else { synonyms.as_str() },
            if ids.is_empty() { "-" } else { ids.as_str() },
        ));
    }
    out
}

fn run_synonyms(
    class: Option<&str>,
    name: Option<&str>,
    synonyms: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<String> {
    let provider = synonym_provider(synonyms)?;
    let index = provider.snapshot();
    let classes = match class {
        Some(class) => vec![EntityClass::parse(class)?],
        None => EntityClass::INDEXED.to_vec(),
    };

    if let (Some(name), [class]) = (name, classes.as_slice()) {
        let entry = index
            .find(*class, name)
            .ok_or_else(|| BioQueryError::NotFound {
                entity: class.to_string(),
                id: name.to_string(),
                suggestion: format!("Try: bioquery synonyms {class}"),
            })?;
        if json {
            return Ok(render::json::to_pretty(entry)?);
        }
        return Ok(synonym_table(*class, std::slice::from_ref(entry)));
    }

    if json {
        let listing = classes
            .iter()
            .map(|class| (*class, index.entries(*class)))
            .collect::<BTreeMap<_, _>>();
        return Ok(render::json::to_pretty(&listing)?);
    }
    let mut out = String::from("# Synonyms\n\n");
    for class in classes {
        out.push_str(&synonym_table(class, index.entries(class)));
        out.push('\n');
    }
    Ok(out)
}

async fn run_inner(cli: Cli, interactive: bool) -> anyhow::Result<String> {
    let Cli {
        command,
        json,
        no_cache,
    } = cli;

    match command {
        Commands::Query(args) => {
            crate::sources::with_no_cache(no_cache, run_query(args, json, interactive)).await
        }
        Commands::Resume(args) => {
            crate::sources::with_no_cache(no_cache, run_resume(args, json, interactive)).await
        }
        Commands::Parse { text, synonyms } => run_parse(&text, synonyms, json),
        Commands::Sources => run_sources(json),
        Commands::Synonyms {
            class,
            name,
            synonyms,
        } => run_synonyms(class.as_deref(), name.as_deref(), synonyms, json),
        Commands::Health { apis_only } => {
            let report = health::check(apis_only).await?;
            if json {
                return Ok(render::json::to_pretty(&report)?);
            }
            Ok(report.to_markdown())
        }
        Commands::Mcp | Commands::Serve => {
            crate::mcp::run_stdio().await?;
            Ok(String::new())
        }
        Commands::ServeHttp { host, port } => {
            crate::mcp::run_http(&host, port).await?;
            Ok(String::new())
        }
        Commands::Version => Ok(format!("bioquery {}", env!("CARGO_PKG_VERSION"))),
    }
}

/// Runs a parsed command line for a person at a terminal.
///
/// # Errors
///
/// Returns an error for invalid arguments, unreadable synonym tables or
/// tokens, and rendering failures. Database failures are reported in the
/// rendered result, not as errors.
pub async fn run(cli: Cli) -> anyhow::Result<String> {
    run_inner(cli, true).await
}

/// Runs an argv-style command without prompting or signal handling.
pub async fn execute(args: Vec<String>) -> anyhow::Result<String> {
    execute_parsed(Cli::try_parse_from(args)?).await
}

/// Like [`execute`] for a command line that was already parsed and checked.
pub async fn execute_parsed(cli: Cli) -> anyhow::Result<String> {
    run_inner(cli, false).await
}
