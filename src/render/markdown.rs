use std::sync::OnceLock;

use minijinja::{Environment, context};
use serde::Serialize;

use crate::entities::{EntityCandidate, EntityClass, MatchKind};
use crate::error::BioQueryError;
use crate::intent::IntentKind;
use crate::pipeline::{EntitySlot, ParsedQuery, PendingDisambiguation, QueryResult, SourceState};
use crate::sources::SourceKind;

static ENV: OnceLock<Environment<'static>> = OnceLock::new();

const ABSENT_CELL: &str = "-";

fn env() -> Result<&'static Environment<'static>, BioQueryError> {
    if let Some(env) = ENV.get() {
        return Ok(env);
    }

    let mut env = Environment::new();
    env.add_filter("truncate", |s: String, max_bytes: usize| -> String {
        if s.len() <= max_bytes {
            return s;
        }
        if max_bytes == 0 {
            return "…".to_string();
        }
        let mut boundary = max_bytes;
        while boundary > 0 && !s.is_char_boundary(boundary) {
            boundary -= 1;
        }
        let mut out = s[..boundary].trim_end().to_string();
        out.push('…');
        out
    });
    env.add_filter("score", |v: f64| -> String { format!("{v:.2}") });
    env.add_template(
        "query_result.md.j2",
        include_str!("../../templates/query_result.md.j2"),
    )?;
    env.add_template(
        "disambiguation.md.j2",
        include_str!("../../templates/disambiguation.md.j2"),
    )?;
    env.add_template(
        "parsed_query.md.j2",
        include_str!("../../templates/parsed_query.md.j2"),
    )?;
    env.add_template("sources.md.j2", include_str!("../../templates/sources.md.j2"))?;

    let _ = ENV.set(env);
    ENV.get().ok_or_else(|| BioQueryError::Api {
        api: "markdown".into(),
        message: "Template environment failed to initialize".into(),
    })
}

/// Table cells must not break the pipe layout.
fn table_cell(value: &str) -> String {
    let flat = value.replace(['\n', '\r'], " ");
    let flat = flat.trim();
    if flat.is_empty() {
        return ABSENT_CELL.to_string();
    }
    flat.replace('|', "\\|")
}

fn primary_id(candidate: &EntityCandidate) -> Option<&str> {
    ["ChEMBL", "Ensembl", "EFO", "MONDO"]
        .iter()
        .find_map(|ns| candidate.external_id(ns))
}

#[derive(Serialize)]
struct EntityRow {
    class: EntityClass,
    name: String,
    id: Option<String>,
    matched: String,
    kind: MatchKind,
    confidence: f64,
    ids: String,
}

fn entity_row(candidate: &EntityCandidate) -> EntityRow {
    let ids = candidate
        .external_ids
        .iter()
        .map(|(ns, id)| format!("{ns}:{id}"))
        .collect::<Vec<_>>()
        .join(", ");
    EntityRow {
        class: candidate.entity_class,
        name: table_cell(&candidate.canonical_name),
        id: primary_id(candidate).map(str::to_string),
        matched: table_cell(&candidate.matched_surface_form),
        kind: candidate.match_kind,
        confidence: candidate.confidence,
        ids: table_cell(&ids),
    }
}

fn entity_rows(parsed: &ParsedQuery) -> Vec<EntityRow> {
    parsed
        .entities
        .values()
        .flat_map(|slot| match slot {
            EntitySlot::One(candidate) => vec![entity_row(candidate)],
            EntitySlot::Many(list) => list.iter().map(entity_row).collect(),
        })
        .collect()
}

#[derive(Serialize)]
struct SourceRow {
    name: &'static str,
    status: String,
    records: usize,
    detail: String,
}

pub fn query_result_markdown(result: &QueryResult) -> Result<String, BioQueryError> {
    let parsed = &result.query_info.parsed_query;
    let rows = result
        .records
        .iter()
        .map(|record| {
            result
                .columns
                .iter()
                .map(|column| match record.cell(column) {
                    Some(value) => table_cell(&value),
                    None => ABSENT_CELL.to_string(),
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    let sources = result
        .per_source_status
        .iter()
        .map(|(kind, status)| SourceRow {
            name: kind.display_name(),
            status: match (status.status, status.reason) {
                (SourceState::Ok, _) => "ok".to_string(),
                (SourceState::Error, Some(reason)) => reason.to_string(),
                (SourceState::Error, None) => "error".to_string(),
            },
            records: status.record_count,
            detail: table_cell(&status.detail),
        })
        .collect::<Vec<_>>();

    let tmpl = env()?.get_template("query_result.md.j2")?;
    Ok(tmpl.render(context! {
        query => &parsed.original_text,
        intent_label => parsed.intent.label(),
        status => result.status.as_str(),
        message => &result.message,
        entities => entity_rows(parsed),
        columns => &result.columns,
        rows => rows,
        sources => sources,
    })?)
}

#[derive(Serialize)]
struct OptionRow {
    original: String,
    matched: String,
    confidence: f64,
    synonyms: String,
}

pub fn disambiguation_markdown(pending: &PendingDisambiguation) -> Result<String, BioQueryError> {
    let options = pending
        .request
        .options()
        .into_iter()
        .map(|o| OptionRow {
            original: table_cell(&o.original),
            matched: table_cell(&o.matched),
            confidence: o.confidence,
            synonyms: table_cell(&o.synonyms.join(", ")),
        })
        .collect::<Vec<_>>();

    let tmpl = env()?.get_template("disambiguation.md.j2")?;
    Ok(tmpl.render(context! {
        entity_class => pending.request.entity_class,
        query => &pending.parsed_query.original_text,
        options => options,
    })?)
}

pub fn parsed_query_markdown(parsed: &ParsedQuery) -> Result<String, BioQueryError> {
    let tmpl = env()?.get_template("parsed_query.md.j2")?;
    Ok(tmpl.render(context! {
        query => &parsed.original_text,
        intent => parsed.intent.as_str(),
        intent_label => parsed.intent.label(),
        entities => entity_rows(parsed),
    })?)
}

#[derive(Serialize)]
struct SourceInfoRow {
    name: &'static str,
    key: &'static str,
    intents: Vec<&'static str>,
    base: String,
}

pub fn sources_markdown(kinds: &[SourceKind]) -> Result<String, BioQueryError> {
    let sources = kinds
        .iter()
        .map(|kind| SourceInfoRow {
            name: kind.display_name(),
            key: kind.api_name(),
            intents: IntentKind::ALL
                .iter()
                .filter(|intent| kind.supports(**intent))
                .map(|intent| intent.as_str())
                .collect(),
            base: crate::sources::source_base(*kind).into_owned(),
        })
        .collect::<Vec<_>>();

    let tmpl = env()?.get_template("sources.md.j2")?;
    Ok(tmpl.render(context! { sources => sources })?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::PipelineConfig;
    use crate::entities::resolve::DisambiguationRequest;
    use crate::entities::synonyms::{SharedSynonymIndex, SynonymLoader};
    use crate::entities::test_candidate;
    use crate::pipeline::{QueryOutcome, QueryPipeline, QueryRequest};
    use crate::sources::SourceRegistry;

    async fn offline_result(text: &str) -> QueryResult {
        let pipeline = QueryPipeline::new(
            Arc::new(SharedSynonymIndex::new(SynonymLoader::Builtin).unwrap()),
            SourceRegistry::fixtures().unwrap(),
            PipelineConfig::default(),
        )
        .unwrap();
        let request = QueryRequest::new(text, [SourceKind::OpenTargets, SourceKind::Chembl]);
        match pipeline
            .begin_query(&request, &CancellationToken::new())
            .await
            .unwrap()
        {
            QueryOutcome::Complete(result) => result,
            QueryOutcome::Pending(_) => panic!("unexpected pending"),
        }
    }

    #[tokio::test]
    async fn query_result_renders_table_with_absent_dashes() {
        let result = offline_result("List drugs for alopecia").await;
        let md = query_result_markdown(&result).unwrap();
        assert!(md.starts_with("# Drugs: List drugs for alopecia"));
        assert!(md.contains("Status: **ok**."));
        assert!(md.contains("| disease_name | efo_id | drug | drug_id | phase | mechanism |"));
        assert!(md.contains("| Minoxidil |"));
        assert!(md.contains("| - |"));
        assert!(md.contains("## Databases"));
        assert!(md.contains("| ChEMBL | ok | 1 | - |"));
        assert!(md.contains("disease `Alopecia` (EFO_0000756)"));
    }

    #[tokio::test]
    async fn empty_result_omits_table() {
        let result = offline_result("what is the weather").await;
        let md = query_result_markdown(&result).unwrap();
        assert!(md.contains("no_entity_recognized"));
        assert!(!md.contains("|---|"));
    }

    #[test]
    fn disambiguation_lists_numbered_options() {
        let mut imatinib = test_candidate(EntityClass::Drug, "Imatinib", 0.85);
        imatinib.synonyms = vec!["gleevec".into(), "sti571".into()];
        let pending = PendingDisambiguation {
            request: DisambiguationRequest {
                entity_class: EntityClass::Drug,
                candidates: vec![imatinib, test_candidate(EntityClass::Drug, "Nilotinib", 0.85)],
            },
            parsed_query: ParsedQuery::new("tki", IntentKind::ListDiseases, Default::default()),
            databases: vec![SourceKind::OpenTargets],
        };
        let md = disambiguation_markdown(&pending).unwrap();
        assert!(md.contains("# Which drug did you mean?"));
        assert!(md.contains("| 1 | Imatinib | imatinib | 0.85 | gleevec, sti571 |"));
        assert!(md.contains("| 2 | Nilotinib | nilotinib | 0.85 | - |"));
        assert!(md.contains("--select drug=<name or #>"));
    }

    #[test]
    fn table_cells_escape_pipes_and_newlines() {
        assert_eq!(table_cell("a|b\nc"), "a\\|b c");
        assert_eq!(table_cell("  "), "-");
    }

    #[test]
    fn sources_table_lists_intents() {
        let md = sources_markdown(&[SourceKind::ProteinAtlas]).unwrap();
        assert!(md.contains("| Human Protein Atlas | hpa | list_expression |"));
    }
}
