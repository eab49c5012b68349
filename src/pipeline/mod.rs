//! Query understanding and result harmonization, end to end.
//!
//! The pipeline is stateless: an ambiguous query returns a serializable
//! [`PendingDisambiguation`] token that the caller hands back to
//! [`QueryPipeline::resume_query`] together with its choice.

pub mod dispatch;
pub mod model;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::entities::ResolvedEntities;
use crate::entities::extract::extract;
use crate::entities::resolve::{Resolution, resolve};
use crate::entities::synonyms::SynonymProvider;
use crate::error::BioQueryError;
use crate::intent::classify;
use crate::sources::{NativeRecord, SourceKind, SourceRegistry};
use crate::transform::harmonize::{columns, harmonize};

use self::dispatch::{SourceQuerySpec, dispatch};
pub use self::model::{
    EntitySlot, ParsedQuery, PendingDisambiguation, QueryInfo, QueryOutcome, QueryRequest,
    QueryResult, QueryStatus, Selection, SourceState, SourceStatus,
};
use self::model::{now_rfc3339, validate_databases};

pub struct QueryPipeline {
    synonyms: Arc<dyn SynonymProvider>,
    registry: SourceRegistry,
    config: PipelineConfig,
}

impl QueryPipeline {
    pub fn new(
        synonyms: Arc<dyn SynonymProvider>,
        registry: SourceRegistry,
        config: PipelineConfig,
    ) -> Result<Self, BioQueryError> {
        config.validate()?;
        Ok(Self {
            synonyms,
            registry,
            config,
        })
    }

    pub fn synonyms(&self) -> &Arc<dyn SynonymProvider> {
        &self.synonyms
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Extraction and classification against a single index snapshot.
    pub fn parse(&self, text: &str) -> ParsedQuery {
        let index = self.synonyms.snapshot();
        let candidates = extract(text, &index);
        let intent = classify(text);
        debug!(intent = %intent, classes = candidates.len(), "Parsed query");
        ParsedQuery::new(text, intent, candidates)
    }

    pub async fn begin_query(
        &self,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryOutcome, BioQueryError> {
        request.validate()?;
        let parsed = self.parse(&request.query);
        Ok(self.advance(parsed, &request.databases, cancel).await)
    }

    /// Applies the consumer's choice for the pending class and continues.
    /// Another ambiguous class may yield a fresh `Pending`.
    pub async fn resume_query(
        &self,
        pending: PendingDisambiguation,
        selection: Selection,
        cancel: &CancellationToken,
    ) -> Result<QueryOutcome, BioQueryError> {
        let PendingDisambiguation {
            request,
            mut parsed_query,
            databases,
        } = pending;
        validate_databases(&databases)?;

        let choice = match selection {
            Selection::Cancel => {
                info!(class = %request.entity_class, "Disambiguation cancelled");
                return Ok(QueryOutcome::Complete(terminal(
                    QueryStatus::Cancelled,
                    "Query cancelled during disambiguation.".into(),
                    parsed_query,
                    databases,
                )));
            }
            Selection::Candidate(choice) => choice,
        };

        let chosen = request.choose(&choice)?.clone();
        debug!(class = %request.entity_class, name = %chosen.canonical_name, "Candidate selected");
        parsed_query.settle(chosen);
        Ok(self.advance(parsed_query, &databases, cancel).await)
    }

    async fn advance(
        &self,
        parsed: ParsedQuery,
        databases: &[SourceKind],
        cancel: &CancellationToken,
    ) -> QueryOutcome {
        if cancel.is_cancelled() {
            return QueryOutcome::Complete(cancelled(parsed, databases.to_vec()));
        }

        let mut entities = parsed.settled();
        match resolve(&parsed.open_candidates(), &self.config.resolver) {
            Resolution::NeedsDisambiguation { request, .. } => {
                return QueryOutcome::Pending(PendingDisambiguation {
                    request,
                    parsed_query: parsed,
                    databases: databases.to_vec(),
                });
            }
            Resolution::Resolved(resolved) => {
                for (_, candidate) in resolved.iter() {
                    entities.insert(candidate.clone());
                }
            }
        }

        let parsed = parsed.resolved(&entities);
        if !entities.has_anchor() {
            info!(query = %parsed.original_text, "No drug, target or disease recognized");
            return QueryOutcome::Complete(terminal(
                QueryStatus::NoEntityRecognized,
                "No drug, target or disease was recognized in the query. \
                 Try naming one explicitly, e.g. \"List diseases for Imatinib\"."
                    .into(),
                parsed,
                databases.to_vec(),
            ));
        }

        QueryOutcome::Complete(self.run(parsed, entities, databases, cancel).await)
    }

    async fn run(
        &self,
        parsed: ParsedQuery,
        entities: ResolvedEntities,
        databases: &[SourceKind],
        cancel: &CancellationToken,
    ) -> QueryResult {
        let intent = parsed.intent;
        let specs = databases
            .iter()
            .map(|source| SourceQuerySpec {
                source: *source,
                intent,
                resolved_entities: entities.clone(),
            })
            .collect::<Vec<_>>();

        let outcomes =
            match dispatch(&specs, &self.registry, self.config.source_timeout, cancel).await {
                Ok(outcomes) => outcomes,
                Err(_) => return cancelled(parsed, databases.to_vec()),
            };

        let mut per_source_status = BTreeMap::new();
        let mut answered: Vec<(SourceKind, Vec<NativeRecord>)> = Vec::new();
        for (source, outcome) in outcomes {
            match outcome {
                Ok(records) => {
                    per_source_status.insert(source, SourceStatus::ok(records.len()));
                    answered.push((source, records));
                }
                Err(err) => {
                    per_source_status.insert(source, SourceStatus::failed(err.reason, err.detail));
                }
            }
        }

        let records = harmonize(&answered, intent);
        let failed = per_source_status.values().filter(|s| s.is_error()).count();
        let (status, message) = summarize(records.len(), failed, databases.len(), &parsed);
        info!(
            intent = %intent,
            status = %status,
            records = records.len(),
            failed,
            "Query finished"
        );

        QueryResult {
            status,
            message,
            columns: columns(&records, intent),
            records,
            query_info: QueryInfo {
                parsed_query: parsed,
                databases_queried: databases.to_vec(),
                timestamp: now_rfc3339(),
            },
            per_source_status,
        }
    }
}

fn summarize(
    records: usize,
    failed: usize,
    queried: usize,
    parsed: &ParsedQuery,
) -> (QueryStatus, String) {
    let label = parsed.intent.label().to_lowercase();
    if queried > 0 && failed == queried {
        return (
            QueryStatus::AllSourcesFailed,
            "Every selected database failed to answer. See per-source status for details."
                .into(),
        );
    }
    if failed > 0 {
        return (
            QueryStatus::SourceUnavailable,
            format!(
                "Found {records} {label} result(s); {failed} of {queried} database(s) did not answer."
            ),
        );
    }
    if records == 0 {
        return (
            QueryStatus::NoResultsForResolvedQuery,
            format!("The query was understood, but no {label} records were found."),
        );
    }
    (QueryStatus::Ok, format!("Found {records} {label} result(s)."))
}

fn terminal(
    status: QueryStatus,
    message: String,
    parsed: ParsedQuery,
    databases: Vec<SourceKind>,
) -> QueryResult {
    let intent = parsed.intent;
    QueryResult {
        status,
        message,
        records: Vec::new(),
        columns: columns(&[], intent),
        query_info: QueryInfo {
            parsed_query: parsed,
            databases_queried: databases,
            timestamp: now_rfc3339(),
        },
        per_source_status: BTreeMap::new(),
    }
}

fn cancelled(parsed: ParsedQuery, databases: Vec<SourceKind>) -> QueryResult {
    terminal(QueryStatus::Cancelled, "Query cancelled.".into(), parsed, databases)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::dispatch::tests::StubSource;
    use super::*;
    use crate::entities::EntityClass;
    use crate::entities::synonyms::{SharedSynonymIndex, SynonymIndex, SynonymLoader, entry};
    use crate::sources::{SourceError, SourceErrorReason};
    use crate::transform::harmonize::FieldValue;

    fn builtin_synonyms() -> Arc<dyn SynonymProvider> {
        Arc::new(SharedSynonymIndex::new(SynonymLoader::Builtin).unwrap())
    }

    fn pipeline(registry: SourceRegistry) -> QueryPipeline {
        QueryPipeline::new(builtin_synonyms(), registry, PipelineConfig::default()).unwrap()
    }

    fn offline() -> QueryPipeline {
        pipeline(SourceRegistry::fixtures().unwrap())
    }

    async fn complete(pipeline: &QueryPipeline, text: &str, dbs: &[SourceKind]) -> QueryResult {
        let request = QueryRequest::new(text, dbs.iter().copied());
        match pipeline
            .begin_query(&request, &CancellationToken::new())
            .await
            .unwrap()
        {
            QueryOutcome::Complete(result) => result,
            QueryOutcome::Pending(p) => panic!("unexpected disambiguation: {:?}", p.request),
        }
    }

    /// Two drug entries that both answer to "tki".
    fn ambiguous_synonyms() -> Arc<dyn SynonymProvider> {
        let mut classes = BTreeMap::new();
        classes.insert(
            EntityClass::Drug,
            vec![
                entry("Imatinib", &["gleevec"], &[("ChEMBL", "CHEMBL941")]),
                entry("Nilotinib", &["tasigna"], &[("ChEMBL", "CHEMBL255863")]),
            ],
        );
        let index = SynonymIndex::from_entries(classes).unwrap();
        Arc::new(SharedSynonymIndex::with_index(SynonymLoader::Builtin, index))
    }

    #[tokio::test]
    async fn imatinib_phase_two_lists_cml_from_opentargets() {
        let result = complete(
            &offline(),
            "List diseases in Phase-2 for Imatinib",
            &[SourceKind::OpenTargets],
        )
        .await;

        assert_eq!(result.status, QueryStatus::Ok);
        assert_eq!(result.intent(), crate::intent::IntentKind::ListDiseases);
        let cml = result
            .records
            .iter()
            .find(|r| r.cell("disease_name").as_deref() == Some("Chronic Myeloid Leukemia"))
            .expect("CML record");
        assert_eq!(cml.cell("phase").as_deref(), Some("2"));
        assert_eq!(cml.cell("source").as_deref(), Some("OpenTargets"));
        for record in &result.records {
            for key in ["disease_name", "phase", "evidence_score"] {
                assert!(record.get(key).is_some());
            }
        }

        let parsed = &result.query_info.parsed_query;
        assert!(matches!(
            parsed.entities.get(&EntityClass::Phase),
            Some(EntitySlot::One(c)) if c.canonical_name == "2"
        ));
        assert_eq!(result.query_info.databases_queried, vec![SourceKind::OpenTargets]);
    }

    #[tokio::test]
    async fn dasatinib_toxicities_carry_severity_and_frequency() {
        let result = complete(
            &offline(),
            "List toxicities for Dasatinib",
            &[SourceKind::OpenTargets],
        )
        .await;

        assert_eq!(result.status, QueryStatus::Ok);
        let effusion = &result.records[0];
        assert_eq!(effusion.cell("toxicity_type").as_deref(), Some("Pleural Effusion"));
        assert_eq!(effusion.cell("severity").as_deref(), Some("Grade 3"));
        assert_eq!(effusion.cell("frequency").as_deref(), Some("28%"));
    }

    #[tokio::test]
    async fn brand_name_resolves_through_synonyms() {
        let result = complete(
            &offline(),
            "Which diseases is Rituxan indicated for?",
            &[SourceKind::OpenTargets],
        )
        .await;
        let names = result
            .records
            .iter()
            .filter_map(|r| r.cell("disease_name"))
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Non-Hodgkin Lymphoma", "Chronic Lymphocytic Leukemia"]);
    }

    #[tokio::test]
    async fn multiple_sources_concatenate_in_request_order() {
        let result = complete(
            &offline(),
            "List drugs for alopecia",
            &[SourceKind::Chembl, SourceKind::OpenTargets],
        )
        .await;
        let sources = result.records.iter().map(|r| r.source).collect::<Vec<_>>();
        assert_eq!(sources, vec![SourceKind::Chembl, SourceKind::OpenTargets]);
        assert_eq!(result.records[0].cell("phase").as_deref(), Some("approved"));
        assert_eq!(result.records[1].cell("drug").as_deref(), Some("Minoxidil"));
        assert_eq!(result.records[0].get("drug"), Some(&FieldValue::Absent));
    }

    #[tokio::test]
    async fn unknown_entity_and_phase_only_queries_are_not_recognized() {
        for text in ["List diseases for aspirinex", "Show me phase 2 drugs"] {
            let result = complete(&offline(), text, &[SourceKind::OpenTargets]).await;
            assert_eq!(result.status, QueryStatus::NoEntityRecognized, "{text}");
            assert!(result.records.is_empty());
            assert!(result.per_source_status.is_empty());
            assert_eq!(result.query_info.databases_queried, vec![SourceKind::OpenTargets]);
        }
    }

    #[tokio::test]
    async fn recognized_query_with_no_rows_is_a_separate_status() {
        let result = complete(
            &offline(),
            "List toxicities for Nilotinib",
            &[SourceKind::OpenTargets],
        )
        .await;
        assert_eq!(result.status, QueryStatus::NoResultsForResolvedQuery);
        assert_eq!(result.per_source_status[&SourceKind::OpenTargets], SourceStatus::ok(0));
    }

    #[tokio::test]
    async fn partial_and_total_source_failures() {
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(StubSource::answering(
            SourceKind::OpenTargets,
            vec![json!({"disease_label": "Chronic Myeloid Leukemia", "clinical_phase": 2})],
        )));
        registry.register(Arc::new(StubSource::failing(
            SourceKind::ClinicalTrials,
            SourceError::new(SourceErrorReason::Unavailable, "502"),
        )));
        registry.register(Arc::new(
            StubSource::answering(SourceKind::Chembl, Vec::new()).delayed(Duration::from_secs(10)),
        ));
        let config = PipelineConfig::default().with_timeout_secs(0.1).unwrap();
        let pipeline = QueryPipeline::new(builtin_synonyms(), registry, config).unwrap();

        let result = complete(
            &pipeline,
            "List diseases for Imatinib",
            &[SourceKind::OpenTargets, SourceKind::ClinicalTrials, SourceKind::Chembl],
        )
        .await;
        assert_eq!(result.status, QueryStatus::SourceUnavailable);
        assert_eq!(result.records.len(), 1);
        assert_eq!(
            result.per_source_status[&SourceKind::Chembl].reason,
            Some(SourceErrorReason::Timeout)
        );
        assert_eq!(result.errors_per_source().len(), 2);

        let result = complete(
            &pipeline,
            "List diseases for Imatinib",
            &[SourceKind::ClinicalTrials, SourceKind::ProteinAtlas],
        )
        .await;
        assert_eq!(result.status, QueryStatus::AllSourcesFailed);
        assert!(result.records.is_empty());
    }

    #[tokio::test]
    async fn ambiguous_drug_pauses_and_selection_matches_single_hit() {
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(StubSource::answering(
            SourceKind::OpenTargets,
            vec![json!({"disease_label": "Chronic Myeloid Leukemia"})],
        )));
        let ambiguous = QueryPipeline::new(
            ambiguous_synonyms(),
            registry.clone(),
            PipelineConfig::default(),
        )
        .unwrap();

        let request = QueryRequest::new(
            "List diseases for gleevec or tasigna",
            [SourceKind::OpenTargets],
        );
        let cancel = CancellationToken::new();
        let pending = match ambiguous.begin_query(&request, &cancel).await.unwrap() {
            QueryOutcome::Pending(pending) => pending,
            QueryOutcome::Complete(r) => panic!("expected disambiguation, got {}", r.status),
        };
        assert_eq!(pending.request.entity_class, EntityClass::Drug);
        let offered = pending
            .request
            .candidates
            .iter()
            .map(|c| c.canonical_name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(offered, vec!["Imatinib", "Nilotinib"]);

        let resumed = match ambiguous
            .resume_query(pending.clone(), Selection::Candidate("imatinib".into()), &cancel)
            .await
            .unwrap()
        {
            QueryOutcome::Complete(result) => result,
            QueryOutcome::Pending(_) => panic!("still pending"),
        };

        let direct = complete(
            &pipeline(registry),
            "List diseases for gleevec",
            &[SourceKind::OpenTargets],
        )
        .await;
        assert_eq!(resumed.status, direct.status);
        assert_eq!(
            serde_json::to_value(&resumed.records).unwrap(),
            serde_json::to_value(&direct.records).unwrap()
        );
        let drug = |r: &QueryResult| match r.query_info.parsed_query.entities.get(&EntityClass::Drug) {
            Some(EntitySlot::One(c)) => c.canonical_name.clone(),
            other => panic!("unexpected slot {other:?}"),
        };
        assert_eq!(drug(&resumed), drug(&direct));

        let by_index = ambiguous
            .resume_query(pending.clone(), Selection::Candidate("2".into()), &cancel)
            .await
            .unwrap();
        assert!(matches!(by_index, QueryOutcome::Complete(ref r) if drug(r) == "Nilotinib"));

        let err = ambiguous
            .resume_query(pending.clone(), Selection::Candidate("Dasatinib".into()), &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Imatinib"));

        let cancelled = ambiguous
            .resume_query(pending, Selection::Cancel, &cancel)
            .await
            .unwrap();
        assert!(matches!(
            cancelled,
            QueryOutcome::Complete(ref r) if r.status == QueryStatus::Cancelled
        ));
    }

    #[tokio::test]
    async fn resume_rejects_token_without_databases() {
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(StubSource::answering(
            SourceKind::OpenTargets,
            vec![json!({"disease_label": "Chronic Myeloid Leukemia"})],
        )));
        let ambiguous =
            QueryPipeline::new(ambiguous_synonyms(), registry, PipelineConfig::default()).unwrap();
        let request = QueryRequest::new(
            "List diseases for gleevec or tasigna",
            [SourceKind::OpenTargets],
        );
        let cancel = CancellationToken::new();
        let mut pending = match ambiguous.begin_query(&request, &cancel).await.unwrap() {
            QueryOutcome::Pending(pending) => pending,
            QueryOutcome::Complete(r) => panic!("expected disambiguation, got {}", r.status),
        };
        pending.databases.clear();

        let err = ambiguous
            .resume_query(pending, Selection::Candidate("1".into()), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BioQueryError::InvalidArgument(_)));
        assert!(err.to_string().contains("At least one database is required"));
    }

    #[tokio::test]
    async fn cancelled_token_yields_cancelled_status() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = QueryRequest::new("List diseases for Imatinib", [SourceKind::OpenTargets]);
        let outcome = offline().begin_query(&request, &cancel).await.unwrap();
        match outcome {
            QueryOutcome::Complete(result) => {
                assert_eq!(result.status, QueryStatus::Cancelled);
                assert!(result.records.is_empty());
            }
            QueryOutcome::Pending(_) => panic!("unexpected pending"),
        }
    }

    #[tokio::test]
    async fn identical_queries_produce_identical_records() {
        let pipeline = offline();
        let dbs = [SourceKind::OpenTargets, SourceKind::ClinicalTrials, SourceKind::Chembl];
        let first = complete(&pipeline, "List diseases for Imatinib", &dbs).await;
        let second = complete(&pipeline, "List diseases for Imatinib", &dbs).await;
        assert_eq!(
            serde_json::to_string(&first.records).unwrap(),
            serde_json::to_string(&second.records).unwrap()
        );
        assert_eq!(first.columns, second.columns);
        assert_eq!(first.per_source_status, second.per_source_status);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let err = offline()
            .begin_query(&QueryRequest::new("", [SourceKind::OpenTargets]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BioQueryError::InvalidArgument(_)));
    }
}
