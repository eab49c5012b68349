//! Request, response and resumable-token types of the query pipeline.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::entities::extract::CandidateMap;
use crate::entities::resolve::DisambiguationRequest;
use crate::entities::{EntityCandidate, EntityClass, ResolvedEntities};
use crate::error::BioQueryError;
use crate::intent::IntentKind;
use crate::sources::{SourceErrorReason, SourceKind};
use crate::transform::harmonize::HarmonizedRecord;

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Extraction yields a list per class; a settled class holds exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntitySlot {
    One(EntityCandidate),
    Many(Vec<EntityCandidate>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedQuery {
    pub original_text: String,
    pub intent: IntentKind,
    pub entities: BTreeMap<EntityClass, EntitySlot>,
    pub timestamp: String,
}

impl ParsedQuery {
    pub fn new(original_text: &str, intent: IntentKind, candidates: CandidateMap) -> Self {
        Self {
            original_text: original_text.to_string(),
            intent,
            entities: candidates
                .into_iter()
                .map(|(class, list)| (class, EntitySlot::Many(list)))
                .collect(),
            timestamp: now_rfc3339(),
        }
    }

    /// Classes still holding an unsettled candidate list.
    pub fn open_candidates(&self) -> CandidateMap {
        self.entities
            .iter()
            .filter_map(|(class, slot)| match slot {
                EntitySlot::Many(list) => Some((*class, list.clone())),
                EntitySlot::One(_) => None,
            })
            .collect()
    }

    /// Classes already settled by an earlier selection.
    pub fn settled(&self) -> ResolvedEntities {
        let mut out = ResolvedEntities::new();
        for slot in self.entities.values() {
            if let EntitySlot::One(candidate) = slot {
                out.insert(candidate.clone());
            }
        }
        out
    }

    pub fn settle(&mut self, candidate: EntityCandidate) {
        self.entities
            .insert(candidate.entity_class, EntitySlot::One(candidate));
    }

    /// Copy with every class reduced to its resolved candidate.
    pub fn resolved(&self, entities: &ResolvedEntities) -> Self {
        Self {
            original_text: self.original_text.clone(),
            intent: self.intent,
            entities: entities
                .iter()
                .map(|(class, candidate)| (*class, EntitySlot::One(candidate.clone())))
                .collect(),
            timestamp: self.timestamp.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub databases: Vec<SourceKind>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>, databases: impl IntoIterator<Item = SourceKind>) -> Self {
        let mut out = Vec::new();
        for kind in databases {
            if !out.contains(&kind) {
                out.push(kind);
            }
        }
        Self {
            query: query.into(),
            databases: out,
        }
    }

    pub fn validate(&self) -> Result<(), BioQueryError> {
        if self.query.trim().is_empty() {
            return Err(BioQueryError::InvalidArgument("Query text is required".into()));
        }
        validate_databases(&self.databases)
    }
}

/// Shared by fresh requests and resumed tokens, which arrive from outside.
pub(crate) fn validate_databases(databases: &[SourceKind]) -> Result<(), BioQueryError> {
    if databases.is_empty() {
        return Err(BioQueryError::InvalidArgument(format!(
            "At least one database is required. Choose from: {}",
            SourceKind::ALL.map(SourceKind::display_name).join(", ")
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Ok,
    SourceUnavailable,
    NoEntityRecognized,
    NoResultsForResolvedQuery,
    AllSourcesFailed,
    Cancelled,
}

impl QueryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::SourceUnavailable => "source_unavailable",
            Self::NoEntityRecognized => "no_entity_recognized",
            Self::NoResultsForResolvedQuery => "no_results_for_resolved_query",
            Self::AllSourcesFailed => "all_sources_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub status: SourceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<SourceErrorReason>,
    pub detail: String,
    pub record_count: usize,
}

impl SourceStatus {
    pub fn ok(record_count: usize) -> Self {
        Self {
            status: SourceState::Ok,
            reason: None,
            detail: String::new(),
            record_count,
        }
    }

    pub fn failed(reason: SourceErrorReason, detail: impl Into<String>) -> Self {
        Self {
            status: SourceState::Error,
            reason: Some(reason),
            detail: detail.into(),
            record_count: 0,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == SourceState::Error
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryInfo {
    pub parsed_query: ParsedQuery,
    pub databases_queried: Vec<SourceKind>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub status: QueryStatus,
    pub message: String,
    #[serde(rename = "data")]
    pub records: Vec<HarmonizedRecord>,
    pub columns: Vec<String>,
    pub query_info: QueryInfo,
    pub per_source_status: BTreeMap<SourceKind, SourceStatus>,
}

impl QueryResult {
    /// Failure details keyed by source; empty when every source answered.
    pub fn errors_per_source(&self) -> BTreeMap<SourceKind, String> {
        self.per_source_status
            .iter()
            .filter(|(_, s)| s.is_error())
            .map(|(kind, s)| {
                let reason = s.reason.map(SourceErrorReason::as_str).unwrap_or("error");
                (*kind, format!("{reason}: {}", s.detail))
            })
            .collect()
    }

    pub fn intent(&self) -> IntentKind {
        self.query_info.parsed_query.intent
    }
}

/// Resumable token handed to the consumer when a class is ambiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDisambiguation {
    pub request: DisambiguationRequest,
    pub parsed_query: ParsedQuery,
    pub databases: Vec<SourceKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    /// Canonical name or 1-based position among the offered candidates.
    Candidate(String),
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum QueryOutcome {
    Complete(QueryResult),
    Pending(PendingDisambiguation),
}
