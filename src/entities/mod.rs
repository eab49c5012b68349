//! Biomedical entity models, synonym tables, extraction and disambiguation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BioQueryError;

pub mod extract;
pub mod resolve;
pub mod synonyms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityClass {
    Drug,
    Target,
    Disease,
    Phase,
}

impl EntityClass {
    pub const ALL: [EntityClass; 4] = [
        EntityClass::Drug,
        EntityClass::Target,
        EntityClass::Disease,
        EntityClass::Phase,
    ];

    /// Classes backed by a synonym table (phase comes from a pattern).
    pub const INDEXED: [EntityClass; 3] =
        [EntityClass::Drug, EntityClass::Target, EntityClass::Disease];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Drug => "drug",
            Self::Target => "target",
            Self::Disease => "disease",
            Self::Phase => "phase",
        }
    }

    pub fn parse(value: &str) -> Result<Self, BioQueryError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "drug" | "compound" => Ok(Self::Drug),
            "target" | "gene" | "protein" => Ok(Self::Target),
            "disease" | "condition" => Ok(Self::Disease),
            "phase" | "stage" => Ok(Self::Phase),
            other => Err(BioQueryError::InvalidArgument(format!(
                "Unknown entity class '{other}'. Expected one of: drug, target, disease, phase"
            ))),
        }
    }
}

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a candidate's surface form matched its synonym entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Canonical,
    Identifier,
    Synonym,
    Pattern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCandidate {
    pub entity_class: EntityClass,
    pub canonical_name: String,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
    pub matched_surface_form: String,
    pub confidence: f64,
    pub match_kind: MatchKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synonyms: Vec<String>,
}

impl EntityCandidate {
    pub fn external_id(&self, namespace: &str) -> Option<&str> {
        self.external_ids
            .iter()
            .find(|(ns, _)| ns.eq_ignore_ascii_case(namespace))
            .map(|(_, id)| id.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// Ranking used everywhere candidates are ordered: confidence descending,
/// then canonical name (case-insensitive, then exact).
pub(crate) fn rank_candidates(candidates: &mut [EntityCandidate]) {
    candidates.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| {
                a.canonical_name
                    .to_lowercase()
                    .cmp(&b.canonical_name.to_lowercase())
            })
            .then_with(|| a.canonical_name.cmp(&b.canonical_name))
    });
}

/// One selected candidate per present entity class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolvedEntities(BTreeMap<EntityClass, EntityCandidate>);

impl ResolvedEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, candidate: EntityCandidate) {
        self.0.insert(candidate.entity_class, candidate);
    }

    pub fn get(&self, class: EntityClass) -> Option<&EntityCandidate> {
        self.0.get(&class)
    }

    pub fn drug(&self) -> Option<&EntityCandidate> {
        self.get(EntityClass::Drug)
    }

    pub fn target(&self) -> Option<&EntityCandidate> {
        self.get(EntityClass::Target)
    }

    pub fn disease(&self) -> Option<&EntityCandidate> {
        self.get(EntityClass::Disease)
    }

    /// Canonical phase value: "1".."3", "approved" or "preclinical".
    pub fn phase(&self) -> Option<&str> {
        self.get(EntityClass::Phase)
            .map(|c| c.canonical_name.as_str())
    }

    /// True when at least one drug, target or disease is present.
    pub fn has_anchor(&self) -> bool {
        EntityClass::INDEXED
            .iter()
            .any(|class| self.0.contains_key(class))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityClass, &EntityCandidate)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn test_candidate(
    class: EntityClass,
    name: &str,
    confidence: f64,
) -> EntityCandidate {
    EntityCandidate {
        entity_class: class,
        canonical_name: name.to_string(),
        external_ids: BTreeMap::new(),
        matched_surface_form: name.to_ascii_lowercase(),
        confidence,
        match_kind: MatchKind::Canonical,
        synonyms: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_candidates_orders_by_confidence_then_name() {
        let mut candidates = vec![
            test_candidate(EntityClass::Drug, "rituximab", 0.85),
            test_candidate(EntityClass::Drug, "Imatinib", 0.95),
            test_candidate(EntityClass::Drug, "dasatinib", 0.95),
        ];
        rank_candidates(&mut candidates);
        let names = candidates
            .iter()
            .map(|c| c.canonical_name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["dasatinib", "Imatinib", "rituximab"]);
    }

    #[test]
    fn external_id_lookup_is_namespace_case_insensitive() {
        let mut candidate = test_candidate(EntityClass::Drug, "Imatinib", 0.95);
        candidate
            .external_ids
            .insert("ChEMBL".into(), "CHEMBL941".into());
        assert_eq!(candidate.external_id("chembl"), Some("CHEMBL941"));
        assert_eq!(candidate.external_id("PubChem"), None);
    }

    #[test]
    fn resolved_entities_require_non_phase_anchor() {
        let mut resolved = ResolvedEntities::new();
        resolved.insert(test_candidate(EntityClass::Phase, "2", 0.95));
        assert!(!resolved.has_anchor());
        assert_eq!(resolved.phase(), Some("2"));

        resolved.insert(test_candidate(EntityClass::Drug, "Imatinib", 0.95));
        assert!(resolved.has_anchor());
    }

    #[test]
    fn entity_class_parse_accepts_aliases() {
        assert_eq!(EntityClass::parse("Gene").unwrap(), EntityClass::Target);
        assert_eq!(EntityClass::parse(" drug ").unwrap(), EntityClass::Drug);
        assert!(EntityClass::parse("pathway").is_err());
    }
}
