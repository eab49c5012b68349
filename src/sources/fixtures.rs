//! Offline source backed by canned records compiled into the binary.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{BiomedicalSource, NativeRecord, SourceError, SourceKind};
use crate::entities::synonyms::EmbeddedData;
use crate::entities::{EntityCandidate, EntityClass, ResolvedEntities};
use crate::error::BioQueryError;
use crate::intent::IntentKind;
use crate::transform::phase::{normalize_phase, phase_matches};
use crate::transform::schema::{self, PHASE_FIELD};

const BUILTIN_FIXTURES: &str = "fixtures.json";

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureEntry {
    pub source: SourceKind,
    pub intent: IntentKind,
    /// Canonical name or external identifier of the anchor entity.
    pub anchor: String,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub records: Vec<NativeRecord>,
}

impl FixtureEntry {
    fn anchored_on(&self, candidate: &EntityCandidate) -> bool {
        let anchor = self.anchor.trim();
        candidate.canonical_name.eq_ignore_ascii_case(anchor)
            || candidate
                .external_ids
                .values()
                .any(|id| id.trim().eq_ignore_ascii_case(anchor))
    }

    fn matches(&self, entities: &ResolvedEntities, intent: IntentKind) -> bool {
        anchor(entities, intent).is_some_and(|candidate| self.anchored_on(candidate))
    }
}

/// Entity a live client would look up for `intent`: the first class present
/// in precedence order. Later classes are ignored even when the first has no
/// fixture, so rows never come from two different anchors.
fn anchor(entities: &ResolvedEntities, intent: IntentKind) -> Option<&EntityCandidate> {
    let precedence: &[EntityClass] = match intent {
        IntentKind::ListDiseases => &[EntityClass::Drug, EntityClass::Target],
        IntentKind::ListToxicities => &[EntityClass::Drug],
        IntentKind::ListDrugs => &[EntityClass::Disease, EntityClass::Target],
        IntentKind::ListTargets => &[EntityClass::Drug, EntityClass::Disease],
        IntentKind::ListInteractions | IntentKind::ListExpression => &[EntityClass::Target],
    };
    precedence.iter().find_map(|class| entities.get(*class))
}

pub fn builtin_entries() -> Result<Arc<Vec<FixtureEntry>>, BioQueryError> {
    let Some(asset) = EmbeddedData::get(BUILTIN_FIXTURES) else {
        return Err(BioQueryError::Api {
            api: "fixtures".into(),
            message: format!("embedded {BUILTIN_FIXTURES} is missing"),
        });
    };
    let entries: Vec<FixtureEntry> = serde_json::from_slice(asset.data.as_ref())?;
    Ok(Arc::new(entries))
}

pub struct FixtureSource {
    kind: SourceKind,
    entries: Arc<Vec<FixtureEntry>>,
}

impl FixtureSource {
    pub fn new(kind: SourceKind, entries: Arc<Vec<FixtureEntry>>) -> Self {
        Self { kind, entries }
    }

    fn native_phase_key(&self, intent: IntentKind) -> Option<&'static str> {
        schema::field_map(self.kind, intent)
            .iter()
            .find(|(_, common)| *common == PHASE_FIELD)
            .map(|(native, _)| *native)
    }

    fn record_in_phase(&self, intent: IntentKind, record: &NativeRecord, requested: &str) -> bool {
        let value = self
            .native_phase_key(intent)
            .and_then(|key| record.get(key))
            .or_else(|| record.get(PHASE_FIELD));
        match value.map(normalize_phase) {
            Some(serde_json::Value::String(phase)) => phase_matches(requested, &phase),
            _ => false,
        }
    }

    /// A phase-specific entry wins when one exists; otherwise the generic
    /// entry is filtered by each record's own phase.
    pub fn lookup(&self, entities: &ResolvedEntities, intent: IntentKind) -> Vec<NativeRecord> {
        let candidates = self
            .entries
            .iter()
            .filter(|e| e.source == self.kind && e.intent == intent && e.matches(entities, intent))
            .collect::<Vec<_>>();

        let Some(requested) = entities.phase() else {
            return candidates
                .iter()
                .filter(|e| e.phase.is_none())
                .flat_map(|e| e.records.iter().cloned())
                .collect();
        };

        if let Some(exact) = candidates
            .iter()
            .find(|e| e.phase.as_deref().is_some_and(|p| phase_matches(requested, p)))
        {
            return exact.records.clone();
        }

        let filter_by_phase = schema::intent_fields(intent).contains(&PHASE_FIELD);
        candidates
            .iter()
            .filter(|e| e.phase.is_none())
            .flat_map(|e| e.records.iter())
            .filter(|r| !filter_by_phase || self.record_in_phase(intent, r, requested))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BiomedicalSource for FixtureSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn query(
        &self,
        entities: &ResolvedEntities,
        intent: IntentKind,
    ) -> Result<Vec<NativeRecord>, SourceError> {
        let records = self.lookup(entities, intent);
        debug!(source = %self.kind, intent = %intent, records = records.len(), "Fixture lookup");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{EntityClass, test_candidate};
    use serde_json::json;

    fn source(kind: SourceKind) -> FixtureSource {
        FixtureSource::new(kind, builtin_entries().unwrap())
    }

    fn drug(name: &str, chembl: &str) -> EntityCandidate {
        let mut candidate = test_candidate(EntityClass::Drug, name, 0.95);
        candidate.external_ids.insert("ChEMBL".into(), chembl.into());
        candidate
    }

    #[test]
    fn builtin_fixtures_parse() {
        let entries = builtin_entries().unwrap();
        assert!(!entries.is_empty());
        assert!(entries.iter().all(|e| !e.records.is_empty()));
    }

    #[tokio::test]
    async fn phase_specific_entry_wins() {
        let mut entities = ResolvedEntities::new();
        entities.insert(drug("Imatinib", "CHEMBL941"));
        entities.insert(test_candidate(EntityClass::Phase, "2", 0.95));

        let records = source(SourceKind::OpenTargets)
            .query(&entities, IntentKind::ListDiseases)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["disease_label"], json!("Chronic Myeloid Leukemia"));
        assert_eq!(records[0]["clinical_phase"], json!(2));
    }

    #[test]
    fn generic_entry_is_filtered_by_record_phase() {
        let mut entities = ResolvedEntities::new();
        entities.insert(drug("Imatinib", "CHEMBL941"));
        entities.insert(test_candidate(EntityClass::Phase, "3", 0.95));

        let records = source(SourceKind::OpenTargets).lookup(&entities, IntentKind::ListDiseases);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["disease_label"], json!("Systemic Mastocytosis"));

        let records = source(SourceKind::ClinicalTrials).lookup(&entities, IntentKind::ListDiseases);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["nct_id"], json!("NCT00075218"));
    }

    #[test]
    fn anchor_matches_by_name_or_identifier() {
        let mut entities = ResolvedEntities::new();
        entities.insert(drug("Dasatinib", "CHEMBL1421"));
        let records = source(SourceKind::OpenTargets).lookup(&entities, IntentKind::ListToxicities);
        assert_eq!(records.len(), 2);

        let mut entities = ResolvedEntities::new();
        entities.insert(test_candidate(EntityClass::Target, "tp53", 0.95));
        let records =
            source(SourceKind::ProteinAtlas).lookup(&entities, IntentKind::ListExpression);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn rows_come_from_the_anchor_the_intent_implies() {
        let entry = |anchor: &str, label: &str| {
            serde_json::from_value::<FixtureEntry>(json!({
                "source": "opentargets",
                "intent": "list_diseases",
                "anchor": anchor,
                "records": [{"disease_label": label}],
            }))
            .unwrap()
        };
        let source = FixtureSource::new(
            SourceKind::OpenTargets,
            Arc::new(vec![
                entry("CHEMBL941", "Chronic Myeloid Leukemia"),
                entry("TP53", "Li-Fraumeni Syndrome"),
            ]),
        );

        let mut entities = ResolvedEntities::new();
        entities.insert(drug("Imatinib", "CHEMBL941"));
        entities.insert(test_candidate(EntityClass::Target, "TP53", 0.95));
        let records = source.lookup(&entities, IntentKind::ListDiseases);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["disease_label"], json!("Chronic Myeloid Leukemia"));

        let mut entities = ResolvedEntities::new();
        entities.insert(drug("Nilotinib", "CHEMBL255863"));
        entities.insert(test_candidate(EntityClass::Target, "TP53", 0.95));
        assert!(source.lookup(&entities, IntentKind::ListDiseases).is_empty());

        let mut entities = ResolvedEntities::new();
        entities.insert(test_candidate(EntityClass::Target, "TP53", 0.95));
        let records = source.lookup(&entities, IntentKind::ListDiseases);
        assert_eq!(records[0]["disease_label"], json!("Li-Fraumeni Syndrome"));
    }

    #[test]
    fn disease_anchors_drug_listings_even_with_a_drug_present() {
        let mut disease = test_candidate(EntityClass::Disease, "Melanoma", 0.95);
        disease.external_ids.insert("EFO".into(), "EFO_0000756".into());
        let mut entities = ResolvedEntities::new();
        entities.insert(disease);
        entities.insert(drug("Dasatinib", "CHEMBL1421"));

        let records = source(SourceKind::OpenTargets).lookup(&entities, IntentKind::ListDrugs);
        assert_eq!(records.len(), 1);
        let records = source(SourceKind::OpenTargets).lookup(&entities, IntentKind::ListToxicities);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn unknown_anchor_or_other_source_yields_nothing() {
        let mut entities = ResolvedEntities::new();
        entities.insert(drug("Nilotinib", "CHEMBL255863"));
        assert!(source(SourceKind::OpenTargets)
            .lookup(&entities, IntentKind::ListDiseases)
            .is_empty());

        let mut entities = ResolvedEntities::new();
        entities.insert(drug("Dasatinib", "CHEMBL1421"));
        assert!(source(SourceKind::Chembl)
            .lookup(&entities, IntentKind::ListToxicities)
            .is_empty());
    }
}
