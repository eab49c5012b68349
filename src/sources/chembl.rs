use std::borrow::Cow;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{BiomedicalSource, NativeRecord, SourceError, SourceKind, clean, put};
use crate::entities::ResolvedEntities;
use crate::error::BioQueryError;
use crate::intent::IntentKind;
use crate::transform::phase::phase_matches;

const CHEMBL_API: &str = "chembl";
const PAGE_LIMIT: usize = 25;

pub struct ChemblClient {
    client: reqwest_middleware::ClientWithMiddleware,
    base: Cow<'static, str>,
}

impl ChemblClient {
    pub fn new() -> Result<Self, BioQueryError> {
        Ok(Self {
            client: crate::sources::shared_client()?,
            base: crate::sources::source_base(SourceKind::Chembl),
        })
    }

    #[cfg(test)]
    fn new_for_test(base: String) -> Result<Self, BioQueryError> {
        Ok(Self {
            client: crate::sources::shared_client()?,
            base: Cow::Owned(base),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        crate::sources::join_endpoint(&self.base, path)
    }

    async fn indications(
        &self,
        filter: (&str, &str),
        phase: Option<&str>,
    ) -> Result<Vec<ChemblIndication>, BioQueryError> {
        let url = self.endpoint("drug_indication.json");
        let limit = PAGE_LIMIT.to_string();
        let resp: ChemblIndicationResponse = crate::sources::send_json(
            SourceKind::Chembl,
            self.client
                .get(&url)
                .query(&[filter, ("limit", limit.as_str())]),
        )
        .await?;

        Ok(resp
            .drug_indications
            .into_iter()
            .filter(|row| match phase {
                None => true,
                Some(requested) => row
                    .max_phase_for_ind
                    .as_ref()
                    .and_then(phase_text)
                    .is_some_and(|p| phase_matches(requested, &p)),
            })
            .collect())
    }

    pub async fn drug_indications(
        &self,
        chembl_id: &str,
        drug_name: &str,
        phase: Option<&str>,
    ) -> Result<Vec<NativeRecord>, BioQueryError> {
        let chembl_id = chembl_id.trim();
        if chembl_id.is_empty() {
            return Err(BioQueryError::InvalidArgument("ChEMBL ID is required".into()));
        }
        let rows = self
            .indications(("molecule_chembl_id", chembl_id), phase)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| row.into_record(Some(drug_name)))
            .collect())
    }

    pub async fn disease_indications(
        &self,
        efo_id: &str,
        phase: Option<&str>,
    ) -> Result<Vec<NativeRecord>, BioQueryError> {
        let efo_id = to_chembl_efo(efo_id);
        if efo_id.is_empty() {
            return Err(BioQueryError::InvalidArgument("EFO ID is required".into()));
        }
        let rows = self.indications(("efo_id", efo_id.as_str()), phase).await?;
        Ok(rows.into_iter().map(|row| row.into_record(None)).collect())
    }

    pub async fn drug_mechanisms(
        &self,
        chembl_id: &str,
        drug_name: &str,
    ) -> Result<Vec<NativeRecord>, BioQueryError> {
        let chembl_id = chembl_id.trim();
        if chembl_id.is_empty() {
            return Err(BioQueryError::InvalidArgument("ChEMBL ID is required".into()));
        }

        let url = self.endpoint("mechanism.json");
        let limit = PAGE_LIMIT.to_string();
        let resp: ChemblMechanismResponse = crate::sources::send_json(
            SourceKind::Chembl,
            self.client
                .get(&url)
                .query(&[("molecule_chembl_id", chembl_id), ("limit", limit.as_str())]),
        )
        .await?;

        Ok(resp
            .mechanisms
            .into_iter()
            .map(|row| {
                let mut record = NativeRecord::new();
                put(&mut record, "molecule_name", clean(Some(drug_name)));
                put(&mut record, "molecule_chembl_id", clean(row.molecule_chembl_id.as_deref()));
                put(&mut record, "target_pref_name", clean(row.target_pref_name.as_deref()));
                put(&mut record, "target_chembl_id", clean(row.target_chembl_id.as_deref()));
                put(&mut record, "action_type", clean(row.action_type.as_deref()));
                put(
                    &mut record,
                    "mechanism_of_action",
                    clean(row.mechanism_of_action.as_deref()),
                );
                record
            })
            .collect())
    }
}

#[async_trait]
impl BiomedicalSource for ChemblClient {
    fn kind(&self) -> SourceKind {
        SourceKind::Chembl
    }

    async fn query(
        &self,
        entities: &ResolvedEntities,
        intent: IntentKind,
    ) -> Result<Vec<NativeRecord>, SourceError> {
        let phase = entities.phase();
        let drug = entities
            .drug()
            .and_then(|d| d.external_id("ChEMBL").map(|id| (id, d.canonical_name.as_str())));
        let disease_efo = entities.disease().and_then(|d| d.external_id("EFO"));

        let records = match (intent, drug, disease_efo) {
            (IntentKind::ListDiseases, Some((id, name)), _) => {
                self.drug_indications(id, name, phase).await?
            }
            (IntentKind::ListTargets, Some((id, name)), _) => self.drug_mechanisms(id, name).await?,
            (IntentKind::ListDrugs, _, Some(efo)) => self.disease_indications(efo, phase).await?,
            _ => Vec::new(),
        };
        debug!(source = CHEMBL_API, intent = %intent, records = records.len(), "Query finished");
        Ok(records)
    }
}

/// ChEMBL stores EFO ids with a colon.
fn to_chembl_efo(id: &str) -> String {
    id.trim().replacen('_', ":", 1)
}

fn from_chembl_efo(id: &str) -> String {
    id.trim().replacen(':', "_", 1)
}

fn phase_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => clean(Some(s)),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ChemblIndicationResponse {
    #[serde(default)]
    drug_indications: Vec<ChemblIndication>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChemblIndication {
    molecule_chembl_id: Option<String>,
    efo_id: Option<String>,
    efo_term: Option<String>,
    mesh_heading: Option<String>,
    max_phase_for_ind: Option<Value>,
}

impl ChemblIndication {
    fn into_record(self, drug_name: Option<&str>) -> NativeRecord {
        let mut record = NativeRecord::new();
        put(&mut record, "molecule_name", clean(drug_name));
        put(&mut record, "molecule_chembl_id", clean(self.molecule_chembl_id.as_deref()));
        put(&mut record, "efo_term", clean(self.efo_term.as_deref()));
        put(
            &mut record,
            "efo_id",
            clean(self.efo_id.as_deref()).map(|id| from_chembl_efo(&id)),
        );
        put(&mut record, "mesh_heading", clean(self.mesh_heading.as_deref()));
        put(&mut record, "max_phase_for_ind", self.max_phase_for_ind);
        record
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ChemblMechanismResponse {
    #[serde(default)]
    mechanisms: Vec<ChemblMechanism>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChemblMechanism {
    molecule_chembl_id: Option<String>,
    target_pref_name: Option<String>,
    target_chembl_id: Option<String>,
    action_type: Option<String>,
    mechanism_of_action: Option<String>,
}
