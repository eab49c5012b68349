use std::borrow::Cow;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{BiomedicalSource, NativeRecord, SourceError, SourceKind, clean, put};
use crate::entities::{EntityCandidate, ResolvedEntities};
use crate::error::BioQueryError;
use crate::intent::IntentKind;
use crate::transform::phase::phase_matches;

const OPENTARGETS_API: &str = "opentargets";
const PAGE_SIZE: usize = 25;

pub struct OpenTargetsClient {
    client: reqwest_middleware::ClientWithMiddleware,
    base: Cow<'static, str>,
}

impl OpenTargetsClient {
    pub fn new() -> Result<Self, BioQueryError> {
        Ok(Self {
            client: crate::sources::shared_client()?,
            base: crate::sources::source_base(SourceKind::OpenTargets),
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

    /// Runs one GraphQL operation; GraphQL-level errors become `Api` errors.
    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<Option<T>, BioQueryError> {
        let url = self.endpoint("graphql");
        let body = GraphQlRequest { query, variables };
        let resp: GraphQlResponse<T> =
            crate::sources::send_json(SourceKind::OpenTargets, self.client.post(&url).json(&body))
                .await?;

        if let Some(errors) = resp.errors {
            let msg = errors
                .into_iter()
                .filter_map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            if !msg.is_empty() {
                return Err(BioQueryError::Api {
                    api: OPENTARGETS_API.to_string(),
                    message: msg,
                });
            }
        }
        Ok(resp.data)
    }

    async fn search_id(&self, entity: &str, query: &str) -> Result<Option<String>, BioQueryError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(None);
        }
        let data: Option<SearchData> = self
            .graphql(
                r#"
query SearchEntity($query: String!, $entity: String!) {
  search(queryString: $query, entityNames: [$entity], page: {index: 0, size: 5}) {
    hits {
      id
      name
      entity
    }
  }
}
"#,
                json!({ "query": query, "entity": entity }),
            )
            .await?;

        let hits = data.and_then(|d| d.search).map(|s| s.hits).unwrap_or_default();
        let exact = hits.iter().find(|h| {
            h.entity.as_deref() == Some(entity)
                && h.name.as_deref().is_some_and(|n| n.trim().eq_ignore_ascii_case(query))
        });
        let first = hits.iter().find(|h| h.entity.as_deref() == Some(entity));
        Ok(exact.or(first).and_then(|h| clean(h.id.as_deref())))
    }

    async fn drug_id(&self, drug: &EntityCandidate) -> Result<Option<String>, BioQueryError> {
        if let Some(id) = drug.external_id("ChEMBL") {
            return Ok(Some(id.to_string()));
        }
        self.search_id("drug", &drug.canonical_name).await
    }

    async fn target_id(&self, target: &EntityCandidate) -> Result<Option<String>, BioQueryError> {
        if let Some(id) = target.external_id("Ensembl") {
            return Ok(Some(id.to_string()));
        }
        self.search_id("target", &target.canonical_name).await
    }

    async fn disease_id(&self, disease: &EntityCandidate) -> Result<Option<String>, BioQueryError> {
        if let Some(id) = ["EFO", "MONDO", "Orphanet"]
            .iter()
            .find_map(|ns| disease.external_id(ns))
            .and_then(normalize_disease_id)
        {
            return Ok(Some(id));
        }
        self.search_id("disease", &disease.canonical_name).await
    }

    pub async fn drug_indications(
        &self,
        chembl_id: &str,
        phase: Option<&str>,
    ) -> Result<Vec<NativeRecord>, BioQueryError> {
        let data: Option<DrugData> = self
            .graphql(
                r#"
query DrugIndications($chemblId: String!) {
  drug(chemblId: $chemblId) {
    id
    name
    indications {
      rows {
        maxPhaseForIndication
        disease { id name }
      }
    }
  }
}
"#,
                json!({ "chemblId": chembl_id }),
            )
            .await?;

        let Some(drug) = data.and_then(|d| d.drug) else {
            warn_missing_field("DrugIndications", "data.drug");
            return Ok(Vec::new());
        };
        let Some(rows) = drug.indications.map(|r| r.rows) else {
            warn_missing_field("DrugIndications", "data.drug.indications");
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for row in rows {
            if !row_phase_matches(phase, row.max_phase_for_indication) {
                continue;
            }
            let Some(disease) = row.disease else { continue };
            let mut record = NativeRecord::new();
            put(&mut record, "drug_name", clean(drug.name.as_deref()));
            put(&mut record, "chembl_id", clean(drug.id.as_deref()).or(Some(chembl_id.to_string())));
            put(&mut record, "disease_label", clean(disease.name.as_deref()));
            put(&mut record, "disease_id", clean(disease.id.as_deref()));
            put(&mut record, "clinical_phase", row.max_phase_for_indication.map(phase_value));
            out.push(record);
            if out.len() >= PAGE_SIZE {
                break;
            }
        }
        Ok(out)
    }

    pub async fn drug_adverse_events(
        &self,
        chembl_id: &str,
    ) -> Result<Vec<NativeRecord>, BioQueryError> {
        let data: Option<DrugData> = self
            .graphql(
                r#"
query DrugAdverseEvents($chemblId: String!, $size: Int!) {
  drug(chemblId: $chemblId) {
    id
    name
    adverseEvents(page: {index: 0, size: $size}) {
      rows {
        name
        count
        logLR
      }
    }
  }
}
"#,
                json!({ "chemblId": chembl_id, "size": PAGE_SIZE }),
            )
            .await?;

        let Some(drug) = data.and_then(|d| d.drug) else {
            warn_missing_field("DrugAdverseEvents", "data.drug");
            return Ok(Vec::new());
        };
        let Some(rows) = drug.adverse_events.map(|r| r.rows) else {
            warn_missing_field("DrugAdverseEvents", "data.drug.adverseEvents");
            return Ok(Vec::new());
        };

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let name = clean(row.name.as_deref())?;
                let mut record = NativeRecord::new();
                put(&mut record, "drug_name", clean(drug.name.as_deref()));
                put(&mut record, "chembl_id", Some(chembl_id.to_string()));
                put(&mut record, "adverse_event", Some(name));
                put(&mut record, "report_count", row.count);
                put(&mut record, "log_likelihood_ratio", row.log_lr);
                Some(record)
            })
            .collect())
    }

    pub async fn drug_mechanism_targets(
        &self,
        chembl_id: &str,
    ) -> Result<Vec<NativeRecord>, BioQueryError> {
        let data: Option<DrugData> = self
            .graphql(
                r#"
query DrugTargets($chemblId: String!) {
  drug(chemblId: $chemblId) {
    id
    name
    mechanismsOfAction {
      rows {
        mechanismOfAction
        actionType
        targets { id approvedSymbol }
      }
    }
  }
}
"#,
                json!({ "chemblId": chembl_id }),
            )
            .await?;

        let Some(drug) = data.and_then(|d| d.drug) else {
            warn_missing_field("DrugTargets", "data.drug");
            return Ok(Vec::new());
        };
        let Some(rows) = drug.mechanisms_of_action.map(|r| r.rows) else {
            warn_missing_field("DrugTargets", "data.drug.mechanismsOfAction");
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for row in rows {
            for target in row.targets {
                let mut record = NativeRecord::new();
                put(&mut record, "drug_name", clean(drug.name.as_deref()));
                put(&mut record, "chembl_id", Some(chembl_id.to_string()));
                put(&mut record, "approved_symbol", clean(target.approved_symbol.as_deref()));
                put(&mut record, "target_id", clean(target.id.as_deref()));
                put(&mut record, "action_type", clean(row.action_type.as_deref()));
                put(
                    &mut record,
                    "mechanism_of_action",
                    clean(row.mechanism_of_action.as_deref()),
                );
                out.push(record);
            }
        }
        out.truncate(PAGE_SIZE);
        Ok(out)
    }

    pub async fn disease_known_drugs(
        &self,
        efo_id: &str,
        phase: Option<&str>,
    ) -> Result<Vec<NativeRecord>, BioQueryError> {
        let data: Option<DiseaseData> = self
            .graphql(
                r#"
query DiseaseKnownDrugs($efoId: String!, $size: Int!) {
  disease(efoId: $efoId) {
    id
    name
    knownDrugs(size: $size) {
      rows {
        phase
        mechanismOfAction
        drug { id name }
      }
    }
  }
}
"#,
                json!({ "efoId": efo_id, "size": PAGE_SIZE }),
            )
            .await?;

        let Some(disease) = data.and_then(|d| d.disease) else {
            warn_missing_field("DiseaseKnownDrugs", "data.disease");
            return Ok(Vec::new());
        };
        let Some(rows) = disease.known_drugs.map(|r| r.rows) else {
            warn_missing_field("DiseaseKnownDrugs", "data.disease.knownDrugs");
            return Ok(Vec::new());
        };

        Ok(rows
            .into_iter()
            .filter(|row| row_phase_matches(phase, row.phase))
            .filter_map(|row| {
                let drug = row.drug?;
                let mut record = NativeRecord::new();
                put(&mut record, "disease_label", clean(disease.name.as_deref()));
                put(&mut record, "disease_id", Some(efo_id.to_string()));
                put(&mut record, "drug_name", clean(drug.name.as_deref()));
                put(&mut record, "chembl_id", clean(drug.id.as_deref()));
                put(&mut record, "clinical_phase", row.phase.map(phase_value));
                put(
                    &mut record,
                    "mechanism_of_action",
                    clean(row.mechanism_of_action.as_deref()),
                );
                Some(record)
            })
            .collect())
    }

    pub async fn disease_associated_targets(
        &self,
        efo_id: &str,
    ) -> Result<Vec<NativeRecord>, BioQueryError> {
        let data: Option<DiseaseData> = self
            .graphql(
                r#"
query DiseaseTargets($efoId: String!, $size: Int!) {
  disease(efoId: $efoId) {
    id
    name
    associatedTargets(page: {index: 0, size: $size}) {
      rows {
        score
        target { id approvedSymbol }
      }
    }
  }
}
"#,
                json!({ "efoId": efo_id, "size": PAGE_SIZE }),
            )
            .await?;

        let Some(disease) = data.and_then(|d| d.disease) else {
            warn_missing_field("DiseaseTargets", "data.disease");
            return Ok(Vec::new());
        };
        let Some(rows) = disease.associated_targets.map(|r| r.rows) else {
            warn_missing_field("DiseaseTargets", "data.disease.associatedTargets");
            return Ok(Vec::new());
        };

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let target = row.target?;
                let mut record = NativeRecord::new();
                put(&mut record, "approved_symbol", clean(target.approved_symbol.as_deref()));
                put(&mut record, "target_id", clean(target.id.as_deref()));
                put(&mut record, "disease_label", clean(disease.name.as_deref()));
                put(&mut record, "disease_id", Some(efo_id.to_string()));
                put(&mut record, "score", row.score);
                Some(record)
            })
            .collect())
    }

    pub async fn target_associated_diseases(
        &self,
        ensembl_id: &str,
    ) -> Result<Vec<NativeRecord>, BioQueryError> {
        let target = self
            .target_node(
                "TargetDiseases",
                r#"
query TargetDiseases($ensemblId: String!, $size: Int!) {
  target(ensemblId: $ensemblId) {
    id
    approvedSymbol
    associatedDiseases(page: {index: 0, size: $size}) {
      rows {
        score
        disease { id name }
      }
    }
  }
}
"#,
                ensembl_id,
            )
            .await?;
        let Some(target) = target else {
            return Ok(Vec::new());
        };
        let Some(rows) = target.associated_diseases.map(|r| r.rows) else {
            warn_missing_field("TargetDiseases", "data.target.associatedDiseases");
            return Ok(Vec::new());
        };

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let disease = row.disease?;
                let mut record = NativeRecord::new();
                put(&mut record, "approved_symbol", clean(target.approved_symbol.as_deref()));
                put(&mut record, "target_id", Some(ensembl_id.to_string()));
                put(&mut record, "disease_label", clean(disease.name.as_deref()));
                put(&mut record, "disease_id", clean(disease.id.as_deref()));
                put(&mut record, "score", row.score);
                Some(record)
            })
            .collect())
    }

    pub async fn target_known_drugs(
        &self,
        ensembl_id: &str,
        phase: Option<&str>,
    ) -> Result<Vec<NativeRecord>, BioQueryError> {
        let target = self
            .target_node(
                "TargetKnownDrugs",
                r#"
query TargetKnownDrugs($ensemblId: String!, $size: Int!) {
  target(ensemblId: $ensemblId) {
    id
    approvedSymbol
    knownDrugs(size: $size) {
      rows {
        phase
        mechanismOfAction
        drug { id name }
        disease { id name }
      }
    }
  }
}
"#,
                ensembl_id,
            )
            .await?;
        let Some(target) = target else {
            return Ok(Vec::new());
        };
        let Some(rows) = target.known_drugs.map(|r| r.rows) else {
            warn_missing_field("TargetKnownDrugs", "data.target.knownDrugs");
            return Ok(Vec::new());
        };

        Ok(rows
            .into_iter()
            .filter(|row| row_phase_matches(phase, row.phase))
            .filter_map(|row| {
                let drug = row.drug?;
                let disease = row.disease.unwrap_or_default();
                let mut record = NativeRecord::new();
                put(&mut record, "approved_symbol", clean(target.approved_symbol.as_deref()));
                put(&mut record, "target_id", Some(ensembl_id.to_string()));
                put(&mut record, "drug_name", clean(drug.name.as_deref()));
                put(&mut record, "chembl_id", clean(drug.id.as_deref()));
                put(&mut record, "disease_label", clean(disease.name.as_deref()));
                put(&mut record, "disease_id", clean(disease.id.as_deref()));
                put(&mut record, "clinical_phase", row.phase.map(phase_value));
                put(
                    &mut record,
                    "mechanism_of_action",
                    clean(row.mechanism_of_action.as_deref()),
                );
                Some(record)
            })
            .collect())
    }

    pub async fn target_interactions(
        &self,
        ensembl_id: &str,
    ) -> Result<Vec<NativeRecord>, BioQueryError> {
        let target = self
            .target_node(
                "TargetInteractions",
                r#"
query TargetInteractions($ensemblId: String!, $size: Int!) {
  target(ensemblId: $ensemblId) {
    id
    approvedSymbol
    interactions(page: {index: 0, size: $size}) {
      rows {
        score
        sourceDatabase
        targetB { id approvedSymbol }
      }
    }
  }
}
"#,
                ensembl_id,
            )
            .await?;
        let Some(target) = target else {
            return Ok(Vec::new());
        };
        let Some(rows) = target.interactions.map(|r| r.rows) else {
            warn_missing_field("TargetInteractions", "data.target.interactions");
            return Ok(Vec::new());
        };

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let partner = row.target_b?;
                let mut record = NativeRecord::new();
                put(&mut record, "approved_symbol", clean(target.approved_symbol.as_deref()));
                put(&mut record, "target_id", Some(ensembl_id.to_string()));
                put(&mut record, "partner_symbol", clean(partner.approved_symbol.as_deref()));
                put(&mut record, "partner_id", clean(partner.id.as_deref()));
                put(&mut record, "interaction_score", row.score);
                put(&mut record, "interaction_source", clean(row.source_database.as_deref()));
                Some(record)
            })
            .collect())
    }

    pub async fn target_expression(
        &self,
        ensembl_id: &str,
    ) -> Result<Vec<NativeRecord>, BioQueryError> {
        let target = self
            .target_node(
                "TargetExpression",
                r#"
query TargetExpression($ensemblId: String!) {
  target(ensemblId: $ensemblId) {
    id
    approvedSymbol
    expressions {
      tissue { label }
      rna { level value }
    }
  }
}
"#,
                ensembl_id,
            )
            .await?;
        let Some(target) = target else {
            return Ok(Vec::new());
        };
        let Some(rows) = target.expressions else {
            warn_missing_field("TargetExpression", "data.target.expressions");
            return Ok(Vec::new());
        };

        let mut out = rows
            .into_iter()
            .filter_map(|row| {
                let tissue = clean(row.tissue.and_then(|t| t.label).as_deref())?;
                let rna = row.rna.unwrap_or_default();
                let mut record = NativeRecord::new();
                put(&mut record, "approved_symbol", clean(target.approved_symbol.as_deref()));
                put(&mut record, "target_id", Some(ensembl_id.to_string()));
                put(&mut record, "tissue_label", Some(tissue));
                put(&mut record, "rna_level", rna.level);
                put(&mut record, "rna_value", rna.value);
                Some(record)
            })
            .collect::<Vec<_>>();
        out.truncate(PAGE_SIZE);
        Ok(out)
    }

    async fn target_node(
        &self,
        operation: &str,
        query: &str,
        ensembl_id: &str,
    ) -> Result<Option<TargetNode>, BioQueryError> {
        let data: Option<TargetData> = self
            .graphql(query, json!({ "ensemblId": ensembl_id, "size": PAGE_SIZE }))
            .await?;
        let target = data.and_then(|d| d.target);
        if target.is_none() {
            warn_missing_field(operation, "data.target");
        }
        Ok(target)
    }

    async fn answer(
        &self,
        entities: &ResolvedEntities,
        intent: IntentKind,
    ) -> Result<Vec<NativeRecord>, BioQueryError> {
        let phase = entities.phase();
        match intent {
            IntentKind::ListDiseases => {
                if let Some(drug) = entities.drug() {
                    let Some(id) = self.drug_id(drug).await? else {
                        return Ok(Vec::new());
                    };
                    return self.drug_indications(&id, phase).await;
                }
                if let Some(target) = entities.target() {
                    let Some(id) = self.target_id(target).await? else {
                        return Ok(Vec::new());
                    };
                    return self.target_associated_diseases(&id).await;
                }
                Ok(Vec::new())
            }
            IntentKind::ListToxicities => {
                let Some(drug) = entities.drug() else {
                    return Ok(Vec::new());
                };
                match self.drug_id(drug).await? {
                    Some(id) => self.drug_adverse_events(&id).await,
                    None => Ok(Vec::new()),
                }
            }
            IntentKind::ListDrugs => {
                if let Some(disease) = entities.disease() {
                    let Some(id) = self.disease_id(disease).await? else {
                        return Ok(Vec::new());
                    };
                    return self.disease_known_drugs(&id, phase).await;
                }
                if let Some(target) = entities.target() {
                    let Some(id) = self.target_id(target).await? else {
                        return Ok(Vec::new());
                    };
                    return self.target_known_drugs(&id, phase).await;
                }
                Ok(Vec::new())
            }
            IntentKind::ListTargets => {
                if let Some(drug) = entities.drug() {
                    let Some(id) = self.drug_id(drug).await? else {
                        return Ok(Vec::new());
                    };
                    return self.drug_mechanism_targets(&id).await;
                }
                if let Some(disease) = entities.disease() {
                    let Some(id) = self.disease_id(disease).await? else {
                        return Ok(Vec::new());
                    };
                    return self.disease_associated_targets(&id).await;
                }
                Ok(Vec::new())
            }
            IntentKind::ListInteractions | IntentKind::ListExpression => {
                let Some(target) = entities.target() else {
                    return Ok(Vec::new());
                };
                let Some(id) = self.target_id(target).await? else {
                    return Ok(Vec::new());
                };
                if intent == IntentKind::ListInteractions {
                    self.target_interactions(&id).await
                } else {
                    self.target_expression(&id).await
                }
            }
        }
    }
}

#[async_trait]
impl BiomedicalSource for OpenTargetsClient {
    fn kind(&self) -> SourceKind {
        SourceKind::OpenTargets
    }

    async fn query(
        &self,
        entities: &ResolvedEntities,
        intent: IntentKind,
    ) -> Result<Vec<NativeRecord>, SourceError> {
        let records = self.answer(entities, intent).await?;
        debug!(source = OPENTARGETS_API, intent = %intent, records = records.len(), "Query finished");
        Ok(records)
    }
}

fn row_phase_matches(requested: Option<&str>, phase: Option<f64>) -> bool {
    match (requested, phase) {
        (None, _) => true,
        (Some(requested), Some(phase)) => phase_matches(requested, &phase.to_string()),
        (Some(_), None) => false,
    }
}

fn phase_value(phase: f64) -> Value {
    if phase.fract() == 0.0 {
        json!(phase as i64)
    } else {
        json!(phase)
    }
}

fn normalize_disease_id(input: &str) -> Option<String> {
    let v = input.trim();
    if v.is_empty() {
        return None;
    }

    if v.contains('_') && v.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Some(v.to_string());
    }

    if let Some((prefix, rest)) = v.split_once(':') {
        let rest = rest.trim();
        if rest.is_empty() {
            return None;
        }
        return Some(format!("{}_{}", prefix.trim().to_ascii_uppercase(), rest));
    }

    None
}

fn warn_missing_field(operation: &str, field: &str) {
    warn!(
        source = OPENTARGETS_API,
        operation = operation,
        field = field,
        "Missing expected GraphQL field; degrading response"
    );
}

#[derive(Debug, Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: Value,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Rows<T> {
    #[serde(default = "Vec::new")]
    rows: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
struct NamedNode {
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetRef {
    id: Option<String>,
    approved_symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DrugData {
    drug: Option<DrugNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DrugNode {
    id: Option<String>,
    name: Option<String>,
    indications: Option<Rows<IndicationRow>>,
    adverse_events: Option<Rows<AdverseEventRow>>,
    mechanisms_of_action: Option<Rows<MechanismRow>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndicationRow {
    max_phase_for_indication: Option<f64>,
    disease: Option<NamedNode>,
}

#[derive(Debug, Deserialize)]
struct AdverseEventRow {
    name: Option<String>,
    count: Option<u64>,
    #[serde(rename = "logLR")]
    log_lr: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MechanismRow {
    mechanism_of_action: Option<String>,
    action_type: Option<String>,
    #[serde(default)]
    targets: Vec<TargetRef>,
}

#[derive(Debug, Deserialize)]
struct DiseaseData {
    disease: Option<DiseaseNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiseaseNode {
    name: Option<String>,
    known_drugs: Option<Rows<KnownDrugRow>>,
    associated_targets: Option<Rows<AssociatedTargetRow>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KnownDrugRow {
    phase: Option<f64>,
    mechanism_of_action: Option<String>,
    drug: Option<NamedNode>,
    disease: Option<NamedNode>,
}

#[derive(Debug, Deserialize)]
struct AssociatedTargetRow {
    score: Option<f64>,
    target: Option<TargetRef>,
}

#[derive(Debug, Deserialize)]
struct TargetData {
    target: Option<TargetNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetNode {
    approved_symbol: Option<String>,
    associated_diseases: Option<Rows<AssociatedDiseaseRow>>,
    known_drugs: Option<Rows<KnownDrugRow>>,
    interactions: Option<Rows<InteractionRow>>,
    expressions: Option<Vec<ExpressionRow>>,
}

#[derive(Debug, Deserialize)]
struct AssociatedDiseaseRow {
    score: Option<f64>,
    disease: Option<NamedNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InteractionRow {
    score: Option<f64>,
    source_database: Option<String>,
    target_b: Option<TargetRef>,
}

#[derive(Debug, Deserialize)]
struct ExpressionRow {
    tissue: Option<TissueNode>,
    rna: Option<RnaNode>,
}

#[derive(Debug, Deserialize)]
struct TissueNode {
    label: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RnaNode {
    level: Option<i64>,
    value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SearchData {
    search: Option<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    id: Option<String>,
    name: Option<String>,
    entity: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::synonyms::SynonymIndex;
    use crate::entities::{EntityClass, test_candidate};
    use crate::sources::SourceErrorReason;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn builtin_candidate(class: EntityClass, name: &str) -> EntityCandidate {
        let index = SynonymIndex::builtin().unwrap();
        let entry = index.find(class, name).unwrap();
        let mut candidate = test_candidate(class, &entry.canonical_name, 0.95);
        candidate.external_ids = entry.external_ids.clone();
        candidate
    }

    #[test]
    fn normalize_disease_id_handles_known_forms() {
        assert_eq!(
            normalize_disease_id("MONDO:0005105").as_deref(),
            Some("MONDO_0005105")
        );
        assert_eq!(
            normalize_disease_id("EFO_0000311").as_deref(),
            Some("EFO_0000311")
        );
        assert_eq!(normalize_disease_id(""), None);
    }

    #[test]
    fn row_phase_filter_treats_phase_four_as_approved() {
        assert!(row_phase_matches(None, None));
        assert!(row_phase_matches(Some("2"), Some(2.0)));
        assert!(row_phase_matches(Some("approved"), Some(4.0)));
        assert!(!row_phase_matches(Some("2"), Some(3.0)));
        assert!(!row_phase_matches(Some("2"), None));
    }

    #[tokio::test]
    async fn imatinib_phase_two_indications_map_to_native_records() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/graphql"))
            .and(body_string_contains("DrugIndications"))
            .and(body_string_contains("\"chemblId\":\"CHEMBL941\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "drug": {
                        "id": "CHEMBL941",
                        "name": "IMATINIB",
                        "indications": {
                            "rows": [
                                {
                                    "maxPhaseForIndication": 2,
                                    "disease": {"id": "EFO_0000220", "name": "Chronic Myeloid Leukemia"}
                                },
                                {
                                    "maxPhaseForIndication": 4,
                                    "disease": {"id": "EFO_0000559", "name": "Gastrointestinal Stromal Tumor"}
                                }
                            ]
                        }
                    }
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenTargetsClient::new_for_test(server.uri()).unwrap();
        let mut entities = ResolvedEntities::new();
        entities.insert(builtin_candidate(EntityClass::Drug, "Imatinib"));
        entities.insert(test_candidate(EntityClass::Phase, "2", 0.95));

        let records = client
            .query(&entities, IntentKind::ListDiseases)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["disease_label"], json!("Chronic Myeloid Leukemia"));
        assert_eq!(records[0]["disease_id"], json!("EFO_0000220"));
        assert_eq!(records[0]["clinical_phase"], json!(2));
        assert_eq!(records[0]["chembl_id"], json!("CHEMBL941"));
    }

    #[tokio::test]
    async fn target_without_ensembl_id_uses_search_fallback() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/graphql"))
            .and(body_string_contains("SearchEntity"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "search": {
                        "hits": [
                            {"id": "ENSG00000135679", "name": "MDM4", "entity": "target"},
                            {"id": "ENSG00000141510", "name": "TP53", "entity": "target"}
                        ]
                    }
                }
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/graphql"))
            .and(body_string_contains("TargetInteractions"))
            .and(body_string_contains("\"ensemblId\":\"ENSG00000141510\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "target": {
                        "id": "ENSG00000141510",
                        "approvedSymbol": "TP53",
                        "interactions": {
                            "rows": [
                                {
                                    "score": 0.95,
                                    "sourceDatabase": "intact",
                                    "targetB": {"id": "ENSG00000135679", "approvedSymbol": "MDM2"}
                                }
                            ]
                        }
                    }
                }
            })))
            .mount(&server)
            .await;

        let client = OpenTargetsClient::new_for_test(server.uri()).unwrap();
        let mut entities = ResolvedEntities::new();
        entities.insert(test_candidate(EntityClass::Target, "TP53", 0.95));

        let records = client
            .query(&entities, IntentKind::ListInteractions)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["partner_symbol"], json!("MDM2"));
        assert_eq!(records[0]["interaction_score"], json!(0.95));
    }

    #[tokio::test]
    async fn adverse_events_leave_severity_out() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/graphql"))
            .and(body_string_contains("DrugAdverseEvents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "drug": {
                        "id": "CHEMBL1421",
                        "name": "DASATINIB",
                        "adverseEvents": {
                            "rows": [
                                {"name": "pleural effusion", "count": 812, "logLR": 1530.2},
                                {"name": "  ", "count": 1, "logLR": 0.1}
                            ]
                        }
                    }
                }
            })))
            .mount(&server)
            .await;

        let client = OpenTargetsClient::new_for_test(server.uri()).unwrap();
        let mut entities = ResolvedEntities::new();
        entities.insert(builtin_candidate(EntityClass::Drug, "Dasatinib"));

        let records = client
            .query(&entities, IntentKind::ListToxicities)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["adverse_event"], json!("pleural effusion"));
        assert!(!records[0].contains_key("severity"));
    }

    #[tokio::test]
    async fn graphql_errors_are_malformed_responses() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": [{"message": "Cannot query field \"foo\""}]
            })))
            .mount(&server)
            .await;

        let client = OpenTargetsClient::new_for_test(server.uri()).unwrap();
        let mut entities = ResolvedEntities::new();
        entities.insert(builtin_candidate(EntityClass::Drug, "Imatinib"));

        let err = client
            .query(&entities, IntentKind::ListTargets)
            .await
            .unwrap_err();
        assert_eq!(err.reason, SourceErrorReason::MalformedResponse);
        assert!(err.detail.contains("Cannot query field"));
    }

    #[tokio::test]
    async fn missing_anchor_yields_zero_rows_without_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let client = OpenTargetsClient::new_for_test(server.uri()).unwrap();
        let mut entities = ResolvedEntities::new();
        entities.insert(builtin_candidate(EntityClass::Disease, "Alopecia"));

        let records = client
            .query(&entities, IntentKind::ListExpression)
            .await
            .unwrap();
        assert!(records.is_empty());
    }
}
