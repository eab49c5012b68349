use std::borrow::Cow;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{BiomedicalSource, NativeRecord, SourceError, SourceKind, clean, put};
use crate::entities::ResolvedEntities;
use crate::error::BioQueryError;
use crate::intent::IntentKind;
use crate::transform::phase::{APPROVED, PRECLINICAL};

const CTGOV_API: &str = "clinicaltrials";
const PAGE_SIZE: usize = 20;
const MAX_ROWS: usize = 50;

pub struct ClinicalTrialsClient {
    client: reqwest_middleware::ClientWithMiddleware,
    base: Cow<'static, str>,
}

/// Which side of the study the query is anchored on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anchor {
    Intervention,
    Condition,
}

impl ClinicalTrialsClient {
    pub fn new() -> Result<Self, BioQueryError> {
        Ok(Self {
            client: crate::sources::shared_client()?,
            base: crate::sources::source_base(SourceKind::ClinicalTrials),
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

    async fn search_studies(
        &self,
        anchor: Anchor,
        term: &str,
        phase_filter: Option<&str>,
    ) -> Result<Vec<CtGovStudy>, BioQueryError> {
        let param = match anchor {
            Anchor::Intervention => "query.intr",
            Anchor::Condition => "query.cond",
        };
        let page_size = PAGE_SIZE.to_string();
        let mut params = vec![
            (param, term.to_string()),
            ("pageSize", page_size),
            ("format", "json".to_string()),
        ];
        if let Some(phase) = phase_filter {
            params.push(("filter.advanced", format!("AREA[Phase]{phase}")));
        }

        let url = self.endpoint("studies");
        let resp: CtGovSearchResponse =
            crate::sources::send_json(SourceKind::ClinicalTrials, self.client.get(&url).query(&params))
                .await?;
        Ok(resp.studies)
    }

    pub async fn studies_for_drug(
        &self,
        drug: &str,
        phase: Option<&str>,
    ) -> Result<Vec<NativeRecord>, BioQueryError> {
        let Some(filter) = phase_filter(phase) else {
            return Ok(Vec::new());
        };
        let studies = self
            .search_studies(Anchor::Intervention, drug, filter)
            .await?;
        Ok(flatten(&studies, Anchor::Intervention, drug))
    }

    pub async fn studies_for_condition(
        &self,
        condition: &str,
        phase: Option<&str>,
    ) -> Result<Vec<NativeRecord>, BioQueryError> {
        let Some(filter) = phase_filter(phase) else {
            return Ok(Vec::new());
        };
        let studies = self
            .search_studies(Anchor::Condition, condition, filter)
            .await?;
        Ok(flatten(&studies, Anchor::Condition, condition))
    }
}

#[async_trait]
impl BiomedicalSource for ClinicalTrialsClient {
    fn kind(&self) -> SourceKind {
        SourceKind::ClinicalTrials
    }

    async fn query(
        &self,
        entities: &ResolvedEntities,
        intent: IntentKind,
    ) -> Result<Vec<NativeRecord>, SourceError> {
        let phase = entities.phase();
        let records = match intent {
            IntentKind::ListDiseases => match entities.drug() {
                Some(drug) => self.studies_for_drug(&drug.canonical_name, phase).await?,
                None => Vec::new(),
            },
            IntentKind::ListDrugs => match entities.disease() {
                Some(disease) => {
                    self.studies_for_condition(&disease.canonical_name, phase)
                        .await?
                }
                None => Vec::new(),
            },
            _ => Vec::new(),
        };
        debug!(source = CTGOV_API, intent = %intent, records = records.len(), "Query finished");
        Ok(records)
    }
}

/// Outer `None`: the phase cannot occur in a registered trial.
fn phase_filter(phase: Option<&str>) -> Option<Option<&'static str>> {
    match phase {
        None => Some(None),
        Some("1") => Some(Some("PHASE1")),
        Some("2") => Some(Some("PHASE2")),
        Some("3") => Some(Some("PHASE3")),
        Some(APPROVED) => Some(Some("PHASE4")),
        Some(PRECLINICAL) => None,
        Some(_) => Some(None),
    }
}

/// One record per (study, condition) or (study, intervention) pair.
fn flatten(studies: &[CtGovStudy], anchor: Anchor, term: &str) -> Vec<NativeRecord> {
    let mut out = Vec::new();
    for study in studies {
        let Some(protocol) = study.protocol_section.as_ref() else {
            continue;
        };
        let ident = protocol.identification_module.as_ref();
        let nct_id = ident.and_then(|m| clean(m.nct_id.as_deref()));
        let title = ident.and_then(|m| clean(m.brief_title.as_deref()));
        let status = protocol
            .status_module
            .as_ref()
            .and_then(|m| clean(m.overall_status.as_deref()));
        let phases = protocol
            .design_module
            .as_ref()
            .map(|m| m.phases.clone())
            .filter(|p| !p.is_empty());
        let conditions = protocol
            .conditions_module
            .as_ref()
            .map(|m| m.conditions.clone())
            .unwrap_or_default();
        let interventions = protocol
            .arms_interventions_module
            .as_ref()
            .map(|m| {
                m.interventions
                    .iter()
                    .filter(|i| {
                        i.intervention_type
                            .as_deref()
                            .is_none_or(|t| t.eq_ignore_ascii_case("DRUG") || t.eq_ignore_ascii_case("BIOLOGICAL"))
                    })
                    .filter_map(|i| clean(i.name.as_deref()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let (fixed_key, varying_key, varying) = match anchor {
            Anchor::Intervention => ("intervention_name", "condition", conditions),
            Anchor::Condition => ("condition", "intervention_name", interventions),
        };

        for value in varying.iter().filter_map(|v| clean(Some(v.as_str()))) {
            let mut record = NativeRecord::new();
            put(&mut record, "nct_id", nct_id.clone());
            put(&mut record, "brief_title", title.clone());
            put(&mut record, "overall_status", status.clone());
            put(&mut record, fixed_key, Some(term.trim().to_string()));
            put(&mut record, varying_key, Some(value));
            put(&mut record, "study_phase", phases.clone());
            out.push(record);
            if out.len() >= MAX_ROWS {
                return out;
            }
        }
    }
    out
}

#[derive(Debug, Deserialize)]
struct CtGovSearchResponse {
    #[serde(default)]
    studies: Vec<CtGovStudy>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CtGovStudy {
    protocol_section: Option<ProtocolSection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtocolSection {
    identification_module: Option<IdentificationModule>,
    status_module: Option<StatusModule>,
    design_module: Option<DesignModule>,
    conditions_module: Option<ConditionsModule>,
    arms_interventions_module: Option<ArmsInterventionsModule>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentificationModule {
    nct_id: Option<String>,
    brief_title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusModule {
    overall_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DesignModule {
    #[serde(default)]
    phases: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ConditionsModule {
    #[serde(default)]
    conditions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ArmsInterventionsModule {
    #[serde(default)]
    interventions: Vec<Intervention>,
}

#[derive(Debug, Deserialize)]
struct Intervention {
    name: Option<String>,
    #[serde(rename = "type")]
    intervention_type: Option<String>,
}
