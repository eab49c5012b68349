use std::borrow::Cow;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use super::{BiomedicalSource, NativeRecord, SourceError, SourceKind, clean, put};
use crate::entities::ResolvedEntities;
use crate::error::BioQueryError;
use crate::intent::IntentKind;

const HPA_API: &str = "hpa";
const HPA_COLUMNS: &str = "g,eg,rnats,rnatd,scl";

pub struct ProteinAtlasClient {
    client: reqwest_middleware::ClientWithMiddleware,
    base: Cow<'static, str>,
}

impl ProteinAtlasClient {
    pub fn new() -> Result<Self, BioQueryError> {
        Ok(Self {
            client: crate::sources::shared_client()?,
            base: crate::sources::source_base(SourceKind::ProteinAtlas),
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

    /// Tissue expression summary for one gene. Only exact symbol hits are kept;
    /// the search endpoint also returns loosely related genes.
    pub async fn expression(&self, symbol: &str) -> Result<Vec<NativeRecord>, BioQueryError> {
        let symbol = symbol.trim();
        if !crate::sources::is_valid_gene_symbol(symbol) {
            return Err(BioQueryError::InvalidArgument(format!(
                "Invalid gene symbol '{symbol}'"
            )));
        }

        let url = self.endpoint("api/search_download.php");
        let rows: Vec<HpaGene> = crate::sources::send_json(
            SourceKind::ProteinAtlas,
            self.client.get(&url).query(&[
                ("search", symbol),
                ("format", "json"),
                ("columns", HPA_COLUMNS),
                ("compress", "no"),
            ]),
        )
        .await?;

        Ok(rows
            .into_iter()
            .filter(|row| {
                row.gene
                    .as_deref()
                    .is_some_and(|g| g.trim().eq_ignore_ascii_case(symbol))
            })
            .map(HpaGene::into_record)
            .collect())
    }
}

#[async_trait]
impl BiomedicalSource for ProteinAtlasClient {
    fn kind(&self) -> SourceKind {
        SourceKind::ProteinAtlas
    }

    async fn query(
        &self,
        entities: &ResolvedEntities,
        intent: IntentKind,
    ) -> Result<Vec<NativeRecord>, SourceError> {
        if intent != IntentKind::ListExpression {
            return Ok(Vec::new());
        }
        let Some(target) = entities.target() else {
            return Ok(Vec::new());
        };
        let symbol = target.canonical_name.as_str();
        if !crate::sources::is_valid_gene_symbol(symbol) {
            warn!(source = HPA_API, symbol, "Target name is not a gene symbol, skipping");
            return Ok(Vec::new());
        }

        let records = self.expression(symbol).await?;
        debug!(source = HPA_API, symbol, records = records.len(), "Query finished");
        Ok(records)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct HpaGene {
    #[serde(rename = "Gene")]
    gene: Option<String>,
    #[serde(rename = "Ensembl")]
    ensembl: Option<String>,
    #[serde(rename = "RNA tissue specificity")]
    rna_tissue_specificity: Option<String>,
    #[serde(rename = "RNA tissue distribution")]
    rna_tissue_distribution: Option<String>,
    #[serde(
        rename = "Subcellular location",
        default,
        deserialize_with = "location_list"
    )]
    subcellular_location: Vec<String>,
}

/// HPA sends a lone location as a bare string and several as an array.
fn location_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Locations {
        One(String),
        Many(Vec<Option<String>>),
    }

    Ok(match Option::<Locations>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Locations::One(location)) => vec![location],
        Some(Locations::Many(locations)) => locations.into_iter().flatten().collect(),
    })
}

impl HpaGene {
    fn into_record(self) -> NativeRecord {
        let locations = self
            .subcellular_location
            .into_iter()
            .filter_map(|v| clean(Some(&v)))
            .collect::<Vec<_>>();

        let mut record = NativeRecord::new();
        put(&mut record, "gene", clean(self.gene.as_deref()));
        put(&mut record, "ensembl", clean(self.ensembl.as_deref()));
        put(
            &mut record,
            "rna_tissue_specificity",
            clean(self.rna_tissue_specificity.as_deref()),
        );
        put(
            &mut record,
            "rna_tissue_distribution",
            clean(self.rna_tissue_distribution.as_deref()),
        );
        put(
            &mut record,
            "subcellular_location",
            (!locations.is_empty()).then(|| locations.join(", ")),
        );
        record
    }
}
