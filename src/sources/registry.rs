//! The set of sources a pipeline fans out to.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::chembl::ChemblClient;
use super::clinicaltrials::ClinicalTrialsClient;
use super::fixtures::{FixtureSource, builtin_entries};
use super::hpa::ProteinAtlasClient;
use super::opentargets::OpenTargetsClient;
use super::{BiomedicalSource, SourceKind};
use crate::error::BioQueryError;

/// Sources keyed by kind. Iteration order is the fixed `SourceKind` order,
/// which is also the order harmonized records are concatenated in.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<SourceKind, Arc<dyn BiomedicalSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP clients for every upstream database.
    pub fn live() -> Result<Self, BioQueryError> {
        let mut registry = Self::new();
        registry.register(Arc::new(OpenTargetsClient::new()?));
        registry.register(Arc::new(ClinicalTrialsClient::new()?));
        registry.register(Arc::new(ChemblClient::new()?));
        registry.register(Arc::new(ProteinAtlasClient::new()?));
        Ok(registry)
    }

    /// Canned records for every source; no network access.
    pub fn fixtures() -> Result<Self, BioQueryError> {
        let entries = builtin_entries()?;
        let mut registry = Self::new();
        for kind in SourceKind::ALL {
            registry.register(Arc::new(FixtureSource::new(kind, Arc::clone(&entries))));
        }
        Ok(registry)
    }

    /// Replaces any source already registered under the same kind.
    pub fn register(&mut self, source: Arc<dyn BiomedicalSource>) {
        self.sources.insert(source.kind(), source);
    }

    pub fn get(&self, kind: SourceKind) -> Option<Arc<dyn BiomedicalSource>> {
        self.sources.get(&kind).cloned()
    }

    pub fn require(&self, kind: SourceKind) -> Result<Arc<dyn BiomedicalSource>, BioQueryError> {
        self.get(kind).ok_or_else(|| BioQueryError::SourceUnavailable {
            source_name: kind.display_name().to_string(),
            reason: "No client is registered for this source.".into(),
            suggestion: "bioquery sources".into(),
        })
    }

    pub fn kinds(&self) -> Vec<SourceKind> {
        self.sources.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixtures_cover_every_source_in_fixed_order() {
        let registry = SourceRegistry::fixtures().unwrap();
        assert_eq!(registry.kinds(), SourceKind::ALL.to_vec());
        for kind in SourceKind::ALL {
            assert_eq!(registry.get(kind).map(|s| s.kind()), Some(kind));
        }
    }

    #[test]
    fn register_replaces_same_kind() {
        let entries = builtin_entries().unwrap();
        let mut registry = SourceRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(FixtureSource::new(SourceKind::Chembl, Arc::clone(&entries))));
        registry.register(Arc::new(FixtureSource::new(SourceKind::Chembl, entries)));
        assert_eq!(registry.kinds(), vec![SourceKind::Chembl]);
    }
}
