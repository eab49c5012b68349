//! Per-class synonym tables mapping surface forms to canonical entries.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use rust_embed::RustEmbed;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::EntityClass;
use crate::error::BioQueryError;

#[derive(RustEmbed)]
#[folder = "data/"]
pub(crate) struct EmbeddedData;

const BUILTIN_SYNONYMS: &str = "synonyms.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynonymEntry {
    pub canonical_name: String,
    #[serde(default)]
    pub synonyms: BTreeSet<String>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

impl SynonymEntry {
    /// True when `name` is the canonical name or one of the synonyms.
    pub fn answers_to(&self, name: &str) -> bool {
        let name = name.trim();
        self.canonical_name.eq_ignore_ascii_case(name)
            || self.synonyms.iter().any(|s| s.eq_ignore_ascii_case(name))
    }
}

/// Immutable lookup structure. Rebuilt wholesale on reload, never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SynonymIndex {
    classes: BTreeMap<EntityClass, Vec<SynonymEntry>>,
}

impl SynonymIndex {
    pub fn from_entries(
        classes: BTreeMap<EntityClass, Vec<SynonymEntry>>,
    ) -> Result<Self, BioQueryError> {
        for (class, entries) in &classes {
            if *class == EntityClass::Phase {
                return Err(BioQueryError::InvalidSynonymIndex(
                    "phase values are pattern-matched and cannot carry a synonym table".into(),
                ));
            }
            validate_class(*class, entries)?;
        }
        Ok(Self { classes })
    }

    pub fn from_json_str(raw: &str) -> Result<Self, BioQueryError> {
        let classes: BTreeMap<EntityClass, Vec<SynonymEntry>> = serde_json::from_str(raw)?;
        Self::from_entries(classes)
    }

    pub fn load(path: &Path) -> Result<Self, BioQueryError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// The curated table compiled into the binary.
    pub fn builtin() -> Result<Self, BioQueryError> {
        let Some(asset) = EmbeddedData::get(BUILTIN_SYNONYMS) else {
            return Err(BioQueryError::InvalidSynonymIndex(format!(
                "embedded {BUILTIN_SYNONYMS} is missing"
            )));
        };
        let raw = std::str::from_utf8(asset.data.as_ref()).map_err(|_| {
            BioQueryError::InvalidSynonymIndex(format!("embedded {BUILTIN_SYNONYMS} is not UTF-8"))
        })?;
        Self::from_json_str(raw)
    }

    pub fn entries(&self, class: EntityClass) -> &[SynonymEntry] {
        self.classes.get(&class).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Exact (case-insensitive) lookup by canonical name or synonym.
    pub fn find(&self, class: EntityClass, name: &str) -> Option<&SynonymEntry> {
        self.entries(class).iter().find(|e| e.answers_to(name))
    }

    pub fn len(&self) -> usize {
        self.classes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn validate_class(class: EntityClass, entries: &[SynonymEntry]) -> Result<(), BioQueryError> {
    // lowercased surface form -> owning canonical name
    let mut owners: HashMap<String, &str> = HashMap::new();

    for entry in entries {
        let canonical = entry.canonical_name.trim();
        if canonical.is_empty() {
            return Err(BioQueryError::InvalidSynonymIndex(format!(
                "{class} entry with empty canonical name"
            )));
        }
        let key = canonical.to_lowercase();
        if let Some(owner) = owners.get(&key) {
            return Err(BioQueryError::InvalidSynonymIndex(format!(
                "{class} name '{canonical}' is already used by '{owner}'"
            )));
        }
        owners.insert(key, canonical);
    }

    for entry in entries {
        let canonical = entry.canonical_name.trim();
        for synonym in &entry.synonyms {
            let key = synonym.trim().to_lowercase();
            if key.is_empty() {
                return Err(BioQueryError::InvalidSynonymIndex(format!(
                    "{class} entry '{canonical}' has an empty synonym"
                )));
            }
            match owners.get(&key) {
                Some(owner) if *owner != canonical => {
                    return Err(BioQueryError::InvalidSynonymIndex(format!(
                        "{class} synonym '{synonym}' of '{canonical}' is already used by '{owner}'"
                    )));
                }
                _ => {
                    owners.insert(key, canonical);
                }
            }
        }
    }

    Ok(())
}

/// Injectable synonym backend: lookups read a snapshot, reloads swap it.
pub trait SynonymProvider: Send + Sync {
    fn snapshot(&self) -> Arc<SynonymIndex>;
    fn reload(&self) -> Result<(), BioQueryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynonymLoader {
    Builtin,
    File(PathBuf),
}

impl SynonymLoader {
    /// `BIOQUERY_SYNONYMS` points at a curated JSON file; otherwise the builtin table.
    pub fn from_env() -> Self {
        std::env::var("BIOQUERY_SYNONYMS")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(|s| Self::File(PathBuf::from(s)))
            .unwrap_or(Self::Builtin)
    }

    pub fn load(&self) -> Result<SynonymIndex, BioQueryError> {
        match self {
            Self::Builtin => SynonymIndex::builtin(),
            Self::File(path) => SynonymIndex::load(path),
        }
    }
}

#[derive(Debug)]
pub struct SharedSynonymIndex {
    loader: SynonymLoader,
    current: RwLock<Arc<SynonymIndex>>,
}

impl SharedSynonymIndex {
    pub fn new(loader: SynonymLoader) -> Result<Self, BioQueryError> {
        let index = loader.load()?;
        info!(entries = index.len(), "Loaded synonym index");
        Ok(Self {
            loader,
            current: RwLock::new(Arc::new(index)),
        })
    }

    /// Wraps a prebuilt index; `reload` re-reads from `loader`.
    pub fn with_index(loader: SynonymLoader, index: SynonymIndex) -> Self {
        Self {
            loader,
            current: RwLock::new(Arc::new(index)),
        }
    }
}

impl SynonymProvider for SharedSynonymIndex {
    fn snapshot(&self) -> Arc<SynonymIndex> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn reload(&self) -> Result<(), BioQueryError> {
        let next = match self.loader.load() {
            Ok(index) => Arc::new(index),
            Err(err) => {
                warn!("Synonym reload failed; keeping previous index: {err}");
                return Err(err);
            }
        };
        let entries = next.len();
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        info!(entries, "Reloaded synonym index");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn entry(canonical: &str, synonyms: &[&str], ids: &[(&str, &str)]) -> SynonymEntry {
    SynonymEntry {
        canonical_name: canonical.to_string(),
        synonyms: synonyms.iter().map(|s| s.to_string()).collect(),
        external_ids: ids
            .iter()
            .map(|(ns, id)| (ns.to_string(), id.to_string()))
            .collect(),
    }
}
