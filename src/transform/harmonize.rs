//! Maps per-source native records onto the intent's common schema.

use std::collections::{BTreeMap, BTreeSet};

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;
use tracing::debug;

use super::phase::normalize_phase;
use super::schema::{self, PHASE_FIELD, SOURCE_FIELD};
use crate::intent::IntentKind;
use crate::sources::{NativeRecord, SourceKind};

/// A cell value. `Absent` is distinct from any real value, including 0 and "".
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Value(Value),
    Absent,
}

impl FieldValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Absent => None,
        }
    }

    /// Plain-text rendering of a present value; strings lose their quotes.
    pub fn text(&self) -> Option<String> {
        match self {
            Self::Value(Value::String(s)) => Some(s.clone()),
            Self::Value(other) => Some(other.to_string()),
            Self::Absent => None,
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Value(v) => v.serialize(serializer),
            Self::Absent => serializer.serialize_none(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarmonizedRecord {
    pub fields: BTreeMap<String, FieldValue>,
    pub source: SourceKind,
}

impl HarmonizedRecord {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Text for one table cell; `None` means absent.
    pub fn cell(&self, column: &str) -> Option<String> {
        if column == SOURCE_FIELD {
            return Some(self.source.display_name().to_string());
        }
        self.fields.get(column).and_then(FieldValue::text)
    }
}

impl Serialize for HarmonizedRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.serialize_entry(SOURCE_FIELD, &self.source)?;
        map.end()
    }
}

fn present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

fn harmonize_one(source: SourceKind, intent: IntentKind, native: &NativeRecord) -> HarmonizedRecord {
    let mut fields = schema::intent_fields(intent)
        .iter()
        .map(|name| (name.to_string(), FieldValue::Absent))
        .collect::<BTreeMap<_, _>>();

    // Renamed fields first so a native key that already uses the common
    // name takes precedence.
    let (renamed, direct): (Vec<_>, Vec<_>) = native
        .iter()
        .filter(|(key, _)| key.as_str() != SOURCE_FIELD)
        .map(|(key, value)| match schema::common_name(source, intent, key) {
            Some(common) => (common.to_string(), value, true),
            None => (key.clone(), value, false),
        })
        .partition(|(_, _, was_renamed)| *was_renamed);

    for (name, value, _) in renamed.into_iter().chain(direct) {
        let value = if name == PHASE_FIELD {
            normalize_phase(value)
        } else {
            value.clone()
        };
        if present(&value) {
            fields.insert(name, FieldValue::Value(value));
        } else {
            fields.entry(name).or_insert(FieldValue::Absent);
        }
    }

    HarmonizedRecord { fields, source }
}

/// Concatenates per-source records in the given order, preserving each
/// source's arrival order. No dedup and no sorting.
pub fn harmonize(
    raw_by_source: &[(SourceKind, Vec<NativeRecord>)],
    intent: IntentKind,
) -> Vec<HarmonizedRecord> {
    let mut out = Vec::new();
    for (source, records) in raw_by_source {
        debug!(source = %source, intent = %intent, records = records.len(), "Harmonizing");
        out.extend(records.iter().map(|r| harmonize_one(*source, intent, r)));
    }
    out
}

/// Column order: schema fields, then extra fields lexically, then `source`.
pub fn columns(records: &[HarmonizedRecord], intent: IntentKind) -> Vec<String> {
    let schema = schema::intent_fields(intent);
    let extras = records
        .iter()
        .flat_map(|r| r.fields.keys())
        .filter(|k| !schema.contains(&k.as_str()) && k.as_str() != SOURCE_FIELD)
        .collect::<BTreeSet<_>>();

    schema
        .iter()
        .map(|s| s.to_string())
        .chain(extras.into_iter().cloned())
        .chain(std::iter::once(SOURCE_FIELD.to_string()))
        .collect()
}
