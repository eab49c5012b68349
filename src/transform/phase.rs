//! Canonical clinical phase values: "1".."3", "approved", "preclinical".
//!
//! Phase 4 (post-marketing) is reported as "approved" so that a ChEMBL
//! `max_phase` of 4 and an OpenTargets "Approved" status line up.

use serde_json::Value;

pub const APPROVED: &str = "approved";
pub const PRECLINICAL: &str = "preclinical";

fn from_number(n: f64) -> Option<&'static str> {
    if n.fract() != 0.0 {
        return None;
    }
    match n as i64 {
        0 => Some(PRECLINICAL),
        1 => Some("1"),
        2 => Some("2"),
        3 => Some("3"),
        4 => Some(APPROVED),
        _ => None,
    }
}

fn from_roman(value: &str) -> Option<&'static str> {
    match value {
        "i" => Some("1"),
        "ii" => Some("2"),
        "iii" => Some("3"),
        "iv" => Some(APPROVED),
        _ => None,
    }
}

fn canonical_part(part: &str) -> Option<&'static str> {
    let lowered = part.trim().to_ascii_lowercase();
    let mut rest = lowered.as_str();
    rest = rest.strip_prefix("early").unwrap_or(rest);
    rest = rest.trim_start_matches(['_', '-', ' ']);
    rest = rest.strip_prefix("phase").unwrap_or(rest);
    rest = rest.trim_start_matches(['_', '-', ' ']).trim();

    match rest {
        "" => None,
        "approved" | "launched" | "marketed" => Some(APPROVED),
        "preclinical" | "pre-clinical" | "pre_clinical" => Some(PRECLINICAL),
        other => other
            .parse::<f64>()
            .ok()
            .and_then(from_number)
            .or_else(|| from_roman(other)),
    }
}

/// Normalizes one textual phase. Compound values such as `"PHASE1/PHASE2"`
/// normalize part by part; anything unrecognized passes through trimmed.
pub fn normalize_phase_str(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(single) = canonical_part(trimmed) {
        return single.to_string();
    }
    let parts = trimmed
        .split(['/', ','])
        .map(canonical_part)
        .collect::<Option<Vec<_>>>();
    match parts {
        Some(parts) if parts.len() > 1 => {
            let mut parts = parts;
            parts.dedup();
            parts.join("/")
        }
        _ => trimmed.to_string(),
    }
}

/// Normalizes a native phase value of any JSON shape.
pub fn normalize_phase(value: &Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64().and_then(from_number) {
            Some(phase) => Value::String(phase.to_string()),
            None => value.clone(),
        },
        Value::String(s) => Value::String(normalize_phase_str(s)),
        Value::Array(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match normalize_phase(item) {
                    Value::String(s) if !s.is_empty() => parts.push(s),
                    Value::Null => {}
                    _ => return value.clone(),
                }
            }
            if parts.is_empty() {
                return Value::Null;
            }
            parts.dedup();
            Value::String(parts.join("/"))
        }
        _ => value.clone(),
    }
}

/// True when a record's (possibly compound) phase includes the requested one.
pub fn phase_matches(requested: &str, record_phase: &str) -> bool {
    let requested = normalize_phase_str(requested);
    normalize_phase_str(record_phase)
        .split('/')
        .any(|part| part.eq_ignore_ascii_case(&requested))
}
