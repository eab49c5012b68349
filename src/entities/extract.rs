//! Dictionary-driven entity extraction plus phase pattern matching.
//!
//! Confidence is a fixed function of how an entry matched, so the same text
//! and index snapshot always produce the same candidate set.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use super::synonyms::{SynonymEntry, SynonymIndex};
use super::{EntityCandidate, EntityClass, MatchKind, rank_candidates};
use crate::transform::phase::normalize_phase_str;

pub const CANONICAL_MATCH_CONFIDENCE: f64 = 0.95;
pub const IDENTIFIER_MATCH_CONFIDENCE: f64 = 0.95;
pub const SYNONYM_MATCH_CONFIDENCE: f64 = 0.85;
pub const PHASE_MATCH_CONFIDENCE: f64 = 0.95;

pub type CandidateMap = BTreeMap<EntityClass, Vec<EntityCandidate>>;

/// Scans `text` against every indexed class and the phase patterns.
///
/// Classes with no match are absent from the returned map.
pub fn extract(text: &str, index: &SynonymIndex) -> CandidateMap {
    let lowered = text.to_lowercase();
    let mut out = CandidateMap::new();

    for class in EntityClass::INDEXED {
        let mut candidates = index
            .entries(class)
            .iter()
            .filter_map(|entry| match_entry(class, entry, text, &lowered))
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            continue;
        }
        rank_candidates(&mut candidates);
        out.insert(class, candidates);
    }

    if let Some(phase) = extract_phase(text) {
        out.insert(EntityClass::Phase, vec![phase]);
    }

    out
}

struct SurfaceMatch<'a> {
    form: &'a str,
    kind: MatchKind,
    confidence: f64,
    start: usize,
}

fn match_entry(
    class: EntityClass,
    entry: &SynonymEntry,
    text: &str,
    lowered: &str,
) -> Option<EntityCandidate> {
    let forms = std::iter::once((
        entry.canonical_name.as_str(),
        MatchKind::Canonical,
        CANONICAL_MATCH_CONFIDENCE,
    ))
    .chain(
        entry
            .external_ids
            .values()
            .map(|id| (id.as_str(), MatchKind::Identifier, IDENTIFIER_MATCH_CONFIDENCE)),
    )
    .chain(
        entry
            .synonyms
            .iter()
            .map(|s| (s.as_str(), MatchKind::Synonym, SYNONYM_MATCH_CONFIDENCE)),
    );

    let mut best: Option<SurfaceMatch<'_>> = None;
    for (form, kind, confidence) in forms {
        let form = form.trim();
        if form.is_empty() {
            continue;
        }
        let needle = form.to_lowercase();
        let Some(start) = find_word(lowered, &needle) else {
            continue;
        };
        let candidate = SurfaceMatch {
            form,
            kind,
            confidence,
            start,
        };
        best = match best {
            Some(current) if !beats(&candidate, &current) => Some(current),
            _ => Some(candidate),
        };
    }

    let best = best?;
    let matched_surface_form = surface_slice(text, lowered, best.start, best.form)
        .unwrap_or(best.form)
        .to_string();

    Some(EntityCandidate {
        entity_class: class,
        canonical_name: entry.canonical_name.trim().to_string(),
        external_ids: entry.external_ids.clone(),
        matched_surface_form,
        confidence: best.confidence,
        match_kind: best.kind,
        synonyms: entry.synonyms.iter().cloned().collect(),
    })
}

/// First occurrence of `needle` not embedded in a longer word.
fn find_word(haystack: &str, needle: &str) -> Option<usize> {
    haystack.match_indices(needle).map(|(i, _)| i).find(|&start| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

fn beats(a: &SurfaceMatch<'_>, b: &SurfaceMatch<'_>) -> bool {
    match a.confidence.total_cmp(&b.confidence) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => match a.form.len().cmp(&b.form.len()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => a.form < b.form,
        },
    }
}

/// Maps a match in the lowercased text back onto the user's original casing.
fn surface_slice<'t>(text: &'t str, lowered: &str, start: usize, form: &str) -> Option<&'t str> {
    if text.len() != lowered.len() {
        return None;
    }
    let end = start.checked_add(form.to_lowercase().len())?;
    text.get(start..end)
}

fn phase_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)phase[-\s]*(\d)",
            r"(?i)phase[-\s]*(iv|iii|ii|i)\b",
            r"(?i)\b(approved)\b",
            r"(?i)\b(pre-?clinical)\b",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// At most one phase candidate: the first pattern (in order) that matches wins.
pub fn extract_phase(text: &str) -> Option<EntityCandidate> {
    for pattern in phase_patterns() {
        let Some(caps) = pattern.captures(text) else {
            continue;
        };
        let (Some(whole), Some(value)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let canonical = normalize_phase_str(value.as_str());
        return Some(EntityCandidate {
            entity_class: EntityClass::Phase,
            canonical_name: canonical,
            external_ids: BTreeMap::new(),
            matched_surface_form: whole.as_str().to_string(),
            confidence: PHASE_MATCH_CONFIDENCE,
            match_kind: MatchKind::Pattern,
            synonyms: Vec::new(),
        });
    }
    None
}
