//! Per-class candidate selection with an explicit disambiguation halt.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::extract::CandidateMap;
use super::{EntityCandidate, EntityClass, ResolvedEntities, rank_candidates};
use crate::error::BioQueryError;

pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.5;
pub const DEFAULT_AMBIGUITY_MARGIN: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub min_confidence: f64,
    pub ambiguity_margin: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            ambiguity_margin: DEFAULT_AMBIGUITY_MARGIN,
        }
    }
}

impl ResolverConfig {
    pub fn validate(&self) -> Result<(), BioQueryError> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(BioQueryError::InvalidArgument(format!(
                "min_confidence must be within [0, 1], got {}",
                self.min_confidence
            )));
        }
        if !(0.0..=1.0).contains(&self.ambiguity_margin) {
            return Err(BioQueryError::InvalidArgument(format!(
                "ambiguity_margin must be within [0, 1], got {}",
                self.ambiguity_margin
            )));
        }
        Ok(())
    }
}

/// Ranked candidates for one class the resolver refused to pick between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisambiguationRequest {
    pub entity_class: EntityClass,
    pub candidates: Vec<EntityCandidate>,
}

/// What the consumer sees when asked to choose.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisambiguationOption {
    pub original: String,
    pub matched: String,
    pub synonyms: Vec<String>,
    pub confidence: f64,
}

impl DisambiguationRequest {
    pub fn options(&self) -> Vec<DisambiguationOption> {
        self.candidates
            .iter()
            .map(|c| DisambiguationOption {
                original: c.canonical_name.clone(),
                matched: c.matched_surface_form.clone(),
                synonyms: c.synonyms.clone(),
                confidence: c.confidence,
            })
            .collect()
    }

    /// Accepts a canonical name (case-insensitive) or a 1-based position.
    pub fn choose(&self, choice: &str) -> Result<&EntityCandidate, BioQueryError> {
        let choice = choice.trim();
        if let Ok(position) = choice.parse::<usize>()
            && position >= 1
            && let Some(candidate) = self.candidates.get(position - 1)
        {
            return Ok(candidate);
        }
        select(&self.candidates, choice)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(ResolvedEntities),
    NeedsDisambiguation {
        resolved: ResolvedEntities,
        request: DisambiguationRequest,
    },
}

/// Picks one candidate per class, or halts at the first ambiguous class.
///
/// Classes are visited in `EntityClass::ALL` order so the same input always
/// asks about the same class first.
pub fn resolve(candidates: &CandidateMap, config: &ResolverConfig) -> Resolution {
    let mut resolved = ResolvedEntities::new();

    for class in EntityClass::ALL {
        let Some(list) = candidates.get(&class) else {
            continue;
        };
        if list.is_empty() {
            continue;
        }
        let mut ranked = list.clone();
        rank_candidates(&mut ranked);

        match pick(&ranked, config) {
            Some(chosen) => {
                debug!(class = %class, name = %chosen.canonical_name, "Resolved entity");
                resolved.insert(chosen.clone());
            }
            None => {
                debug!(class = %class, candidates = ranked.len(), "Entity needs disambiguation");
                return Resolution::NeedsDisambiguation {
                    resolved,
                    request: DisambiguationRequest {
                        entity_class: class,
                        candidates: ranked,
                    },
                };
            }
        }
    }

    Resolution::Resolved(resolved)
}

fn pick<'a>(ranked: &'a [EntityCandidate], config: &ResolverConfig) -> Option<&'a EntityCandidate> {
    let top = ranked.first()?;
    if top.confidence < config.min_confidence {
        return None;
    }
    match ranked.get(1) {
        None => Some(top),
        Some(runner_up) if top.confidence - runner_up.confidence > config.ambiguity_margin => {
            Some(top)
        }
        Some(_) => None,
    }
}

/// Picks the candidate whose canonical name matches `name`.
pub fn select<'a>(
    candidates: &'a [EntityCandidate],
    name: &str,
) -> Result<&'a EntityCandidate, BioQueryError> {
    let name = name.trim();
    candidates
        .iter()
        .find(|c| c.canonical_name.eq_ignore_ascii_case(name))
        .ok_or_else(|| {
            let offered = candidates
                .iter()
                .map(|c| c.canonical_name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            BioQueryError::InvalidArgument(format!(
                "'{name}' is not one of the offered candidates: {offered}"
            ))
        })
}
