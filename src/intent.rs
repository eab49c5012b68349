//! Keyword-rule intent classification.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BioQueryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    ListDiseases,
    ListToxicities,
    ListDrugs,
    ListTargets,
    ListInteractions,
    ListExpression,
}

impl IntentKind {
    pub const ALL: [IntentKind; 6] = [
        IntentKind::ListDiseases,
        IntentKind::ListToxicities,
        IntentKind::ListDrugs,
        IntentKind::ListTargets,
        IntentKind::ListInteractions,
        IntentKind::ListExpression,
    ];

    pub const FALLBACK: IntentKind = IntentKind::ListDiseases;

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ListDiseases => "list_diseases",
            Self::ListToxicities => "list_toxicities",
            Self::ListDrugs => "list_drugs",
            Self::ListTargets => "list_targets",
            Self::ListInteractions => "list_interactions",
            Self::ListExpression => "list_expression",
        }
    }

    pub fn parse(value: &str) -> Result<Self, BioQueryError> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        let normalized = normalized.strip_prefix("list_").unwrap_or(&normalized);
        match normalized {
            "diseases" | "disease" => Ok(Self::ListDiseases),
            "toxicities" | "toxicity" => Ok(Self::ListToxicities),
            "drugs" | "drug" => Ok(Self::ListDrugs),
            "targets" | "target" => Ok(Self::ListTargets),
            "interactions" | "interaction" => Ok(Self::ListInteractions),
            "expression" => Ok(Self::ListExpression),
            _ => Err(BioQueryError::InvalidArgument(format!(
                "Unknown intent '{}'. Expected one of: {}",
                value.trim(),
                IntentKind::ALL.map(IntentKind::as_str).join(", ")
            ))),
        }
    }

    /// Short human label used in rendered headings.
    pub fn label(self) -> &'static str {
        match self {
            Self::ListDiseases => "Diseases",
            Self::ListToxicities => "Toxicities",
            Self::ListDrugs => "Drugs",
            Self::ListTargets => "Targets",
            Self::ListInteractions => "Interactions",
            Self::ListExpression => "Expression",
        }
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IntentRule {
    pub intent: IntentKind,
    pub keywords: &'static [&'static str],
}

/// Precedence order. The first rule with a keyword contained in the
/// lowercased text decides the intent, so a query mentioning both toxicity
/// and a disease is a toxicity query.
pub const INTENT_RULES: [IntentRule; 6] = [
    IntentRule {
        intent: IntentKind::ListToxicities,
        keywords: &[
            "toxicit",
            "toxic",
            "adverse event",
            "adverse effect",
            "adverse reaction",
            "side effect",
            "safety",
        ],
    },
    IntentRule {
        intent: IntentKind::ListDiseases,
        keywords: &["disease", "condition", "indication", "indicated for"],
    },
    IntentRule {
        intent: IntentKind::ListDrugs,
        keywords: &["compound", "drug", "medication", "medicine", "treatment"],
    },
    IntentRule {
        intent: IntentKind::ListTargets,
        keywords: &["protein target", "target"],
    },
    IntentRule {
        intent: IntentKind::ListInteractions,
        keywords: &["interaction", "interacting", "interacts", "binding partner", "partner"],
    },
    IntentRule {
        intent: IntentKind::ListExpression,
        keywords: &["expression", "expressed", "tissue"],
    },
];

pub fn classify(text: &str) -> IntentKind {
    let lowered = text.to_lowercase();
    INTENT_RULES
        .iter()
        .find(|rule| rule.keywords.iter().any(|kw| lowered.contains(kw)))
        .map(|rule| rule.intent)
        .unwrap_or(IntentKind::FALLBACK)
}
