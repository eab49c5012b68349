//! Common output schema per intent and per-source native field maps.

use crate::intent::IntentKind;
use crate::sources::SourceKind;

pub const SOURCE_FIELD: &str = "source";
pub const PHASE_FIELD: &str = "phase";

/// Fields every record of `intent` carries, in display order.
pub fn intent_fields(intent: IntentKind) -> &'static [&'static str] {
    match intent {
        IntentKind::ListDiseases => &[
            "drug",
            "drug_id",
            "disease_name",
            "efo_id",
            "phase",
            "evidence_score",
        ],
        IntentKind::ListToxicities => &["drug", "drug_id", "toxicity_type", "severity", "frequency"],
        IntentKind::ListDrugs => &[
            "disease_name",
            "efo_id",
            "drug",
            "drug_id",
            "phase",
            "mechanism",
        ],
        IntentKind::ListTargets => &[
            "target_symbol",
            "ensembl_id",
            "drug",
            "disease_name",
            "action",
            "score",
        ],
        IntentKind::ListInteractions => &[
            "target_symbol",
            "ensembl_id",
            "interacting_partner",
            "partner_ensembl_id",
            "interaction_score",
        ],
        IntentKind::ListExpression => &[
            "target_symbol",
            "ensembl_id",
            "tissue",
            "expression_level",
            "localization",
        ],
    }
}

pub type FieldMap = &'static [(&'static str, &'static str)];

const OPENTARGETS_COMMON: FieldMap = &[
    ("drug_name", "drug"),
    ("chembl_id", "drug_id"),
    ("disease_label", "disease_name"),
    ("disease_id", "efo_id"),
    ("clinical_phase", "phase"),
    ("mechanism_of_action", "mechanism"),
    ("approved_symbol", "target_symbol"),
    ("target_id", "ensembl_id"),
    ("action_type", "action"),
    ("adverse_event", "toxicity_type"),
    ("partner_symbol", "interacting_partner"),
    ("partner_id", "partner_ensembl_id"),
    ("tissue_label", "tissue"),
    ("rna_level", "expression_level"),
];

const OPENTARGETS_DISEASES: FieldMap = &[
    ("drug_name", "drug"),
    ("chembl_id", "drug_id"),
    ("disease_label", "disease_name"),
    ("disease_id", "efo_id"),
    ("clinical_phase", "phase"),
    ("score", "evidence_score"),
];

const CLINICALTRIALS: FieldMap = &[
    ("intervention_name", "drug"),
    ("condition", "disease_name"),
    ("study_phase", "phase"),
];

const CHEMBL: FieldMap = &[
    ("molecule_name", "drug"),
    ("molecule_chembl_id", "drug_id"),
    ("efo_term", "disease_name"),
    ("max_phase_for_ind", "phase"),
    ("target_pref_name", "target_symbol"),
    ("action_type", "action"),
    ("mechanism_of_action", "mechanism"),
];

const PROTEIN_ATLAS: FieldMap = &[
    ("gene", "target_symbol"),
    ("ensembl", "ensembl_id"),
    ("rna_tissue_specificity", "tissue"),
    ("rna_tissue_distribution", "expression_level"),
    ("subcellular_location", "localization"),
];

/// Native -> common renames for one source answering one intent.
pub fn field_map(source: SourceKind, intent: IntentKind) -> FieldMap {
    match (source, intent) {
        (SourceKind::OpenTargets, IntentKind::ListDiseases) => OPENTARGETS_DISEASES,
        (SourceKind::OpenTargets, _) => OPENTARGETS_COMMON,
        (SourceKind::ClinicalTrials, _) => CLINICALTRIALS,
        (SourceKind::Chembl, _) => CHEMBL,
        (SourceKind::ProteinAtlas, _) => PROTEIN_ATLAS,
    }
}

pub fn common_name(source: SourceKind, intent: IntentKind, native: &str) -> Option<&'static str> {
    field_map(source, intent)
        .iter()
        .find(|(from, _)| *from == native)
        .map(|(_, to)| *to)
}
