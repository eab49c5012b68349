//! CSV export of harmonized records.

use crate::error::BioQueryError;
use crate::intent::IntentKind;
use crate::transform::harmonize::{HarmonizedRecord, columns};

/// Header is `columns()`; absent values become empty cells.
pub fn to_csv(records: &[HarmonizedRecord], intent: IntentKind) -> Result<String, BioQueryError> {
    let header = columns(records, intent);
    let mut writer = ::csv::WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(&header)?;
    for record in records {
        writer.write_record(
            header
                .iter()
                .map(|column| record.cell(column).unwrap_or_default()),
        )?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| BioQueryError::Io(err.into_error()))?;
    String::from_utf8(bytes).map_err(|err| {
        BioQueryError::InvalidArgument(format!("CSV output is not valid UTF-8: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{NativeRecord, SourceKind};
    use crate::transform::harmonize::harmonize;
    use serde_json::json;

    fn native(value: serde_json::Value) -> NativeRecord {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn header_follows_columns_and_absent_cells_are_empty() {
        let records = harmonize(
            &[(
                SourceKind::OpenTargets,
                vec![native(json!({
                    "drug_name": "Imatinib",
                    "disease_label": "Chronic Myeloid Leukemia",
                    "clinical_phase": 2,
                    "score": 0.95
                }))],
            )],
            IntentKind::ListDiseases,
        );
        let out = to_csv(&records, IntentKind::ListDiseases).unwrap();
        let mut lines = out.lines();
        assert_eq!(
            lines.next(),
            Some("drug,drug_id,disease_name,efo_id,phase,evidence_score,source")
        );
        assert_eq!(
            lines.next(),
            Some("Imatinib,,Chronic Myeloid Leukemia,,2,0.95,OpenTargets")
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn delimiters_quotes_and_newlines_are_quoted() {
        let records = harmonize(
            &[(
                SourceKind::Chembl,
                vec![native(json!({
                    "efo_term": "leukemia, chronic",
                    "mechanism_of_action": "says \"inhibit\"\nstrongly"
                }))],
            )],
            IntentKind::ListDrugs,
        );
        let out = to_csv(&records, IntentKind::ListDrugs).unwrap();
        assert!(out.contains("\"leukemia, chronic\""));
        assert!(out.contains("\"says \"\"inhibit\"\"\nstrongly\""));
    }

    #[test]
    fn empty_result_still_has_header() {
        let out = to_csv(&[], IntentKind::ListToxicities).unwrap();
        assert_eq!(out, "drug,drug_id,toxicity_type,severity,frequency,source\n");
    }
}
