//! `SOURCE_TO_CONCEPT_MAP` file parser.
//!
//! Holds site-maintained mappings for local code systems that have no
//! Athena vocabulary (document categories, consent types, ...).

use csv::StringRecord;
use omop_types::SourceToConceptEntry;

use crate::parser::{parse, VocabRecord};
use crate::types::{VocabConfig, VocabResult};

/// Expected columns in a source-to-concept map file.
const SOURCE_TO_CONCEPT_COLUMNS: &[&str] = &[
    "source_code",
    "source_concept_id",
    "source_vocabulary_id",
    "source_code_description",
    "target_concept_id",
    "target_vocabulary_id",
    "valid_start_date",
    "valid_end_date",
    "invalid_reason",
];

impl VocabRecord for SourceToConceptEntry {
    const EXPECTED_COLUMNS: &'static [&'static str] = SOURCE_TO_CONCEPT_COLUMNS;

    fn from_record(record: &StringRecord) -> VocabResult<Self> {
        Ok(SourceToConceptEntry {
            source_code: parse::column(record, 0, "source_code")?.trim().to_string(),
            source_concept_id: parse::optional_concept_id(parse::column(record, 1, "source_concept_id")?)?
                .unwrap_or(omop_types::well_known::NO_MATCHING_CONCEPT),
            source_vocabulary_id: parse::column(record, 2, "source_vocabulary_id")?.trim().to_string(),
            source_code_description: parse::optional_text(record.get(3).unwrap_or("")),
            target_concept_id: parse::concept_id(parse::column(record, 4, "target_concept_id")?)?,
            target_vocabulary_id: parse::column(record, 5, "target_vocabulary_id")?.trim().to_string(),
            valid_start_date: parse::date(parse::column(record, 6, "valid_start_date")?)?,
            valid_end_date: parse::date(parse::column(record, 7, "valid_end_date")?)?,
            invalid_reason: parse::optional_text(record.get(8).unwrap_or("")),
        })
    }

    fn passes_filter(&self, config: &VocabConfig) -> bool {
        if config.valid_only && self.invalid_reason.is_some() {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(fields: &[&str]) -> StringRecord {
        let mut record = StringRecord::new();
        for field in fields {
            record.push_field(field);
        }
        record
    }

    #[test]
    fn test_parse_source_to_concept_record() {
        let record = make_record(&[
            "LAB",
            "",
            "DiagnosticReportCategory",
            "Laboratory report",
            "4024958",
            "SNOMED",
            "1970-01-01",
            "2099-12-31",
            "",
        ]);

        let entry = SourceToConceptEntry::from_record(&record).unwrap();
        assert_eq!(entry.source_code, "LAB");
        assert_eq!(entry.source_concept_id, 0);
        assert_eq!(entry.target_concept_id, 4024958);
        assert_eq!(entry.key().0, "DiagnosticReportCategory");
        assert_eq!(entry.valid_end_date.to_string(), "2099-12-31");
    }
}
