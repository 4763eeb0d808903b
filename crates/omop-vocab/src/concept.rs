//! `CONCEPT` file parser.

use csv::StringRecord;
use omop_types::Concept;

use crate::parser::{parse, VocabRecord};
use crate::types::{VocabConfig, VocabError, VocabResult};

/// Expected columns in a concept file.
const CONCEPT_COLUMNS: &[&str] = &[
    "concept_id",
    "concept_name",
    "domain_id",
    "vocabulary_id",
    "concept_class_id",
    "standard_concept",
    "concept_code",
    "valid_start_date",
    "valid_end_date",
    "invalid_reason",
];

impl VocabRecord for Concept {
    const EXPECTED_COLUMNS: &'static [&'static str] = CONCEPT_COLUMNS;

    fn from_record(record: &StringRecord) -> VocabResult<Self> {
        let concept_code = parse::column(record, 6, "concept_code")?.trim().to_string();
        let valid_start_date = parse::date(parse::column(record, 7, "valid_start_date")?)?;
        let valid_end_date = parse::date(parse::column(record, 8, "valid_end_date")?)?;
        if valid_start_date > valid_end_date {
            return Err(VocabError::InvalidWindow {
                code: concept_code,
                start: valid_start_date,
                end: valid_end_date,
            });
        }

        Ok(Concept {
            concept_id: parse::concept_id(parse::column(record, 0, "concept_id")?)?,
            concept_name: parse::column(record, 1, "concept_name")?.to_string(),
            domain_id: parse::column(record, 2, "domain_id")?.trim().to_string(),
            vocabulary_id: parse::column(record, 3, "vocabulary_id")?.trim().to_string(),
            concept_class_id: parse::column(record, 4, "concept_class_id")?.trim().to_string(),
            standard_concept: parse::optional_text(record.get(5).unwrap_or("")),
            concept_code,
            valid_start_date,
            valid_end_date,
            invalid_reason: parse::optional_text(record.get(9).unwrap_or("")),
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
    use crate::parser::VocabParser;
    use chrono::NaiveDate;

    fn make_record(fields: &[&str]) -> StringRecord {
        let mut record = StringRecord::new();
        for field in fields {
            record.push_field(field);
        }
        record
    }

    #[test]
    fn test_parse_concept_record() {
        let record = make_record(&[
            "44800001",
            "Hypertensive heart and chronic kidney disease",
            "Condition",
            "ICD10GM",
            "4-char nonbill code",
            "",
            "I12.3",
            "20190101",
            "20211231",
            "",
        ]);

        let concept = Concept::from_record(&record).unwrap();
        assert_eq!(concept.concept_id, 44800001);
        assert_eq!(concept.vocabulary_id, "ICD10GM");
        assert_eq!(concept.concept_code, "I12.3");
        assert_eq!(concept.standard_concept, None);
        assert_eq!(concept.valid_start_date, NaiveDate::from_ymd_opt(2019, 1, 1).unwrap());
        assert_eq!(concept.valid_end_date, NaiveDate::from_ymd_opt(2021, 12, 31).unwrap());
        assert!(concept.invalid_reason.is_none());
    }

    #[test]
    fn test_reject_inverted_window() {
        let record = make_record(&[
            "1", "x", "Condition", "ICD10GM", "c", "", "A00", "20220101", "20210101", "",
        ]);
        assert!(matches!(
            Concept::from_record(&record),
            Err(VocabError::InvalidWindow { .. })
        ));
    }

    #[test]
    fn test_valid_only_filter() {
        let record = make_record(&[
            "2", "retired", "Drug", "ATC", "ATC 5th", "", "N02BE01", "19700101", "20191231", "D",
        ]);
        let concept = Concept::from_record(&record).unwrap();

        assert!(concept.passes_filter(&VocabConfig::default()));
        let config = VocabConfig {
            valid_only: true,
            ..Default::default()
        };
        assert!(!concept.passes_filter(&config));
    }

    #[test]
    fn test_parse_concept_file_with_bom() {
        let data = "\u{feff}concept_id\tconcept_name\tdomain_id\tvocabulary_id\tconcept_class_id\tstandard_concept\tconcept_code\tvalid_start_date\tvalid_end_date\tinvalid_reason\n\
                    8507\tMALE\tGender\tGender\tGender\tS\tM\t19700101\t20991231\t\n\
                    8532\tFEMALE \"F\"\tGender\tGender\tGender\tS\tF\t19700101\t20991231\t\n";

        let parser: VocabParser<_, Concept> =
            VocabParser::from_reader(data.as_bytes(), VocabConfig::default()).unwrap();
        let concepts = parser.parse_all().unwrap();

        assert_eq!(concepts.len(), 2);
        assert_eq!(concepts[1].concept_name, "FEMALE \"F\"");
        assert!(concepts[0].is_standard());
    }

    #[test]
    fn test_reject_wrong_header() {
        let data = "id\tname\n1\tx\n";
        let result: VocabResult<VocabParser<_, Concept>> =
            VocabParser::from_reader(data.as_bytes(), VocabConfig::default());
        assert!(result.is_err());
    }
}
