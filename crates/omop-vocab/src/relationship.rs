//! `CONCEPT_RELATIONSHIP` file parser.

use csv::StringRecord;
use omop_types::ConceptRelationship;

use crate::parser::{parse, VocabRecord};
use crate::types::{VocabConfig, VocabResult};

/// Expected columns in a concept relationship file.
const RELATIONSHIP_COLUMNS: &[&str] = &[
    "concept_id_1",
    "concept_id_2",
    "relationship_id",
    "valid_start_date",
    "valid_end_date",
    "invalid_reason",
];

impl VocabRecord for ConceptRelationship {
    const EXPECTED_COLUMNS: &'static [&'static str] = RELATIONSHIP_COLUMNS;

    fn from_record(record: &StringRecord) -> VocabResult<Self> {
        Ok(ConceptRelationship {
            concept_id_1: parse::concept_id(parse::column(record, 0, "concept_id_1")?)?,
            concept_id_2: parse::concept_id(parse::column(record, 1, "concept_id_2")?)?,
            relationship_id: parse::column(record, 2, "relationship_id")?.trim().to_string(),
            valid_start_date: parse::date(parse::column(record, 3, "valid_start_date")?)?,
            valid_end_date: parse::date(parse::column(record, 4, "valid_end_date")?)?,
            invalid_reason: parse::optional_text(record.get(5).unwrap_or("")),
        })
    }

    // Only "Maps to" rows feed the cross-mapping tables; the rest of the
    // relationship graph is never consulted.
    fn passes_filter(&self, config: &VocabConfig) -> bool {
        if !self.is_maps_to() {
            return false;
        }
        if config.valid_only && !self.is_active() {
            return false;
        }
        true
    }
}
