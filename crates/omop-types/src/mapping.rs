//! Curated and derived mapping rows.
//!
//! - [`SourceToConceptEntry`]: a row of `SOURCE_TO_CONCEPT_MAP`, used for local
//!   code systems that are not part of the standard vocabularies.
//! - [`CrossMapping`]: a row of a derived cross-vocabulary table (ICD to
//!   SNOMED, vaccine to standard, race to standard).

use chrono::NaiveDate;

use crate::{well_known, ConceptId, CrossMappingKind};

/// A manually curated mapping for a local source code.
///
/// Keyed by (source vocabulary id, source code, target concept id, valid end date).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceToConceptEntry {
    /// Code in the local code system.
    pub source_code: String,
    /// Concept id of the source code, usually 0.
    pub source_concept_id: ConceptId,
    /// Local vocabulary the code belongs to.
    pub source_vocabulary_id: String,
    /// Free-text description of the source code.
    pub source_code_description: Option<String>,
    /// Concept the source code maps to.
    pub target_concept_id: ConceptId,
    /// Vocabulary of the target concept.
    pub target_vocabulary_id: String,
    /// First day the mapping is valid.
    pub valid_start_date: NaiveDate,
    /// Last day the mapping is valid.
    pub valid_end_date: NaiveDate,
    /// `D` or `U` when the mapping was retired.
    pub invalid_reason: Option<String>,
}

impl SourceToConceptEntry {
    /// Builds the default entry returned when a code has no curated mapping.
    pub fn fallback(source_vocabulary_id: &str, source_code: &str, target: ConceptId) -> Self {
        Self {
            source_code: source_code.to_string(),
            source_concept_id: well_known::NO_MATCHING_CONCEPT,
            source_vocabulary_id: source_vocabulary_id.to_string(),
            source_code_description: None,
            target_concept_id: target,
            target_vocabulary_id: "None".to_string(),
            valid_start_date: NaiveDate::MIN,
            valid_end_date: NaiveDate::MAX,
            invalid_reason: None,
        }
    }

    /// Returns the composite key identifying this entry.
    pub fn key(&self) -> (&str, &str, ConceptId, NaiveDate) {
        (
            &self.source_vocabulary_id,
            &self.source_code,
            self.target_concept_id,
            self.valid_end_date,
        )
    }
}

/// A row of a derived cross-vocabulary mapping table.
///
/// One generic row type serves every mapping kind; the kind tags which table
/// the row belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CrossMapping {
    /// Table this row belongs to.
    pub kind: CrossMappingKind,
    /// Vocabulary of the source code.
    pub source_vocabulary_id: String,
    /// Source code as written.
    pub source_code: String,
    /// Concept id of the source code.
    pub source_concept_id: ConceptId,
    /// Standard concept the source maps to.
    pub target_concept_id: ConceptId,
    /// Domain of the target concept.
    pub target_domain_id: String,
    /// First day the source concept is valid.
    pub valid_start_date: NaiveDate,
    /// Last day the source concept is valid.
    pub valid_end_date: NaiveDate,
}

impl CrossMapping {
    /// Returns true if `date` falls inside the source concept's window.
    pub fn is_valid_on(&self, date: NaiveDate) -> bool {
        self.valid_start_date <= date && date <= self.valid_end_date
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_to_concept_fallback() {
        let entry = SourceToConceptEntry::fallback("OBS_CATEGORY", "vital-signs", 0);

        assert_eq!(entry.target_concept_id, 0);
        assert_eq!(
            entry.key(),
            ("OBS_CATEGORY", "vital-signs", 0, NaiveDate::MAX)
        );
    }

    #[test]
    fn test_cross_mapping_window() {
        let mapping = CrossMapping {
            kind: CrossMappingKind::IcdToSnomed,
            source_vocabulary_id: "ICD10GM".to_string(),
            source_code: "I10.90".to_string(),
            source_concept_id: 1,
            target_concept_id: 320128,
            target_domain_id: "Condition".to_string(),
            valid_start_date: NaiveDate::from_ymd_opt(2019, 1, 1).unwrap(),
            valid_end_date: NaiveDate::from_ymd_opt(2019, 12, 31).unwrap(),
        };

        assert!(mapping.is_valid_on(NaiveDate::from_ymd_opt(2019, 7, 1).unwrap()));
        assert!(!mapping.is_valid_on(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()));
    }
}
