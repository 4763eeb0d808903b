//! OMOP vocabulary Concept type.
//!
//! This module provides the `Concept` struct representing a row of the
//! vocabulary `CONCEPT` table.

use chrono::NaiveDate;

use crate::{well_known, ConceptId, Domain};

/// A concept from the OMOP `CONCEPT` table.
///
/// A source code may map to several concepts over time; their validity
/// windows never overlap for the same code and vocabulary.
///
/// # Examples
///
/// ```
/// use chrono::NaiveDate;
/// use omop_types::{Concept, Domain};
///
/// let concept = Concept {
///     concept_id: 44800001,
///     concept_name: "Hypertensive renal disease".to_string(),
///     domain_id: "Condition".to_string(),
///     vocabulary_id: "ICD10GM".to_string(),
///     concept_class_id: "4-char billing code".to_string(),
///     standard_concept: None,
///     concept_code: "I12.3".to_string(),
///     valid_start_date: NaiveDate::from_ymd_opt(2015, 1, 1).unwrap(),
///     valid_end_date: NaiveDate::from_ymd_opt(2099, 12, 31).unwrap(),
///     invalid_reason: None,
/// };
///
/// assert_eq!(concept.domain(), Some(Domain::Condition));
/// assert!(concept.is_valid_on(NaiveDate::from_ymd_opt(2021, 3, 15).unwrap()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Concept {
    /// Unique identifier for this concept.
    pub concept_id: ConceptId,
    /// Human readable name.
    pub concept_name: String,
    /// Domain the concept belongs to (e.g. `Condition`, `Drug`).
    pub domain_id: String,
    /// Vocabulary the code is taken from (e.g. `ICD10GM`, `LOINC`).
    pub vocabulary_id: String,
    /// Concept class within the vocabulary.
    pub concept_class_id: String,
    /// `S` for standard, `C` for classification, absent otherwise.
    pub standard_concept: Option<String>,
    /// Code as written in the source vocabulary.
    pub concept_code: String,
    /// First day the concept is valid.
    pub valid_start_date: NaiveDate,
    /// Last day the concept is valid.
    pub valid_end_date: NaiveDate,
    /// `D` (deleted), `U` (updated) or absent when valid.
    pub invalid_reason: Option<String>,
}

impl Concept {
    /// Builds the fallback concept returned for codes without a mapping.
    ///
    /// The concept id is [`well_known::NO_MATCHING_CONCEPT`] and the source
    /// code is carried verbatim so downstream auditing can see it.
    pub fn no_matching(code: &str, vocabulary_id: Option<&str>, domain: Domain) -> Self {
        Self {
            concept_id: well_known::NO_MATCHING_CONCEPT,
            concept_name: "No matching concept".to_string(),
            domain_id: domain.as_str().to_string(),
            vocabulary_id: vocabulary_id.unwrap_or("None").to_string(),
            concept_class_id: "Undefined".to_string(),
            standard_concept: None,
            concept_code: code.to_string(),
            valid_start_date: NaiveDate::MIN,
            valid_end_date: NaiveDate::MAX,
            invalid_reason: None,
        }
    }

    /// Returns the domain enum value.
    ///
    /// Returns `None` if the domain id is not one the pipeline routes on.
    pub fn domain(&self) -> Option<Domain> {
        Domain::from_domain_id(&self.domain_id)
    }

    /// Returns true if `date` falls inside the validity window (inclusive).
    pub fn is_valid_on(&self, date: NaiveDate) -> bool {
        self.valid_start_date <= date && date <= self.valid_end_date
    }

    /// Returns true if this is a standard concept.
    pub fn is_standard(&self) -> bool {
        self.standard_concept.as_deref() == Some("S")
    }

    /// Returns true if this is the "no matching concept" fallback.
    pub fn is_no_matching(&self) -> bool {
        self.concept_id == well_known::NO_MATCHING_CONCEPT
    }
}
