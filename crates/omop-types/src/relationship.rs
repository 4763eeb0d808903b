//! OMOP ConceptRelationship type.
//!
//! This module provides the `ConceptRelationship` struct representing a row
//! of the vocabulary `CONCEPT_RELATIONSHIP` table.

use chrono::NaiveDate;

use crate::ConceptId;

/// A relationship between two concepts.
///
/// # Examples
///
/// ```
/// use chrono::NaiveDate;
/// use omop_types::ConceptRelationship;
///
/// let relationship = ConceptRelationship {
///     concept_id_1: 45591453,  // ICD10 I10
///     concept_id_2: 320128,    // Essential hypertension
///     relationship_id: "Maps to".to_string(),
///     valid_start_date: NaiveDate::from_ymd_opt(1970, 1, 1).unwrap(),
///     valid_end_date: NaiveDate::from_ymd_opt(2099, 12, 31).unwrap(),
///     invalid_reason: None,
/// };
///
/// assert!(relationship.is_maps_to());
/// assert!(relationship.is_active());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConceptRelationship {
    /// Source concept.
    pub concept_id_1: ConceptId,
    /// Destination concept.
    pub concept_id_2: ConceptId,
    /// Relationship type (e.g. `Maps to`, `Is a`).
    pub relationship_id: String,
    /// First day the relationship is valid.
    pub valid_start_date: NaiveDate,
    /// Last day the relationship is valid.
    pub valid_end_date: NaiveDate,
    /// `D` or `U` when the relationship was retired.
    pub invalid_reason: Option<String>,
}

impl ConceptRelationship {
    /// Relationship id linking a source concept to its standard counterpart.
    pub const MAPS_TO: &'static str = "Maps to";

    /// Returns true if this is a `Maps to` relationship.
    pub fn is_maps_to(&self) -> bool {
        self.relationship_id == Self::MAPS_TO
    }

    /// Returns true if the relationship has not been retired.
    pub fn is_active(&self) -> bool {
        self.invalid_reason.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relationship_helpers() {
        let rel = ConceptRelationship {
            concept_id_1: 1,
            concept_id_2: 2,
            relationship_id: "Is a".to_string(),
            valid_start_date: NaiveDate::MIN,
            valid_end_date: NaiveDate::MAX,
            invalid_reason: Some("D".to_string()),
        };

        assert!(!rel.is_maps_to());
        assert!(!rel.is_active());
    }
}
