//! Well-known OMOP concept IDs.
//!
//! This module provides constants for concept identifiers the pipeline writes
//! directly, without a vocabulary lookup: fallback concepts, provenance type
//! concepts, genders and visit types.
//!
//! # Examples
//!
//! ```
//! use omop_types::well_known;
//!
//! assert_eq!(well_known::NO_MATCHING_CONCEPT, 0);
//! assert_eq!(well_known::EHR, 32817);
//! ```

use crate::ConceptId;

// =============================================================================
// Fallback Concepts
// =============================================================================

/// No matching concept - 0.
///
/// Written whenever a source code could not be mapped.
pub const NO_MATCHING_CONCEPT: ConceptId = 0;

/// First id of the range reserved for site-local concepts - 2000000000.
pub const LOCAL_CONCEPT_START: ConceptId = 2_000_000_000;

/// Local "manually recorded" concept.
///
/// Default target for category-like local vocabularies whose code has no
/// curated entry in `SOURCE_TO_CONCEPT_MAP`.
pub const MANUALLY_RECORDED: ConceptId = LOCAL_CONCEPT_START + 1;

// =============================================================================
// Type Concepts (provenance)
// =============================================================================

/// EHR - 32817.
pub const EHR: ConceptId = 32817;

/// EHR administration record - 32818.
pub const EHR_ADMINISTRATION_RECORD: ConceptId = 32818;

/// Patient self-report - 32865.
///
/// Used for medication statements.
pub const PATIENT_SELF_REPORTED: ConceptId = 32865;

// =============================================================================
// Gender
// =============================================================================

/// MALE - 8507.
pub const GENDER_MALE: ConceptId = 8507;

/// FEMALE - 8532.
pub const GENDER_FEMALE: ConceptId = 8532;

/// OTHER - 8521.
pub const GENDER_OTHER: ConceptId = 8521;

/// UNKNOWN - 8551.
pub const GENDER_UNKNOWN: ConceptId = 8551;

// =============================================================================
// Visit Types
// =============================================================================

/// Inpatient Visit - 9201.
pub const INPATIENT_VISIT: ConceptId = 9201;

/// Outpatient Visit - 9202.
pub const OUTPATIENT_VISIT: ConceptId = 9202;

/// Emergency Room Visit - 9203.
pub const EMERGENCY_ROOM_VISIT: ConceptId = 9203;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_constants() {
        assert_eq!(NO_MATCHING_CONCEPT, 0);
        assert_eq!(EHR, 32817);
        assert_eq!(GENDER_FEMALE, 8532);
        assert_eq!(INPATIENT_VISIT, 9201);
    }

    #[test]
    fn test_local_concepts_are_in_local_range() {
        assert!(MANUALLY_RECORDED >= LOCAL_CONCEPT_START);
    }
}
