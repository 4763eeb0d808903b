//! Identifier types for OMOP CDM rows.
//!
//! This module provides type aliases for vocabulary concept identifiers and
//! the integer surrogate keys minted for CDM rows such as persons and visits.

/// An OMOP vocabulary concept identifier.
///
/// Concept identifiers are signed 32-bit values in the published vocabularies,
/// widened to 64 bits so local concepts (2 billion and above) fit.
///
/// # Examples
///
/// ```
/// use omop_types::ConceptId;
///
/// let no_matching: ConceptId = 0;
/// let male: ConceptId = 8507;
/// ```
pub type ConceptId = i64;

/// An internally minted surrogate key (person_id, visit_occurrence_id, ...).
pub type SurrogateId = i64;
