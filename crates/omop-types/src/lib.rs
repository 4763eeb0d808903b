//! # omop-types
//!
//! Type definitions for the OMOP Common Data Model.
//!
//! This crate provides Rust type definitions for the vocabulary tables the
//! ETL reads (concepts, concept relationships, source-to-concept mappings),
//! the identity records used to resolve cross-resource references, and the
//! CDM rows the ETL writes.
//!
//! ## Features
//!
//! - `serde` (default): Enables serialization/deserialization support via serde.
//!
//! ## Usage
//!
//! ```rust
//! use chrono::NaiveDate;
//! use omop_types::{well_known, Concept, Domain};
//!
//! let fallback = Concept::no_matching("X99.9", Some("ICD10GM"), Domain::Condition);
//! assert_eq!(fallback.concept_id, well_known::NO_MATCHING_CONCEPT);
//! assert!(fallback.is_valid_on(NaiveDate::from_ymd_opt(2021, 3, 15).unwrap()));
//! ```

#![warn(missing_docs)]

#[allow(missing_docs)]
pub mod cdm;
mod concept;
mod enums;
mod identity;
mod ids;
mod mapping;
mod relationship;
pub mod well_known;

// Re-export all public types at crate root
pub use cdm::{CdmRecord, CdmTable, ClinicalEvent};
pub use concept::Concept;
pub use enums::{CrossMappingKind, Domain, EntityKind};
pub use identity::IdentityRecord;
pub use ids::{ConceptId, SurrogateId};
pub use mapping::{CrossMapping, SourceToConceptEntry};
pub use relationship::ConceptRelationship;
