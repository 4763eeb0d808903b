//! # omop-vocab
//!
//! Loads OMOP vocabulary exports and resolves source codes to concepts.
//!
//! - [`VocabParser`]: streaming parser for the tab-delimited vocabulary files.
//! - [`discover_vocabulary_files`]: locates `CONCEPT`, `CONCEPT_RELATIONSHIP`
//!   and `SOURCE_TO_CONCEPT_MAP` in an export directory.
//! - [`VocabularySnapshot`]: preloaded in-memory [`ConceptSource`], including
//!   the cross-vocabulary tables derived from `Maps to` relationships.
//! - [`CachedConceptSource`]: read-through cache over a slower source.
//! - [`VocabularyRouter`]: code system url to vocabulary id.
//! - [`ConceptResolver`]: temporally-aware resolution with safe defaults.
//!
//! ## Features
//!
//! - `parallel` (default): parses `CONCEPT` files with rayon.
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use omop_vocab::{discover_vocabulary_files, CodeLookup, ConceptResolver, VocabConfig,
//!     VocabularyRouter, VocabularySnapshot};
//! use omop_types::Domain;
//!
//! let files = discover_vocabulary_files("/data/vocabulary")?;
//! let mut snapshot = VocabularySnapshot::new();
//! snapshot.load_all(&files, VocabConfig::default())?;
//!
//! let resolver = ConceptResolver::new(Arc::new(snapshot), Arc::new(VocabularyRouter::default()));
//! let lookup = CodeLookup::new("http://fhir.de/CodeSystem/bfarm/icd-10-gm", "I12.3", Domain::Condition);
//! let concept = resolver.resolve(&lookup)?;
//! ```

#![warn(missing_docs)]

mod concept;
pub mod loader;
pub mod parser;
mod relationship;
pub mod resolver;
pub mod router;
pub mod source;
mod source_to_concept;
pub mod store;
pub mod types;
mod validity;

pub use loader::discover_vocabulary_files;
pub use parser::{VocabParser, VocabRecord};
pub use resolver::{CodeLookup, ConceptResolver, ResolveError};
pub use router::{RouteTable, VocabularyRouter};
pub use source::{CachedConceptSource, ConceptSource};
pub use store::{LoadSummary, VocabularySnapshot};
pub use types::{ParseStats, VocabConfig, VocabError, VocabFiles, VocabResult};
pub use validity::validity_date;

// Re-export omop-types for convenience
pub use omop_types;
