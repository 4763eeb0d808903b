//! # omop-etl
//!
//! FHIR to OMOP CDM ETL: maps staged FHIR resources to CDM rows, resolving
//! codes through [`omop_vocab`] and references through the CDM itself.
//!
//! - [`LoadModeOrchestrator`]: runs a load by walking a [`FlowGraph`] of
//!   stages, bulk (worker pool, optional in-memory reference dictionary) or
//!   incremental (single-threaded, unresolved references reschedule).
//! - [`ChunkPipeline`]: read, map and commit of one stage in chunks.
//! - [`ReferenceResolver`]: person, visit and medication references by
//!   logical id or business identifier.
//! - [`IdentityCaches`]: thread-safe surrogate id allocation.
//! - [`processors`]: per-resource mappings.
//! - [`files`]: NDJSON staging and CDM collaborators for the binary.
//!
//! ## Usage
//!
//! ```ignore
//! use omop_etl::{Collaborators, ConceptSources, EtlConfig, LoadModeOrchestrator};
//!
//! let config = EtlConfig { bulk_load: true, ..Default::default() };
//! let concepts = ConceptSources::single(Arc::new(snapshot), Arc::new(router));
//! let report = LoadModeOrchestrator::new(config, collaborators, concepts).run()?;
//! for stage in &report.stages {
//!     println!("{}: {} written", stage.stage, stage.records_written);
//! }
//! ```

#![warn(missing_docs)]

pub mod collaborators;
pub mod config;
pub mod error;
pub mod fhir;
pub mod files;
pub mod flow;
pub mod identity;
pub mod orchestrator;
pub mod pipeline;
pub mod processors;
pub mod reference;
pub mod source;
pub mod stage;

pub use collaborators::{
    CdmWriter, ChunkRequest, Collaborators, IdentityStore, LoadLifecycle, RescheduleHook, SourceReader,
};
pub use config::{EtlConfig, LoadMode};
pub use error::{EtlError, EtlResult};
pub use files::{MemoryCdmStore, NdjsonStaging};
pub use flow::{Decision, Edge, FlowGraph, FlowGraphBuilder, NodeKind, RunReport, StageRunner};
pub use identity::{IdentityCache, IdentityCaches, IdentityIndex};
pub use orchestrator::{ConceptSources, LoadModeOrchestrator};
pub use pipeline::{ChunkPipeline, StageReport};
pub use processors::MappingContext;
pub use reference::{ReferenceOutcome, ReferenceResolver};
pub use source::SourceResource;
pub use stage::Stage;

// Re-export the vocabulary crate for convenience
pub use omop_vocab;
