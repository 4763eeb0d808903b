//! ETL error type.

use omop_types::{EntityKind, SurrogateId};
use omop_vocab::{ResolveError, VocabError};
use thiserror::Error;

use crate::stage::Stage;

/// Errors raised while mapping resources or running stages.
///
/// Item-level variants (see [`EtlError::skip_reason`]) drop the single
/// resource and are counted; [`EtlError::Deferred`] marks a resource handed
/// to the reschedule hook. Everything else fails the chunk.
#[derive(Error, Debug)]
pub enum EtlError {
    /// Neither a logical id nor an identifier was given for a reference.
    #[error("Resource {resource_id} has no {kind} reference")]
    NoReference {
        /// Kind of the referenced entity.
        kind: EntityKind,
        /// Staging id of the referencing resource.
        resource_id: i64,
    },

    /// A referenced entity was not found during a bulk load.
    #[error("Resource {resource_id} references an unknown {kind}")]
    UnresolvedReference {
        /// Kind of the referenced entity.
        kind: EntityKind,
        /// Staging id of the referencing resource.
        resource_id: i64,
    },

    /// A referenced entity was not found during an incremental load and the
    /// resource was rescheduled.
    #[error("Resource {resource_id} deferred until its {kind} is loaded")]
    Deferred {
        /// Kind of the referenced entity.
        kind: EntityKind,
        /// Staging id of the deferred resource.
        resource_id: i64,
    },

    /// Logical id and identifier resolve to different surrogate ids.
    #[error(
        "Identity conflict for {kind}: logical id {logical_id} is {by_logical_id}, identifier {identifier} is {by_identifier}"
    )]
    IdentityConflict {
        /// Kind of the entity.
        kind: EntityKind,
        /// The logical id.
        logical_id: String,
        /// Surrogate id found by logical id.
        by_logical_id: SurrogateId,
        /// The identifier.
        identifier: String,
        /// Surrogate id found by identifier.
        by_identifier: SurrogateId,
    },

    /// The resource lacks data the mapping requires.
    #[error("Invalid {resource_type} resource {resource_id}: {reason}")]
    InvalidResource {
        /// FHIR resource type.
        resource_type: String,
        /// Staging id.
        resource_id: i64,
        /// What is missing or malformed.
        reason: String,
    },

    /// Concept resolution failed.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Vocabulary loading failed.
    #[error(transparent)]
    Vocabulary(#[from] VocabError),

    /// A collaborator (reader, writer, identity store) failed.
    #[error("Store error: {0}")]
    Store(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid run configuration or flow definition.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The worker pool could not be built.
    #[error("Worker pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    /// A stage gave up on a chunk.
    #[error("Stage {stage} failed after {attempts} attempt(s): {source}")]
    StageFailed {
        /// The failed stage.
        stage: Stage,
        /// Attempts made on the failing chunk.
        attempts: u32,
        /// The last error.
        #[source]
        source: Box<EtlError>,
    },
}

/// Result type for ETL operations.
pub type EtlResult<T> = Result<T, EtlError>;

impl EtlError {
    /// Returns the counter key for errors that only skip the current item.
    pub fn skip_reason(&self) -> Option<&'static str> {
        match self {
            Self::NoReference { .. } => Some("no_reference"),
            Self::UnresolvedReference { .. } => Some("unresolved_reference"),
            Self::InvalidResource { .. } => Some("invalid_resource"),
            Self::Resolve(ResolveError::NoValidConcept { .. }) => Some("no_valid_concept"),
            _ => None,
        }
    }

    /// Returns true if the error only skips the current item.
    pub fn is_item_skip(&self) -> bool {
        self.skip_reason().is_some()
    }

    /// Returns true if retrying the chunk may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Io(_) | Self::Resolve(ResolveError::Source(_))
        )
    }

    /// Shorthand for [`EtlError::InvalidResource`].
    pub fn invalid(resource_type: &str, resource_id: i64, reason: impl Into<String>) -> Self {
        Self::InvalidResource {
            resource_type: resource_type.to_string(),
            resource_id,
            reason: reason.into(),
        }
    }
}
