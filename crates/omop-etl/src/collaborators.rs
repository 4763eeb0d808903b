//! External collaborators of a run.
//!
//! The ETL core only talks to these traits. [`crate::files`] provides
//! file-backed implementations for the binary; tests use in-memory ones.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use omop_types::cdm::MedicationRecord;
use omop_types::{CdmRecord, EntityKind, IdentityRecord, SurrogateId};

use crate::config::EtlConfig;
use crate::error::EtlResult;
use crate::source::SourceResource;
use crate::stage::Stage;

/// A bounded read from the staging table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRequest<'a> {
    /// Resource type to read.
    pub resource_type: &'a str,
    /// Rows of this type (inside the date window) already read.
    pub offset: usize,
    /// Maximum rows to return.
    pub limit: usize,
    /// Earliest `last_updated` date.
    pub start_date: NaiveDate,
    /// Latest `last_updated` date.
    pub end_date: NaiveDate,
}

/// Reads staged resources.
pub trait SourceReader: Send + Sync {
    /// Returns the next chunk, in staging order. Empty means exhausted.
    fn read_chunk(&self, request: &ChunkRequest<'_>) -> EtlResult<Vec<SourceResource>>;
}

/// Writes mapped CDM rows.
pub trait CdmWriter: Send + Sync {
    /// Commits one chunk's records as a unit.
    fn write_chunk(&self, stage: Stage, records: &[CdmRecord]) -> EtlResult<()>;
}

/// Looks up entities already written to the CDM.
pub trait IdentityStore: Send + Sync {
    /// Finds an entity by its logical id.
    fn find_by_logical_id(&self, kind: EntityKind, logical_id: &str) -> EtlResult<Option<SurrogateId>>;

    /// Finds an entity by its business identifier.
    fn find_by_identifier(&self, kind: EntityKind, identifier: &str) -> EtlResult<Option<SurrogateId>>;

    /// Returns a registered medication.
    fn find_medication(&self, medication_id: SurrogateId) -> EtlResult<Option<MedicationRecord>>;

    /// Returns the highest surrogate id in use for `kind`.
    fn max_id(&self, kind: EntityKind) -> EtlResult<Option<SurrogateId>>;

    /// Returns every identity of `kind`, for preloading in-memory indexes.
    fn load_identities(&self, kind: EntityKind) -> EtlResult<Vec<IdentityRecord>>;
}

/// Moves a staged resource's `last_updated` watermark forward so a later
/// incremental run picks it up again.
pub trait RescheduleHook: Send + Sync {
    /// Re-attempt `resource_id` no earlier than `after`.
    fn reschedule(&self, resource_id: i64, after: DateTime<Utc>) -> EtlResult<()>;
}

/// Schema preparation before, and aggregation after, the load.
pub trait LoadLifecycle: Send + Sync {
    /// Prepares the target (schema, cdm source bookkeeping).
    fn init(&self, config: &EtlConfig) -> EtlResult<()>;

    /// Runs after every load, whichever branch ran.
    fn post_process(&self) -> EtlResult<()>;
}

/// The collaborators a run needs.
#[derive(Clone)]
pub struct Collaborators {
    /// Staging table.
    pub reader: Arc<dyn SourceReader>,
    /// CDM writer.
    pub writer: Arc<dyn CdmWriter>,
    /// CDM identity lookups.
    pub identities: Arc<dyn IdentityStore>,
    /// Reschedule hook for deferred resources.
    pub reschedule: Arc<dyn RescheduleHook>,
    /// Init and post-process steps.
    pub lifecycle: Arc<dyn LoadLifecycle>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
