//! Cross-resource reference resolution.
//!
//! A reference names its target by logical id, by business identifier, or
//! both. [`ReferenceResolver`] turns it into the target's surrogate id using
//! one of two strategies:
//!
//! - bulk load with the RAM dictionary: in-memory [`IdentityIndex`]es,
//!   preloaded from the store and extended as chunks commit;
//! - otherwise: read-through store lookups.
//!
//! A target that is not found is deferred during incremental load and
//! unresolved during bulk load. Deferred resources are handed to the
//! reschedule hook by [`ReferenceResolver::apply_reschedules`] once their
//! chunk has committed, so a retried chunk reschedules each resource once.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use omop_types::cdm::MedicationRecord;
use omop_types::{CdmRecord, EntityKind, IdentityRecord, SurrogateId};

use crate::collaborators::{IdentityStore, RescheduleHook};
use crate::config::{EtlConfig, LoadMode};
use crate::error::{EtlError, EtlResult};
use crate::identity::{agree, IdentityIndex};

/// Delay before a deferred resource is attempted again.
pub const RESCHEDULE_DELAY_DAYS: i64 = 1;

/// Result of resolving a reference that was present.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceOutcome<T> {
    /// The target was found.
    Resolved(T),
    /// The target is unknown and the dependent resource will be
    /// rescheduled.
    Deferred,
    /// The target is unknown (bulk load).
    Unresolved,
}

impl<T> ReferenceOutcome<T> {
    /// Returns the target, or the error skipping/deferring the item.
    pub fn required(self, kind: EntityKind, resource_id: i64) -> EtlResult<T> {
        match self {
            Self::Resolved(value) => Ok(value),
            Self::Deferred => Err(EtlError::Deferred { kind, resource_id }),
            Self::Unresolved => Err(EtlError::UnresolvedReference { kind, resource_id }),
        }
    }

    /// Like [`ReferenceOutcome::required`], but an unresolved target is
    /// dropped instead of skipping the item.
    pub fn optional(self, kind: EntityKind, resource_id: i64) -> EtlResult<Option<T>> {
        match self {
            Self::Resolved(value) => Ok(Some(value)),
            Self::Deferred => Err(EtlError::Deferred { kind, resource_id }),
            Self::Unresolved => Ok(None),
        }
    }

    /// Returns true if the target was found.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum KeyKind {
    LogicalId,
    Identifier,
}

/// Resolves person, visit and medication references.
pub struct ReferenceResolver {
    mode: LoadMode,
    use_ram: bool,
    persons: IdentityIndex,
    visits: IdentityIndex,
    medications: IdentityIndex,
    medication_records: DashMap<SurrogateId, MedicationRecord>,
    lookups: DashMap<(EntityKind, KeyKind, String), SurrogateId>,
    pending: DashMap<i64, DateTime<Utc>>,
    store: Arc<dyn IdentityStore>,
    hook: Arc<dyn RescheduleHook>,
}

impl std::fmt::Debug for ReferenceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceResolver")
            .field("mode", &self.mode)
            .field("use_ram", &self.use_ram)
            .field("persons", &self.persons.len())
            .field("visits", &self.visits.len())
            .field("medications", &self.medications.len())
            .field("cached_lookups", &self.lookups.len())
            .field("pending_reschedules", &self.pending.len())
            .finish()
    }
}

impl ReferenceResolver {
    /// Creates a resolver for the run described by `config`.
    pub fn new(config: &EtlConfig, store: Arc<dyn IdentityStore>, hook: Arc<dyn RescheduleHook>) -> Self {
        Self {
            mode: config.load_mode(),
            use_ram: config.uses_ram_dictionary(),
            persons: IdentityIndex::new(EntityKind::Person),
            visits: IdentityIndex::new(EntityKind::VisitOccurrence),
            medications: IdentityIndex::new(EntityKind::Medication),
            medication_records: DashMap::new(),
            lookups: DashMap::new(),
            pending: DashMap::new(),
            store,
            hook,
        }
    }

    /// Returns true if lookups go to the in-memory indexes.
    pub fn uses_ram(&self) -> bool {
        self.use_ram
    }

    /// Resolves a reference to a person.
    pub fn resolve_person_id(
        &self,
        identifier: Option<&str>,
        logical_id: Option<&str>,
        resource_id: i64,
    ) -> EtlResult<ReferenceOutcome<SurrogateId>> {
        self.resolve(EntityKind::Person, identifier, logical_id, resource_id)
    }

    /// Resolves a reference to a visit occurrence.
    pub fn resolve_visit_id(
        &self,
        identifier: Option<&str>,
        logical_id: Option<&str>,
        resource_id: i64,
    ) -> EtlResult<ReferenceOutcome<SurrogateId>> {
        self.resolve(EntityKind::VisitOccurrence, identifier, logical_id, resource_id)
    }

    /// Resolves a reference to a registered medication and returns its code.
    pub fn resolve_medication(
        &self,
        identifier: Option<&str>,
        logical_id: Option<&str>,
        resource_id: i64,
    ) -> EtlResult<ReferenceOutcome<MedicationRecord>> {
        let id = match self.resolve(EntityKind::Medication, identifier, logical_id, resource_id)? {
            ReferenceOutcome::Resolved(id) => id,
            ReferenceOutcome::Deferred => return Ok(ReferenceOutcome::Deferred),
            ReferenceOutcome::Unresolved => return Ok(ReferenceOutcome::Unresolved),
        };

        if let Some(record) = self.medication_records.get(&id) {
            return Ok(ReferenceOutcome::Resolved(record.clone()));
        }
        match self.store.find_medication(id)? {
            Some(record) => {
                self.medication_records.insert(id, record.clone());
                Ok(ReferenceOutcome::Resolved(record))
            }
            None => self.not_found(EntityKind::Medication, resource_id),
        }
    }

    fn resolve(
        &self,
        kind: EntityKind,
        identifier: Option<&str>,
        logical_id: Option<&str>,
        resource_id: i64,
    ) -> EtlResult<ReferenceOutcome<SurrogateId>> {
        let identifier = identifier.filter(|s| !s.trim().is_empty());
        let logical_id = logical_id.filter(|s| !s.trim().is_empty());
        if identifier.is_none() && logical_id.is_none() {
            return Err(EtlError::NoReference { kind, resource_id });
        }

        match self.find(kind, identifier, logical_id)? {
            Some(id) => Ok(ReferenceOutcome::Resolved(id)),
            None => self.not_found(kind, resource_id),
        }
    }

    /// Surrogate id an entity already has, looked up by its own keys.
    ///
    /// Unlike reference resolution a miss is not deferred: the caller
    /// allocates a new id instead.
    pub fn existing_id(
        &self,
        kind: EntityKind,
        identifier: Option<&str>,
        logical_id: Option<&str>,
    ) -> EtlResult<Option<SurrogateId>> {
        let identifier = identifier.filter(|s| !s.trim().is_empty());
        let logical_id = logical_id.filter(|s| !s.trim().is_empty());
        if identifier.is_none() && logical_id.is_none() {
            return Ok(None);
        }
        self.find(kind, identifier, logical_id)
    }

    fn find(
        &self,
        kind: EntityKind,
        identifier: Option<&str>,
        logical_id: Option<&str>,
    ) -> EtlResult<Option<SurrogateId>> {
        match self.index(kind) {
            Some(index) if self.use_ram => index.lookup(identifier, logical_id),
            _ => self.lookup_store(kind, identifier, logical_id),
        }
    }

    fn not_found<T>(&self, kind: EntityKind, resource_id: i64) -> EtlResult<ReferenceOutcome<T>> {
        match self.mode {
            LoadMode::Incremental => {
                let after = Utc::now() + Duration::days(RESCHEDULE_DELAY_DAYS);
                self.pending.insert(resource_id, after);
                tracing::debug!(%kind, resource_id, %after, "reference not loaded yet, deferred");
                Ok(ReferenceOutcome::Deferred)
            }
            LoadMode::Bulk => Ok(ReferenceOutcome::Unresolved),
        }
    }

    fn lookup_store(
        &self,
        kind: EntityKind,
        identifier: Option<&str>,
        logical_id: Option<&str>,
    ) -> EtlResult<Option<SurrogateId>> {
        let by_logical = match logical_id {
            Some(key) => self.cached(kind, KeyKind::LogicalId, key, || {
                self.store.find_by_logical_id(kind, key)
            })?,
            None => None,
        };
        let by_identifier = match identifier {
            Some(key) => self.cached(kind, KeyKind::Identifier, key, || {
                self.store.find_by_identifier(kind, key)
            })?,
            None => None,
        };
        agree(kind, logical_id, by_logical, identifier, by_identifier)
    }

    /// Read-through cache over a store query. Misses are not cached so a
    /// target committed later in the run is still found.
    fn cached(
        &self,
        kind: EntityKind,
        key_kind: KeyKind,
        key: &str,
        query: impl FnOnce() -> EtlResult<Option<SurrogateId>>,
    ) -> EtlResult<Option<SurrogateId>> {
        let cache_key = (kind, key_kind, key.to_string());
        if let Some(id) = self.lookups.get(&cache_key) {
            return Ok(Some(*id));
        }
        let found = query()?;
        if let Some(id) = found {
            self.lookups.insert(cache_key, id);
        }
        Ok(found)
    }

    /// Returns true if references to `kind` are resolved by this resolver.
    pub fn tracks(&self, kind: EntityKind) -> bool {
        self.index(kind).is_some()
    }

    fn index(&self, kind: EntityKind) -> Option<&IdentityIndex> {
        match kind {
            EntityKind::Person => Some(&self.persons),
            EntityKind::VisitOccurrence => Some(&self.visits),
            EntityKind::Medication => Some(&self.medications),
            _ => None,
        }
    }

    /// Registers an identity so later references in this run find it.
    ///
    /// Only affects the in-memory indexes; store lookups see the store.
    pub fn register(&self, kind: EntityKind, record: &IdentityRecord) -> EtlResult<()> {
        if !self.use_ram || !record.has_keys() {
            return Ok(());
        }
        match self.index(kind) {
            Some(index) => index.register(record),
            None => Ok(()),
        }
    }

    /// Registers a medication and remembers its code.
    pub fn register_medication(&self, record: &MedicationRecord) -> EtlResult<()> {
        let identity = IdentityRecord::new(
            record.medication_id,
            record.fhir_logical_id.as_deref(),
            record.fhir_identifier.as_deref(),
        );
        self.register(EntityKind::Medication, &identity)?;
        self.medication_records.insert(record.medication_id, record.clone());
        Ok(())
    }

    /// Registers every identity introduced by a committed chunk.
    pub fn register_committed(&self, records: &[CdmRecord]) -> EtlResult<()> {
        for record in records {
            match record {
                CdmRecord::Medication(medication) => self.register_medication(medication)?,
                other => {
                    if let Some((kind, identity)) = other.identity() {
                        self.register(kind, &identity)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Hands every pending deferral to the reschedule hook.
    ///
    /// Returns the number of resources rescheduled.
    pub fn apply_reschedules(&self) -> EtlResult<usize> {
        let mut pending: Vec<(i64, DateTime<Utc>)> = self.pending.iter().map(|e| (*e.key(), *e.value())).collect();
        pending.sort_unstable_by_key(|(resource_id, _)| *resource_id);
        for (resource_id, after) in &pending {
            self.hook.reschedule(*resource_id, *after)?;
            self.pending.remove(resource_id);
        }
        Ok(pending.len())
    }

    /// Drops deferrals recorded by a chunk attempt that did not commit.
    pub fn discard_reschedules(&self) {
        self.pending.clear();
    }

    /// Number of deferrals not yet handed to the hook.
    pub fn pending_reschedules(&self) -> usize {
        self.pending.len()
    }

    /// Checks the identities a chunk is about to commit.
    ///
    /// Fails with [`EtlError::IdentityConflict`] if two records of the chunk
    /// bind the same logical id or identifier to different ids, or if a
    /// record's keys already belong to another entity.
    pub fn check_chunk(&self, records: &[CdmRecord]) -> EtlResult<()> {
        let mut staged: HashMap<EntityKind, IdentityIndex> = HashMap::new();
        for record in records {
            let Some((kind, identity)) = record.identity() else {
                continue;
            };
            if !self.tracks(kind) || !identity.has_keys() {
                continue;
            }
            staged
                .entry(kind)
                .or_insert_with(|| IdentityIndex::new(kind))
                .register(&identity)?;

            let existing = self.find(kind, identity.identifier.as_deref(), identity.logical_id.as_deref())?;
            if let Some(existing) = existing.filter(|id| *id != identity.surrogate_id) {
                return Err(EtlError::IdentityConflict {
                    kind,
                    logical_id: identity.logical_id.clone().unwrap_or_default(),
                    by_logical_id: identity.surrogate_id,
                    identifier: identity.identifier.clone().unwrap_or_default(),
                    by_identifier: existing,
                });
            }
        }
        Ok(())
    }

    /// Fills the in-memory indexes from the store.
    ///
    /// Returns the number of identities loaded. A no-op unless the RAM
    /// dictionary is in use.
    pub fn preload(&self) -> EtlResult<usize> {
        if !self.use_ram {
            return Ok(0);
        }
        let mut total = 0;
        for kind in [EntityKind::Person, EntityKind::VisitOccurrence, EntityKind::Medication] {
            let identities = self.store.load_identities(kind)?;
            for identity in &identities {
                self.register(kind, identity)?;
            }
            tracing::debug!(%kind, count = identities.len(), "preloaded identities");
            total += identities.len();
        }
        Ok(total)
    }
}
