//! Surrogate id allocation and in-memory identity indexes.
//!
//! - [`IdentityCache`]: key -> surrogate id with a counter-based allocator,
//!   one per [`EntityKind`] (bundled in [`IdentityCaches`]).
//! - [`IdentityIndex`]: logical id / identifier -> surrogate id of entities
//!   committed in this run, used to resolve references during bulk load.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use omop_types::{EntityKind, IdentityRecord, SurrogateId};

use crate::collaborators::IdentityStore;
use crate::error::{EtlError, EtlResult};

/// Concurrency-safe key -> surrogate id map.
///
/// Ids are allocated from a counter starting at 1, or after a seeded
/// maximum. [`IdentityCache::get_or_create`] is an atomic compute-if-absent:
/// concurrent callers with the same key get the same id and the counter
/// advances once.
///
/// Allocations may also reserve a business identifier, so another key
/// carrying the same identifier gets the same id in this run.
#[derive(Debug)]
pub struct IdentityCache {
    kind: EntityKind,
    ids: DashMap<String, SurrogateId>,
    identifiers: DashMap<String, SurrogateId>,
    next: AtomicI64,
}

impl IdentityCache {
    /// Creates an empty cache allocating from 1.
    pub fn new(kind: EntityKind) -> Self {
        Self::starting_after(kind, 0)
    }

    /// Creates an empty cache allocating from `max_id + 1`.
    pub fn starting_after(kind: EntityKind, max_id: SurrogateId) -> Self {
        Self {
            kind,
            ids: DashMap::new(),
            identifiers: DashMap::new(),
            next: AtomicI64::new(max_id.max(0) + 1),
        }
    }

    /// Entity kind this cache allocates for.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Returns the id for `key`, allocating one if absent.
    pub fn get_or_create(&self, key: &str) -> SurrogateId {
        if let Some(id) = self.ids.get(key) {
            return *id;
        }
        *self
            .ids
            .entry(key.to_string())
            .or_insert_with(|| self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// Like [`IdentityCache::get_or_create`], but a key first seen with an
    /// `identifier` another key already reserved gets that key's id.
    pub fn get_or_create_shared(&self, key: &str, identifier: Option<&str>) -> SurrogateId {
        let Some(identifier) = identifier else {
            return self.get_or_create(key);
        };
        if let Some(id) = self.ids.get(key) {
            return *id;
        }
        // Lock order: identifiers, then ids.
        let id = *self
            .identifiers
            .entry(identifier.to_string())
            .or_insert_with(|| self.get_or_create(key));
        *self.ids.entry(key.to_string()).or_insert(id)
    }

    /// Binds `identifier` to `id` unless it is already reserved.
    pub fn reserve_identifier(&self, identifier: &str, id: SurrogateId) {
        self.identifiers.entry(identifier.to_string()).or_insert(id);
    }

    /// Returns the id for `key` without allocating.
    pub fn get(&self, key: &str) -> Option<SurrogateId> {
        self.ids.get(key).map(|id| *id)
    }

    /// Stores an externally known id; later allocations stay above it.
    pub fn put(&self, key: &str, id: SurrogateId) {
        self.ids.insert(key.to_string(), id);
        self.next.fetch_max(id + 1, Ordering::SeqCst);
    }

    /// Drops all keys. Ids already handed out are never reused.
    pub fn clear(&self) {
        self.ids.clear();
        self.identifiers.clear();
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if no key is cached.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The id the next allocation will return.
    pub fn next_id(&self) -> SurrogateId {
        self.next.load(Ordering::SeqCst)
    }
}

/// One [`IdentityCache`] per entity kind.
#[derive(Debug)]
pub struct IdentityCaches {
    person: IdentityCache,
    location: IdentityCache,
    visit_occurrence: IdentityCache,
    medication: IdentityCache,
    drug_exposure: IdentityCache,
    visit_detail: IdentityCache,
}

impl Default for IdentityCaches {
    fn default() -> Self {
        Self {
            person: IdentityCache::new(EntityKind::Person),
            location: IdentityCache::new(EntityKind::Location),
            visit_occurrence: IdentityCache::new(EntityKind::VisitOccurrence),
            medication: IdentityCache::new(EntityKind::Medication),
            drug_exposure: IdentityCache::new(EntityKind::DrugExposure),
            visit_detail: IdentityCache::new(EntityKind::VisitDetail),
        }
    }
}

impl IdentityCaches {
    /// Creates caches allocating from 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates caches allocating above the ids already in `store`.
    pub fn seeded(store: &dyn IdentityStore) -> EtlResult<Self> {
        let seed = |kind| -> EtlResult<IdentityCache> {
            let max = store.max_id(kind)?.unwrap_or(0);
            Ok(IdentityCache::starting_after(kind, max))
        };
        Ok(Self {
            person: seed(EntityKind::Person)?,
            location: seed(EntityKind::Location)?,
            visit_occurrence: seed(EntityKind::VisitOccurrence)?,
            medication: seed(EntityKind::Medication)?,
            drug_exposure: seed(EntityKind::DrugExposure)?,
            visit_detail: seed(EntityKind::VisitDetail)?,
        })
    }

    /// Returns the cache for `kind`.
    pub fn cache(&self, kind: EntityKind) -> &IdentityCache {
        match kind {
            EntityKind::Person => &self.person,
            EntityKind::Location => &self.location,
            EntityKind::VisitOccurrence => &self.visit_occurrence,
            EntityKind::Medication => &self.medication,
            EntityKind::DrugExposure => &self.drug_exposure,
            EntityKind::VisitDetail => &self.visit_detail,
        }
    }

    /// Shorthand for `cache(kind).get_or_create(key)`.
    pub fn get_or_create(&self, kind: EntityKind, key: &str) -> SurrogateId {
        self.cache(kind).get_or_create(key)
    }
}

/// In-memory index of committed identities of one kind.
///
/// Keys are never remapped: registering a logical id or identifier that is
/// already bound to another surrogate id is an [`EtlError::IdentityConflict`].
#[derive(Debug)]
pub struct IdentityIndex {
    kind: EntityKind,
    by_logical_id: DashMap<String, SurrogateId>,
    by_identifier: DashMap<String, SurrogateId>,
}

impl IdentityIndex {
    /// Creates an empty index.
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            by_logical_id: DashMap::new(),
            by_identifier: DashMap::new(),
        }
    }

    /// Registers an identity under both of its keys.
    pub fn register(&self, record: &IdentityRecord) -> EtlResult<()> {
        if let Some(logical_id) = &record.logical_id {
            self.bind(&self.by_logical_id, logical_id, record)?;
        }
        if let Some(identifier) = &record.identifier {
            self.bind(&self.by_identifier, identifier, record)?;
        }
        Ok(())
    }

    fn bind(&self, map: &DashMap<String, SurrogateId>, key: &str, record: &IdentityRecord) -> EtlResult<()> {
        match map.entry(key.to_string()) {
            Entry::Occupied(existing) if *existing.get() != record.surrogate_id => {
                Err(self.conflict(record, *existing.get()))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(record.surrogate_id);
                Ok(())
            }
        }
    }

    fn conflict(&self, record: &IdentityRecord, existing: SurrogateId) -> EtlError {
        EtlError::IdentityConflict {
            kind: self.kind,
            logical_id: record.logical_id.clone().unwrap_or_default(),
            by_logical_id: record.surrogate_id,
            identifier: record.identifier.clone().unwrap_or_default(),
            by_identifier: existing,
        }
    }

    /// Looks up an entity by either key; a hit on one key wins, two hits
    /// that disagree are a conflict.
    pub fn lookup(&self, identifier: Option<&str>, logical_id: Option<&str>) -> EtlResult<Option<SurrogateId>> {
        let by_logical = logical_id.and_then(|k| self.by_logical_id.get(k).map(|id| *id));
        let by_identifier = identifier.and_then(|k| self.by_identifier.get(k).map(|id| *id));
        agree(self.kind, logical_id, by_logical, identifier, by_identifier)
    }

    /// Number of logical ids indexed.
    pub fn len(&self) -> usize {
        self.by_logical_id.len()
    }

    /// Returns true if nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.by_logical_id.is_empty() && self.by_identifier.is_empty()
    }
}

/// Merges the results of a logical-id and an identifier lookup.
pub(crate) fn agree(
    kind: EntityKind,
    logical_id: Option<&str>,
    by_logical: Option<SurrogateId>,
    identifier: Option<&str>,
    by_identifier: Option<SurrogateId>,
) -> EtlResult<Option<SurrogateId>> {
    match (by_logical, by_identifier) {
        (Some(a), Some(b)) if a != b => Err(EtlError::IdentityConflict {
            kind,
            logical_id: logical_id.unwrap_or_default().to_string(),
            by_logical_id: a,
            identifier: identifier.unwrap_or_default().to_string(),
            by_identifier: b,
        }),
        (Some(a), _) => Ok(Some(a)),
        (None, b) => Ok(b),
    }
}
