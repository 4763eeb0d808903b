//! File-backed collaborators used by the `fhir2omop` binary.
//!
//! - [`NdjsonStaging`]: staging table read from an NDJSON file, one
//!   `{"id", "last_updated", "resource"}` object per line. Reschedules are
//!   kept as watermarks and persisted next to the file.
//! - [`MemoryCdmStore`]: CDM tables held in memory and served back for
//!   identity lookups. Each committed chunk is appended to `<table>.ndjson`;
//!   post-process compacts the files.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use omop_types::cdm::MedicationRecord;
use omop_types::{CdmRecord, CdmTable, EntityKind, IdentityRecord, SurrogateId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collaborators::{
    CdmWriter, ChunkRequest, IdentityStore, LoadLifecycle, RescheduleHook, SourceReader,
};
use crate::config::EtlConfig;
use crate::error::EtlResult;
use crate::source::SourceResource;
use crate::stage::Stage;

// ═══════════════════════════════════════════════════════════════════════════
// Staging
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
struct StagingRow {
    id: i64,
    last_updated: DateTime<Utc>,
    resource: Value,
}

/// NDJSON staging table.
#[derive(Debug)]
pub struct NdjsonStaging {
    path: Option<PathBuf>,
    rows: Vec<SourceResource>,
    watermarks: DashMap<i64, DateTime<Utc>>,
}

/// Sidecar file holding reschedule watermarks for `path`.
pub fn reschedule_file(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".reschedule.json");
    path.with_file_name(name)
}

impl NdjsonStaging {
    /// Reads a staging file and applies previously persisted watermarks.
    ///
    /// Malformed lines are logged and skipped.
    pub fn open<P: AsRef<Path>>(path: P) -> EtlResult<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let mut rows = Vec::new();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StagingRow>(&line) {
                Ok(row) => rows.push(SourceResource::from_payload(row.id, row.last_updated, row.resource)),
                Err(e) => {
                    tracing::warn!(line = line_no + 1, error = %e, "skipping malformed staging row");
                }
            }
        }

        let watermarks = DashMap::new();
        let sidecar = reschedule_file(path);
        if sidecar.exists() {
            let saved: HashMap<i64, DateTime<Utc>> = serde_json::from_reader(BufReader::new(File::open(&sidecar)?))?;
            for row in &mut rows {
                if let Some(after) = saved.get(&row.id) {
                    row.last_updated = row.last_updated.max(*after);
                }
            }
            for (id, after) in saved {
                watermarks.insert(id, after);
            }
        }

        tracing::info!(path = %path.display(), rows = rows.len(), rescheduled = watermarks.len(), "staging file loaded");
        Ok(Self {
            path: Some(path.to_path_buf()),
            rows,
            watermarks,
        })
    }

    /// Staging table over in-memory rows; reschedules are not persisted.
    pub fn from_rows(rows: Vec<SourceResource>) -> Self {
        Self {
            path: None,
            rows,
            watermarks: DashMap::new(),
        }
    }

    /// Number of staged rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Watermark of a rescheduled row.
    pub fn watermark(&self, resource_id: i64) -> Option<DateTime<Utc>> {
        self.watermarks.get(&resource_id).map(|w| *w)
    }

    /// Number of rescheduled rows.
    pub fn rescheduled(&self) -> usize {
        self.watermarks.len()
    }

    /// Writes the watermarks next to the staging file.
    pub fn persist_reschedules(&self) -> EtlResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if self.watermarks.is_empty() {
            return Ok(());
        }
        let saved: BTreeMap<i64, DateTime<Utc>> = self.watermarks.iter().map(|e| (*e.key(), *e.value())).collect();
        let sidecar = reschedule_file(path);
        let mut writer = BufWriter::new(File::create(&sidecar)?);
        serde_json::to_writer_pretty(&mut writer, &saved)?;
        writer.flush()?;
        tracing::info!(path = %sidecar.display(), count = saved.len(), "reschedules saved");
        Ok(())
    }
}

impl SourceReader for NdjsonStaging {
    fn read_chunk(&self, request: &ChunkRequest<'_>) -> EtlResult<Vec<SourceResource>> {
        Ok(self
            .rows
            .iter()
            .filter(|row| row.resource_type == request.resource_type)
            .filter(|row| {
                let day = row.last_updated.date_naive();
                request.start_date <= day && day <= request.end_date
            })
            .skip(request.offset)
            .take(request.limit)
            .cloned()
            .collect())
    }
}

impl RescheduleHook for NdjsonStaging {
    fn reschedule(&self, resource_id: i64, after: DateTime<Utc>) -> EtlResult<()> {
        self.watermarks
            .entry(resource_id)
            .and_modify(|current| *current = (*current).max(after))
            .or_insert(after);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CDM store
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct TableRows {
    rows: Vec<CdmRecord>,
    positions: HashMap<String, usize>,
}

impl TableRows {
    fn upsert(&mut self, record: CdmRecord) {
        match row_key(&record) {
            Some(key) => match self.positions.get(&key) {
                Some(&pos) => self.rows[pos] = record,
                None => {
                    self.positions.insert(key, self.rows.len());
                    self.rows.push(record);
                }
            },
            None => self.rows.push(record),
        }
    }
}

/// Key rows are replaced by: the surrogate id for entity tables; logical
/// id, concept and source value for event tables.
fn row_key(record: &CdmRecord) -> Option<String> {
    let (id, concept, source) = match record {
        CdmRecord::Person(r) => return Some(r.person_id.to_string()),
        CdmRecord::Location(r) => return Some(r.location_id.to_string()),
        CdmRecord::VisitOccurrence(r) => return Some(r.visit_occurrence_id.to_string()),
        CdmRecord::VisitDetail(r) => return Some(r.visit_detail_id.to_string()),
        CdmRecord::DrugExposure(r) => return Some(r.drug_exposure_id.to_string()),
        CdmRecord::Medication(r) => return Some(r.medication_id.to_string()),
        CdmRecord::ConditionOccurrence(r) => (&r.fhir_logical_id, r.condition_concept_id, &r.condition_source_value),
        CdmRecord::ProcedureOccurrence(r) => (&r.fhir_logical_id, r.procedure_concept_id, &r.procedure_source_value),
        CdmRecord::Measurement(r) => (&r.fhir_logical_id, r.measurement_concept_id, &r.measurement_source_value),
        CdmRecord::Observation(r) => (&r.fhir_logical_id, r.observation_concept_id, &r.observation_source_value),
    };
    id.as_ref().map(|id| format!("{id}|{concept}|{source}"))
}

/// Surrogate id of an entity row.
fn surrogate_id(record: &CdmRecord) -> Option<(EntityKind, SurrogateId)> {
    match record {
        CdmRecord::Person(r) => Some((EntityKind::Person, r.person_id)),
        CdmRecord::Location(r) => Some((EntityKind::Location, r.location_id)),
        CdmRecord::VisitOccurrence(r) => Some((EntityKind::VisitOccurrence, r.visit_occurrence_id)),
        CdmRecord::VisitDetail(r) => Some((EntityKind::VisitDetail, r.visit_detail_id)),
        CdmRecord::DrugExposure(r) => Some((EntityKind::DrugExposure, r.drug_exposure_id)),
        CdmRecord::Medication(r) => Some((EntityKind::Medication, r.medication_id)),
        _ => None,
    }
}

fn entity_table(kind: EntityKind) -> Option<CdmTable> {
    match kind {
        EntityKind::Person => Some(CdmTable::Person),
        EntityKind::VisitOccurrence => Some(CdmTable::VisitOccurrence),
        EntityKind::Medication => Some(CdmTable::Medication),
        _ => None,
    }
}

/// In-memory CDM backed by NDJSON files.
///
/// Serves identity lookups from what has been written, including rows
/// loaded from a previous run's output. A chunk is durable once
/// [`CdmWriter::write_chunk`] returns; replaying the files upserts, so a
/// chunk appended twice loads once.
#[derive(Debug, Default)]
pub struct MemoryCdmStore {
    output_dir: Option<PathBuf>,
    tables: DashMap<CdmTable, TableRows>,
    by_logical_id: DashMap<(EntityKind, String), SurrogateId>,
    by_identifier: DashMap<(EntityKind, String), SurrogateId>,
    medications: DashMap<SurrogateId, MedicationRecord>,
    max_ids: DashMap<EntityKind, SurrogateId>,
}

impl MemoryCdmStore {
    /// Creates an empty store that is never flushed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a store writing to `dir`, loading any tables already there.
    pub fn open<P: AsRef<Path>>(dir: P) -> EtlResult<Self> {
        let dir = dir.as_ref();
        let store = Self {
            output_dir: Some(dir.to_path_buf()),
            ..Default::default()
        };

        for table in CdmTable::ALL {
            let path = table_file(dir, table);
            if !path.exists() {
                continue;
            }
            let reader = BufReader::new(File::open(&path)?);
            let mut count = 0;
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                store.insert(serde_json::from_str(&line)?);
                count += 1;
            }
            tracing::info!(table = table.as_str(), rows = count, "loaded existing CDM table");
        }
        Ok(store)
    }

    fn insert(&self, record: CdmRecord) {
        if let Some((kind, id)) = surrogate_id(&record) {
            self.max_ids
                .entry(kind)
                .and_modify(|max| *max = (*max).max(id))
                .or_insert(id);
        }
        if let Some((kind, identity)) = record.identity() {
            if let Some(logical_id) = identity.logical_id {
                self.by_logical_id.insert((kind, logical_id), identity.surrogate_id);
            }
            if let Some(identifier) = identity.identifier {
                self.by_identifier.insert((kind, identifier), identity.surrogate_id);
            }
        }
        if let CdmRecord::Medication(medication) = &record {
            self.medications.insert(medication.medication_id, medication.clone());
        }
        self.tables.entry(record.table()).or_default().upsert(record);
    }

    /// Number of rows in `table`.
    pub fn row_count(&self, table: CdmTable) -> usize {
        self.tables.get(&table).map_or(0, |t| t.rows.len())
    }

    /// Copy of the rows of `table`.
    pub fn rows(&self, table: CdmTable) -> Vec<CdmRecord> {
        self.tables.get(&table).map(|t| t.rows.clone()).unwrap_or_default()
    }

    /// Appends `records` to their table files.
    fn append(&self, records: &[CdmRecord]) -> EtlResult<()> {
        let Some(dir) = &self.output_dir else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;
        let mut files: HashMap<CdmTable, BufWriter<File>> = HashMap::new();
        for record in records {
            let writer = match files.entry(record.table()) {
                Entry::Occupied(open) => open.into_mut(),
                Entry::Vacant(slot) => {
                    let file = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(table_file(dir, record.table()))?;
                    slot.insert(BufWriter::new(file))
                }
            };
            serde_json::to_writer(&mut *writer, record)?;
            writer.write_all(b"\n")?;
        }
        for writer in files.values_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Rewrites every table to `<output_dir>/<table>.ndjson`, one row per
    /// key.
    pub fn flush(&self) -> EtlResult<()> {
        let Some(dir) = &self.output_dir else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;
        for table in CdmTable::ALL {
            let Some(rows) = self.tables.get(&table) else {
                continue;
            };
            let mut writer = BufWriter::new(File::create(table_file(dir, table))?);
            for row in &rows.rows {
                serde_json::to_writer(&mut writer, row)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
            tracing::info!(table = table.as_str(), rows = rows.rows.len(), "CDM table written");
        }
        Ok(())
    }
}

fn table_file(dir: &Path, table: CdmTable) -> PathBuf {
    dir.join(format!("{}.ndjson", table.as_str()))
}

impl CdmWriter for MemoryCdmStore {
    fn write_chunk(&self, _stage: Stage, records: &[CdmRecord]) -> EtlResult<()> {
        self.append(records)?;
        for record in records {
            self.insert(record.clone());
        }
        Ok(())
    }
}

impl IdentityStore for MemoryCdmStore {
    fn find_by_logical_id(&self, kind: EntityKind, logical_id: &str) -> EtlResult<Option<SurrogateId>> {
        Ok(self.by_logical_id.get(&(kind, logical_id.to_string())).map(|id| *id))
    }

    fn find_by_identifier(&self, kind: EntityKind, identifier: &str) -> EtlResult<Option<SurrogateId>> {
        Ok(self.by_identifier.get(&(kind, identifier.to_string())).map(|id| *id))
    }

    fn find_medication(&self, medication_id: SurrogateId) -> EtlResult<Option<MedicationRecord>> {
        Ok(self.medications.get(&medication_id).map(|m| m.clone()))
    }

    fn max_id(&self, kind: EntityKind) -> EtlResult<Option<SurrogateId>> {
        Ok(self.max_ids.get(&kind).map(|id| *id))
    }

    fn load_identities(&self, kind: EntityKind) -> EtlResult<Vec<IdentityRecord>> {
        let Some(table) = entity_table(kind) else {
            return Ok(Vec::new());
        };
        Ok(self
            .tables
            .get(&table)
            .map(|t| {
                t.rows
                    .iter()
                    .filter_map(CdmRecord::identity)
                    .map(|(_, identity)| identity)
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl LoadLifecycle for MemoryCdmStore {
    fn init(&self, config: &EtlConfig) -> EtlResult<()> {
        if let Some(dir) = &self.output_dir {
            fs::create_dir_all(dir)?;
        }
        tracing::info!(
            mode = ?config.load_mode(),
            start = %config.start_date,
            end = %config.end_date,
            "CDM store ready"
        );
        Ok(())
    }

    fn post_process(&self) -> EtlResult<()> {
        self.flush()
    }
}
