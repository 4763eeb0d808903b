//! Chunked stage execution.
//!
//! A stage reads bounded chunks from the staging table, maps every item
//! independently and commits each chunk's records as one unit. Chunks are
//! committed in read order and item order survives parallel mapping.
//!
//! Per-item failures (see [`EtlError::is_item_skip`]) are counted and the
//! item dropped. Deferred items are counted and rescheduled once the chunk
//! has committed. Identities are checked before the write: a chunk that
//! binds one key to two ids is never committed. Anything else fails the
//! chunk; retryable failures are attempted again up to
//! [`EtlConfig::chunk_retries`] times, after which the stage aborts.
//! Chunks committed before the failure stay committed.

use std::collections::BTreeMap;

use omop_types::CdmRecord;
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::collaborators::{ChunkRequest, Collaborators};
use crate::config::EtlConfig;
use crate::error::{EtlError, EtlResult};
use crate::processors::{process, MappingContext};
use crate::source::SourceResource;
use crate::stage::Stage;

/// Counters of one stage run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    /// The stage.
    pub stage: Stage,
    /// Resources the stage selected.
    pub items_read: usize,
    /// CDM records committed.
    pub records_written: usize,
    /// Skipped items by reason.
    pub skipped: BTreeMap<String, usize>,
    /// Items handed to the reschedule hook.
    pub deferred: usize,
    /// Chunks committed.
    pub chunks_committed: usize,
    /// Chunk attempts repeated after a retryable failure.
    pub chunk_retries: u32,
}

impl StageReport {
    /// Creates an empty report.
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            items_read: 0,
            records_written: 0,
            skipped: BTreeMap::new(),
            deferred: 0,
            chunks_committed: 0,
            chunk_retries: 0,
        }
    }

    /// Total skipped items.
    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }

    fn absorb(&mut self, chunk: ChunkOutcome) {
        self.items_read += chunk.items;
        self.records_written += chunk.records;
        self.deferred += chunk.deferred;
        for (reason, count) in chunk.skipped {
            *self.skipped.entry(reason.to_string()).or_default() += count;
        }
        self.chunks_committed += 1;
    }
}

#[derive(Debug, Default)]
struct ChunkOutcome {
    read: usize,
    items: usize,
    records: usize,
    deferred: usize,
    skipped: BTreeMap<&'static str, usize>,
}

/// Runs stages against one set of collaborators.
pub struct ChunkPipeline<'a> {
    config: &'a EtlConfig,
    collaborators: &'a Collaborators,
    ctx: &'a MappingContext,
    pool: Option<&'a ThreadPool>,
}

impl<'a> ChunkPipeline<'a> {
    /// Creates a pipeline. With a pool, items are mapped on it; without,
    /// on the calling thread.
    pub fn new(
        config: &'a EtlConfig,
        collaborators: &'a Collaborators,
        ctx: &'a MappingContext,
        pool: Option<&'a ThreadPool>,
    ) -> Self {
        Self {
            config,
            collaborators,
            ctx,
            pool,
        }
    }

    /// Runs `stage` to completion.
    pub fn run(&self, stage: Stage) -> EtlResult<StageReport> {
        tracing::info!(%stage, parallel = self.pool.is_some(), "stage started");
        let mut report = StageReport::new(stage);
        let mut offset = 0;

        loop {
            let chunk = self.with_retry(stage, &mut report, || self.run_chunk(stage, offset))?;
            if chunk.read == 0 {
                break;
            }
            offset += chunk.read;
            let exhausted = chunk.read < self.config.chunk_size;
            report.absorb(chunk);
            if exhausted {
                break;
            }
        }

        tracing::info!(
            %stage,
            items = report.items_read,
            written = report.records_written,
            skipped = report.skipped_total(),
            deferred = report.deferred,
            chunks = report.chunks_committed,
            "stage finished"
        );
        Ok(report)
    }

    fn with_retry<T>(
        &self,
        stage: Stage,
        report: &mut StageReport,
        mut attempt: impl FnMut() -> EtlResult<T>,
    ) -> EtlResult<T> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match attempt() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempts <= self.config.chunk_retries => {
                    tracing::warn!(%stage, attempt = attempts, error = %e, "chunk failed, retrying");
                    report.chunk_retries += 1;
                }
                Err(e) => {
                    tracing::error!(%stage, attempts, error = %e, "stage aborted");
                    return Err(EtlError::StageFailed {
                        stage,
                        attempts,
                        source: Box::new(e),
                    });
                }
            }
        }
    }

    /// Reads, maps and commits the chunk at `offset`.
    fn run_chunk(&self, stage: Stage, offset: usize) -> EtlResult<ChunkOutcome> {
        let request = ChunkRequest {
            resource_type: stage.resource_type(),
            offset,
            limit: self.config.chunk_size,
            start_date: self.config.start_date,
            end_date: self.config.end_date,
        };
        self.ctx.references.discard_reschedules();
        let chunk = self.collaborators.reader.read_chunk(&request)?;
        let mut outcome = ChunkOutcome {
            read: chunk.len(),
            ..Default::default()
        };
        if chunk.is_empty() {
            return Ok(outcome);
        }

        let items: Vec<&SourceResource> = chunk.iter().filter(|r| stage.selects(r)).collect();
        outcome.items = items.len();

        let mut records = Vec::new();
        for (item, result) in items.iter().zip(self.transform(stage, &items)) {
            match result {
                Ok(mapped) => records.extend(mapped),
                Err(EtlError::Deferred { .. }) => outcome.deferred += 1,
                Err(e) => match e.skip_reason() {
                    Some(reason) => {
                        tracing::warn!(%stage, resource_id = item.id, error = %e, "skipping resource");
                        *outcome.skipped.entry(reason).or_default() += 1;
                    }
                    None => return Err(e),
                },
            }
        }

        self.ctx.references.check_chunk(&records)?;
        self.collaborators.writer.write_chunk(stage, &records)?;
        self.ctx.references.register_committed(&records)?;
        self.ctx.references.apply_reschedules()?;
        outcome.records = records.len();
        tracing::debug!(%stage, offset, read = outcome.read, written = outcome.records, "chunk committed");
        Ok(outcome)
    }

    /// Maps every item, preserving order.
    fn transform(&self, stage: Stage, items: &[&SourceResource]) -> Vec<EtlResult<Vec<CdmRecord>>> {
        let ctx = self.ctx;
        match self.pool {
            Some(pool) => pool.install(|| {
                items
                    .par_iter()
                    .map(|item| process(stage, item, ctx))
                    .collect()
            }),
            None => items.iter().map(|item| process(stage, item, ctx)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{CdmWriter, IdentityStore, LoadLifecycle, RescheduleHook, SourceReader};
    use crate::processors::testing::*;
    use crate::reference::ReferenceResolver;
    use chrono::{DateTime, TimeZone, Utc};
    use omop_types::cdm::MedicationRecord;
    use omop_types::{CdmTable, EntityKind, IdentityRecord, SurrogateId};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct VecReader {
        rows: Vec<SourceResource>,
        failures: AtomicUsize,
        /// Reads at or past this offset always fail.
        broken_from: Option<usize>,
    }

    impl SourceReader for VecReader {
        fn read_chunk(&self, request: &ChunkRequest<'_>) -> EtlResult<Vec<SourceResource>> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(EtlError::Store("connection reset".to_string()));
            }
            if self.broken_from.is_some_and(|from| request.offset >= from) {
                return Err(EtlError::Store("connection reset".to_string()));
            }
            Ok(self
                .rows
                .iter()
                .filter(|r| r.resource_type == request.resource_type)
                .skip(request.offset)
                .take(request.limit)
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct VecWriter {
        chunks: Mutex<Vec<Vec<CdmRecord>>>,
        failures: AtomicUsize,
    }

    impl CdmWriter for VecWriter {
        fn write_chunk(&self, _stage: Stage, records: &[CdmRecord]) -> EtlResult<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(EtlError::Store("deadlock victim".to_string()));
            }
            self.chunks.lock().unwrap().push(records.to_vec());
            Ok(())
        }
    }

    struct Nothing;

    #[derive(Default)]
    struct CountingHook {
        calls: Mutex<Vec<i64>>,
    }

    impl RescheduleHook for CountingHook {
        fn reschedule(&self, resource_id: i64, _: DateTime<Utc>) -> EtlResult<()> {
            self.calls.lock().unwrap().push(resource_id);
            Ok(())
        }
    }

    impl LoadLifecycle for Nothing {
        fn init(&self, _config: &EtlConfig) -> EtlResult<()> {
            Ok(())
        }
        fn post_process(&self) -> EtlResult<()> {
            Ok(())
        }
    }

    impl RescheduleHook for Nothing {
        fn reschedule(&self, _: i64, _: DateTime<Utc>) -> EtlResult<()> {
            Ok(())
        }
    }

    impl IdentityStore for Nothing {
        fn find_by_logical_id(&self, _: EntityKind, _: &str) -> EtlResult<Option<SurrogateId>> {
            Ok(None)
        }
        fn find_by_identifier(&self, _: EntityKind, _: &str) -> EtlResult<Option<SurrogateId>> {
            Ok(None)
        }
        fn find_medication(&self, _: SurrogateId) -> EtlResult<Option<MedicationRecord>> {
            Ok(None)
        }
        fn max_id(&self, _: EntityKind) -> EtlResult<Option<SurrogateId>> {
            Ok(None)
        }
        fn load_identities(&self, _: EntityKind) -> EtlResult<Vec<IdentityRecord>> {
            Ok(Vec::new())
        }
    }

    fn make_row(id: i64, payload: Value) -> SourceResource {
        SourceResource::from_payload(id, Utc.with_ymd_and_hms(2021, 3, 16, 0, 0, 0).unwrap(), payload)
    }

    fn make_patients(n: i64) -> Vec<SourceResource> {
        (1..=n)
            .map(|i| make_row(i, json!({ "resourceType": "Patient", "id": format!("pat-{i}") })))
            .collect()
    }

    fn make_collaborators(rows: Vec<SourceResource>, failures: usize) -> (Collaborators, Arc<VecWriter>) {
        make_broken_collaborators(rows, failures, None)
    }

    fn make_broken_collaborators(
        rows: Vec<SourceResource>,
        failures: usize,
        broken_from: Option<usize>,
    ) -> (Collaborators, Arc<VecWriter>) {
        let writer = Arc::new(VecWriter::default());
        let collaborators = Collaborators {
            reader: Arc::new(VecReader {
                rows,
                failures: AtomicUsize::new(failures),
                broken_from,
            }),
            writer: writer.clone(),
            identities: Arc::new(Nothing),
            reschedule: Arc::new(Nothing),
            lifecycle: Arc::new(Nothing),
        };
        (collaborators, writer)
    }

    fn bulk_config(chunk_size: usize, chunk_retries: u32) -> EtlConfig {
        EtlConfig {
            bulk_load: true,
            chunk_size,
            chunk_retries,
            ..Default::default()
        }
    }

    #[test]
    fn test_chunks_commit_in_order() {
        let config = bulk_config(2, 0);
        let (collaborators, writer) = make_collaborators(make_patients(5), 0);
        let ctx = make_context(&config);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();

        let report = ChunkPipeline::new(&config, &collaborators, &ctx, Some(&pool))
            .run(Stage::Patients)
            .unwrap();

        assert_eq!(report.items_read, 5);
        assert_eq!(report.records_written, 5);
        assert_eq!(report.chunks_committed, 3);

        let chunks = writer.chunks.lock().unwrap();
        let logical_ids: Vec<_> = chunks
            .iter()
            .flatten()
            .map(|r| match r {
                CdmRecord::Person(p) => p.fhir_logical_id.clone().unwrap(),
                other => panic!("unexpected {:?}", other.table()),
            })
            .collect();
        assert_eq!(logical_ids, ["pat-1", "pat-2", "pat-3", "pat-4", "pat-5"]);
    }

    #[test]
    fn test_item_errors_are_counted() {
        let config = bulk_config(10, 0);
        let rows = vec![
            make_row(1, json!({ "resourceType": "Condition", "id": "c-1" })),
            make_row(
                2,
                json!({
                    "resourceType": "Condition",
                    "id": "c-2",
                    "subject": { "reference": "Patient/nobody" },
                    "onsetDateTime": "2021-03-15",
                    "code": { "coding": [{ "system": "http://loinc.org", "code": "x" }] }
                }),
            ),
        ];
        let (collaborators, writer) = make_collaborators(rows, 0);
        let ctx = make_context(&config);

        let report = ChunkPipeline::new(&config, &collaborators, &ctx, None)
            .run(Stage::Conditions)
            .unwrap();

        assert_eq!(report.items_read, 2);
        assert_eq!(report.records_written, 0);
        assert_eq!(report.skipped.get("no_reference"), Some(&1));
        assert_eq!(report.skipped.get("unresolved_reference"), Some(&1));
        assert_eq!(writer.chunks.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_retryable_failure_is_retried() {
        let config = bulk_config(10, 2);
        let (collaborators, _) = make_collaborators(make_patients(1), 2);
        let ctx = make_context(&config);

        let report = ChunkPipeline::new(&config, &collaborators, &ctx, None)
            .run(Stage::Patients)
            .unwrap();

        assert_eq!(report.chunk_retries, 2);
        assert_eq!(report.records_written, 1);
    }

    #[test]
    fn test_exhausted_retries_fail_the_stage() {
        let config = bulk_config(10, 1);
        let (collaborators, writer) = make_collaborators(make_patients(1), 5);
        let ctx = make_context(&config);

        let err = ChunkPipeline::new(&config, &collaborators, &ctx, None)
            .run(Stage::Patients)
            .unwrap_err();

        assert!(matches!(err, EtlError::StageFailed { attempts: 2, .. }));
        assert!(writer.chunks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failed_chunk_keeps_earlier_chunks() {
        let config = bulk_config(2, 1);
        let (collaborators, writer) = make_broken_collaborators(make_patients(4), 0, Some(2));
        let ctx = make_context(&config);

        let err = ChunkPipeline::new(&config, &collaborators, &ctx, None)
            .run(Stage::Patients)
            .unwrap_err();

        assert!(matches!(err, EtlError::StageFailed { attempts: 2, .. }));
        let chunks = writer.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 2);
        let outcome = ctx.references.resolve_person_id(None, Some("pat-2"), 99).unwrap();
        assert!(outcome.is_resolved());
    }

    #[test]
    fn test_retried_chunk_reschedules_once() {
        let config = EtlConfig {
            chunk_retries: 2,
            ..Default::default()
        };
        let rows = vec![make_row(
            9,
            json!({
                "resourceType": "Condition",
                "id": "c-9",
                "subject": { "reference": "Patient/pat-404" },
                "onsetDateTime": "2021-03-15",
                "code": { "coding": [{ "system": "http://fhir.de/CodeSystem/bfarm/icd-10-gm", "code": "I12.3" }] }
            }),
        )];
        let (collaborators, writer) = make_collaborators(rows, 0);
        writer.failures.store(2, Ordering::SeqCst);
        let hook = Arc::new(CountingHook::default());
        let mut ctx = make_context(&config);
        ctx.references = Arc::new(ReferenceResolver::new(&config, Arc::new(Nothing), hook.clone()));

        let report = ChunkPipeline::new(&config, &collaborators, &ctx, None)
            .run(Stage::Conditions)
            .unwrap();

        assert_eq!(report.chunk_retries, 2);
        assert_eq!(report.deferred, 1);
        assert_eq!(*hook.calls.lock().unwrap(), vec![9]);
    }

    #[test]
    fn test_shared_identifier_commits_one_id() {
        let rows = vec![
            make_row(1, json!({ "resourceType": "Patient", "id": "pat-1", "identifier": [{ "value": "mrn-1" }] })),
            make_row(2, json!({ "resourceType": "Patient", "id": "pat-2", "identifier": [{ "value": "mrn-1" }] })),
        ];
        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
        for (bulk_load, chunk_size) in [(true, 1), (true, 10), (false, 1), (false, 10)] {
            let config = EtlConfig {
                bulk_load,
                chunk_size,
                ..Default::default()
            };
            let (collaborators, writer) = make_collaborators(rows.clone(), 0);
            let ctx = make_context(&config);

            ChunkPipeline::new(&config, &collaborators, &ctx, bulk_load.then_some(&pool))
                .run(Stage::Patients)
                .unwrap();

            let ids: Vec<SurrogateId> = writer
                .chunks
                .lock()
                .unwrap()
                .iter()
                .flatten()
                .map(|r| match r {
                    CdmRecord::Person(p) => p.person_id,
                    other => panic!("unexpected {:?}", other.table()),
                })
                .collect();
            assert_eq!(ids, vec![1, 1], "bulk_load={bulk_load} chunk_size={chunk_size}");
        }
    }

    #[test]
    fn test_committed_identities_are_registered() {
        let config = bulk_config(10, 0);
        let (collaborators, writer) = make_collaborators(make_patients(1), 0);
        let ctx = make_context(&config);
        let pipeline = ChunkPipeline::new(&config, &collaborators, &ctx, None);

        pipeline.run(Stage::Patients).unwrap();

        let outcome = ctx.references.resolve_person_id(None, Some("pat-1"), 99).unwrap();
        assert!(outcome.is_resolved());
        assert_eq!(writer.chunks.lock().unwrap()[0][0].table(), CdmTable::Person);
    }
}
