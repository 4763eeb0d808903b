//! FHIR to OMOP ETL binary.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use clap::{ArgAction, Parser};
use omop_etl::config::{default_end_date, default_start_date};
use omop_etl::{
    Collaborators, ConceptSources, EtlConfig, LoadModeOrchestrator, MemoryCdmStore, NdjsonStaging, Stage,
};
use omop_vocab::loader::format_bytes;
use omop_vocab::{discover_vocabulary_files, VocabConfig, VocabularyRouter, VocabularySnapshot};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fhir2omop")]
#[command(about = "Load staged FHIR resources into an OMOP CDM")]
struct Args {
    /// Directory holding the CONCEPT, CONCEPT_RELATIONSHIP and SOURCE_TO_CONCEPT_MAP files
    #[arg(long, env = "FHIR2OMOP_VOCABULARY_DIR")]
    vocabulary_dir: PathBuf,

    /// NDJSON staging file
    #[arg(long, env = "FHIR2OMOP_STAGING_FILE")]
    staging_file: PathBuf,

    /// Directory the CDM tables are read from and written to
    #[arg(long, env = "FHIR2OMOP_OUTPUT_DIR", default_value = "cdm")]
    output_dir: PathBuf,

    /// Replay the whole staging table instead of an incremental load
    #[arg(long, env = "FHIR2OMOP_BULK_LOAD")]
    bulk_load: bool,

    /// Run only this stage (bulk load only)
    #[arg(long)]
    single_step: Option<Stage>,

    /// Write medication statements
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    write_medication_statements: bool,

    /// Resolve references from in-memory indexes during bulk load
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    dictionary_in_ram: bool,

    /// Resources per chunk
    #[arg(long, default_value_t = 5_000)]
    chunk_size: usize,

    /// Worker threads during bulk load
    #[arg(long, default_value_t = 4)]
    throttle_limit: usize,

    /// Extra attempts for a chunk that failed with a retryable error
    #[arg(long, default_value_t = 2)]
    chunk_retries: u32,

    /// Earliest last-updated date to load (YYYY-MM-DD)
    #[arg(long)]
    start_date: Option<NaiveDate>,

    /// Latest last-updated date to load (YYYY-MM-DD)
    #[arg(long)]
    end_date: Option<NaiveDate>,

    /// JSON file overriding the code system routing table
    #[arg(long)]
    vocabulary_routes: Option<PathBuf>,
}

impl Args {
    fn config(&self) -> EtlConfig {
        EtlConfig {
            bulk_load: self.bulk_load,
            single_step: self.single_step,
            write_medication_statements: self.write_medication_statements,
            dictionary_in_ram: self.dictionary_in_ram,
            chunk_size: self.chunk_size,
            throttle_limit: self.throttle_limit,
            chunk_retries: self.chunk_retries,
            start_date: self.start_date.unwrap_or_else(default_start_date),
            end_date: self.end_date.unwrap_or_else(default_end_date),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = args.config();

    tracing::info!("Loading vocabulary from: {}", args.vocabulary_dir.display());
    let started = Instant::now();
    let files = discover_vocabulary_files(&args.vocabulary_dir)?;
    let mut snapshot = VocabularySnapshot::new();
    let summary = snapshot.load_all(&files, VocabConfig::default())?;
    tracing::info!(
        "Loaded {} concepts, {} relationships, {} source-to-concept entries, {} cross mappings in {:.1?} (~{})",
        summary.concepts,
        summary.relationships,
        summary.source_to_concept,
        summary.cross_mappings,
        started.elapsed(),
        format_bytes(snapshot.estimated_memory_bytes())
    );

    let router = match &args.vocabulary_routes {
        Some(path) => {
            tracing::info!("Loading routing table from: {}", path.display());
            VocabularyRouter::from_json_reader(BufReader::new(File::open(path)?))?
        }
        None => VocabularyRouter::default(),
    };
    tracing::info!("Routing {} code systems", router.len());

    let staging = Arc::new(NdjsonStaging::open(&args.staging_file)?);
    tracing::info!("Staged {} resources from: {}", staging.len(), args.staging_file.display());
    let store = Arc::new(MemoryCdmStore::open(&args.output_dir)?);

    let collaborators = Collaborators {
        reader: staging.clone(),
        writer: store.clone(),
        identities: store.clone(),
        reschedule: staging.clone(),
        lifecycle: store,
    };
    // The exported files are the only backend: bulk loads with the RAM
    // dictionary read the snapshot directly, other modes through a
    // per-code cache.
    let concepts = ConceptSources::single(Arc::new(snapshot), Arc::new(router));

    // Committed chunks are already on disk; keep the deferrals of a failed
    // run as well.
    let result = LoadModeOrchestrator::new(config, collaborators, concepts).run();
    staging.persist_reschedules()?;
    let report = result?;

    for stage in &report.stages {
        tracing::info!(
            "{}: read {}, wrote {}, skipped {}, deferred {}, {} chunk(s), {} retr(ies)",
            stage.stage,
            stage.items_read,
            stage.records_written,
            stage.skipped_total(),
            stage.deferred,
            stage.chunks_committed,
            stage.chunk_retries
        );
        for (reason, count) in &stage.skipped {
            tracing::info!("  {}: {} skipped as {}", stage.stage, count, reason);
        }
    }
    tracing::info!(
        "Load finished in {:.1?}: {} resource(s) rescheduled, path {}",
        started.elapsed(),
        staging.rescheduled(),
        report.path.join(" -> ")
    );

    Ok(())
}
