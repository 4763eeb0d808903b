//! Load mode orchestration.
//!
//! [`LoadModeOrchestrator`] wires the shared state of a run (identity
//! caches, reference resolver, concept source, worker pool) and walks the
//! [`FlowGraph`].

use std::sync::Arc;

use omop_vocab::{CachedConceptSource, ConceptResolver, ConceptSource, VocabularyRouter};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::collaborators::Collaborators;
use crate::config::{EtlConfig, LoadMode};
use crate::error::EtlResult;
use crate::flow::{FlowGraph, RunReport, StageRunner};
use crate::identity::IdentityCaches;
use crate::pipeline::{ChunkPipeline, StageReport};
use crate::processors::MappingContext;
use crate::reference::ReferenceResolver;
use crate::stage::Stage;

/// Concept sources a run picks from by load mode.
#[derive(Clone)]
pub struct ConceptSources {
    /// Preloaded vocabulary, used by bulk loads with the RAM dictionary.
    pub snapshot: Arc<dyn ConceptSource>,
    /// Per-code queries, cached for the run in every other mode.
    pub query: Arc<dyn ConceptSource>,
    /// Code system routing.
    pub router: Arc<VocabularyRouter>,
}

impl ConceptSources {
    /// One backend serving both roles.
    pub fn single(source: Arc<dyn ConceptSource>, router: Arc<VocabularyRouter>) -> Self {
        Self {
            snapshot: Arc::clone(&source),
            query: source,
            router,
        }
    }

    /// Builds the resolver for a run of `config`.
    pub fn resolver(&self, config: &EtlConfig) -> ConceptResolver {
        let source: Arc<dyn ConceptSource> = if config.uses_ram_dictionary() {
            Arc::clone(&self.snapshot)
        } else {
            Arc::new(CachedConceptSource::new(Arc::clone(&self.query)))
        };
        ConceptResolver::new(source, Arc::clone(&self.router))
    }
}

impl std::fmt::Debug for ConceptSources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConceptSources")
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

/// Runs one ETL load.
#[derive(Debug)]
pub struct LoadModeOrchestrator {
    config: EtlConfig,
    collaborators: Collaborators,
    concepts: ConceptSources,
    flow: Option<FlowGraph>,
}

impl LoadModeOrchestrator {
    /// Creates an orchestrator using the standard flow.
    pub fn new(config: EtlConfig, collaborators: Collaborators, concepts: ConceptSources) -> Self {
        Self {
            config,
            collaborators,
            concepts,
            flow: None,
        }
    }

    /// Replaces the standard flow.
    pub fn with_flow(mut self, flow: FlowGraph) -> Self {
        self.flow = Some(flow);
        self
    }

    /// The run configuration.
    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    /// Runs the load.
    pub fn run(&self) -> EtlResult<RunReport> {
        self.config.validate()?;
        let flow = match &self.flow {
            Some(flow) => flow.clone(),
            None => FlowGraph::standard()?,
        };

        let mode = self.config.load_mode();
        tracing::info!(
            ?mode,
            single_step = ?self.config.single_step,
            chunk_size = self.config.chunk_size,
            ram_dictionary = self.config.uses_ram_dictionary(),
            "load started"
        );

        let caches = Arc::new(IdentityCaches::seeded(self.collaborators.identities.as_ref())?);
        let references = Arc::new(ReferenceResolver::new(
            &self.config,
            Arc::clone(&self.collaborators.identities),
            Arc::clone(&self.collaborators.reschedule),
        ));
        let pool = match mode {
            LoadMode::Bulk => Some(
                ThreadPoolBuilder::new()
                    .num_threads(self.config.throttle_limit)
                    .thread_name(|i| format!("etl-worker-{i}"))
                    .build()?,
            ),
            LoadMode::Incremental => None,
        };

        let mut run = Run {
            config: &self.config,
            collaborators: &self.collaborators,
            ctx: MappingContext {
                concepts: self.concepts.resolver(&self.config),
                references,
                caches,
            },
            pool,
        };
        let report = flow.run(&self.config, &mut run)?;

        tracing::info!(
            stages = report.stages.len(),
            written = report.stages.iter().map(|s| s.records_written).sum::<usize>(),
            skipped = report.stages.iter().map(StageReport::skipped_total).sum::<usize>(),
            deferred = report.stages.iter().map(|s| s.deferred).sum::<usize>(),
            "load finished"
        );
        Ok(report)
    }
}

/// State of one run, driven by the flow interpreter.
struct Run<'a> {
    config: &'a EtlConfig,
    collaborators: &'a Collaborators,
    ctx: MappingContext,
    pool: Option<ThreadPool>,
}

impl StageRunner for Run<'_> {
    fn init(&mut self) -> EtlResult<()> {
        self.collaborators.lifecycle.init(self.config)?;
        let preloaded = self.ctx.references.preload()?;
        if self.ctx.references.uses_ram() {
            tracing::info!(identities = preloaded, "reference dictionary loaded");
        }
        Ok(())
    }

    fn run_stage(&mut self, stage: Stage) -> EtlResult<StageReport> {
        ChunkPipeline::new(self.config, self.collaborators, &self.ctx, self.pool.as_ref()).run(stage)
    }

    fn post_process(&mut self) -> EtlResult<()> {
        self.collaborators.lifecycle.post_process()
    }
}
