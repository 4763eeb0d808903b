//! Declarative load flow.
//!
//! The run is a DAG of named nodes joined by labelled edges. Decision nodes
//! pick an outgoing edge from the run configuration; stage nodes run one
//! [`Stage`]. [`FlowGraph::run`] walks the graph from the start node to a
//! `Done` node.
//!
//! ```text
//! init ─> load_mode ─BULKLOAD──────> step_selector ─ALL──┐
//!                   │                      └─<stage>─> single:<stage> ─> post_process
//!                   └─INCREMENTALLOAD─────────────────────┤
//!                                                         v
//! patients ─> encounter_institution ─> encounter_department ─> medications
//!   ─> statements ─WRITE─> medication_statements ─> medication_administrations
//!               └──SKIP───────────────────────────────┘
//!   ─> conditions ─> observations ─> procedures ─> immunizations
//!   ─> consents ─> diagnostic_reports ─> post_process ─> done
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::config::EtlConfig;
use crate::error::{EtlError, EtlResult};
use crate::pipeline::StageReport;
use crate::stage::Stage;

/// A branch point evaluated against the run configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// `BulkLoad` or `IncrementalLoad`.
    LoadMode,
    /// `All` or `Step(stage)`.
    StepSelector,
    /// `WriteStatements` or `SkipStatements`.
    MedicationStatements,
}

impl Decision {
    /// Edge taken for `config`.
    pub fn decide(self, config: &EtlConfig) -> Edge {
        match self {
            Self::LoadMode if config.bulk_load => Edge::BulkLoad,
            Self::LoadMode => Edge::IncrementalLoad,
            Self::StepSelector => config.single_step.map_or(Edge::All, Edge::Step),
            Self::MedicationStatements if config.write_medication_statements => Edge::WriteStatements,
            Self::MedicationStatements => Edge::SkipStatements,
        }
    }
}

/// Edge label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// Unconditional successor.
    Next,
    /// Bulk load branch.
    BulkLoad,
    /// Incremental load branch.
    IncrementalLoad,
    /// Full stage sequence.
    All,
    /// One named stage.
    Step(Stage),
    /// Medication statements are written.
    WriteStatements,
    /// Medication statements are skipped.
    SkipStatements,
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Next => f.write_str("NEXT"),
            Self::BulkLoad => f.write_str("BULKLOAD"),
            Self::IncrementalLoad => f.write_str("INCREMENTALLOAD"),
            Self::All => f.write_str("ALL"),
            Self::Step(stage) => f.write_str(stage.as_str()),
            Self::WriteStatements => f.write_str("WRITE_STATEMENTS"),
            Self::SkipStatements => f.write_str("SKIP_STATEMENTS"),
        }
    }
}

/// What a node does when entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Runs [`StageRunner::init`].
    Init,
    /// Chooses an outgoing edge.
    Decision(Decision),
    /// Runs a stage.
    Stage(Stage),
    /// Runs [`StageRunner::post_process`].
    PostProcess,
    /// Terminal node.
    Done,
}

#[derive(Debug, Clone)]
struct FlowNode {
    kind: NodeKind,
    edges: Vec<(Edge, String)>,
}

/// Executes the work named by flow nodes.
pub trait StageRunner {
    /// Prepares the run.
    fn init(&mut self) -> EtlResult<()>;

    /// Runs one stage.
    fn run_stage(&mut self, stage: Stage) -> EtlResult<StageReport>;

    /// Finishes the run.
    fn post_process(&mut self) -> EtlResult<()>;
}

/// Path taken through the flow and the reports of the stages run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Names of the visited nodes, in order.
    pub path: Vec<String>,
    /// One report per stage run.
    pub stages: Vec<StageReport>,
}

impl RunReport {
    /// Stages run, in order.
    pub fn stages_run(&self) -> Vec<Stage> {
        self.stages.iter().map(|r| r.stage).collect()
    }
}

/// A validated flow graph.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    start: String,
    nodes: BTreeMap<String, FlowNode>,
}

/// Builds a [`FlowGraph`].
#[derive(Debug, Default)]
pub struct FlowGraphBuilder {
    start: Option<String>,
    nodes: BTreeMap<String, NodeKind>,
    edges: Vec<(String, Edge, String)>,
}

impl FlowGraphBuilder {
    /// Adds a node. The first node added is the start node.
    pub fn node(mut self, name: &str, kind: NodeKind) -> Self {
        self.start.get_or_insert_with(|| name.to_string());
        self.nodes.insert(name.to_string(), kind);
        self
    }

    /// Adds an edge between two nodes.
    pub fn edge(mut self, from: &str, label: Edge, to: &str) -> Self {
        self.edges.push((from.to_string(), label, to.to_string()));
        self
    }

    /// Adds a chain of nodes joined by `Next` edges.
    pub fn chain(mut self, nodes: &[&str]) -> Self {
        for pair in nodes.windows(2) {
            self = self.edge(pair[0], Edge::Next, pair[1]);
        }
        self
    }

    /// Validates and returns the graph.
    pub fn build(self) -> EtlResult<FlowGraph> {
        let start = self
            .start
            .ok_or_else(|| EtlError::Config("flow has no nodes".to_string()))?;
        let mut nodes: BTreeMap<String, FlowNode> = self
            .nodes
            .into_iter()
            .map(|(name, kind)| (name, FlowNode { kind, edges: Vec::new() }))
            .collect();

        for (from, label, to) in self.edges {
            if !nodes.contains_key(&to) {
                return Err(EtlError::Config(format!(
                    "edge {label} from {from} targets unknown node {to}"
                )));
            }
            let node = nodes
                .get_mut(&from)
                .ok_or_else(|| EtlError::Config(format!("edge {label} from unknown node {from}")))?;
            if node.edges.iter().any(|(existing, _)| *existing == label) {
                return Err(EtlError::Config(format!("node {from} has two {label} edges")));
            }
            node.edges.push((label, to));
        }

        Ok(FlowGraph { start, nodes })
    }
}

fn single(stage: Stage) -> String {
    format!("single:{stage}")
}

impl FlowGraph {
    /// Starts a new graph.
    pub fn builder() -> FlowGraphBuilder {
        FlowGraphBuilder::default()
    }

    /// The standard load flow.
    pub fn standard() -> EtlResult<Self> {
        let mut builder = Self::builder()
            .node("init", NodeKind::Init)
            .node("load_mode", NodeKind::Decision(Decision::LoadMode))
            .node("step_selector", NodeKind::Decision(Decision::StepSelector))
            .node("statements", NodeKind::Decision(Decision::MedicationStatements))
            .node("post_process", NodeKind::PostProcess)
            .node("done", NodeKind::Done);

        for stage in Stage::ALL {
            builder = builder
                .node(stage.as_str(), NodeKind::Stage(stage))
                .node(&single(stage), NodeKind::Stage(stage))
                .edge("step_selector", Edge::Step(stage), &single(stage))
                .edge(&single(stage), Edge::Next, "post_process");
        }

        builder
            .edge("init", Edge::Next, "load_mode")
            .edge("load_mode", Edge::BulkLoad, "step_selector")
            .edge("load_mode", Edge::IncrementalLoad, "patients")
            .edge("step_selector", Edge::All, "patients")
            .chain(&["patients", "encounter_institution", "encounter_department", "medications", "statements"])
            .edge("statements", Edge::WriteStatements, "medication_statements")
            .edge("statements", Edge::SkipStatements, "medication_administrations")
            .chain(&[
                "medication_statements",
                "medication_administrations",
                "conditions",
                "observations",
                "procedures",
                "immunizations",
                "consents",
                "diagnostic_reports",
                "post_process",
                "done",
            ])
            .build()
    }

    /// Name of the start node.
    pub fn start(&self) -> &str {
        &self.start
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Walks the graph for `config`, delegating work to `runner`.
    pub fn run(&self, config: &EtlConfig, runner: &mut dyn StageRunner) -> EtlResult<RunReport> {
        let mut report = RunReport::default();
        let mut current = self.start.as_str();

        // A DAG walk enters each node at most once.
        for _ in 0..self.nodes.len() {
            let node = self
                .nodes
                .get(current)
                .ok_or_else(|| EtlError::Config(format!("unknown flow node {current}")))?;
            report.path.push(current.to_string());
            tracing::debug!(node = current, "entering flow node");

            let edge = match node.kind {
                NodeKind::Init => {
                    runner.init()?;
                    Edge::Next
                }
                NodeKind::Decision(decision) => decision.decide(config),
                NodeKind::Stage(stage) => {
                    report.stages.push(runner.run_stage(stage)?);
                    Edge::Next
                }
                NodeKind::PostProcess => {
                    runner.post_process()?;
                    Edge::Next
                }
                NodeKind::Done => return Ok(report),
            };

            current = node
                .edges
                .iter()
                .find(|(label, _)| *label == edge)
                .map(|(_, target)| target.as_str())
                .ok_or_else(|| EtlError::Config(format!("flow node {current} has no {edge} edge")))?;
        }

        Err(EtlError::Config("flow did not reach a done node".to_string()))
    }
}
