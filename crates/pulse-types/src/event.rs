// Wire events streamed to observers
// Every frame serializes as {"type": <kind>, "data": {...}}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{ChartData, Signal, TransmissionGraph};
use crate::run::{RunStatus, Step};

/// One event produced during a run, tagged with the run that emitted it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    /// Phase transition with overall progress percentage
    Progress {
        run_id: String,
        phase: String,
        progress: u8,
    },
    /// Narration step from a phase or worker
    Step(Step),
    /// High-value signal distilled from one item
    Signal(Signal),
    /// Price chart for a ticker named by a signal
    Chart(ChartData),
    /// Aggregate transmission graph, replaces any prior graph
    Graph(TransmissionGraph),
    /// Terminal success frame
    Completed { run_id: String, signal_count: u32 },
    /// Terminal failure frame
    Error { run_id: String, message: String },
    /// Full current state, sent once to each newly attached observer
    Init(InitSnapshot),
}

impl EventPayload {
    /// Stamps the emitting run's id onto the payload. Steps and domain
    /// payloads carry their own run_id field; this overwrites it so a
    /// stage cannot mislabel its output.
    pub fn tag_run_id(&mut self, run_id: &str) {
        match self {
            EventPayload::Progress { run_id: id, .. } => *id = run_id.to_string(),
            EventPayload::Step(step) => step.run_id = run_id.to_string(),
            EventPayload::Signal(signal) => signal.run_id = run_id.to_string(),
            EventPayload::Chart(chart) => chart.run_id = run_id.to_string(),
            EventPayload::Graph(graph) => graph.run_id = run_id.to_string(),
            EventPayload::Completed { run_id: id, .. } => *id = run_id.to_string(),
            EventPayload::Error { run_id: id, .. } => *id = run_id.to_string(),
            EventPayload::Init(snapshot) => snapshot.run_id = run_id.to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            EventPayload::Progress { run_id, .. } => run_id,
            EventPayload::Step(step) => &step.run_id,
            EventPayload::Signal(signal) => &signal.run_id,
            EventPayload::Chart(chart) => &chart.run_id,
            EventPayload::Graph(graph) => &graph.run_id,
            EventPayload::Completed { run_id, .. } => run_id,
            EventPayload::Error { run_id, .. } => run_id,
            EventPayload::Init(snapshot) => &snapshot.run_id,
        }
    }
}

/// Everything a late-joining observer needs to render the current run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitSnapshot {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub signals: Vec<Signal>,
    /// Keyed by ticker; a later chart for the same ticker replaces the earlier
    #[serde(default)]
    pub charts: BTreeMap<String, ChartData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<TransmissionGraph>,
}
