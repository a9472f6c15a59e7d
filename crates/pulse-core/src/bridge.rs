// Event Bridge
// Non-blocking hand-off from run contexts to the delivery task. Emission
// never blocks and never fails the run: with no sink enabled, events are
// dropped with a warning.
//
// Events share one queue with the delivery task's control commands so
// that resets, attaches, and publishes apply in exact send order.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use pulse_types::{ChartData, EventPayload, InitSnapshot, Signal, Step, StepType, TransmissionGraph};

use crate::error::{PulseError, Result};

/// One run-tagged event headed for delivery
#[derive(Debug, Clone)]
pub struct RunEvent {
    pub run_id: String,
    pub payload: EventPayload,
}

/// Protocol of the delivery task. Keeping events and control on one
/// queue makes the init-snapshot and reset contracts plain FIFO facts.
pub enum DeliveryCommand {
    Event(RunEvent),
    /// Bind the broadcaster to a new run, dropping prior cached state
    Reset {
        run_id: String,
        query: Option<String>,
        ack: oneshot::Sender<()>,
    },
    Attach {
        sender: mpsc::UnboundedSender<String>,
        reply: oneshot::Sender<Uuid>,
    },
    Detach {
        id: Uuid,
    },
    Snapshot {
        reply: oneshot::Sender<InitSnapshot>,
    },
}

/// Shared emission point. Enabled with the delivery channel's sender at
/// serve time; disabled (events dropped) when no observer plumbing exists,
/// e.g. in headless tests.
#[derive(Clone, Default)]
pub struct EventBridge {
    sink: Arc<Mutex<Option<mpsc::UnboundedSender<DeliveryCommand>>>>,
}

impl EventBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self, sender: mpsc::UnboundedSender<DeliveryCommand>) {
        let mut guard = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(sender);
    }

    pub fn disable(&self) {
        let mut guard = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    /// Sends one event toward delivery. Tagging with the emitting run's id
    /// happens here so stage code cannot mislabel its output.
    pub fn emit(&self, run_id: &str, mut payload: EventPayload) {
        payload.tag_run_id(run_id);
        let guard = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(sender) => {
                let event = RunEvent {
                    run_id: run_id.to_string(),
                    payload,
                };
                if sender.send(DeliveryCommand::Event(event)).is_err() {
                    warn!(run_id, "event delivery channel closed, dropping event");
                }
            }
            None => {
                warn!(run_id, "event bridge disabled, dropping event");
            }
        }
    }
}

/// Everything a phase or worker needs: the owning run's id, the emission
/// bridge, and the cancellation token. Passed explicitly down the call
/// tree; no ambient state.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: String,
    pub bridge: EventBridge,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, bridge: EventBridge, cancel: CancellationToken) -> Self {
        Self {
            run_id: run_id.into(),
            bridge,
            cancel,
        }
    }

    /// Returns `Cancelled` once cancellation has been requested. Phases
    /// call this between units of work; in-flight work is never aborted.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PulseError::Cancelled);
        }
        Ok(())
    }

    pub fn emit(&self, payload: EventPayload) {
        self.bridge.emit(&self.run_id, payload);
    }

    /// Phase transition: progress frame plus a phase step for the log
    pub fn phase(&self, name: &str, progress: u8, narration: impl Into<String>) {
        self.emit(EventPayload::Progress {
            run_id: String::new(),
            phase: name.to_string(),
            progress,
        });
        self.step(StepType::Phase, "System", narration);
    }

    pub fn step(&self, step_type: StepType, agent: &str, content: impl Into<String>) {
        self.emit(EventPayload::Step(Step::new(step_type, agent, content)));
    }

    pub fn signal(&self, signal: Signal) {
        self.emit(EventPayload::Signal(signal));
    }

    pub fn chart(&self, chart: ChartData) {
        self.emit(EventPayload::Chart(chart));
    }

    pub fn graph(&self, graph: TransmissionGraph) {
        self.emit(EventPayload::Graph(graph));
    }
}
