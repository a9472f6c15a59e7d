// Broadcaster
// Current-run state cache plus observer fan-out. Purely synchronous by
// construction: one delivery task owns the value and applies resets,
// publishes, attaches and detaches in arrival order, which makes the
// init-snapshot-then-live-events contract atomic.

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use pulse_types::{EventPayload, InitSnapshot, RunStatus};

/// Most recent steps retained for replay to late joiners; older steps
/// stay available through the run store.
pub const MAX_REPLAY_STEPS: usize = 100;

/// Accumulated state of the current run, replayable to late joiners
#[derive(Debug, Clone, Default)]
pub struct RunStateCache {
    snapshot: InitSnapshot,
}

impl RunStateCache {
    /// Drops all prior state and binds the cache to a new run
    pub fn reset(&mut self, run_id: &str, query: Option<String>) {
        self.snapshot = InitSnapshot {
            run_id: run_id.to_string(),
            status: Some(RunStatus::Running),
            query,
            ..Default::default()
        };
    }

    pub fn run_id(&self) -> &str {
        &self.snapshot.run_id
    }

    pub fn snapshot(&self) -> InitSnapshot {
        self.snapshot.clone()
    }

    /// Folds one event into the cache
    pub fn apply(&mut self, event: &EventPayload) {
        match event {
            EventPayload::Progress { phase, progress, .. } => {
                self.snapshot.phase = phase.clone();
                self.snapshot.progress = *progress;
            }
            EventPayload::Step(step) => {
                self.snapshot.steps.push(step.clone());
                if self.snapshot.steps.len() > MAX_REPLAY_STEPS {
                    self.snapshot.steps.remove(0);
                }
            }
            EventPayload::Signal(signal) => self.snapshot.signals.push(signal.clone()),
            EventPayload::Chart(chart) => {
                // Later chart for the same ticker replaces the earlier
                self.snapshot.charts.insert(chart.ticker.clone(), chart.clone());
            }
            EventPayload::Graph(graph) => self.snapshot.graph = Some(graph.clone()),
            EventPayload::Completed { .. } => {
                self.snapshot.status = Some(RunStatus::Completed);
                self.snapshot.progress = 100;
            }
            EventPayload::Error { .. } => self.snapshot.status = Some(RunStatus::Failed),
            EventPayload::Init(_) => {}
        }
    }
}

/// One attached observer. Frames are pre-serialized JSON text.
pub struct Subscriber {
    pub id: Uuid,
    sender: mpsc::UnboundedSender<String>,
}

/// Fan-out of run events to attached observers with a replayable cache.
/// Owned by a single delivery task; methods are plain synchronous calls.
#[derive(Default)]
pub struct Broadcaster {
    cache: RunStateCache,
    subscribers: Vec<Subscriber>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears cached state for a new run. Existing observers stay attached
    /// and will see the new run's events.
    pub fn reset(&mut self, run_id: &str, query: Option<String>) {
        self.cache.reset(run_id, query);
    }

    /// Applies the event to the cache and fans it out. Events tagged with
    /// a run other than the cache's current one are late arrivals from a
    /// superseded run and are dropped.
    pub fn publish(&mut self, event: &EventPayload) {
        if event.run_id() != self.cache.run_id() {
            debug!(
                event_run = event.run_id(),
                current_run = self.cache.run_id(),
                "dropping event from superseded run"
            );
            return;
        }
        self.cache.apply(event);

        if self.subscribers.is_empty() {
            return;
        }
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(err) => {
                debug!("failed to serialize event frame: {err}");
                return;
            }
        };
        // Dead observers are detected by failed sends and dropped
        self.subscribers.retain(|sub| sub.sender.send(frame.clone()).is_ok());
    }

    /// Attaches an observer and immediately sends it the init snapshot.
    /// No publish can interleave between the snapshot and later frames
    /// because both happen on the delivery task.
    pub fn attach(&mut self, sender: mpsc::UnboundedSender<String>) -> Uuid {
        let id = Uuid::new_v4();
        let init = EventPayload::Init(self.cache.snapshot());
        if let Ok(frame) = serde_json::to_string(&init) {
            let _ = sender.send(frame);
        }
        self.subscribers.push(Subscriber { id, sender });
        id
    }

    pub fn detach(&mut self, id: Uuid) {
        self.subscribers.retain(|sub| sub.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn snapshot(&self) -> InitSnapshot {
        self.cache.snapshot()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_types::{ChartData, Signal, Step, StepType};

    fn progress(run_id: &str, phase: &str, pct: u8) -> EventPayload {
        EventPayload::Progress {
            run_id: run_id.to_string(),
            phase: phase.to_string(),
            progress: pct,
        }
    }

    fn tagged_step(run_id: &str, content: &str) -> EventPayload {
        let mut event = EventPayload::Step(Step::new(StepType::Thought, "FinAgent", content));
        event.tag_run_id(run_id);
        event
    }

    #[test]
    fn late_joiner_snapshot_matches_published_state() {
        let mut broadcaster = Broadcaster::new();
        broadcaster.reset("run_1", Some("chips".to_string()));
        broadcaster.publish(&progress("run_1", "analysis", 50));
        broadcaster.publish(&tagged_step("run_1", "scoring item 3"));

        let mut signal_event = EventPayload::Signal(Signal::new("run_1", "Export curbs"));
        signal_event.tag_run_id("run_1");
        broadcaster.publish(&signal_event);

        let (tx, mut rx) = mpsc::unbounded_channel();
        broadcaster.attach(tx);

        let frame = rx.try_recv().unwrap();
        let init: EventPayload = serde_json::from_str(&frame).unwrap();
        match init {
            EventPayload::Init(snap) => {
                assert_eq!(snap.run_id, "run_1");
                assert_eq!(snap.phase, "analysis");
                assert_eq!(snap.progress, 50);
                assert_eq!(snap.steps.len(), 1);
                assert_eq!(snap.signals.len(), 1);
            }
            other => panic!("expected init, got {other:?}"),
        }
    }

    #[test]
    fn events_from_superseded_run_are_dropped() {
        let mut broadcaster = Broadcaster::new();
        broadcaster.reset("run_2", None);
        broadcaster.publish(&tagged_step("run_1", "stale"));

        assert!(broadcaster.snapshot().steps.is_empty());
    }

    #[test]
    fn reset_clears_cache_but_keeps_observers() {
        let mut broadcaster = Broadcaster::new();
        broadcaster.reset("run_1", None);
        broadcaster.publish(&tagged_step("run_1", "one"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        broadcaster.attach(tx);
        rx.try_recv().unwrap(); // init for run_1

        broadcaster.reset("run_2", None);
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert!(broadcaster.snapshot().steps.is_empty());

        broadcaster.publish(&tagged_step("run_2", "fresh"));
        let frame = rx.try_recv().unwrap();
        let event: EventPayload = serde_json::from_str(&frame).unwrap();
        assert_eq!(event.run_id(), "run_2");
    }

    #[test]
    fn dead_subscriber_is_removed_without_disturbing_others() {
        let mut broadcaster = Broadcaster::new();
        broadcaster.reset("run_1", None);

        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        let (live_tx, mut live_rx) = mpsc::unbounded_channel();
        broadcaster.attach(dead_tx);
        broadcaster.attach(live_tx);
        drop(dead_rx);

        broadcaster.publish(&tagged_step("run_1", "hello"));

        assert_eq!(broadcaster.subscriber_count(), 1);
        live_rx.try_recv().unwrap(); // init
        let frame = live_rx.try_recv().unwrap();
        assert!(frame.contains("hello"));
    }

    #[test]
    fn chart_upsert_keeps_latest_per_ticker() {
        let mut broadcaster = Broadcaster::new();
        broadcaster.reset("run_1", None);

        for signal_id in ["s1", "s2"] {
            let mut event = EventPayload::Chart(ChartData {
                ticker: "NVDA".to_string(),
                run_id: "run_1".to_string(),
                history: Vec::new(),
                prediction: None,
                signal_id: Some(signal_id.to_string()),
            });
            event.tag_run_id("run_1");
            broadcaster.publish(&event);
        }

        let snap = broadcaster.snapshot();
        assert_eq!(snap.charts.len(), 1);
        assert_eq!(snap.charts["NVDA"].signal_id.as_deref(), Some("s2"));
    }

    #[test]
    fn detach_stops_delivery() {
        let mut broadcaster = Broadcaster::new();
        broadcaster.reset("run_1", None);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = broadcaster.attach(tx);
        rx.try_recv().unwrap(); // init

        broadcaster.detach(id);
        broadcaster.publish(&tagged_step("run_1", "after detach"));
        assert!(rx.try_recv().is_err());
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn step_replay_depth_is_bounded() {
        let mut broadcaster = Broadcaster::new();
        broadcaster.reset("run_1", None);
        for n in 0..(MAX_REPLAY_STEPS + 25) {
            broadcaster.publish(&tagged_step("run_1", &format!("step {n}")));
        }

        let snap = broadcaster.snapshot();
        assert_eq!(snap.steps.len(), MAX_REPLAY_STEPS);
        // Oldest steps fall off first
        assert_eq!(snap.steps[0].content, "step 25");
    }

    #[test]
    fn completion_marks_cache_terminal() {
        let mut broadcaster = Broadcaster::new();
        broadcaster.reset("run_1", None);
        broadcaster.publish(&EventPayload::Completed {
            run_id: "run_1".to_string(),
            signal_count: 4,
        });

        let snap = broadcaster.snapshot();
        assert_eq!(snap.status, Some(RunStatus::Completed));
        assert_eq!(snap.progress, 100);
    }
}
