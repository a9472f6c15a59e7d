// Delivery task
// The single context that owns the Broadcaster. Run events, observer
// attach/detach, resets, and snapshot queries arrive on one queue and
// are applied strictly in send order, which is what makes the
// init-snapshot contract and reset atomicity hold.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use pulse_core::{Broadcaster, DeliveryCommand, RunStore, MAX_REPLAY_STEPS};
use pulse_types::{EventPayload, InitSnapshot};

/// Cheap clonable handle to the delivery task. The same underlying
/// sender is installed on the event bridge.
#[derive(Clone)]
pub struct DeliveryHandle {
    commands: mpsc::UnboundedSender<DeliveryCommand>,
}

impl DeliveryHandle {
    pub fn sender(&self) -> mpsc::UnboundedSender<DeliveryCommand> {
        self.commands.clone()
    }

    /// Binds the broadcaster to a new run, dropping prior cached state.
    /// Resolves once the reset has been applied, so events emitted after
    /// this returns are guaranteed to land in the new run's cache.
    pub async fn reset(&self, run_id: &str, query: Option<String>) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .commands
            .send(DeliveryCommand::Reset {
                run_id: run_id.to_string(),
                query,
                ack: ack_tx,
            })
            .is_ok()
        {
            let _ = ack_rx.await;
        }
    }

    /// Attaches an observer; the init snapshot is already queued on the
    /// observer's channel by the time this resolves, and every frame the
    /// observer receives afterwards postdates that snapshot.
    pub async fn attach(&self, sender: mpsc::UnboundedSender<String>) -> Option<Uuid> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(DeliveryCommand::Attach {
                sender,
                reply: reply_tx,
            })
            .ok()?;
        reply_rx.await.ok()
    }

    pub fn detach(&self, id: Uuid) {
        let _ = self.commands.send(DeliveryCommand::Detach { id });
    }

    pub async fn snapshot(&self) -> Option<InitSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(DeliveryCommand::Snapshot { reply: reply_tx })
            .ok()?;
        reply_rx.await.ok()
    }
}

/// Spawns the delivery task and returns its handle
pub fn spawn_delivery(store: Arc<dyn RunStore>) -> DeliveryHandle {
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut broadcaster = Broadcaster::new();

        // A run left in the running state by a previous process is shown
        // to observers from the durable step log; it is not resumed.
        match store.get_active_run() {
            Ok(Some(run)) => {
                broadcaster.reset(&run.run_id, run.query.clone());
                match store.list_steps(&run.run_id, Some(MAX_REPLAY_STEPS)) {
                    Ok(steps) => {
                        for step in steps {
                            broadcaster.publish(&EventPayload::Step(step));
                        }
                    }
                    Err(err) => {
                        warn!(run_id = %run.run_id, "failed to load step replay: {err}")
                    }
                }
            }
            Ok(None) => {}
            Err(err) => warn!("failed to look up active run: {err}"),
        }

        while let Some(command) = command_rx.recv().await {
            match command {
                DeliveryCommand::Event(event) => {
                    // Narration steps are persisted here; signal steps are
                    // written by the orchestrator at discovery time and do
                    // not travel as step events.
                    if let EventPayload::Step(step) = &event.payload {
                        if let Err(err) = store.append_step(step) {
                            warn!(run_id = %event.run_id, "failed to persist step: {err}");
                        }
                    }
                    broadcaster.publish(&event.payload);
                }
                DeliveryCommand::Reset { run_id, query, ack } => {
                    debug!(run_id, "broadcaster reset");
                    broadcaster.reset(&run_id, query);
                    let _ = ack.send(());
                }
                DeliveryCommand::Attach { sender, reply } => {
                    let id = broadcaster.attach(sender);
                    let _ = reply.send(id);
                }
                DeliveryCommand::Detach { id } => broadcaster.detach(id),
                DeliveryCommand::Snapshot { reply } => {
                    let _ = reply.send(broadcaster.snapshot());
                }
            }
        }
        debug!("delivery task stopped");
    });

    DeliveryHandle {
        commands: command_tx,
    }
}

// ============================================================================
// Tests
// ============================================================================
