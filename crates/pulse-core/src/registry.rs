// Run Registry
// Tracks live runs and their cancellation tokens. Enforces at most one
// live execution per run id; entries are removed by a watcher task when
// the run's task finishes, including on panic or abort.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{PulseError, Result};

struct RunHandle {
    /// Generation guard: the watcher only removes the entry it created,
    /// so a restart that replaces a stale entry is never swept by the
    /// previous generation's watcher.
    generation: u64,
    cancel: CancellationToken,
    abort: tokio::task::AbortHandle,
}

/// Registry of live runs. Clone is cheap; all clones share state.
#[derive(Clone, Default)]
pub struct RunRegistry {
    inner: Arc<Mutex<HashMap<String, RunHandle>>>,
    next_generation: Arc<AtomicU64>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `run_id` and spawns its execution task. Fails with
    /// `AlreadyActive` if a live task holds the id. The future receives a
    /// fresh cancellation token and must poll it at its own checkpoints;
    /// the registry never aborts a running task.
    pub fn start<F, Fut>(&self, run_id: &str, execute: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let task = {
            let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = guard.get(run_id) {
                if !existing.abort.is_finished() {
                    return Err(PulseError::AlreadyActive(run_id.to_string()));
                }
                // Finished but not yet swept; safe to replace.
            }

            let task = tokio::spawn(execute(cancel.clone()));
            guard.insert(
                run_id.to_string(),
                RunHandle {
                    generation,
                    cancel: cancel.clone(),
                    abort: task.abort_handle(),
                },
            );
            task
        };

        // Watcher: removes the entry when the task finishes, whatever the
        // outcome. Keeps the uniqueness check purely map-based.
        let registry = self.inner.clone();
        let watched_id = run_id.to_string();
        tokio::spawn(async move {
            if let Err(join_err) = task.await {
                if join_err.is_panic() {
                    error!(run_id = %watched_id, "run task panicked: {}", join_err);
                }
            }
            let mut guard = registry.lock().unwrap_or_else(|e| e.into_inner());
            if guard
                .get(&watched_id)
                .is_some_and(|h| h.generation == generation)
            {
                guard.remove(&watched_id);
                debug!(run_id = %watched_id, "run deregistered");
            }
        });

        Ok(())
    }

    /// Requests cooperative cancellation. Returns false when the run is
    /// not live; repeat calls on a live run are no-ops that return true.
    pub fn cancel(&self, run_id: &str) -> bool {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match guard.get(run_id) {
            Some(handle) if !handle.abort.is_finished() => {
                handle.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .get(run_id)
            .is_some_and(|handle| !handle.abort.is_finished())
    }

    /// Ids of all live runs
    pub fn active_run_ids(&self) -> Vec<String> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .iter()
            .filter(|(_, handle)| !handle.abort.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
