// Bounded Parallel Stage Executor
// Runs one async job per item with at most K in flight, aggregating
// results in completion order. A failed item is absorbed, not fatal;
// cancellation stops admissions, drains in-flight work, then surfaces
// as `Cancelled`.

use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{PulseError, Result};

/// Executes `work` over `items` with at most `concurrency` jobs in flight.
/// `aggregate` is invoked on the caller's context in completion order, once
/// per finished item; a panicking job is reported to it as a stage error.
/// Returns the number of items whose job succeeded.
///
/// When `cancel` trips, no further items are admitted; already-running jobs
/// are drained to completion and their results discarded.
pub async fn execute_bounded<T, R, W, Fut, A>(
    items: Vec<T>,
    concurrency: usize,
    cancel: &CancellationToken,
    work: W,
    mut aggregate: A,
) -> Result<usize>
where
    T: Send + 'static,
    R: Send + 'static,
    W: Fn(T) -> Fut,
    Fut: Future<Output = Result<R>> + Send + 'static,
    A: FnMut(usize, Result<R>),
{
    if items.is_empty() {
        return Ok(0);
    }
    let concurrency = concurrency.max(1);

    let mut pending = items.into_iter().enumerate();
    let mut in_flight: JoinSet<(usize, Result<R>)> = JoinSet::new();
    let mut succeeded = 0usize;

    // Prime up to the bound
    while in_flight.len() < concurrency {
        match pending.next() {
            Some((index, item)) => {
                let job = work(item);
                in_flight.spawn(async move { (index, job.await) });
            }
            None => break,
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        let (index, outcome) = match joined {
            Ok(pair) => pair,
            Err(join_err) => {
                // A panicked job is one failed item, never a failed run
                warn!("stage job panicked: {}", join_err);
                if cancel.is_cancelled() {
                    continue;
                }
                // Index is lost on panic; admit a replacement below and
                // report the failure without one.
                aggregate(usize::MAX, Err(PulseError::Stage("job panicked".to_string())));
                if let Some((index, item)) = pending.next() {
                    let job = work(item);
                    in_flight.spawn(async move { (index, job.await) });
                }
                continue;
            }
        };

        if cancel.is_cancelled() {
            // Drain without admitting or aggregating
            debug!(index, "discarding result after cancellation");
            continue;
        }

        if outcome.is_ok() {
            succeeded += 1;
        }
        aggregate(index, outcome);

        if !cancel.is_cancelled() {
            if let Some((index, item)) = pending.next() {
                let job = work(item);
                in_flight.spawn(async move { (index, job.await) });
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(PulseError::Cancelled);
    }
    Ok(succeeded)
}

// ============================================================================
// Tests
// ============================================================================
