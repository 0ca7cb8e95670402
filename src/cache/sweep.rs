//! Background sweep loop for anything that can drop its own stale entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A store with a parameterless cleanup pass returning the number of entries
/// it removed.
pub trait Sweep: Send + Sync {
    fn cleanup(&self) -> usize;
}

/// Handle to a running sweep loop.  Dropping it without calling
/// [`SweepHandle::stop`] leaves the loop running.
#[derive(Debug)]
pub struct SweepHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Spawn a task calling `target.cleanup()` every `interval` until stopped.
///
/// The first sweep happens one full `interval` after the call.  `on_sweep`
/// receives the number of entries removed by each pass.
pub fn start_cleanup_loop<S, F>(target: Arc<S>, interval: Duration, on_sweep: F) -> SweepHandle
where
    S: Sweep + ?Sized + 'static,
    F: Fn(usize) + Send + 'static,
{
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = target.cleanup();
                    if removed > 0 {
                        debug!(removed, "swept expired cache entries");
                    }
                    on_sweep(removed);
                }
            }
        }
    });

    SweepHandle { shutdown, task }
}

impl SweepHandle {
    /// Signal the loop to exit and wait until it has.  No cleanup pass runs
    /// after this returns.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "cache sweep task did not exit cleanly");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
