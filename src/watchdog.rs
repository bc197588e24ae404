//! Deadline and memory supervision.
//!
//! Each armed submission gets two independent tasks: a deadline timer and a
//! memory sampler. Whichever trips first fires the watchdog; it fires at most
//! once. The broker learns about it through a oneshot channel, so a slow or
//! hung collection path never delays enforcement.
//!
//! Firing and disarming race on a single atomic flag. Whoever flips it first
//! wins and the other side becomes a no-op.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::RuntimeError;
use crate::execution::RuntimeClient;

/// Why the watchdog fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogSignal {
    /// The wall-clock limit elapsed.
    Deadline { elapsed: Duration },
    /// A memory sample exceeded the submission's limit.
    MemoryExceeded { usage_mb: u64 },
}

struct Shared {
    fired: AtomicBool,
    peak_mb: AtomicU64,
    /// Set once the first memory sample landed.
    sampled: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<WatchdogSignal>>>,
}

impl Shared {
    /// Fires unless already fired or disarmed. Returns whether this call won.
    fn fire(&self, signal: WatchdogSignal) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(signal);
        }
        true
    }
}

/// Handle to one armed watchdog.
///
/// Dropping the handle stops both supervision tasks.
pub struct WatchdogHandle {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl WatchdogHandle {
    /// Stops supervision.
    ///
    /// Returns `true` if the watchdog had not fired yet; from then on it never
    /// will. Returns `false` if it already fired, in which case its signal is
    /// authoritative and is waiting on the receiver.
    pub fn disarm(&self) -> bool {
        let won = self
            .shared
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        for task in &self.tasks {
            task.abort();
        }
        won
    }

    /// Highest working-set memory observed so far, in megabytes. `None` until
    /// a sample was taken.
    pub fn peak_memory_mb(&self) -> Option<u64> {
        self.shared
            .sampled
            .load(Ordering::Acquire)
            .then(|| self.shared.peak_mb.load(Ordering::Acquire))
    }

    /// Whether the watchdog fired (as opposed to being disarmed or still armed).
    pub fn has_fired(&self) -> bool {
        self.shared.fired.load(Ordering::Acquire)
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// What one watchdog supervises.
#[derive(Debug, Clone)]
pub struct WatchTarget {
    pub submission_id: String,
    pub container_id: String,
    /// When the container started; the deadline counts from here.
    pub started: Instant,
    pub time_limit: Duration,
    pub memory_mb: u64,
}

/// Arms per-submission watchdogs against a runtime.
pub struct Watchdog {
    runtime: Arc<dyn RuntimeClient>,
    stats_interval: Duration,
}

impl Watchdog {
    pub fn new(runtime: Arc<dyn RuntimeClient>, stats_interval: Duration) -> Self {
        Self {
            runtime,
            stats_interval,
        }
    }

    /// Starts supervising `target`.
    ///
    /// The receiver resolves at most once, with the first signal to trip.
    pub fn arm(&self, target: WatchTarget) -> (WatchdogHandle, oneshot::Receiver<WatchdogSignal>) {
        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(Shared {
            fired: AtomicBool::new(false),
            peak_mb: AtomicU64::new(0),
            sampled: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
        });

        let deadline = tokio::spawn(run_deadline(
            Arc::clone(&shared),
            target.submission_id.clone(),
            target.started,
            target.time_limit,
        ));

        let sampler = tokio::spawn(run_sampler(
            Arc::clone(&shared),
            Arc::clone(&self.runtime),
            target,
            self.stats_interval,
        ));

        (
            WatchdogHandle {
                shared,
                tasks: vec![deadline, sampler],
            },
            rx,
        )
    }
}

async fn run_deadline(
    shared: Arc<Shared>,
    submission_id: String,
    started: Instant,
    time_limit: Duration,
) {
    // sleep_until never completes early.
    tokio::time::sleep_until(started + time_limit).await;

    let elapsed = started.elapsed();
    if shared.fire(WatchdogSignal::Deadline { elapsed }) {
        debug!(
            submission_id = %submission_id,
            elapsed_ms = elapsed.as_millis() as u64,
            "Deadline watchdog fired"
        );
    }
}

async fn run_sampler(
    shared: Arc<Shared>,
    runtime: Arc<dyn RuntimeClient>,
    target: WatchTarget,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match runtime.stats(&target.container_id).await {
            Ok(stats) => {
                shared.peak_mb.fetch_max(stats.memory_mb, Ordering::AcqRel);
                shared.sampled.store(true, Ordering::Release);

                if stats.memory_mb > target.memory_mb {
                    if shared.fire(WatchdogSignal::MemoryExceeded {
                        usage_mb: stats.memory_mb,
                    }) {
                        debug!(
                            submission_id = %target.submission_id,
                            usage_mb = stats.memory_mb,
                            limit_mb = target.memory_mb,
                            "Memory watchdog fired"
                        );
                    }
                    return;
                }
            }
            // Container is gone; nothing left to sample.
            Err(RuntimeError::ContainerNotFound { .. }) => return,
            Err(e) => {
                warn!(
                    submission_id = %target.submission_id,
                    error = %e,
                    "Memory sample failed"
                );
            }
        }
    }
}
