// =============================================================================
// Matrixon Sync - Retry Scheduler
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Drives a sync strategy until stopped. A failed poll or batch is logged and
//   retried after a randomized delay; the cursor only moves on success, so a
//   retry re-polls from the last good position.
//
// =============================================================================

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use super::SyncStrategy;

/// Lower edge of the default backoff band
pub const DEFAULT_BACKOFF_MIN: Duration = Duration::from_millis(5_000);

/// Upper edge of the default backoff band
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_millis(15_000);

/// Uniformly random delay band between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    min: Duration,
    max: Duration,
}

impl Backoff {
    /// An inverted band is normalized rather than rejected.
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Draw the next delay; independent of how many failures came before.
    pub fn next_delay(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_MIN, DEFAULT_BACKOFF_MAX)
    }
}

/// Cooperative stop flag shared between the client and its sync task
#[derive(Debug, Default)]
pub struct StopSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    /// Sleep for `duration`, waking early on stop. Returns `false` if woken
    /// by a stop request.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_requested() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_requested(),
            _ = notified => false,
        }
    }
}

/// Counters of one scheduler run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Batches fully processed
    pub batches: u64,
    /// Failed attempts that were retried
    pub failures: u64,
}

/// Runs poll/process cycles with randomized backoff on failure
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    backoff: Backoff,
    stop: Arc<StopSignal>,
}

impl RetryScheduler {
    pub fn new(backoff: Backoff, stop: Arc<StopSignal>) -> Self {
        Self { backoff, stop }
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Loop until a stop is requested. Failures never escape; they are logged
    /// and retried after a delay drawn from the backoff band.
    pub async fn run<S: SyncStrategy>(&self, strategy: &mut S) -> RunSummary {
        let mut summary = RunSummary::default();
        info!("🔄 Starting {} sync loop", strategy.name());

        while !self.stop.is_requested() {
            let result = match strategy.poll().await {
                Ok(batch) => {
                    if self.stop.is_requested() {
                        debug!("Stop requested, discarding fetched batch");
                        break;
                    }
                    strategy.process(batch).await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => summary.batches += 1,
                Err(e) => {
                    if self.stop.is_requested() {
                        break;
                    }
                    summary.failures += 1;
                    error!(kind = e.kind(), error = %e, "Error handling sync");
                    let delay = self.backoff.next_delay();
                    info!("Backing off for {}ms", delay.as_millis());
                    if !self.stop.sleep(delay).await {
                        break;
                    }
                }
            }
        }

        info!(
            batches = summary.batches,
            failures = summary.failures,
            "✅ {} sync loop stopped",
            strategy.name()
        );
        summary
    }
}
