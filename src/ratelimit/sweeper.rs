//! Background eviction of idle visitors.
//!
//! The sweeper bounds memory and lets blocks lapse for visitors that have
//! stopped sending requests. It runs on its own tokio task and contends on the
//! same store lock as the admission path.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use super::limiter::RateLimiter;
use crate::config::RateLimitingConfig;

/// Visitor count above which each sweep is reported at info level.
const BUSY_VISITOR_COUNT: usize = 100;

/// What a single sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Idle visitors removed
    pub evicted: usize,
    /// Expired blocks cleared
    pub unblocked: usize,
    /// Visitors still tracked afterwards
    pub remaining: usize,
}

/// Periodic cleanup of a [`RateLimiter`]'s visitor store.
#[derive(Debug)]
pub struct Sweeper {
    limiter: Arc<RateLimiter>,
    interval: Duration,
    idle_eviction: Duration,
}

impl Sweeper {
    pub fn new(limiter: Arc<RateLimiter>, config: &RateLimitingConfig) -> Self {
        Self {
            limiter,
            interval: config.sweep_interval(),
            idle_eviction: config.idle_eviction(),
        }
    }

    /// Run one pass at the limiter's current time.
    pub fn sweep(&self) -> SweepStats {
        self.sweep_at(self.limiter.now())
    }

    /// Run one pass at `now`.
    ///
    /// Visitors idle for longer than the eviction threshold are removed;
    /// the rest have their block cleared once the block window has elapsed.
    pub fn sweep_at(&self, now: Instant) -> SweepStats {
        let policy = self.limiter.policy();
        let mut stats = SweepStats::default();

        self.limiter.store().retain(|identity, state| {
            if now.saturating_duration_since(state.last_seen) > self.idle_eviction {
                trace!(identity = %identity, "Evicting idle visitor");
                stats.evicted += 1;
                return false;
            }

            if policy.block_expired(state, now) {
                trace!(identity = %identity, "Clearing expired block");
                policy.unblock(state, now);
                stats.unblocked += 1;
            }

            stats.remaining += 1;
            true
        });

        stats
    }

    /// Start sweeping on a background task.
    ///
    /// The first pass runs one interval after spawning. The task stops when
    /// [`SweeperHandle::shutdown`] is called or the handle is dropped.
    pub fn spawn(self) -> SweeperHandle {
        self.spawn_with(Sweeper::sweep)
    }

    /// Like [`Sweeper::spawn`], with `pass` standing in for each sweep.
    fn spawn_with<F>(self, pass: F) -> SweeperHandle
    where
        F: FnMut(&Sweeper) -> SweepStats + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            interval_secs = self.interval.as_secs(),
            idle_eviction_secs = self.idle_eviction.as_secs(),
            "Starting visitor sweeper"
        );

        let task = tokio::spawn(self.run(shutdown_rx, pass));

        SweeperHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run<F>(self, mut shutdown: watch::Receiver<bool>, mut pass: F)
    where
        F: FnMut(&Sweeper) -> SweepStats,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_pass(&mut pass),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Visitor sweeper stopped");
    }

    /// One pass, isolated so a panic cannot end the schedule.
    fn run_pass<F>(&self, pass: &mut F)
    where
        F: FnMut(&Sweeper) -> SweepStats,
    {
        match panic::catch_unwind(AssertUnwindSafe(|| pass(self))) {
            Ok(stats) if stats.remaining > BUSY_VISITOR_COUNT => {
                info!(
                    evicted = stats.evicted,
                    unblocked = stats.unblocked,
                    active_visitors = stats.remaining,
                    "Sweep complete"
                );
            }
            Ok(stats) => {
                debug!(
                    evicted = stats.evicted,
                    unblocked = stats.unblocked,
                    active_visitors = stats.remaining,
                    "Sweep complete"
                );
            }
            Err(_) => {
                error!("Visitor sweep panicked; continuing with the next cycle");
            }
        }
    }
}

/// Handle to a running sweeper task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop and wait for it to finish.
    pub async fn shutdown(self) {
        // The task may already be gone; a closed channel is fine.
        let _ = self.shutdown.send(true);

        if let Err(e) = self.task.await {
            warn!(error = %e, "Visitor sweeper task ended abnormally");
        }
    }
}
