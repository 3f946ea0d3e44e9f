//! The admission gate: one call per inbound request.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};

use super::clock::{Clock, SystemClock};
use super::policy::{BucketPolicy, Verdict, REFILL_WINDOW};
use super::visitor::{VisitorState, VisitorStore};
use crate::config::RateLimitingConfig;

/// Why a request was admitted or denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Admitted,
    /// The bucket was empty; this request started a block.
    Exhausted,
    /// An earlier block is still in force.
    Blocked,
}

/// Result of an admission check, with everything needed to render
/// rate limit headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub outcome: Outcome,
    /// Configured capacity per window
    pub limit: u64,
    /// Tokens left after this request
    pub remaining: u64,
    /// Seconds until a retry is permitted (zero when admitted)
    pub retry_after: u64,
    /// Seconds until the bucket conceptually refills
    pub reset_after: u64,
}

impl Decision {
    pub fn allowed(&self) -> bool {
        self.outcome == Outcome::Admitted
    }
}

/// Per-client token bucket rate limiter.
///
/// This struct is thread-safe and is shared by reference between the request
/// pipeline and the [`Sweeper`](super::Sweeper).
#[derive(Debug)]
pub struct RateLimiter {
    store: VisitorStore,
    policy: BucketPolicy,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter driven by the system clock.
    pub fn new(config: &RateLimitingConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a rate limiter driven by `clock`.
    pub fn with_clock(config: &RateLimitingConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = config.requests_per_minute;
        Self {
            store: VisitorStore::new(capacity),
            policy: BucketPolicy::new(capacity, REFILL_WINDOW, config.block_window()),
            clock,
        }
    }

    /// Check and record one request from `identity` at the current time.
    pub fn check(&self, identity: &str) -> Decision {
        self.check_at(identity, self.clock.now())
    }

    /// Check and record one request from `identity` at `now`.
    ///
    /// An empty identity is a valid key; every such caller shares one bucket.
    pub fn check_at(&self, identity: &str, now: Instant) -> Decision {
        if identity.is_empty() {
            trace!("Empty identity, using the shared bucket");
        }

        let verdict = self.store.get_or_create(identity, now, |state, created| {
            if created {
                debug!(identity = %identity, "Tracking new visitor");
                Verdict::Admit {
                    remaining: state.tokens,
                }
            } else {
                let was_blocked = state.is_blocked();
                let verdict = self.policy.decide(state, now);
                if was_blocked && verdict.is_admit() {
                    debug!(identity = %identity, "Block expired, bucket reset");
                }
                verdict
            }
        });

        trace!(identity = %identity, verdict = ?verdict, "Checked rate limit");

        let limit = self.policy.capacity();
        let reset_after = self.policy.window().as_secs();

        match verdict {
            Verdict::Admit { remaining } => Decision {
                outcome: Outcome::Admitted,
                limit,
                remaining,
                retry_after: 0,
                reset_after,
            },
            Verdict::Exhausted { retry_after } => {
                info!(
                    identity = %identity,
                    limit = limit,
                    block_secs = retry_after,
                    "Visitor exceeded rate limit, blocking"
                );
                Decision {
                    outcome: Outcome::Exhausted,
                    limit,
                    remaining: 0,
                    retry_after,
                    reset_after,
                }
            }
            Verdict::Blocked { retry_after } => Decision {
                outcome: Outcome::Blocked,
                limit,
                remaining: 0,
                retry_after,
                reset_after,
            },
        }
    }

    /// The current time according to the limiter's clock.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn capacity(&self) -> u64 {
        self.policy.capacity()
    }

    /// Snapshot of the state tracked for `identity`.
    pub fn visitor(&self, identity: &str) -> Option<VisitorState> {
        self.store.get(identity)
    }

    /// Number of identities currently tracked.
    pub fn visitor_count(&self) -> usize {
        self.store.len()
    }

    /// Forget every visitor.
    pub fn clear(&self) {
        self.store.clear();
    }

    pub(crate) fn store(&self) -> &VisitorStore {
        &self.store
    }

    pub(crate) fn policy(&self) -> &BucketPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    fn config(capacity: u64) -> RateLimitingConfig {
        RateLimitingConfig {
            requests_per_minute: capacity,
            ..RateLimitingConfig::default()
        }
    }

    fn limiter(capacity: u64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(&config(capacity), clock.clone());
        (limiter, clock)
    }

    #[test]
    fn test_first_request_creates_visitor() {
        let (limiter, _clock) = limiter(10);
        assert_eq!(limiter.visitor_count(), 0);

        let decision = limiter.check("10.0.0.1");

        assert!(decision.allowed());
        assert_eq!(decision.remaining, 9);
        assert_eq!(decision.limit, 10);
        assert_eq!(decision.reset_after, 60);
        assert_eq!(limiter.visitor_count(), 1);
    }

    #[test]
    fn test_exhaust_block_and_recover() {
        let (limiter, clock) = limiter(3);

        let remaining: Vec<u64> = (0..3)
            .map(|_| {
                let decision = limiter.check("A");
                assert!(decision.allowed());
                decision.remaining
            })
            .collect();
        assert_eq!(remaining, vec![2, 1, 0]);

        let denied = limiter.check("A");
        assert_eq!(denied.outcome, Outcome::Exhausted);
        assert_eq!(denied.retry_after, 300);
        assert_eq!(denied.remaining, 0);

        clock.advance(Duration::from_secs(301));

        let decision = limiter.check("A");
        assert!(decision.allowed());
        assert_eq!(decision.remaining, 2);
    }

    #[test]
    fn test_block_holds_for_whole_window() {
        let (limiter, clock) = limiter(2);

        limiter.check("A");
        limiter.check("A");
        assert_eq!(limiter.check("A").outcome, Outcome::Exhausted);

        for _ in 0..29 {
            clock.advance(Duration::from_secs(10));
            let decision = limiter.check("A");
            assert_eq!(decision.outcome, Outcome::Blocked);
            assert_eq!(decision.retry_after, 300 - clock.elapsed().as_secs());
        }

        clock.advance(Duration::from_secs(10));
        assert!(limiter.check("A").allowed());
    }

    #[test]
    fn test_half_window_refill() {
        let (limiter, clock) = limiter(60);

        assert!(limiter.check("B").allowed());
        clock.advance(Duration::from_secs(30));

        let decision = limiter.check("B");
        assert!(decision.allowed());
        assert_eq!(decision.remaining, 59);
    }

    #[test]
    fn test_identities_are_independent() {
        let (limiter, _clock) = limiter(1);

        assert!(limiter.check("10.0.0.1").allowed());
        assert!(limiter.check("10.0.0.2").allowed());
        assert!(!limiter.check("10.0.0.1").allowed());
        assert_eq!(limiter.visitor_count(), 2);
    }

    #[test]
    fn test_empty_identity_shares_a_bucket() {
        let (limiter, _clock) = limiter(2);

        assert!(limiter.check("").allowed());
        assert!(limiter.check("").allowed());
        assert!(!limiter.check("").allowed());
        assert_eq!(limiter.visitor_count(), 1);
    }

    #[test]
    fn test_at_most_capacity_per_window() {
        let (limiter, clock) = limiter(10);
        let mut admitted = 0;

        // 120 requests spread evenly over one minute.
        for _ in 0..120 {
            if limiter.check("C").allowed() {
                admitted += 1;
            }
            clock.advance(Duration::from_millis(500));
        }

        assert!(admitted <= 10, "admitted {} requests", admitted);
    }

    #[test]
    fn test_steady_refill_over_one_window() {
        let (limiter, clock) = limiter(60);

        // One token per second comes back, so a request every second never
        // runs dry: 61 requests across exactly one minute are all admitted.
        let mut admitted = 0;
        for second in 0..=60 {
            let decision = limiter.check("E");
            assert!(decision.allowed(), "denied at {}s", second);
            assert_eq!(decision.remaining, 59);
            admitted += 1;
            if second < 60 {
                clock.advance(Duration::from_secs(1));
            }
        }
        assert_eq!(admitted, 61);

        // A burst at the end of the window only gets what is left.
        let mut burst = 0;
        while limiter.check("E").allowed() {
            burst += 1;
        }
        assert_eq!(burst, 59);
        // The starting bucket plus one minute of refill, and nothing more.
        assert_eq!(admitted + burst, 120);
        assert_eq!(limiter.visitor("E").unwrap().tokens, 0);
    }

    #[test]
    fn test_tokens_stay_within_bounds() {
        let (limiter, clock) = limiter(5);
        let steps = [0u64, 1, 7, 0, 0, 13, 61, 0, 0, 0, 0, 0, 0, 2, 400, 0, 3];

        for step in steps {
            clock.advance(Duration::from_secs(step));
            limiter.check("D");
            let state = limiter.visitor("D").unwrap();
            assert!(state.tokens <= limiter.capacity());
        }
    }

    #[test]
    fn test_clear() {
        let (limiter, _clock) = limiter(5);
        limiter.check("A");
        limiter.clear();
        assert_eq!(limiter.visitor_count(), 0);
        assert!(limiter.visitor("A").is_none());
    }

    #[test]
    fn test_concurrent_requests_never_double_spend() {
        const THREADS: usize = 16;
        const PER_THREAD: usize = 50;

        for capacity in [1u64, 37, 500, 2000] {
            let (limiter, _clock) = limiter(capacity);
            let admitted = AtomicU64::new(0);
            let barrier = Barrier::new(THREADS);

            std::thread::scope(|scope| {
                for _ in 0..THREADS {
                    scope.spawn(|| {
                        barrier.wait();
                        for _ in 0..PER_THREAD {
                            if limiter.check("shared").allowed() {
                                admitted.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    });
                }
            });

            let total = (THREADS * PER_THREAD) as u64;
            assert_eq!(admitted.load(Ordering::Relaxed), total.min(capacity));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tasks_share_limiter() {
        let (limiter, _clock) = limiter(25);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check("task").allowed() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 25);
    }
}
