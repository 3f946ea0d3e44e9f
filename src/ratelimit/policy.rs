//! Token bucket policy with block escalation.
//!
//! Refill is computed lazily from the time since the visitor was last seen,
//! so no per-visitor timer is needed. A visitor that empties its bucket is
//! blocked for a fixed cooldown instead of being admitted again as soon as a
//! single token trickles back.

use std::time::{Duration, Instant};

use super::visitor::VisitorState;

/// Period over which a full bucket is refilled.
pub const REFILL_WINDOW: Duration = Duration::from_secs(60);

/// Outcome of applying the policy to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Admitted; `remaining` tokens are left afterwards.
    Admit { remaining: u64 },
    /// This request found the bucket empty and started a block.
    Exhausted { retry_after: u64 },
    /// The visitor is inside an earlier block.
    Blocked { retry_after: u64 },
}

impl Verdict {
    pub fn is_admit(&self) -> bool {
        matches!(self, Verdict::Admit { .. })
    }
}

/// The decision rules shared by the admission gate and the sweeper.
#[derive(Debug, Clone)]
pub struct BucketPolicy {
    capacity: u64,
    window: Duration,
    block_window: Duration,
}

impl BucketPolicy {
    pub fn new(capacity: u64, window: Duration, block_window: Duration) -> Self {
        Self {
            capacity,
            window,
            block_window,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Apply one request to `state` at `now`, updating it in place.
    ///
    /// A request arriving with zero tokens is denied.
    pub fn decide(&self, state: &mut VisitorState, now: Instant) -> Verdict {
        if let Some(blocked_at) = state.blocked_at {
            let retry_after = self.retry_after(blocked_at, now);
            if retry_after > 0 {
                return Verdict::Blocked { retry_after };
            }

            self.unblock(state, now);
        }

        self.refill(state, now);

        if state.tokens > 0 {
            state.tokens -= 1;
            Verdict::Admit {
                remaining: state.tokens,
            }
        } else {
            state.blocked_at = Some(now);
            Verdict::Exhausted {
                retry_after: self.block_window.as_secs(),
            }
        }
    }

    /// Lift a lapsed block and hand back a full bucket.
    ///
    /// Both the admission path and the sweeper go through here, so a visitor
    /// ends up in the same state whichever of them notices the expiry first.
    pub fn unblock(&self, state: &mut VisitorState, now: Instant) {
        state.blocked_at = None;
        state.tokens = self.capacity;
        state.last_seen = state.last_seen.max(now);
    }

    /// Credit tokens for the time elapsed since `last_seen`, clamped to the
    /// capacity. Fractional tokens are discarded.
    pub fn refill(&self, state: &mut VisitorState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_seen);
        let to_add = (elapsed.as_secs_f64() * self.capacity as f64 / self.window.as_secs_f64()) as u64;

        state.tokens = state.tokens.saturating_add(to_add).min(self.capacity);
        // Callers sample the clock before taking the store lock, so `now`
        // can trail a concurrent update slightly.
        state.last_seen = state.last_seen.max(now);
    }

    /// Whole seconds left in a block that started at `blocked_at`; zero once
    /// the block has run its course.
    pub fn retry_after(&self, blocked_at: Instant, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(blocked_at).as_secs();
        self.block_window.as_secs().saturating_sub(elapsed)
    }

    pub fn block_expired(&self, state: &VisitorState, now: Instant) -> bool {
        match state.blocked_at {
            Some(blocked_at) => self.retry_after(blocked_at, now) == 0,
            None => false,
        }
    }
}
