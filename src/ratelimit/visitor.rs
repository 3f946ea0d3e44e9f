//! Per-client visitor state and the store that owns it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;

/// Token bucket state for one client identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitorState {
    /// Request credits currently available, never above the capacity
    pub tokens: u64,
    /// When tokens were last refilled
    pub last_seen: Instant,
    /// Start of the penalty window, if the visitor is blocked
    pub blocked_at: Option<Instant>,
}

impl VisitorState {
    /// State for a visitor seen for the first time.
    ///
    /// The triggering request has already spent one token.
    pub fn fresh(capacity: u64, now: Instant) -> Self {
        Self {
            tokens: capacity.saturating_sub(1),
            last_seen: now,
            blocked_at: None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked_at.is_some()
    }
}

/// Concurrency-safe map from client identity to [`VisitorState`].
///
/// One lock guards the whole map. Every read-modify-write happens inside a
/// single acquisition, so the admission path and the sweeper never observe a
/// partially updated entry.
#[derive(Debug)]
pub struct VisitorStore {
    capacity: u64,
    visitors: Mutex<HashMap<String, VisitorState>>,
}

impl VisitorStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            visitors: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` against the entry for `identity`, inserting a fresh one first
    /// if none exists. `f` receives `true` when the entry was just created.
    ///
    /// Lookup, creation and `f` share one lock acquisition.
    pub fn get_or_create<R>(
        &self,
        identity: &str,
        now: Instant,
        f: impl FnOnce(&mut VisitorState, bool) -> R,
    ) -> R {
        let mut visitors = self.visitors.lock();

        if let Some(state) = visitors.get_mut(identity) {
            return f(state, false);
        }

        let state = visitors
            .entry(identity.to_owned())
            .or_insert_with(|| VisitorState::fresh(self.capacity, now));
        f(state, true)
    }

    /// Visit every entry under the lock, dropping those for which `f`
    /// returns `false`.
    pub fn retain(&self, mut f: impl FnMut(&str, &mut VisitorState) -> bool) {
        let mut visitors = self.visitors.lock();
        visitors.retain(|identity, state| f(identity.as_str(), state));
    }

    /// Snapshot of the entry for `identity`.
    pub fn get(&self, identity: &str) -> Option<VisitorState> {
        self.visitors.lock().get(identity).cloned()
    }

    pub fn len(&self) -> usize {
        self.visitors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.visitors.lock().is_empty()
    }

    pub fn clear(&self) {
        self.visitors.lock().clear();
    }
}
