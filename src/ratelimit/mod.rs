//! Rate limiting logic and state management.

mod clock;
mod limiter;
mod policy;
mod sweeper;
mod visitor;

pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{Decision, Outcome, RateLimiter};
pub use policy::{BucketPolicy, Verdict, REFILL_WINDOW};
pub use sweeper::{SweepStats, Sweeper, SweeperHandle};
pub use visitor::{VisitorState, VisitorStore};
