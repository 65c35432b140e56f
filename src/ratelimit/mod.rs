//! Rate limiting primitives: sliding windows, blocks, and the edge bucket.

mod edge;
mod limiter;
mod penalty;
mod scope;
mod window;

pub use edge::{Bucket, EdgeOutcome, EdgeThrottle};
pub use limiter::{
    CheckOutcome, Headroom, ScopeLimiter, ScopePolicies, ScopePolicy, SharedWindow, TierCount,
    Violation, WindowSweep,
};
pub use penalty::{BlockEntry, PenaltyBox};
pub use scope::{Scope, ScopeKey, GLOBAL_IDENTIFIER};
pub use window::{Tier, TierPolicy, WindowCounter};
