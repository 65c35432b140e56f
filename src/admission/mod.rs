//! Admission control: the decision pipeline, its background janitor, and
//! the views exported to callers.

mod controller;
mod janitor;
mod response;
mod status;

pub use controller::{AdmissionController, Decision, DenyReason, RequestDescriptor, SweepReport};
pub use janitor::{Janitor, JanitorHandle};
pub use response::{rate_limit_headers, ThrottleError, ThrottleResponse, RATE_LIMIT_EXCEEDED, TOO_MANY_REQUESTS};
pub use status::{AggregateStats, StatusSnapshot, TierStatus};
