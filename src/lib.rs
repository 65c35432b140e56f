//! Turnstile - Admission Control for Inference Backends
//!
//! This crate decides, for every inbound request, whether it may proceed.
//! Requests are checked against sliding windows in three scopes (global,
//! client, session), each with a burst and a sustained tier, behind a cheap
//! per-client token bucket. Violations earn a temporary block, and a
//! background janitor reclaims state that can no longer affect a decision.

pub mod admission;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;

pub use admission::{AdmissionController, Decision, DenyReason, Janitor, RequestDescriptor};
pub use config::TurnstileConfig;
pub use error::{Result, TurnstileError};
