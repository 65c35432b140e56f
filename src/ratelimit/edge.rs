//! Per-identifier token bucket applied at ingress.
//!
//! This is a cheap first gate, configured looser than the sliding windows so
//! that it never becomes the binding constraint. It fails open.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{error, trace};

use super::limiter::deadline;
use crate::error::{Result, TurnstileError};

/// Token bucket state for one identifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    /// Available tokens, `0 <= tokens <= capacity`
    pub tokens: f64,
    /// Time of the last refill
    pub last_refill: Instant,
}

impl Bucket {
    /// A bucket that has never been used.
    pub fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }
}

/// Outcome of a consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeOutcome {
    /// Whether a token was available
    pub allowed: bool,
    /// Whole tokens left after this attempt
    pub remaining: u32,
    /// `last_refill + period`
    pub reset_at: Instant,
    /// Time until one token is available, when denied
    pub retry_after: Option<Duration>,
}

/// Lazily refilled token buckets keyed by identifier.
#[derive(Debug)]
pub struct EdgeThrottle {
    buckets: DashMap<String, Bucket>,
    capacity: f64,
    period: Duration,
}

impl EdgeThrottle {
    /// Create a throttle granting `capacity` tokens per `period`.
    pub fn new(capacity: u32, period: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity: f64::from(capacity),
            period,
        }
    }

    /// Refill rate in tokens per second.
    pub fn refill_rate_per_second(&self) -> f64 {
        self.capacity / self.period.as_secs_f64()
    }

    /// Try to take one token for `identifier`.
    ///
    /// Never blocks beyond the identifier's own entry and never fails: a
    /// corrupted bucket is reset and the request is allowed.
    pub fn try_consume(&self, identifier: &str, now: Instant) -> EdgeOutcome {
        match self.consume(identifier, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(identifier = %identifier, error = %e, "Edge throttle fault, failing open");
                self.buckets
                    .insert(identifier.to_string(), Bucket::full(self.capacity, now));
                EdgeOutcome {
                    allowed: true,
                    remaining: self.capacity as u32,
                    reset_at: now.checked_add(self.period).unwrap_or(now),
                    retry_after: None,
                }
            }
        }
    }

    fn consume(&self, identifier: &str, now: Instant) -> Result<EdgeOutcome> {
        let mut bucket = self
            .buckets
            .entry(identifier.to_string())
            .or_insert_with(|| Bucket::full(self.capacity, now));

        if !bucket.tokens.is_finite() || bucket.tokens < 0.0 {
            return Err(TurnstileError::Internal(format!(
                "bucket for {} holds {} tokens",
                identifier, bucket.tokens
            )));
        }

        // Out-of-order callers never move the refill clock backwards
        if now > bucket.last_refill {
            let elapsed = now - bucket.last_refill;
            let added = elapsed.as_secs_f64() / self.period.as_secs_f64() * self.capacity;
            bucket.tokens = (bucket.tokens + added).min(self.capacity);
            bucket.last_refill = now;
        }

        let reset_at = deadline(bucket.last_refill, self.period)?;
        let allowed = bucket.tokens >= 1.0;
        let retry_after = if allowed {
            bucket.tokens -= 1.0;
            None
        } else {
            let missing = 1.0 - bucket.tokens;
            let wait = Duration::try_from_secs_f64(
                missing * self.period.as_secs_f64() / self.capacity,
            )
            .map_err(|e| TurnstileError::Internal(format!("edge retry delay: {}", e)))?;
            Some(wait)
        };

        trace!(
            identifier = %identifier,
            allowed = allowed,
            tokens = bucket.tokens,
            "Edge throttle check"
        );

        Ok(EdgeOutcome {
            allowed,
            remaining: bucket.tokens.floor() as u32,
            reset_at,
            retry_after,
        })
    }

    /// Drop the bucket for `identifier`.
    pub fn reset(&self, identifier: &str) -> bool {
        self.buckets.remove(identifier).is_some()
    }

    /// Remove buckets that have refilled completely.
    ///
    /// A bucket idle for at least one period is indistinguishable from a
    /// fresh one, so dropping it changes no future decision.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < self.period);
        before.saturating_sub(self.buckets.len())
    }

    /// Current tokens for `identifier`, if tracked.
    pub fn tokens(&self, identifier: &str) -> Option<f64> {
        self.buckets.get(identifier).map(|bucket| bucket.tokens)
    }

    /// Number of tracked buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// True when no bucket is tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn corrupt(&self, identifier: &str, now: Instant) {
        self.buckets.insert(
            identifier.to_string(),
            Bucket {
                tokens: f64::NAN,
                last_refill: now,
            },
        );
    }
}
