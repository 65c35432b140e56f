//! Read-only views of limiter state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;

use crate::ratelimit::{Scope, Tier};

/// Count and quota for one tier of one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierStatus {
    pub tier: Tier,
    pub limit: u32,
    pub window_secs: u64,
    pub count: usize,
    pub remaining: u32,
}

/// Snapshot of one (scope, identifier).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub scope: Scope,
    pub identifier: String,
    pub tiers: Vec<TierStatus>,
    pub is_blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_for_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_tier: Option<Tier>,
}

/// Process-wide counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateStats {
    pub tracked_identifiers: usize,
    pub tracked_global: usize,
    pub tracked_clients: usize,
    pub tracked_sessions: usize,
    pub edge_buckets: usize,
    pub blocked: usize,
    /// Requests counted in the global scope's longest window
    pub global_usage: usize,
    pub admitted_total: u64,
    pub denied_total: u64,
    pub internal_faults: u64,
    pub captured_at: DateTime<Utc>,
}

/// Map a monotonic instant onto wall-clock time relative to `now`.
pub(crate) fn to_wall_clock(at: Instant, now: Instant) -> DateTime<Utc> {
    let wall_now = Utc::now();
    chrono::Duration::from_std(at.saturating_duration_since(now))
        .ok()
        .and_then(|offset| wall_now.checked_add_signed(offset))
        .unwrap_or(wall_now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_wall_clock_is_in_the_future() {
        let now = Instant::now();
        let before = Utc::now();
        let at = to_wall_clock(now + Duration::from_secs(3600), now);
        assert!(at >= before + chrono::Duration::seconds(3600));
    }

    #[test]
    fn test_wall_clock_never_goes_backwards() {
        let now = Instant::now() + Duration::from_secs(10);
        let before = Utc::now();
        assert!(to_wall_clock(now - Duration::from_secs(5), now) >= before);
    }

    #[test]
    fn test_snapshot_omits_empty_block_fields() {
        let snapshot = StatusSnapshot {
            scope: Scope::Client,
            identifier: "10.0.0.1".to_string(),
            tiers: vec![TierStatus {
                tier: Tier::Burst,
                limit: 10,
                window_secs: 60,
                count: 4,
                remaining: 6,
            }],
            is_blocked: false,
            blocked_for_secs: None,
            blocked_until: None,
            blocked_tier: None,
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["scope"], "client");
        assert_eq!(json["tiers"][0]["tier"], "burst");
        assert_eq!(json["tiers"][0]["remaining"], 6);
        assert!(json.get("blocked_until").is_none());
    }
}
