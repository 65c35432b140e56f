//! Client-facing rendering of a denial.

use chrono::Utc;
use serde::Serialize;
use std::time::Duration;

use super::controller::{Decision, DenyReason};
use super::status::to_wall_clock;
use crate::ratelimit::{Scope, Tier};

/// HTTP status for every denial.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Machine-readable error code for every denial.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

/// Body returned to a client whose request was denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThrottleResponse {
    pub status: u16,
    pub error: ThrottleError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThrottleError {
    pub code: &'static str,
    pub reason: DenyReason,
    pub message: String,
    /// Whole seconds, rounded up
    pub retry_after: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
}

impl ThrottleResponse {
    /// Build the denial body, or `None` for an allowed decision.
    pub fn from_decision(decision: &Decision) -> Option<Self> {
        if decision.allowed {
            return None;
        }
        let reason = decision.reason?;
        let retry_after = ceil_secs(decision.retry_after.unwrap_or_default());

        let scope = decision.violated_scope.map_or("request", |s| s.as_str());
        let message = match reason {
            DenyReason::Blocked => format!(
                "Too many requests: {} is temporarily blocked, retry in {}s",
                scope, retry_after
            ),
            DenyReason::QuotaExceeded => format!(
                "Too many requests: {} {} limit of {} exceeded",
                scope,
                decision.violated_tier.map_or("rate", |t| t.as_str()),
                decision.limit
            ),
            DenyReason::Throttled => "Too many requests: slow down".to_string(),
        };

        Some(Self {
            status: TOO_MANY_REQUESTS,
            error: ThrottleError {
                code: RATE_LIMIT_EXCEEDED,
                reason,
                message,
                retry_after,
                scope: decision.violated_scope,
                tier: decision.violated_tier,
            },
        })
    }
}

/// Standard rate limit headers for any decision.
///
/// `Retry-After` is only present on denials. A degraded decision carries no
/// quota information, so it produces no headers at all.
pub fn rate_limit_headers(decision: &Decision) -> Vec<(&'static str, String)> {
    if decision.degraded {
        return Vec::new();
    }
    let reset = to_wall_clock(decision.reset_at, decision.decided_at).timestamp();
    let mut headers = vec![
        ("X-RateLimit-Limit", decision.limit.to_string()),
        ("X-RateLimit-Remaining", decision.remaining.to_string()),
        ("X-RateLimit-Reset", reset.max(Utc::now().timestamp()).to_string()),
    ];
    if let Some(retry_after) = decision.retry_after {
        headers.push(("Retry-After", ceil_secs(retry_after).to_string()));
    }
    headers
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::clock::MockClock;
    use crate::config::TurnstileConfig;
    use std::sync::Arc;
    use std::time::Instant;

    fn create_test_controller() -> AdmissionController {
        let clock = MockClock::new(Instant::now());
        AdmissionController::with_clock(TurnstileConfig::default(), Arc::new(clock)).unwrap()
    }

    #[test]
    fn test_ceil_secs_rounds_up() {
        assert_eq!(ceil_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ceil_secs(Duration::from_secs(3)), 3);
        assert_eq!(ceil_secs(Duration::ZERO), 0);
    }

    #[test]
    fn test_allowed_decision_has_no_body() {
        let controller = create_test_controller();
        let decision = controller.admit(&controller.request("c1", None));

        assert!(ThrottleResponse::from_decision(&decision).is_none());
        let headers = rate_limit_headers(&decision);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0], ("X-RateLimit-Limit", "10".to_string()));
        assert_eq!(headers[1], ("X-RateLimit-Remaining", "9".to_string()));
    }

    #[test]
    fn test_degraded_decision_has_no_headers() {
        let controller = create_test_controller();
        let now = controller.now();
        controller
            .limiter()
            .corrupt(&crate::ratelimit::ScopeKey::client("c1"), now);

        let decision = controller.admit(&controller.request("c1", None));
        assert!(decision.allowed && decision.degraded);
        assert!(rate_limit_headers(&decision).is_empty());
        assert!(ThrottleResponse::from_decision(&decision).is_none());
    }

    #[test]
    fn test_quota_denial_body_and_headers() {
        let controller = create_test_controller();
        for _ in 0..10 {
            controller.admit(&controller.request("c1", None));
        }
        let decision = controller.admit(&controller.request("c1", None));
        let response = ThrottleResponse::from_decision(&decision).unwrap();

        assert_eq!(response.status, 429);
        assert_eq!(response.error.code, "RATE_LIMIT_EXCEEDED");
        assert_eq!(response.error.reason, DenyReason::QuotaExceeded);
        assert_eq!(response.error.retry_after, 3600);
        assert!(response.error.message.contains("client burst limit of 10"));

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["reason"], "quota_exceeded");
        assert_eq!(json["error"]["scope"], "client");
        assert_eq!(json["error"]["tier"], "burst");

        let headers = rate_limit_headers(&decision);
        assert!(headers.contains(&("Retry-After", "3600".to_string())));
        assert!(headers.contains(&("X-RateLimit-Remaining", "0".to_string())));
    }

    #[test]
    fn test_blocked_denial_message() {
        let controller = create_test_controller();
        for _ in 0..11 {
            controller.admit(&controller.request("c1", None));
        }
        let decision = controller.admit(&controller.request("c1", None));
        let response = ThrottleResponse::from_decision(&decision).unwrap();

        assert_eq!(response.error.reason, DenyReason::Blocked);
        assert!(response.error.message.contains("temporarily blocked"));
    }
}
