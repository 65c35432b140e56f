//! Admission decisions across every scope.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

use super::status::{to_wall_clock, AggregateStats, StatusSnapshot, TierStatus};
use crate::clock::{Clock, SystemClock};
use crate::config::TurnstileConfig;
use crate::error::Result;
use crate::ratelimit::{
    BlockEntry, EdgeOutcome, EdgeThrottle, Headroom, PenaltyBox, Scope, ScopeKey, ScopeLimiter,
    Tier, Violation, WindowCounter,
};

/// One inbound request as seen by the limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    /// Client network address
    pub client_id: String,
    /// Session identifier, when the request belongs to one
    pub session_id: Option<String>,
    /// Arrival time
    pub now: Instant,
}

impl RequestDescriptor {
    /// Create a descriptor without a session.
    pub fn new(client_id: impl Into<String>, now: Instant) -> Self {
        Self {
            client_id: client_id.into(),
            session_id: None,
            now,
        }
    }

    /// Attach a session identifier.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// An earlier violation is still being served
    Blocked,
    /// A sliding window tier is full
    QuotaExceeded,
    /// The edge token bucket is empty
    Throttled,
}

/// The outcome of [`AdmissionController::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Limit of the tier that produced `remaining`
    pub limit: u32,
    /// Smallest remaining quota across every scope consulted
    pub remaining: u32,
    pub reset_at: Instant,
    pub retry_after: Option<Duration>,
    pub violated_scope: Option<Scope>,
    pub violated_tier: Option<Tier>,
    pub reason: Option<DenyReason>,
    /// Set when an internal fault forced a fail-open decision. Quota fields
    /// carry no information then and no rate limit headers are derived.
    pub degraded: bool,
    /// The request's arrival time
    pub decided_at: Instant,
}

impl Decision {
    fn allowed(headroom: Headroom, now: Instant) -> Self {
        Self {
            allowed: true,
            limit: headroom.limit,
            remaining: headroom.remaining,
            reset_at: headroom.reset_at,
            retry_after: None,
            violated_scope: None,
            violated_tier: None,
            reason: None,
            degraded: false,
            decided_at: now,
        }
    }

    fn fail_open(now: Instant) -> Self {
        Self {
            allowed: true,
            limit: 0,
            remaining: 0,
            reset_at: now,
            retry_after: None,
            violated_scope: None,
            violated_tier: None,
            reason: None,
            degraded: true,
            decided_at: now,
        }
    }

    fn blocked(scope: Scope, block: BlockEntry, limit: u32, now: Instant) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at: block.expires_at,
            retry_after: Some(block.expires_at.saturating_duration_since(now)),
            violated_scope: Some(scope),
            violated_tier: Some(block.tier),
            reason: Some(DenyReason::Blocked),
            degraded: false,
            decided_at: now,
        }
    }

    fn violation(scope: Scope, violation: Violation, now: Instant) -> Self {
        Self {
            allowed: false,
            limit: violation.limit,
            remaining: 0,
            reset_at: violation.reset_at,
            retry_after: Some(violation.retry_after),
            violated_scope: Some(scope),
            violated_tier: Some(violation.tier),
            reason: Some(DenyReason::QuotaExceeded),
            degraded: false,
            decided_at: now,
        }
    }

    fn throttled(edge: EdgeOutcome, capacity: u32, now: Instant) -> Self {
        Self {
            allowed: false,
            limit: capacity,
            remaining: edge.remaining,
            reset_at: edge.reset_at,
            retry_after: edge.retry_after,
            violated_scope: Some(Scope::Client),
            violated_tier: None,
            reason: Some(DenyReason::Throttled),
            degraded: false,
            decided_at: now,
        }
    }

    /// Time from the decision until `reset_at`.
    pub fn reset_after(&self) -> Duration {
        self.reset_at.saturating_duration_since(self.decided_at)
    }
}

/// What one janitor pass reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub pruned_entries: usize,
    pub evicted_windows: usize,
    pub expired_blocks: usize,
    pub evicted_buckets: usize,
}

impl SweepReport {
    /// True when the pass reclaimed anything.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Orchestrates blocks, sliding windows and the edge bucket into one decision.
pub struct AdmissionController {
    limiter: ScopeLimiter,
    penalty: Arc<PenaltyBox>,
    edge: EdgeThrottle,
    clock: Arc<dyn Clock>,
    config: TurnstileConfig,
    admitted: AtomicU64,
    denied: AtomicU64,
    faults: AtomicU64,
}

impl AdmissionController {
    /// Create a controller on the system clock.
    ///
    /// Fails with a configuration error before any traffic is accepted.
    pub fn new(config: TurnstileConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Create a controller on a custom clock.
    pub fn with_clock(config: TurnstileConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let penalty = Arc::new(PenaltyBox::new());
        let limiter = ScopeLimiter::new(
            config.limits.policies(),
            Arc::clone(&penalty),
            config.limits.block_duration(),
        );
        let edge = EdgeThrottle::new(config.edge.capacity, config.edge.period());

        info!(
            block_duration_secs = config.limits.block_duration_secs,
            edge_capacity = config.edge.capacity,
            edge_period_secs = config.edge.period_secs,
            "Admission controller initialized"
        );

        Ok(Self {
            limiter,
            penalty,
            edge,
            clock,
            config,
            admitted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            faults: AtomicU64::new(0),
        })
    }

    /// The validated configuration.
    pub fn config(&self) -> &TurnstileConfig {
        &self.config
    }

    /// Current time on the controller's clock.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Build a descriptor stamped with the controller's clock.
    pub fn request(&self, client_id: &str, session_id: Option<&str>) -> RequestDescriptor {
        let request = RequestDescriptor::new(client_id, self.now());
        match session_id {
            Some(session) => request.with_session(session),
            None => request,
        }
    }

    /// Decide whether a request may proceed.
    ///
    /// Never fails: an internal fault is logged, counted, and turned into an
    /// allowed decision marked `degraded`.
    pub fn admit(&self, request: &RequestDescriptor) -> Decision {
        let decision = match self.evaluate(request) {
            Ok(decision) => decision,
            Err(e) => {
                self.faults.fetch_add(1, Ordering::Relaxed);
                error!(
                    client = %request.client_id,
                    session = ?request.session_id,
                    error = %e,
                    "Admission check faulted, failing open"
                );
                Decision::fail_open(request.now)
            }
        };

        if decision.allowed {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
            debug!(
                client = %request.client_id,
                reason = ?decision.reason,
                scope = ?decision.violated_scope,
                tier = ?decision.violated_tier,
                retry_after_secs = decision.retry_after.map(|d| d.as_secs()),
                "Request denied"
            );
        }

        decision
    }

    fn evaluate(&self, request: &RequestDescriptor) -> Result<Decision> {
        let now = request.now;
        let global_key = ScopeKey::global();
        let client_key = ScopeKey::client(request.client_id.as_str());
        let session_key = request.session_id.as_deref().map(ScopeKey::session);

        trace!(client = %request.client_id, session = ?request.session_id, "Evaluating request");

        // Map lookups and counter creation happen before any counter is locked
        let global_window = self.limiter.window(&global_key);
        let client_window = self.limiter.window(&client_key);
        let session_window = session_key.as_ref().map(|key| self.limiter.window(key));

        // Counters are locked in scope order and held until the request is
        // recorded, so checks for one identifier are totally ordered.
        let mut global = global_window.lock();
        if let Some(denied) = self.gate(&global_key, &mut global, now)? {
            return Ok(denied);
        }

        let mut client = client_window.lock();
        if let Some(denied) = self.gate(&client_key, &mut client, now)? {
            return Ok(denied);
        }

        let mut session = session_window.as_ref().map(|window| window.lock());
        if let (Some(key), Some(counter)) = (&session_key, session.as_mut()) {
            if let Some(denied) = self.gate(key, counter, now)? {
                return Ok(denied);
            }
        }

        let edge = self.edge.try_consume(&request.client_id, now);
        if !edge.allowed {
            return Ok(Decision::throttled(edge, self.config.edge.capacity, now));
        }

        // Every scope records the request before any headroom fault surfaces
        let global_headroom = self.limiter.commit(&global_key, &mut global, now);
        let client_headroom = self.limiter.commit(&client_key, &mut client, now);
        let session_headroom = match (&session_key, session.as_mut()) {
            (Some(key), Some(counter)) => Some(self.limiter.commit(key, counter, now)),
            _ => None,
        };

        let mut tightest = global_headroom?;
        for headroom in std::iter::once(client_headroom).chain(session_headroom) {
            let headroom = headroom?;
            if headroom.remaining < tightest.remaining {
                tightest = headroom;
            }
        }

        Ok(Decision::allowed(tightest, now))
    }

    /// Block check followed by the scope's tiers.
    fn gate(
        &self,
        key: &ScopeKey,
        counter: &mut WindowCounter,
        now: Instant,
    ) -> Result<Option<Decision>> {
        if let Some(block) = self.penalty.active(key, now) {
            trace!(key = %key, tier = %block.tier, "Identifier is blocked");
            let limit = self.tier_limit(key.scope, block.tier);
            return Ok(Some(Decision::blocked(key.scope, block, limit, now)));
        }

        Ok(self
            .limiter
            .evaluate(key, counter, now)?
            .map(|violation| Decision::violation(key.scope, violation, now)))
    }

    fn tier_limit(&self, scope: Scope, tier: Tier) -> u32 {
        self.limiter
            .policy(scope)
            .tiers
            .iter()
            .find(|t| t.tier == tier)
            .map_or(0, |t| t.threshold)
    }

    /// Read-only snapshot of one identifier at the current time.
    pub fn get_status(&self, scope: Scope, identifier: &str) -> StatusSnapshot {
        self.status_at(scope, identifier, self.now())
    }

    /// Read-only snapshot of one identifier at `now`.
    pub fn status_at(&self, scope: Scope, identifier: &str, now: Instant) -> StatusSnapshot {
        let key = ScopeKey::new(scope, identifier);
        let block = self.penalty.peek(&key, now);

        let tiers = self
            .limiter
            .tier_counts(&key, now)
            .into_iter()
            .map(|count| TierStatus {
                tier: count.tier,
                limit: count.limit,
                window_secs: count.window.as_secs(),
                count: count.count,
                remaining: count.limit.saturating_sub(count.count as u32),
            })
            .collect();

        StatusSnapshot {
            scope,
            identifier: key.identifier,
            tiers,
            is_blocked: block.is_some(),
            blocked_for_secs: block.and_then(|b| b.remaining(now)).map(|d| d.as_secs()),
            blocked_until: block.map(|b| to_wall_clock(b.expires_at, now)),
            blocked_tier: block.map(|b| b.tier),
        }
    }

    /// Clear the block and counters for exactly one identifier.
    ///
    /// Resetting a client also drops its edge bucket, so its next request is
    /// treated as if the client had never been seen.
    pub fn reset(&self, scope: Scope, identifier: &str) -> bool {
        let key = ScopeKey::new(scope, identifier);
        let unblocked = self.penalty.unblock(&key);
        let cleared = self.limiter.reset(&key);
        let bucket = scope == Scope::Client && self.edge.reset(identifier);

        info!(key = %key, unblocked = unblocked, cleared = cleared, "Rate limit reset");
        unblocked || cleared || bucket
    }

    /// Counters for observability export at the current time.
    pub fn aggregate_stats(&self) -> AggregateStats {
        self.aggregate_stats_at(self.now())
    }

    /// Counters for observability export at `now`.
    pub fn aggregate_stats_at(&self, now: Instant) -> AggregateStats {
        let tracked_global = self.limiter.tracked_in(Scope::Global);
        let tracked_clients = self.limiter.tracked_in(Scope::Client);
        let tracked_sessions = self.limiter.tracked_in(Scope::Session);

        AggregateStats {
            tracked_identifiers: tracked_global + tracked_clients + tracked_sessions,
            tracked_global,
            tracked_clients,
            tracked_sessions,
            edge_buckets: self.edge.len(),
            blocked: self.penalty.active_count(now),
            global_usage: self.limiter.usage(&ScopeKey::global(), now),
            admitted_total: self.admitted.load(Ordering::Relaxed),
            denied_total: self.denied.load(Ordering::Relaxed),
            internal_faults: self.faults.load(Ordering::Relaxed),
            captured_at: chrono::Utc::now(),
        }
    }

    /// Reclaim expired state: blocks first, then windows, then buckets.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let expired_blocks = self.penalty.sweep(now);
        let windows = self.limiter.sweep(now, &self.penalty.active_keys(now));
        let evicted_buckets = self.edge.sweep(now);

        SweepReport {
            pruned_entries: windows.pruned_entries,
            evicted_windows: windows.evicted,
            expired_blocks,
            evicted_buckets,
        }
    }

    #[cfg(test)]
    pub(crate) fn limiter(&self) -> &ScopeLimiter {
        &self.limiter
    }

    #[cfg(test)]
    pub(crate) fn edge(&self) -> &EdgeThrottle {
        &self.edge
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("limiter", &self.limiter)
            .field("blocks", &self.penalty.len())
            .field("edge_buckets", &self.edge.len())
            .finish()
    }
}
