//! Sliding window enforcement per scope and tier.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::penalty::PenaltyBox;
use super::scope::{Scope, ScopeKey};
use super::window::{Tier, TierPolicy, WindowCounter};
use crate::error::{Result, TurnstileError};

/// Window counter shared between the map and in-flight checks.
pub type SharedWindow = Arc<Mutex<WindowCounter>>;

/// `base + offset`, or an internal fault when the instant is not representable.
pub(crate) fn deadline(base: Instant, offset: Duration) -> Result<Instant> {
    base.checked_add(offset).ok_or_else(|| {
        TurnstileError::Internal(format!("deadline {:?} past the clock's range", offset))
    })
}

/// Tiers and violation handling for one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopePolicy {
    /// Tiers in evaluation order (burst before sustained)
    pub tiers: Vec<TierPolicy>,
    /// Whether a violation writes a block
    pub penalize: bool,
}

impl ScopePolicy {
    /// Longest window among the tiers; entries older than this are dead.
    pub fn horizon(&self) -> Duration {
        self.tiers
            .iter()
            .map(|t| t.window)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Policies for every scope.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopePolicies {
    pub global: ScopePolicy,
    pub client: ScopePolicy,
    pub session: ScopePolicy,
}

impl ScopePolicies {
    /// Policy for `scope`.
    pub fn get(&self, scope: Scope) -> &ScopePolicy {
        match scope {
            Scope::Global => &self.global,
            Scope::Client => &self.client,
            Scope::Session => &self.session,
        }
    }
}

/// Quota left in the tightest tier after admitting a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Headroom {
    pub tier: Tier,
    pub limit: u32,
    pub remaining: u32,
    /// When the oldest counted request leaves the tier's window
    pub reset_at: Instant,
}

/// A breached tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Violation {
    pub tier: Tier,
    pub limit: u32,
    /// Requests already counted in the tier's window
    pub count: usize,
    pub retry_after: Duration,
    pub reset_at: Instant,
    /// Whether a block was written for this violation
    pub blocked: bool,
}

/// Result of a sliding window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Allowed(Headroom),
    Violation(Violation),
}

/// Live count for one tier, used by status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierCount {
    pub tier: Tier,
    pub limit: u32,
    pub window: Duration,
    pub count: usize,
}

/// What a sweep over the window counters reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowSweep {
    /// Expired timestamps dropped
    pub pruned_entries: usize,
    /// Counters removed entirely
    pub evicted: usize,
}

/// The authoritative sliding window limiter.
///
/// Each (scope, identifier) owns its own lock, so checks for different
/// identifiers never wait on each other.
pub struct ScopeLimiter {
    windows: DashMap<ScopeKey, SharedWindow>,
    policies: ScopePolicies,
    penalty: Arc<PenaltyBox>,
    block_duration: Duration,
}

impl ScopeLimiter {
    /// Create a new limiter writing blocks into `penalty`.
    pub fn new(policies: ScopePolicies, penalty: Arc<PenaltyBox>, block_duration: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            policies,
            penalty,
            block_duration,
        }
    }

    /// Policy for `scope`.
    pub fn policy(&self, scope: Scope) -> &ScopePolicy {
        self.policies.get(scope)
    }

    /// Check `key` and record the request if every tier has room.
    ///
    /// A violating request is not recorded.
    pub fn record_and_check(&self, key: &ScopeKey, now: Instant) -> Result<CheckOutcome> {
        let window = self.window(key);
        let mut counter = window.lock();

        if let Some(violation) = self.evaluate(key, &mut counter, now)? {
            return Ok(CheckOutcome::Violation(violation));
        }
        Ok(CheckOutcome::Allowed(self.commit(key, &mut counter, now)?))
    }

    /// Get or lazily create the counter for `key`.
    ///
    /// The map guard is released before returning; callers lock the counter
    /// itself.
    pub fn window(&self, key: &ScopeKey) -> SharedWindow {
        if let Some(existing) = self.windows.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self.windows.entry(key.clone()).or_insert_with(|| {
            debug!(key = %key, "Creating new window counter");
            Arc::new(Mutex::new(WindowCounter::new()))
        });
        Arc::clone(entry.value())
    }

    /// Prune and evaluate tiers in order without recording.
    ///
    /// On a breach, writes or refreshes the block for `key` when the scope
    /// penalizes violations. A counter that fails its consistency check is
    /// repaired before the fault is returned, so only this call is affected.
    pub fn evaluate(
        &self,
        key: &ScopeKey,
        counter: &mut WindowCounter,
        now: Instant,
    ) -> Result<Option<Violation>> {
        if let Err(e) = counter.check_invariants() {
            counter.repair();
            warn!(key = %key, entries = counter.len(), "Repaired window counter");
            return Err(e);
        }

        let policy = self.policy(key.scope);
        counter.prune(policy.horizon(), now);

        for tier in &policy.tiers {
            let count = counter.count_within(tier.window, now);
            trace!(key = %key, tier = %tier.tier, count = count, limit = tier.threshold, "Checking tier");

            if count < tier.threshold as usize {
                continue;
            }

            let oldest = counter.oldest_within(tier.window, now).unwrap_or(now);
            let window_reset = deadline(oldest, tier.window)?;

            let (retry_after, reset_at) = if policy.penalize {
                let expires_at = self.penalty.block(key, tier.tier, self.block_duration, now)?;
                (self.block_duration, expires_at)
            } else {
                (window_reset.saturating_duration_since(now), window_reset)
            };

            debug!(
                key = %key,
                tier = %tier.tier,
                count = count,
                limit = tier.threshold,
                retry_after_secs = retry_after.as_secs(),
                "Sliding window limit exceeded"
            );

            return Ok(Some(Violation {
                tier: tier.tier,
                limit: tier.threshold,
                count,
                retry_after,
                reset_at,
                blocked: policy.penalize,
            }));
        }

        Ok(None)
    }

    /// Record an admitted request and report the tightest tier.
    ///
    /// The request stays recorded even when its headroom cannot be computed.
    pub fn commit(
        &self,
        key: &ScopeKey,
        counter: &mut WindowCounter,
        now: Instant,
    ) -> Result<Headroom> {
        counter.record(now);
        let policy = self.policy(key.scope);

        let mut tightest: Option<Headroom> = None;
        for tier in &policy.tiers {
            let count = counter.count_within(tier.window, now);
            let oldest = counter.oldest_within(tier.window, now).unwrap_or(now);
            let headroom = Headroom {
                tier: tier.tier,
                limit: tier.threshold,
                remaining: tier.threshold.saturating_sub(count as u32),
                reset_at: deadline(oldest, tier.window)?,
            };
            if tightest.map_or(true, |t| headroom.remaining < t.remaining) {
                tightest = Some(headroom);
            }
        }

        Ok(tightest.unwrap_or(Headroom {
            tier: Tier::Sustained,
            limit: 0,
            remaining: 0,
            reset_at: now,
        }))
    }

    /// Live per-tier counts without pruning or creating state.
    pub fn tier_counts(&self, key: &ScopeKey, now: Instant) -> Vec<TierCount> {
        let window = self.windows.get(key).map(|w| Arc::clone(w.value()));
        let counter = window.as_ref().map(|w| w.lock());

        self.policy(key.scope)
            .tiers
            .iter()
            .map(|tier| TierCount {
                tier: tier.tier,
                limit: tier.threshold,
                window: tier.window,
                count: counter
                    .as_ref()
                    .map_or(0, |c| c.count_within(tier.window, now)),
            })
            .collect()
    }

    /// Requests counted for `key` inside its longest window.
    pub fn usage(&self, key: &ScopeKey, now: Instant) -> usize {
        let horizon = self.policy(key.scope).horizon();
        let Some(window) = self.windows.get(key).map(|w| Arc::clone(w.value())) else {
            return 0;
        };
        let count = window.lock().count_within(horizon, now);
        count
    }

    /// Forget all counts for exactly `key`.
    pub fn reset(&self, key: &ScopeKey) -> bool {
        match self.windows.remove(key) {
            Some((_, window)) => {
                // In-flight holders of the Arc must not resurrect old counts
                window.lock().clear();
                true
            }
            None => false,
        }
    }

    /// Prune every counter and evict the ones left empty and unblocked.
    ///
    /// Each counter is pruned under its own lock only. Eviction happens
    /// under the map guard and only when nobody else holds the counter.
    pub fn sweep(&self, now: Instant, blocked: &HashSet<ScopeKey>) -> WindowSweep {
        let snapshot: Vec<(ScopeKey, SharedWindow)> = self
            .windows
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut report = WindowSweep::default();
        let mut empty = Vec::new();

        for (key, window) in snapshot {
            let horizon = self.policy(key.scope).horizon();
            let mut counter = window.lock();
            report.pruned_entries += counter.prune(horizon, now);
            if counter.is_empty() && !blocked.contains(&key) {
                empty.push(key);
            }
        }

        for key in empty {
            let removed = self.windows.remove_if(&key, |_, window| {
                Arc::strong_count(window) == 1
                    && window.try_lock().map_or(false, |counter| counter.is_empty())
            });
            if removed.is_some() {
                report.evicted += 1;
            }
        }

        report
    }

    /// Number of tracked counters across all scopes.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }

    /// Number of tracked counters in one scope.
    pub fn tracked_in(&self, scope: Scope) -> usize {
        self.windows
            .iter()
            .filter(|entry| entry.key().scope == scope)
            .count()
    }

    #[cfg(test)]
    pub(crate) fn corrupt(&self, key: &ScopeKey, now: Instant) {
        let window = self.window(key);
        let mut counter = window.lock();
        counter.push_unchecked(now + Duration::from_secs(5));
        counter.push_unchecked(now);
    }
}

impl std::fmt::Debug for ScopeLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeLimiter")
            .field("tracked", &self.windows.len())
            .field("policies", &self.policies)
            .field("block_duration", &self.block_duration)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);
    const HOUR: Duration = Duration::from_secs(3600);

    fn policy(burst: u32, sustained: u32, penalize: bool) -> ScopePolicy {
        ScopePolicy {
            tiers: vec![
                TierPolicy::new(Tier::Burst, burst, MINUTE),
                TierPolicy::new(Tier::Sustained, sustained, HOUR),
            ],
            penalize,
        }
    }

    fn create_test_limiter(penalize: bool) -> (ScopeLimiter, Arc<PenaltyBox>) {
        let penalty = Arc::new(PenaltyBox::new());
        let policies = ScopePolicies {
            global: ScopePolicy {
                tiers: vec![TierPolicy::new(Tier::Sustained, 100, HOUR)],
                penalize,
            },
            client: policy(3, 5, penalize),
            session: policy(3, 5, penalize),
        };
        (ScopeLimiter::new(policies, Arc::clone(&penalty), HOUR), penalty)
    }

    fn base() -> Instant {
        Instant::now() + HOUR
    }

    #[test]
    fn test_record_and_check_creates_counter() {
        let (limiter, _) = create_test_limiter(true);
        let key = ScopeKey::client("c1");

        let outcome = limiter.record_and_check(&key, base()).unwrap();
        assert!(matches!(outcome, CheckOutcome::Allowed(_)));
        assert_eq!(limiter.tracked(), 1);
        assert_eq!(limiter.usage(&key, base()), 1);
    }

    #[test]
    fn test_burst_violation_blocks_and_is_not_recorded() {
        let (limiter, penalty) = create_test_limiter(true);
        let key = ScopeKey::client("c1");
        let t0 = base();

        for i in 0..3 {
            let outcome = limiter.record_and_check(&key, t0 + Duration::from_secs(i)).unwrap();
            assert!(matches!(outcome, CheckOutcome::Allowed(_)), "request {} should pass", i);
        }

        let now = t0 + Duration::from_secs(4);
        match limiter.record_and_check(&key, now).unwrap() {
            CheckOutcome::Violation(v) => {
                assert_eq!(v.tier, Tier::Burst);
                assert_eq!(v.retry_after, HOUR);
                assert_eq!(v.count, 3);
                assert!(v.blocked);
            }
            other => panic!("expected violation, got {:?}", other),
        }

        assert_eq!(limiter.usage(&key, now), 3);
        assert_eq!(penalty.is_blocked(&key, now), Some(HOUR));
    }

    #[test]
    fn test_sustained_tier_evaluated_after_burst_window_clears() {
        let (limiter, _) = create_test_limiter(false);
        let key = ScopeKey::client("c1");
        let t0 = base();

        // 5 requests spread so burst never trips
        for i in 0..5 {
            let outcome = limiter
                .record_and_check(&key, t0 + Duration::from_secs(61 * i))
                .unwrap();
            assert!(matches!(outcome, CheckOutcome::Allowed(_)));
        }

        let now = t0 + Duration::from_secs(61 * 5);
        match limiter.record_and_check(&key, now).unwrap() {
            CheckOutcome::Violation(v) => {
                assert_eq!(v.tier, Tier::Sustained);
                assert!(!v.blocked);
                // Oldest entry at t0 leaves the hour window at t0 + 1h
                assert_eq!(v.reset_at, t0 + HOUR);
                assert_eq!(v.retry_after, (t0 + HOUR) - now);
            }
            other => panic!("expected violation, got {:?}", other),
        }
    }

    #[test]
    fn test_headroom_reports_tightest_tier() {
        let (limiter, _) = create_test_limiter(true);
        let key = ScopeKey::session("s1");
        let t0 = base();

        match limiter.record_and_check(&key, t0).unwrap() {
            CheckOutcome::Allowed(headroom) => {
                assert_eq!(headroom.tier, Tier::Burst);
                assert_eq!(headroom.limit, 3);
                assert_eq!(headroom.remaining, 2);
                assert_eq!(headroom.reset_at, t0 + MINUTE);
            }
            other => panic!("expected allowed, got {:?}", other),
        }
    }

    #[test]
    fn test_window_boundary_is_exclusive() {
        let (limiter, _) = create_test_limiter(false);
        let key = ScopeKey::client("edge");
        let t0 = base();

        for _ in 0..3 {
            limiter.record_and_check(&key, t0).unwrap();
        }
        // At exactly t0 + 60s the three entries no longer count for burst
        let outcome = limiter.record_and_check(&key, t0 + MINUTE).unwrap();
        assert!(matches!(outcome, CheckOutcome::Allowed(_)));
    }

    #[test]
    fn test_reset_clears_only_one_key() {
        let (limiter, _) = create_test_limiter(true);
        let t0 = base();
        let a = ScopeKey::client("a");
        let b = ScopeKey::client("b");

        limiter.record_and_check(&a, t0).unwrap();
        limiter.record_and_check(&b, t0).unwrap();

        assert!(limiter.reset(&a));
        assert_eq!(limiter.usage(&a, t0), 0);
        assert_eq!(limiter.usage(&b, t0), 1);
    }

    #[test]
    fn test_corrupted_counter_is_an_error_once() {
        let (limiter, _) = create_test_limiter(true);
        let key = ScopeKey::client("bad");
        let t0 = base();

        limiter.corrupt(&key, t0);
        assert!(limiter.record_and_check(&key, t0).is_err());

        // Repaired in place: both entries still count against the burst of 3
        assert!(matches!(
            limiter.record_and_check(&key, t0),
            Ok(CheckOutcome::Allowed(_))
        ));
        assert!(matches!(
            limiter.record_and_check(&key, t0),
            Ok(CheckOutcome::Violation(_))
        ));
    }

    #[test]
    fn test_unrepresentable_block_deadline_is_an_error() {
        let penalty = Arc::new(PenaltyBox::new());
        let policies = ScopePolicies {
            global: policy(3, 5, true),
            client: policy(3, 5, true),
            session: policy(3, 5, true),
        };
        let limiter = ScopeLimiter::new(policies, penalty, Duration::MAX);
        let key = ScopeKey::client("c1");
        let t0 = base();

        for _ in 0..3 {
            limiter.record_and_check(&key, t0).unwrap();
        }
        let err = limiter.record_and_check(&key, t0).unwrap_err();
        assert!(matches!(err, TurnstileError::Internal(_)));
    }

    #[test]
    fn test_unrepresentable_window_deadline_is_an_error() {
        let penalty = Arc::new(PenaltyBox::new());
        let huge = ScopePolicy {
            tiers: vec![TierPolicy::new(Tier::Sustained, 5, Duration::MAX)],
            penalize: true,
        };
        let policies = ScopePolicies {
            global: huge.clone(),
            client: huge.clone(),
            session: huge,
        };
        let limiter = ScopeLimiter::new(policies, penalty, HOUR);

        let err = limiter
            .record_and_check(&ScopeKey::session("s1"), base())
            .unwrap_err();
        assert!(matches!(err, TurnstileError::Internal(_)));
    }

    #[test]
    fn test_sweep_evicts_idle_and_is_idempotent() {
        let (limiter, penalty) = create_test_limiter(true);
        let t0 = base();

        limiter.record_and_check(&ScopeKey::client("idle"), t0).unwrap();
        limiter
            .record_and_check(&ScopeKey::client("active"), t0 + Duration::from_secs(3000))
            .unwrap();

        let now = t0 + HOUR + Duration::from_secs(1);
        let first = limiter.sweep(now, &penalty.active_keys(now));
        assert_eq!(first.pruned_entries, 1);
        assert_eq!(first.evicted, 1);
        assert_eq!(limiter.tracked(), 1);

        let second = limiter.sweep(now, &penalty.active_keys(now));
        assert_eq!(second, WindowSweep::default());
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn test_sweep_keeps_blocked_identifier() {
        let (limiter, _) = create_test_limiter(true);
        let t0 = base();
        let key = ScopeKey::client("blocked");

        limiter.record_and_check(&key, t0).unwrap();
        let mut blocked = HashSet::new();
        blocked.insert(key.clone());

        let report = limiter.sweep(t0 + HOUR * 2, &blocked);
        assert_eq!(report.evicted, 0);
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn test_concurrent_checks_never_exceed_burst() {
        let (limiter, _) = create_test_limiter(false);
        let limiter = Arc::new(limiter);
        let now = base();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    let key = ScopeKey::client("shared");
                    (0..10)
                        .filter(|_| {
                            matches!(
                                limiter.record_and_check(&key, now),
                                Ok(CheckOutcome::Allowed(_))
                            )
                        })
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 3);
    }
}
