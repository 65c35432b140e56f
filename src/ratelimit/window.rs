//! Sliding window counter implementation.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::{Result, TurnstileError};

/// Quota tier within a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Short window, evaluated first
    Burst,
    /// Long window
    Sustained,
}

impl Tier {
    /// Lowercase name used in logs and responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Burst => "burst",
            Tier::Sustained => "sustained",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A threshold over a trailing window for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    /// Which tier this is
    pub tier: Tier,
    /// Maximum admitted requests inside the window
    pub threshold: u32,
    /// Length of the trailing window
    pub window: Duration,
}

impl TierPolicy {
    /// Create a new tier policy.
    pub fn new(tier: Tier, threshold: u32, window: Duration) -> Self {
        Self {
            tier,
            threshold,
            window,
        }
    }
}

/// Ascending timestamps of admitted requests for one (scope, identifier).
///
/// A single timeline serves every tier of the scope: each tier counts the
/// suffix that falls inside its own window. The window boundary is
/// exclusive, so an entry at exactly `now - window` no longer counts.
#[derive(Debug, Clone, Default)]
pub struct WindowCounter {
    entries: VecDeque<Instant>,
}

/// `now - window`, or `None` when that predates the clock's origin.
fn cutoff(now: Instant, window: Duration) -> Option<Instant> {
    now.checked_sub(window)
}

impl WindowCounter {
    /// Create an empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry with `timestamp <= now - horizon`.
    ///
    /// Returns the number of entries removed.
    pub fn prune(&mut self, horizon: Duration, now: Instant) -> usize {
        let Some(cutoff) = cutoff(now, horizon) else {
            return 0;
        };
        let expired = self.entries.partition_point(|ts| *ts <= cutoff);
        self.entries.drain(..expired);
        expired
    }

    /// Number of entries with `timestamp > now - window`.
    pub fn count_within(&self, window: Duration, now: Instant) -> usize {
        match cutoff(now, window) {
            Some(cutoff) => self.entries.len() - self.entries.partition_point(|ts| *ts <= cutoff),
            None => self.entries.len(),
        }
    }

    /// Oldest entry still inside the window.
    pub fn oldest_within(&self, window: Duration, now: Instant) -> Option<Instant> {
        let first = match cutoff(now, window) {
            Some(cutoff) => self.entries.partition_point(|ts| *ts <= cutoff),
            None => 0,
        };
        self.entries.get(first).copied()
    }

    /// Record an admitted request, keeping the sequence sorted.
    pub fn record(&mut self, now: Instant) {
        match self.entries.back() {
            Some(last) if *last > now => {
                let at = self.entries.partition_point(|ts| *ts <= now);
                self.entries.insert(at, now);
            }
            _ => self.entries.push_back(now),
        }
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Cheap consistency check run before every evaluation.
    pub fn check_invariants(&self) -> Result<()> {
        match (self.entries.front(), self.entries.back()) {
            (Some(first), Some(last)) if first > last => Err(TurnstileError::Internal(format!(
                "window counter out of order ({} entries)",
                self.entries.len()
            ))),
            _ => Ok(()),
        }
    }

    /// Restore ordering after a failed consistency check. Counts are kept.
    pub fn repair(&mut self) {
        self.entries.make_contiguous().sort_unstable();
    }

    #[cfg(test)]
    pub(crate) fn push_unchecked(&mut self, ts: Instant) {
        self.entries.push_back(ts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);
    const HOUR: Duration = Duration::from_secs(3600);

    fn base() -> Instant {
        Instant::now() + HOUR
    }

    #[test]
    fn test_count_within_excludes_boundary() {
        let t0 = base();
        let mut counter = WindowCounter::new();
        counter.record(t0);
        counter.record(t0 + Duration::from_secs(30));

        assert_eq!(counter.count_within(MINUTE, t0 + Duration::from_secs(59)), 2);
        // Entry at exactly now - window is outside
        assert_eq!(counter.count_within(MINUTE, t0 + MINUTE), 1);
        assert_eq!(counter.count_within(MINUTE, t0 + Duration::from_secs(90)), 0);
    }

    #[test]
    fn test_prune_removes_boundary_entry() {
        let t0 = base();
        let mut counter = WindowCounter::new();
        counter.record(t0);
        counter.record(t0 + Duration::from_secs(1));

        assert_eq!(counter.prune(MINUTE, t0 + MINUTE), 1);
        assert_eq!(counter.len(), 1);
        assert_eq!(counter.prune(MINUTE, t0 + MINUTE), 0);
    }

    #[test]
    fn test_tiers_share_timeline() {
        let t0 = base();
        let mut counter = WindowCounter::new();
        counter.record(t0);
        counter.record(t0 + Duration::from_secs(120));

        let now = t0 + Duration::from_secs(150);
        assert_eq!(counter.count_within(MINUTE, now), 1);
        assert_eq!(counter.count_within(HOUR, now), 2);
        assert_eq!(counter.oldest_within(HOUR, now), Some(t0));
        assert_eq!(counter.oldest_within(MINUTE, now), Some(t0 + Duration::from_secs(120)));
    }

    #[test]
    fn test_record_out_of_order_stays_sorted() {
        let t0 = base();
        let mut counter = WindowCounter::new();
        counter.record(t0 + Duration::from_secs(5));
        counter.record(t0);
        counter.record(t0 + Duration::from_secs(3));

        assert!(counter.check_invariants().is_ok());
        assert_eq!(counter.oldest_within(HOUR, t0 + Duration::from_secs(6)), Some(t0));
    }

    #[test]
    fn test_corruption_is_detected() {
        let t0 = base();
        let mut counter = WindowCounter::new();
        counter.push_unchecked(t0 + Duration::from_secs(5));
        counter.push_unchecked(t0);

        assert!(matches!(
            counter.check_invariants(),
            Err(TurnstileError::Internal(_))
        ));

        counter.repair();
        assert!(counter.check_invariants().is_ok());
        assert_eq!(counter.len(), 2);
        assert_eq!(counter.oldest_within(HOUR, t0), Some(t0));
    }
}
