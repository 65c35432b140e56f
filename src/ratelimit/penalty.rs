//! Temporary blocks imposed after a violation.

use dashmap::DashMap;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::limiter::deadline;
use super::scope::ScopeKey;
use super::window::Tier;
use crate::error::Result;

/// An active block for one (scope, identifier).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    /// The block is lifted once `now >= expires_at`
    pub expires_at: Instant,
    /// Tier whose violation caused the block
    pub tier: Tier,
}

impl BlockEntry {
    /// Time left on the block, `None` once expired.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        if self.expires_at > now {
            Some(self.expires_at - now)
        } else {
            None
        }
    }
}

/// Store of temporary blocks keyed by scope key.
///
/// Expired entries read as absent whether or not the janitor has run yet.
#[derive(Debug, Default)]
pub struct PenaltyBox {
    blocks: DashMap<ScopeKey, BlockEntry>,
}

impl PenaltyBox {
    /// Create an empty penalty box.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining block time for `key`, removing the entry if it has expired.
    pub fn is_blocked(&self, key: &ScopeKey, now: Instant) -> Option<Duration> {
        self.active(key, now).and_then(|entry| entry.remaining(now))
    }

    /// Active block for `key`, removing the entry if it has expired.
    pub fn active(&self, key: &ScopeKey, now: Instant) -> Option<BlockEntry> {
        let entry = self.blocks.get(key).map(|entry| *entry)?;
        if entry.expires_at > now {
            return Some(entry);
        }
        self.blocks.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    /// Active block for `key` without side effects.
    pub fn peek(&self, key: &ScopeKey, now: Instant) -> Option<BlockEntry> {
        self.blocks
            .get(key)
            .map(|entry| *entry)
            .filter(|entry| entry.expires_at > now)
    }

    /// Create or refresh a block lasting `duration` from `now`.
    ///
    /// Returns the expiry. Nothing is written when it is not representable.
    pub fn block(
        &self,
        key: &ScopeKey,
        tier: Tier,
        duration: Duration,
        now: Instant,
    ) -> Result<Instant> {
        let expires_at = deadline(now, duration)?;
        warn!(
            key = %key,
            tier = %tier,
            block_secs = duration.as_secs(),
            "Blocking identifier"
        );
        self.blocks.insert(key.clone(), BlockEntry { expires_at, tier });
        Ok(expires_at)
    }

    /// Lift the block for exactly `key`. Returns whether one existed.
    pub fn unblock(&self, key: &ScopeKey) -> bool {
        let removed = self.blocks.remove(key).is_some();
        if removed {
            debug!(key = %key, "Block lifted");
        }
        removed
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.blocks.len();
        self.blocks.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.blocks.len())
    }

    /// Keys with an active block at `now`.
    pub fn active_keys(&self, now: Instant) -> HashSet<ScopeKey> {
        self.blocks
            .iter()
            .filter(|entry| entry.value().expires_at > now)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of active blocks at `now`.
    pub fn active_count(&self, now: Instant) -> usize {
        self.blocks
            .iter()
            .filter(|entry| entry.value().expires_at > now)
            .count()
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
