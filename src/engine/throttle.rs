//! Per-branch throttling of wrong supervisor PINs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::domain::BranchId;
use crate::error::{Result, ScanError};

#[derive(Debug, Clone, Copy)]
struct Attempt {
    id: u64,
    at: DateTime<Utc>,
}

/// Sliding-window counter of PIN attempts per branch.
///
/// Every attempt takes a slot before the PIN is checked, so terminals racing
/// at the same branch cannot together exceed `max_failures`. A wrong PIN keeps
/// its slot until it leaves `window`; a correct PIN clears the branch. Once a
/// branch holds `max_failures` slots, further attempts are refused until the
/// oldest one expires.
pub struct PinThrottle {
    attempts: DashMap<BranchId, VecDeque<Attempt>>,
    next_id: AtomicU64,
    max_failures: u32,
    window: Duration,
}

/// A reserved PIN attempt.
///
/// Resolve it with [`PinAttempt::succeeded`] or [`PinAttempt::failed`].
/// Dropping it unresolved gives the slot back, for attempts that never got as
/// far as a PIN comparison.
#[must_use]
pub struct PinAttempt<'a> {
    throttle: &'a PinThrottle,
    branch_id: BranchId,
    attempt: Attempt,
    resolved: bool,
}

impl PinThrottle {
    pub fn new(max_failures: u32, window: Duration) -> Self {
        Self {
            attempts: DashMap::new(),
            next_id: AtomicU64::new(0),
            max_failures,
            window,
        }
    }

    /// Take a slot for one attempt, or refuse if the branch is over its budget.
    pub fn reserve(&self, branch_id: BranchId, now: DateTime<Utc>) -> Result<PinAttempt<'_>> {
        // The entry guard holds the shard lock for the whole check-and-push.
        let mut entry = self.attempts.entry(branch_id).or_default();
        let cutoff = now - self.window;
        while entry.front().is_some_and(|a| a.at <= cutoff) {
            entry.pop_front();
        }
        if (entry.len() as u32) >= self.max_failures {
            let retry_after = entry
                .front()
                .map(|oldest| (oldest.at + self.window - now).num_seconds().max(1))
                .unwrap_or(1);
            return Err(ScanError::AuthorizationThrottled {
                branch_id,
                retry_after_secs: retry_after as u64,
            });
        }

        let attempt = Attempt {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            at: now,
        };
        entry.push_back(attempt);
        Ok(PinAttempt {
            throttle: self,
            branch_id,
            attempt,
            resolved: false,
        })
    }

    /// Attempts currently counted against the branch, pending ones included.
    pub fn attempts(&self, branch_id: BranchId) -> usize {
        self.attempts.get(&branch_id).map_or(0, |q| q.len())
    }

    fn release(&self, branch_id: BranchId, id: u64) {
        if let Some(mut entry) = self.attempts.get_mut(&branch_id) {
            entry.retain(|a| a.id != id);
        }
    }
}

impl PinAttempt<'_> {
    /// Correct PIN: the branch starts over.
    pub fn succeeded(mut self) {
        self.resolved = true;
        self.throttle.attempts.remove(&self.branch_id);
    }

    /// Wrong PIN: the slot stays counted until it leaves the window.
    pub fn failed(mut self) {
        self.resolved = true;
        let mut entry = self.throttle.attempts.entry(self.branch_id).or_default();
        // A concurrent success may have cleared the branch in the meantime.
        if !entry.iter().any(|a| a.id == self.attempt.id) {
            let at = self.attempt.at;
            let pos = entry.partition_point(|a| a.at <= at);
            entry.insert(pos, self.attempt);
        }
    }
}

impl Drop for PinAttempt<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.throttle.release(self.branch_id, self.attempt.id);
        }
    }
}
