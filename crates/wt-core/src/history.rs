//! Change history and stability classification.
//!
//! Every accepted edit appends a [`Change`] to its [`StringEntry`]. History is
//! a ring bounded by `max_num_changes`; the oldest changes fall off the front,
//! the newest one never does.
//!
//! An entry is **stable** once it has seen at least `min_num_changes` edits
//! over its whole lifetime and its newest edit is at least
//! `change_stable_age` old. Classification is lazy: it is recomputed when a
//! change is recorded and when the entry is read through [`HistoryPolicy::refresh`].
//! A refreshed entry that reached `Stable` stays there until the next change.

use chrono::{DateTime, Duration, Utc};

use crate::config::HistoryConfig;
use crate::model::{Change, ModelError, StabilityState, StringEntry, StringValue};

/// Largest stable age accepted; keeps the conversion into `chrono::Duration`
/// in range.
pub const MAX_STABLE_AGE_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// Last second of year 9999 (`9999-12-31T23:59:59Z`). Later change times
/// have no four-digit RFC 3339 form and would not read back.
pub const LATEST_CHANGE_SECS: i64 = 253_402_300_799;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("invalid change: {0}")]
    InvalidChange(String),
    #[error(transparent)]
    Identifier(#[from] ModelError),
}

/// Thresholds driving history pruning and stability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryPolicy {
    max_num_changes: usize,
    min_num_changes: i64,
    change_stable_age: Duration,
}

impl HistoryPolicy {
    /// `max_num_changes` below 1 is raised to 1 so the newest change always
    /// survives; the age is clamped to `0..=MAX_STABLE_AGE_SECS`.
    pub fn new(max_num_changes: usize, min_num_changes: i64, change_stable_age_secs: i64) -> Self {
        Self {
            max_num_changes: max_num_changes.max(1),
            min_num_changes,
            change_stable_age: Duration::seconds(
                change_stable_age_secs.clamp(0, MAX_STABLE_AGE_SECS),
            ),
        }
    }

    pub fn from_config(config: &HistoryConfig) -> Self {
        Self::new(
            config.max_num_changes,
            config.min_num_changes,
            config.change_stable_age,
        )
    }

    pub fn max_num_changes(&self) -> usize {
        self.max_num_changes
    }

    pub fn min_num_changes(&self) -> i64 {
        self.min_num_changes
    }

    pub fn change_stable_age(&self) -> Duration {
        self.change_stable_age
    }

    /// Append a change to `entry`, prune the oldest changes beyond the cap
    /// and return the recomputed stability.
    ///
    /// Rejects timestamps before the epoch or past year 9999, timestamps
    /// older than the newest recorded change, and entries whose lifetime
    /// counter is exhausted; the entry is untouched in those cases.
    pub fn record_change(
        &self,
        entry: &mut StringEntry,
        value: StringValue,
        author: &str,
        now: DateTime<Utc>,
    ) -> Result<StabilityState, HistoryError> {
        if now.timestamp() < 0 {
            return Err(HistoryError::InvalidChange(format!(
                "timestamp {} is before the epoch",
                now.to_rfc3339()
            )));
        }
        if now.timestamp() > LATEST_CHANGE_SECS {
            return Err(HistoryError::InvalidChange(format!(
                "timestamp {} is past year 9999",
                now.to_rfc3339()
            )));
        }
        if let Some(newest) = entry.newest_change() {
            if now < newest.timestamp() {
                return Err(HistoryError::InvalidChange(format!(
                    "timestamp {} precedes change #{} at {}",
                    now.to_rfc3339(),
                    newest.seq(),
                    newest.timestamp().to_rfc3339()
                )));
            }
        }

        let seq = entry.lifetime_changes.checked_add(1).ok_or_else(|| {
            HistoryError::InvalidChange("lifetime change counter is exhausted".into())
        })?;
        if entry.history.capacity() == 0 {
            entry.history.reserve_exact(self.max_num_changes + 1);
        }
        entry
            .history
            .push_back(Change::new(seq, value.clone(), author, now));
        while entry.history.len() > self.max_num_changes {
            entry.history.pop_front();
        }
        entry.lifetime_changes = seq;
        entry.value = value;

        entry.stability = self.classify(entry, now);
        Ok(entry.stability)
    }

    /// Pure classification of `entry` at `now`.
    pub fn classify(&self, entry: &StringEntry, now: DateTime<Utc>) -> StabilityState {
        let Some(newest) = entry.newest_change() else {
            return StabilityState::Unstable;
        };
        let enough_changes = i128::from(entry.lifetime_changes) >= i128::from(self.min_num_changes);
        let old_enough = now.signed_duration_since(newest.timestamp()) >= self.change_stable_age;
        if enough_changes && old_enough {
            StabilityState::Stable
        } else {
            StabilityState::Unstable
        }
    }

    /// Refresh the cached stability of `entry`. `Stable` latches: only a new
    /// change moves an entry back to `Unstable`.
    pub fn refresh(&self, entry: &mut StringEntry, now: DateTime<Utc>) -> StabilityState {
        if entry.stability == StabilityState::Unstable {
            entry.stability = self.classify(entry, now);
        }
        entry.stability
    }
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        Self::from_config(&HistoryConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
