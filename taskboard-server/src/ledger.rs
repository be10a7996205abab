//! Bounded, append-only activity ledger.
//!
//! The [`ActivityLedger`] keeps at most `capacity` entries system-wide. Each
//! append pushes the new entry and then evicts the oldest entries until the
//! cap holds again. Eviction follows insertion order and ignores groups, so
//! one busy group can push another group's history out of the ledger.
//! Group-filtered reads are taken from whatever survived the global cap.

use std::collections::VecDeque;

use taskboard_proto::activity::ActivityLogEntry;
use taskboard_proto::ids::GroupId;
use tokio::sync::RwLock;

/// Default number of entries the ledger retains.
pub const DEFAULT_LEDGER_CAPACITY: usize = 20;

/// Default maximum length of an entry's detail text, in characters.
pub const DEFAULT_MAX_DETAIL_LEN: usize = 1024;

/// Errors that can occur when appending to the ledger.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    /// The entry's detail text exceeds the configured maximum.
    #[error("activity detail too long: {len} characters (max {max})")]
    DetailTooLong {
        /// Actual length in characters.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// In-memory activity ledger with global FIFO eviction.
///
/// Thread-safe via [`RwLock`].
pub struct ActivityLedger {
    entries: RwLock<VecDeque<ActivityLogEntry>>,
    capacity: usize,
    max_detail_len: usize,
}

impl Default for ActivityLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityLedger {
    /// Creates an empty ledger with the default capacity and detail limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_LEDGER_CAPACITY, DEFAULT_MAX_DETAIL_LEN)
    }

    /// Creates an empty ledger with custom limits. A zero capacity is raised
    /// to one so the most recent action is always visible.
    #[must_use]
    pub fn with_limits(capacity: usize, max_detail_len: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity + 1)),
            capacity,
            max_detail_len,
        }
    }

    /// Maximum number of retained entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends an entry, then evicts oldest-first until at most `capacity`
    /// entries remain. Returns the number of entries evicted.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::DetailTooLong`] if the detail exceeds the
    /// configured maximum. The ledger is unchanged in that case.
    pub async fn append(&self, entry: ActivityLogEntry) -> Result<usize, LedgerError> {
        let len = entry.detail.chars().count();
        if len > self.max_detail_len {
            return Err(LedgerError::DetailTooLong {
                len,
                max: self.max_detail_len,
            });
        }

        let mut entries = self.entries.write().await;
        entries.push_back(entry);
        let mut evicted = 0;
        while entries.len() > self.capacity {
            entries.pop_front();
            evicted += 1;
        }
        drop(entries);
        Ok(evicted)
    }

    /// Returns one page of retained entries, newest first.
    ///
    /// When `group_id` is given, only that group's retained entries are
    /// considered. `page` is 1-based (0 is treated as 1) and `page_size` is
    /// clamped to `1..=capacity`.
    pub async fn recent(
        &self,
        group_id: Option<&GroupId>,
        page: usize,
        page_size: usize,
    ) -> Vec<ActivityLogEntry> {
        let page_size = page_size.clamp(1, self.capacity);
        let skip = page.max(1).saturating_sub(1).saturating_mul(page_size);
        let entries = self.entries.read().await;
        entries
            .iter()
            .rev()
            .filter(|entry| group_id.is_none_or(|group| entry.group_id == *group))
            .skip(skip)
            .take(page_size)
            .cloned()
            .collect()
    }

    /// Number of retained entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns `true` if nothing is retained.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
