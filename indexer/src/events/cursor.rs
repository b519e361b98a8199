//! Block cursor for the realtime sync poller.
//!
//! Tracks the last block handed to a sync job and the chain head, and cuts
//! the gap into bounded ranges.

use serde::{Deserialize, Serialize};

/// An inclusive block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRange {
    /// First block.
    pub from_block: u64,
    /// Last block, inclusive.
    pub to_block: u64,
}

impl BlockRange {
    /// Creates a range.
    #[must_use]
    pub const fn new(from_block: u64, to_block: u64) -> Self {
        Self {
            from_block,
            to_block,
        }
    }

    /// Number of blocks covered.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.to_block.saturating_sub(self.from_block).saturating_add(1)
    }

    /// Returns true if the range is inverted.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.to_block < self.from_block
    }

    /// Dedup key of the sync job covering this range.
    #[must_use]
    pub fn job_id(&self) -> String {
        format!("{}-{}", self.from_block, self.to_block)
    }
}

/// Cursor over the chain head.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Latest block reported by the node.
    pub head_block: u64,

    /// Last block already handed to a sync job.
    pub last_synced: u64,

    /// Number of ranges emitted.
    pub ranges_emitted: u64,
}

impl SyncCursor {
    /// Creates a cursor that resumes after `last_synced`.
    #[must_use]
    pub const fn new(last_synced: u64) -> Self {
        Self {
            head_block: last_synced,
            last_synced,
            ranges_emitted: 0,
        }
    }

    /// Updates the head block. The head never moves backwards.
    pub fn update_head(&mut self, head_block: u64) {
        if head_block > self.head_block {
            self.head_block = head_block;
        }
    }

    /// Returns the number of blocks not yet handed out.
    #[must_use]
    pub const fn pending_count(&self) -> u64 {
        self.head_block.saturating_sub(self.last_synced)
    }

    /// Returns true if there are blocks to sync.
    #[must_use]
    pub const fn has_pending(&self) -> bool {
        self.head_block > self.last_synced
    }

    /// Returns the next range of at most `max_blocks` blocks and advances.
    pub fn next_range(&mut self, max_blocks: u64) -> Option<BlockRange> {
        if !self.has_pending() || max_blocks == 0 {
            return None;
        }
        let from_block = self.last_synced.saturating_add(1);
        let to_block = self
            .head_block
            .min(from_block.saturating_add(max_blocks - 1));
        self.last_synced = to_block;
        self.ranges_emitted = self.ranges_emitted.saturating_add(1);
        Some(BlockRange::new(from_block, to_block))
    }

    /// Drains every pending range.
    pub fn drain_ranges(&mut self, max_blocks: u64) -> Vec<BlockRange> {
        std::iter::from_fn(|| self.next_range(max_blocks)).collect()
    }
}
