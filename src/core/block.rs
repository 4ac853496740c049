//! Block layout for parallel fetches
//!
//! A block is one contiguous byte range of the resource, owned by exactly one
//! fetch worker. Ranges are contiguous, non-overlapping, and their union is
//! `[0, content_length)`.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Lifecycle of a single block. Only the owning worker writes this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Pending,
    Connecting,
    Fetching,
    Done,
    Failed,
}

impl BlockState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BlockState::Connecting,
            2 => BlockState::Fetching,
            3 => BlockState::Done,
            4 => BlockState::Failed,
            _ => BlockState::Pending,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            BlockState::Pending => 0,
            BlockState::Connecting => 1,
            BlockState::Fetching => 2,
            BlockState::Done => 3,
            BlockState::Failed => 4,
        }
    }
}

/// One byte range of the download. Progress and state are atomics so the
/// owning worker can update them while the coordinator reads aggregates.
#[derive(Debug)]
pub struct Block {
    pub index: u32,
    pub start: u64,
    /// Inclusive end offset; `None` when the total length is unknown
    pub end: Option<u64>,
    completed: AtomicU64,
    state: AtomicU8,
}

impl Block {
    pub fn new(index: u32, start: u64, end: Option<u64>) -> Self {
        Self {
            index,
            start,
            end,
            completed: AtomicU64::new(0),
            state: AtomicU8::new(BlockState::Pending.as_u8()),
        }
    }

    /// The single open-ended block used when the server reports no length.
    pub fn single_unknown() -> Self {
        Self::new(0, 0, None)
    }

    /// Range length in bytes, when known.
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    pub fn bytes_completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn add_completed(&self, bytes: u64) {
        self.completed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Restore progress from a persisted snapshot.
    pub fn set_completed(&self, bytes: u64) {
        self.completed.store(bytes, Ordering::Relaxed);
    }

    /// Bytes still missing, when the range length is known.
    pub fn remaining(&self) -> Option<u64> {
        self.len().map(|len| len.saturating_sub(self.bytes_completed()))
    }

    pub fn is_done(&self) -> bool {
        matches!(self.remaining(), Some(0))
    }

    pub fn state(&self) -> BlockState {
        BlockState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: BlockState) {
        self.state.store(state.as_u8(), Ordering::Relaxed);
    }
}

/// Partition `content_length` bytes into `desired` contiguous blocks.
///
/// Block `i` gets `content_length / count` bytes, with the first
/// `content_length % count` blocks taking one extra byte. A length smaller
/// than the desired count collapses to one block per byte; zero length yields
/// no blocks at all.
pub fn split(content_length: u64, desired: usize) -> Vec<Block> {
    if content_length == 0 {
        return Vec::new();
    }
    let count = (desired.max(1) as u64).min(content_length);
    let base = content_length / count;
    let extra = content_length % count;

    let mut blocks = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    for i in 0..count {
        let len = base + u64::from(i < extra);
        blocks.push(Block::new(i as u32, start, Some(start + len - 1)));
        start += len;
    }
    blocks
}

/// Default block count based on file size, capped by the configured maximum
/// and by twice the CPU count.
pub fn default_block_count(file_size: u64, max_blocks: usize) -> usize {
    let cpu_count = num_cpus::get();

    let base_count = match file_size {
        size if size <= 1024 * 1024 => 1,            // <= 1MB: single connection
        size if size <= 10 * 1024 * 1024 => 2,       // <= 10MB: 2 blocks
        size if size <= 100 * 1024 * 1024 => 4,      // <= 100MB: 4 blocks
        size if size <= 512 * 1024 * 1024 => 8,      // <= 512MB: 8 blocks
        size if size <= 1024 * 1024 * 1024 => 12,    // <= 1GB: 12 blocks
        _ => 16,                                      // > 1GB: 16 blocks
    };

    std::cmp::min(base_count, std::cmp::min(max_blocks, cpu_count * 2)).max(1)
}
