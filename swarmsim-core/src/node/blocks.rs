//! Per-node block completion store.

use parking_lot::Mutex;
use rand::Rng;

/// Completion value reported for a block that has not been attempted.
pub const MISSING: f64 = -1.0;
/// Completion value reported for a block whose reservation is being made.
pub const RESERVED: f64 = -0.5;
/// Completion value reported for a finished block.
pub const COMPLETE: f64 = 1.0;

/// State of one block on one node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BlockState {
    Missing,
    /// Claimed by a download job; bandwidth negotiation or transfer start pending
    Reserved,
    /// Transfer under way, fraction in `0.0..1.0`
    Transferring(f64),
    Complete,
}

impl BlockState {
    /// Numeric completion value as exposed on the status surface.
    pub fn completion(self) -> f64 {
        match self {
            BlockState::Missing => MISSING,
            BlockState::Reserved => RESERVED,
            BlockState::Transferring(fraction) => fraction,
            BlockState::Complete => COMPLETE,
        }
    }
}

/// Fixed-size completion map guarded by a single lock.
///
/// Claiming a block moves it from `Missing` to `Reserved` under the lock, so
/// two download jobs on the same node can never hold the same block.
#[derive(Debug)]
pub struct BlockStore {
    blocks: Mutex<Vec<BlockState>>,
}

impl BlockStore {
    /// Creates a store with every block missing.
    pub fn empty(block_count: u32) -> Self {
        Self {
            blocks: Mutex::new(vec![BlockState::Missing; block_count as usize]),
        }
    }

    /// Creates a store with every block complete.
    pub fn complete(block_count: u32) -> Self {
        Self {
            blocks: Mutex::new(vec![BlockState::Complete; block_count as usize]),
        }
    }

    pub fn block_count(&self) -> u32 {
        self.blocks.lock().len() as u32
    }

    /// State of a block; out-of-range indices read as missing.
    pub fn state(&self, index: u32) -> BlockState {
        self.blocks
            .lock()
            .get(index as usize)
            .copied()
            .unwrap_or(BlockState::Missing)
    }

    /// Completion value of a block, `-1` when absent.
    pub fn completion(&self, index: u32) -> f64 {
        self.state(index).completion()
    }

    pub fn is_complete(&self, index: u32) -> bool {
        self.state(index) == BlockState::Complete
    }

    /// Completion value for every block in index order.
    pub fn snapshot(&self) -> Vec<f64> {
        self.blocks
            .lock()
            .iter()
            .map(|state| state.completion())
            .collect()
    }

    /// Sum of non-negative completion values divided by the block count.
    pub fn progress(&self) -> f64 {
        let blocks = self.blocks.lock();
        if blocks.is_empty() {
            return COMPLETE;
        }
        let total: f64 = blocks
            .iter()
            .map(|state| state.completion().max(0.0))
            .sum();
        total / blocks.len() as f64
    }

    /// True when every block is complete.
    pub fn all_complete(&self) -> bool {
        self.blocks
            .lock()
            .iter()
            .all(|state| *state == BlockState::Complete)
    }

    pub fn missing_count(&self) -> usize {
        self.blocks
            .lock()
            .iter()
            .filter(|state| **state == BlockState::Missing)
            .count()
    }

    /// Picks a missing block and claims it as reserved.
    ///
    /// Probes `block_count` random indices, then falls back to the first
    /// missing index in order. Returns `None` only when nothing is missing.
    pub fn claim_missing<R: Rng>(&self, rng: &mut R) -> Option<u32> {
        let mut blocks = self.blocks.lock();
        let count = blocks.len();
        if count == 0 {
            return None;
        }

        let probed = (0..count)
            .map(|_| rng.random_range(0..count))
            .find(|&index| blocks[index] == BlockState::Missing);

        let index = probed.or_else(|| {
            blocks
                .iter()
                .position(|state| *state == BlockState::Missing)
        })?;

        blocks[index] = BlockState::Reserved;
        Some(index as u32)
    }

    /// Records transfer progress for a claimed block.
    pub fn set_progress(&self, index: u32, fraction: f64) {
        let state = if fraction >= COMPLETE {
            BlockState::Complete
        } else {
            BlockState::Transferring(fraction.max(0.0))
        };
        self.set(index, state);
    }

    pub fn mark_complete(&self, index: u32) {
        self.set(index, BlockState::Complete);
    }

    /// Reverts a block to missing so a later job can retry it.
    pub fn clear(&self, index: u32) {
        self.set(index, BlockState::Missing);
    }

    fn set(&self, index: u32, state: BlockState) {
        if let Some(slot) = self.blocks.lock().get_mut(index as usize) {
            *slot = state;
        }
    }
}
