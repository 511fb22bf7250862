//! Aggregate swarm statistics with baseline reset detection.
//!
//! The engine is recomputed from a full population scan on every registry
//! mutation. Freshly created seeds report a transfer time of zero, so when
//! every seed in the scan shows zero elapsed time the population looks like a
//! fresh start and the baseline is re-captured instead of polluting the
//! running mean with zero-duration samples.

use serde::Serialize;

/// Observation of one registered node taken during a statistics scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSample {
    pub is_seed: bool,
    /// Simulated milliseconds the node spent downloading
    pub transfer_time_ms: u64,
}

impl NodeSample {
    pub fn seed(transfer_time_ms: u64) -> Self {
        Self {
            is_seed: true,
            transfer_time_ms,
        }
    }

    pub fn peer(transfer_time_ms: u64) -> Self {
        Self {
            is_seed: false,
            transfer_time_ms,
        }
    }
}

/// Outcome of a recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsUpdate {
    /// Population looked freshly started; counts were re-captured.
    Rebaselined,
    /// Running aggregates were recomputed against the existing baseline.
    Recomputed,
}

/// Snapshot of swarm-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SwarmStatistics {
    /// Seeds present when the baseline was captured
    pub initial_seed_count: usize,
    /// Non-seed nodes present when the baseline was captured
    pub initial_peer_count: usize,
    /// Nodes currently registered
    pub total_node_count: usize,
    /// Mean simulated completion time over seeds that actually downloaded
    pub mean_time_to_completion_ms: u64,
    /// True once every registered node is a seed
    pub is_complete: bool,
}

impl SwarmStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes statistics from a population scan.
    ///
    /// `seed_count` is the size of the registry's seed set, which may lag or
    /// lead the per-node samples while promotions are in flight.
    pub fn update(&mut self, samples: &[NodeSample], seed_count: usize) -> StatsUpdate {
        let mut total_duration: u64 = 0;
        let mut completed: u64 = 0;
        let mut is_reset = true;

        for sample in samples.iter().filter(|sample| sample.is_seed) {
            if sample.transfer_time_ms > 0 {
                total_duration += sample.transfer_time_ms;
                completed += 1;
            }
            is_reset &= sample.transfer_time_ms == 0;
        }

        if is_reset {
            self.rebaseline(samples.len(), seed_count);
            return StatsUpdate::Rebaselined;
        }

        self.mean_time_to_completion_ms = if completed == 0 {
            0
        } else {
            total_duration / completed
        };
        self.total_node_count = samples.len();
        self.is_complete = samples.len() == seed_count;
        StatsUpdate::Recomputed
    }

    fn rebaseline(&mut self, node_count: usize, seed_count: usize) {
        self.total_node_count = node_count;
        self.initial_seed_count = seed_count;
        self.initial_peer_count = node_count.saturating_sub(seed_count);
        self.mean_time_to_completion_ms = 0;
        self.is_complete = false;
    }
}
