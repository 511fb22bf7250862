//! Centralized configuration for swarm simulations.
//!
//! All tunable parameters are defined here to avoid hard-coded values
//! scattered throughout the engine. Nodes read the configuration once, at
//! creation time; changing it mid-run never affects nodes that already exist.

use std::time::Duration;

use crate::SwarmError;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

/// Central configuration for all simulation components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct SwarmConfig {
    pub bandwidth: BandwidthConfig,
    pub file: FileConfig,
    pub simulation: SimulationConfig,
    pub reservation: ReservationPolicy,
}

/// Bandwidth ranges handed out to newly created nodes.
///
/// Seeds always receive the maximum of each range; peers receive a uniform
/// random rate inside it. All values are bytes per second.
#[derive(Debug, Clone)]
pub struct BandwidthConfig {
    pub upload_min: f64,
    pub upload_max: f64,
    pub download_min: f64,
    pub download_max: f64,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            upload_min: (256 * KIB) as f64,
            upload_max: MIB as f64,
            download_min: (5 * MIB) as f64,
            download_max: (15 * MIB) as f64,
        }
    }
}

/// Shape of the simulated file.
#[derive(Debug, Clone)]
pub struct FileConfig {
    /// Total size of the simulated file in bytes
    pub file_size: u64,
    /// Size of a single block in bytes
    pub block_size: u64,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            file_size: 100 * MIB,
            block_size: 256 * KIB,
        }
    }
}

impl FileConfig {
    /// Number of blocks the file is split into, rounded up.
    pub fn block_count(&self) -> u32 {
        if self.block_size == 0 {
            return 0;
        }
        self.file_size.div_ceil(self.block_size) as u32
    }
}

/// Runtime behaviour of the simulation engine.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Scalar applied to every computed duration (0.1 = ten times faster)
    pub time_dilation: f64,
    /// Concurrent block jobs per node
    pub worker_pool_size: usize,
    /// Random (block, peer) pairs tried per selection round
    pub max_selection_attempts: u32,
    /// Lower bound of the jittered pause after a fruitless selection round
    pub retry_backoff_min: Duration,
    /// Upper bound of the jittered pause after a fruitless selection round
    pub retry_backoff_max: Duration,
    /// Per-subscriber event channel capacity
    pub event_buffer: usize,
    /// Pause between flagging a node disposed and draining its pool
    pub dispose_grace: Duration,
    /// Deterministic seed for reproducible block and peer selection
    pub deterministic_seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            time_dilation: 0.1,
            worker_pool_size: 8,
            max_selection_attempts: 100,
            retry_backoff_min: Duration::from_millis(5),
            retry_backoff_max: Duration::from_millis(25),
            event_buffer: 1024,
            dispose_grace: Duration::from_millis(100),
            deterministic_seed: None,
        }
    }
}

impl SimulationConfig {
    /// Creates a configuration for fast deterministic testing.
    pub fn deterministic_testing() -> Self {
        Self {
            time_dilation: 0.0005,
            worker_pool_size: 8,
            max_selection_attempts: 100,
            retry_backoff_min: Duration::from_millis(1),
            retry_backoff_max: Duration::from_millis(3),
            event_buffer: 256,
            dispose_grace: Duration::from_millis(5),
            deterministic_seed: Some(42),
        }
    }
}

/// Upload reservation policy applied by a responding node.
///
/// A grant is capped at `max_upload / max_share_divisor` and refused when it
/// would not exceed `max_upload / min_share_divisor`.
#[derive(Debug, Clone)]
pub struct ReservationPolicy {
    pub max_share_divisor: f64,
    pub min_share_divisor: f64,
}

impl Default for ReservationPolicy {
    fn default() -> Self {
        Self {
            max_share_divisor: 4.0,
            min_share_divisor: 6.0,
        }
    }
}

impl ReservationPolicy {
    /// Largest slice a single (peer, block) reservation may take.
    pub fn cap(&self, max_upload: f64) -> f64 {
        max_upload / self.max_share_divisor
    }

    /// Grants must be strictly above this value.
    pub fn floor(&self, max_upload: f64) -> f64 {
        max_upload / self.min_share_divisor
    }
}

impl SwarmConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("SWARMSIM_FILE_SIZE") {
            if let Ok(bytes) = value.parse::<u64>() {
                config.file.file_size = bytes;
            }
        }

        if let Ok(value) = std::env::var("SWARMSIM_BLOCK_SIZE") {
            if let Ok(bytes) = value.parse::<u64>() {
                config.file.block_size = bytes;
            }
        }

        if let Ok(value) = std::env::var("SWARMSIM_TIME_DILATION") {
            if let Ok(ratio) = value.parse::<f64>() {
                config.simulation.time_dilation = ratio;
            }
        }

        if let Ok(value) = std::env::var("SWARMSIM_POOL_SIZE") {
            if let Ok(size) = value.parse::<usize>() {
                config.simulation.worker_pool_size = size;
            }
        }

        if let Ok(value) = std::env::var("SWARMSIM_SEED") {
            if let Ok(seed) = value.parse::<u64>() {
                config.simulation.deterministic_seed = Some(seed);
            }
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Small file, fast dilation and a fixed seed so scenarios finish in
    /// milliseconds and are reproducible per node.
    pub fn for_testing() -> Self {
        Self {
            file: FileConfig {
                file_size: 16 * 64 * KIB,
                block_size: 64 * KIB,
            },
            simulation: SimulationConfig::deterministic_testing(),
            ..Default::default()
        }
    }

    /// Checks the configuration for values the engine cannot work with.
    ///
    /// # Errors
    /// - `SwarmError::Configuration` - Zero sizes, inverted ranges, or a
    ///   non-positive dilation ratio
    pub fn validate(&self) -> Result<(), SwarmError> {
        let invalid = |reason: String| Err(SwarmError::Configuration { reason });

        if self.file.block_size == 0 {
            return invalid("block size cannot be zero".to_string());
        }
        if self.file.file_size == 0 {
            return invalid("file size cannot be zero".to_string());
        }
        let bw = &self.bandwidth;
        if bw.upload_min <= 0.0 || bw.download_min <= 0.0 {
            return invalid("bandwidth minimums must be positive".to_string());
        }
        if bw.upload_min > bw.upload_max {
            return invalid(format!(
                "upload range is inverted: {} > {}",
                bw.upload_min, bw.upload_max
            ));
        }
        if bw.download_min > bw.download_max {
            return invalid(format!(
                "download range is inverted: {} > {}",
                bw.download_min, bw.download_max
            ));
        }
        let dilation = self.simulation.time_dilation;
        if dilation.is_nan() || dilation <= 0.0 {
            return invalid(format!(
                "time dilation must be positive, got {}",
                self.simulation.time_dilation
            ));
        }
        if self.simulation.worker_pool_size == 0 {
            return invalid("worker pool size cannot be zero".to_string());
        }
        if self.simulation.retry_backoff_min > self.simulation.retry_backoff_max {
            return invalid("retry backoff range is inverted".to_string());
        }
        if self.reservation.min_share_divisor < self.reservation.max_share_divisor {
            return invalid(format!(
                "reservation floor divisor {} is below cap divisor {}",
                self.reservation.min_share_divisor, self.reservation.max_share_divisor
            ));
        }
        Ok(())
    }
}
