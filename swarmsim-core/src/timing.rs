//! Clock and duration model for simulated transfers.
//!
//! Converts (block size, reserved bandwidth, dilation ratio) into real sleep
//! durations and progress increments, and converts real elapsed time back
//! into simulated milliseconds.

use std::time::Duration;

const MILLIS_PER_SECOND: f64 = 1000.0;
const NANOS_PER_MILLI: f64 = 1_000_000.0;

/// Undilated time, in milliseconds, to move `block_size` bytes at `bandwidth` bytes/sec.
///
/// Returns `f64::INFINITY` for non-positive bandwidth.
pub fn transfer_duration_ms(block_size: u64, bandwidth: f64) -> f64 {
    if bandwidth <= 0.0 {
        return f64::INFINITY;
    }
    block_size as f64 / bandwidth * MILLIS_PER_SECOND
}

/// Converts real elapsed time into simulated milliseconds.
pub fn simulated_millis(real: Duration, time_dilation: f64) -> u64 {
    if time_dilation <= 0.0 {
        return 0;
    }
    (real.as_nanos() as f64 / NANOS_PER_MILLI / time_dilation) as u64
}

/// Sleep plan for a single simulated block transfer.
///
/// Short transfers get coarse steps so they emit few progress updates; long
/// transfers get 100 steps so progress stays visible.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferSchedule {
    increments: u32,
    step: Duration,
}

impl TransferSchedule {
    /// Builds the schedule for a dilated duration in milliseconds.
    pub fn new(dilated_ms: f64) -> Self {
        let dilated_ms = if dilated_ms.is_finite() {
            dilated_ms.max(0.0)
        } else {
            0.0
        };

        let increments: u32 = if dilated_ms < 10.0 {
            1
        } else if dilated_ms < 100.0 {
            10
        } else {
            100
        };

        Self {
            increments,
            step: Duration::from_nanos(
                (dilated_ms * NANOS_PER_MILLI / f64::from(increments)) as u64,
            ),
        }
    }

    /// Schedule for moving one block at the reserved bandwidth.
    pub fn for_block(block_size: u64, bandwidth: f64, time_dilation: f64) -> Self {
        Self::new(transfer_duration_ms(block_size, bandwidth) * time_dilation)
    }

    /// Number of sleep steps.
    pub fn increments(&self) -> u32 {
        self.increments
    }

    /// Sleep per step.
    pub fn step(&self) -> Duration {
        self.step
    }

    /// Completion gained per step.
    pub fn increment_value(&self) -> f64 {
        1.0 / f64::from(self.increments)
    }

    /// Total real time the transfer will sleep.
    pub fn total(&self) -> Duration {
        self.step * self.increments
    }
}

/// Original estimate of total transfer time in simulated milliseconds.
///
/// Returns `None` while no progress has been made.
pub fn estimated_millis(elapsed_simulated_ms: u64, progress: f64) -> Option<u64> {
    if progress <= 0.0 || !progress.is_finite() {
        return None;
    }
    Some((100.0 * elapsed_simulated_ms as f64 / progress) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_duration() {
        // 256 KiB at 64 KiB/s takes four seconds
        assert_eq!(transfer_duration_ms(262_144, 65_536.0), 4000.0);
        assert_eq!(transfer_duration_ms(1000, 0.0), f64::INFINITY);
    }

    #[test]
    fn test_schedule_granularity() {
        let short = TransferSchedule::new(5.0);
        assert_eq!(short.increments(), 1);
        assert_eq!(short.step(), Duration::from_micros(5000));

        let medium = TransferSchedule::new(50.0);
        assert_eq!(medium.increments(), 10);
        assert_eq!(medium.step(), Duration::from_millis(5));

        let long = TransferSchedule::new(4000.0);
        assert_eq!(long.increments(), 100);
        assert_eq!(long.step(), Duration::from_millis(40));
        assert_eq!(long.total(), Duration::from_millis(4000));
    }

    #[test]
    fn test_schedule_boundaries() {
        assert_eq!(TransferSchedule::new(9.999).increments(), 1);
        assert_eq!(TransferSchedule::new(10.0).increments(), 10);
        assert_eq!(TransferSchedule::new(99.999).increments(), 10);
        assert_eq!(TransferSchedule::new(100.0).increments(), 100);
    }

    #[test]
    fn test_schedule_for_block_applies_dilation() {
        // 4000 ms undilated, 0.1 dilation -> 400 ms in 100 steps
        let schedule = TransferSchedule::for_block(262_144, 65_536.0, 0.1);
        assert_eq!(schedule.increments(), 100);
        assert_eq!(schedule.step(), Duration::from_millis(4));
        assert!((schedule.increment_value() - 0.01).abs() < f64::EPSILON);
    }

    #[test]
    fn test_degenerate_schedule_is_single_instant_step() {
        let schedule = TransferSchedule::new(f64::INFINITY);
        assert_eq!(schedule.increments(), 1);
        assert_eq!(schedule.step(), Duration::ZERO);
    }

    #[test]
    fn test_simulated_millis() {
        assert_eq!(simulated_millis(Duration::from_millis(50), 0.25), 200);
        assert_eq!(simulated_millis(Duration::from_secs(2), 1.0), 2000);
        assert_eq!(simulated_millis(Duration::from_secs(2), 0.0), 0);
    }

    #[test]
    fn test_estimated_millis() {
        assert_eq!(estimated_millis(1000, 0.0), None);
        assert_eq!(estimated_millis(500, 0.5), Some(100_000));
    }
}
