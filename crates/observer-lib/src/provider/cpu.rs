//! CPU usage derivation
//!
//! Two formulas are supported:
//! - raw ticks: `process_ticks_delta / system_ticks_delta × 100`
//! - wall clock: `processor_time_delta / wall_delta / logical_cpus × 100`
//!
//! Counters are monotonic but two reads can race, so every delta is clamped
//! at zero instead of wrapping.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Pause before re-sampling a process seen for the first time
pub const FIRST_SAMPLE_DELAY: Duration = Duration::from_millis(50);

/// Which derivation a provider uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuMode {
    #[default]
    Ticks,
    WallClock,
}

/// Difference of two monotonic counters, zero if `current` went backwards
pub fn clamped_delta(current: u64, previous: u64) -> u64 {
    current.saturating_sub(previous)
}

/// Percent of total machine CPU from raw tick counters
pub fn tick_cpu_percent(previous: &CpuReading, current: &CpuReading) -> f64 {
    let system = clamped_delta(current.system_ticks, previous.system_ticks);
    if system == 0 {
        return 0.0;
    }
    let process = clamped_delta(current.process_ticks, previous.process_ticks);
    (process as f64 / system as f64 * 100.0).min(100.0)
}

/// Percent of total machine CPU from processor time over wall time
pub fn wall_clock_cpu_percent(
    previous: &CpuReading,
    current: &CpuReading,
    logical_processors: usize,
) -> f64 {
    let wall = current.wall.saturating_duration_since(previous.wall);
    if wall.is_zero() || logical_processors == 0 {
        return 0.0;
    }
    let used = current.processor_time.saturating_sub(previous.processor_time);
    (used.as_secs_f64() / wall.as_secs_f64() / logical_processors as f64 * 100.0).min(100.0)
}

/// One observation of a process's CPU counters
#[derive(Debug, Clone, Copy)]
pub struct CpuReading {
    /// utime + stime of the process, in clock ticks
    pub process_ticks: u64,
    /// Sum of all CPU time on the machine, in clock ticks
    pub system_ticks: u64,
    /// Process CPU time as a duration
    pub processor_time: Duration,
    pub wall: Instant,
    /// Process start marker, changes when the pid is reused
    pub start_marker: u64,
}

/// Keeps the previous reading per pid so consecutive calls yield a delta
#[derive(Debug)]
pub struct CpuTracker {
    mode: CpuMode,
    logical_processors: usize,
    previous: DashMap<u32, CpuReading>,
}

impl CpuTracker {
    pub fn new(mode: CpuMode, logical_processors: usize) -> Self {
        Self {
            mode,
            logical_processors: logical_processors.max(1),
            previous: DashMap::new(),
        }
    }

    /// Store `reading` and return the usage since the previous one.
    ///
    /// `None` means there was no usable previous reading (first call, or the
    /// pid now belongs to a different process).
    pub fn record(&self, pid: u32, reading: CpuReading) -> Option<f64> {
        match self.previous.insert(pid, reading) {
            Some(prev) if prev.start_marker == reading.start_marker => {
                Some(self.percent(&prev, &reading))
            }
            _ => None,
        }
    }

    pub fn percent(&self, previous: &CpuReading, current: &CpuReading) -> f64 {
        match self.mode {
            CpuMode::Ticks => tick_cpu_percent(previous, current),
            CpuMode::WallClock => wall_clock_cpu_percent(previous, current, self.logical_processors),
        }
    }

    pub fn forget(&self, pid: u32) {
        self.previous.remove(&pid);
    }

    pub fn tracked(&self) -> usize {
        self.previous.len()
    }

    pub fn mode(&self) -> CpuMode {
        self.mode
    }
}

/// Logical processors visible to this process
pub fn logical_processors() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(process_ticks: u64, system_ticks: u64, wall: Instant) -> CpuReading {
        CpuReading {
            process_ticks,
            system_ticks,
            processor_time: Duration::from_millis(process_ticks * 10),
            wall,
            start_marker: 7,
        }
    }

    #[test]
    fn test_clamped_delta_never_wraps() {
        assert_eq!(clamped_delta(100, 40), 60);
        assert_eq!(clamped_delta(40, 100), 0);
        assert_eq!(clamped_delta(0, u64::MAX), 0);
    }

    #[test]
    fn test_tick_percent() {
        let now = Instant::now();
        let prev = reading(100, 1_000, now);
        let cur = reading(150, 1_200, now);
        assert!((tick_cpu_percent(&prev, &cur) - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_tick_percent_with_skewed_counters_is_zero() {
        let now = Instant::now();
        let prev = reading(500, 1_000, now);
        let cur = reading(400, 1_100, now);
        assert_eq!(tick_cpu_percent(&prev, &cur), 0.0);

        let backwards_system = reading(600, 900, now);
        assert_eq!(tick_cpu_percent(&prev, &backwards_system), 0.0);
    }

    #[test]
    fn test_wall_clock_percent() {
        let start = Instant::now();
        let prev = CpuReading {
            processor_time: Duration::from_millis(1_000),
            ..reading(0, 0, start)
        };
        let cur = CpuReading {
            processor_time: Duration::from_millis(1_500),
            ..reading(0, 0, start + Duration::from_secs(1))
        };
        // 0.5s of CPU in 1s of wall time on 4 cpus
        let pct = wall_clock_cpu_percent(&prev, &cur, 4);
        assert!((pct - 12.5).abs() < 1e-9);
    }

    #[test]
    fn test_tracker_first_reading_has_no_value() {
        let tracker = CpuTracker::new(CpuMode::Ticks, 2);
        let now = Instant::now();
        assert_eq!(tracker.record(10, reading(100, 1_000, now)), None);
        assert_eq!(tracker.record(10, reading(110, 1_100, now)), Some(10.0));
    }

    #[test]
    fn test_tracker_detects_pid_reuse() {
        let tracker = CpuTracker::new(CpuMode::Ticks, 2);
        let now = Instant::now();
        tracker.record(10, reading(100, 1_000, now));

        let reused = CpuReading {
            start_marker: 99,
            ..reading(5, 1_100, now)
        };
        assert_eq!(tracker.record(10, reused), None);

        tracker.forget(10);
        assert_eq!(tracker.tracked(), 0);
    }
}
