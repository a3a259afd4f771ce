//! Bounded rolling sample windows
//!
//! One window exists per (entity, metric) pair. Samples accumulate over a
//! single monitoring pass and are cleared once the window has been evaluated.

use crate::models::MetricKind;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Samples taken per second in duration-bounded mode
pub const SAMPLES_PER_SECOND: usize = 4;

/// Circular capacity when none is configured
pub const DEFAULT_DATA_CAPACITY: usize = 5;

/// Capacity rule for a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    /// Fixed capacity, oldest sample evicted on overflow
    #[default]
    Circular,
    /// Capacity derived from monitor duration × sampling rate
    DurationBounded,
}

impl WindowMode {
    /// Capacity to allocate for a window in this mode. Never zero.
    pub fn capacity(self, data_capacity: usize, monitor_duration: Duration) -> usize {
        match self {
            WindowMode::Circular if data_capacity > 0 => data_capacity,
            WindowMode::Circular => DEFAULT_DATA_CAPACITY,
            WindowMode::DurationBounded => {
                let secs = monitor_duration.as_secs() as usize;
                if secs > 0 {
                    secs * SAMPLES_PER_SECOND
                } else {
                    SAMPLES_PER_SECOND
                }
            }
        }
    }
}

/// Rolling window of numeric samples for one entity/metric pair
#[derive(Debug, Clone)]
pub struct ResourceUsageWindow {
    id: String,
    metric: MetricKind,
    mode: WindowMode,
    capacity: usize,
    samples: VecDeque<f64>,
}

impl ResourceUsageWindow {
    /// Create a window. A zero capacity is raised to one.
    pub fn new(id: impl Into<String>, metric: MetricKind, capacity: usize, mode: WindowMode) -> Self {
        let capacity = capacity.max(1);
        Self {
            id: id.into(),
            metric,
            mode,
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a sample, evicting the oldest when full
    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Average over the current samples, `None` when empty
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Largest sample currently held
    pub fn max(&self) -> Option<f64> {
        self.samples
            .iter()
            .copied()
            .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn metric(&self) -> MetricKind {
        self.metric
    }

    pub fn mode(&self) -> WindowMode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circular_keeps_last_n_in_order() {
        let mut window = ResourceUsageWindow::new("svc:proc:1", MetricKind::CpuPercent, 5, WindowMode::Circular);
        for i in 0..8 {
            window.push(i as f64);
        }

        assert_eq!(window.len(), 5);
        let held: Vec<f64> = window.samples().collect();
        assert_eq!(held, vec![3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_duration_bounded_evicts_oldest() {
        let capacity = WindowMode::DurationBounded.capacity(0, Duration::from_secs(2));
        assert_eq!(capacity, 8);

        let mut window = ResourceUsageWindow::new("w", MetricKind::MemoryMb, capacity, WindowMode::DurationBounded);
        for i in 0..10 {
            window.push(i as f64);
        }
        assert_eq!(window.len(), 8);
        assert_eq!(window.samples().next(), Some(2.0));
    }

    #[test]
    fn test_zero_capacity_raised_to_one() {
        let mut window = ResourceUsageWindow::new("w", MetricKind::Handles, 0, WindowMode::Circular);
        assert_eq!(window.capacity(), 1);
        window.push(1.0);
        window.push(2.0);
        assert_eq!(window.samples().collect::<Vec<_>>(), vec![2.0]);
    }

    #[test]
    fn test_average_and_max_on_demand() {
        let mut window = ResourceUsageWindow::new("w", MetricKind::CpuPercent, 4, WindowMode::Circular);
        assert_eq!(window.average(), None);
        assert_eq!(window.max(), None);

        window.push(10.0);
        window.push(30.0);
        assert_eq!(window.average(), Some(20.0));
        assert_eq!(window.max(), Some(30.0));

        window.clear();
        assert!(window.is_empty());
        assert_eq!(window.average(), None);
    }

    #[test]
    fn test_capacity_rules() {
        let d = Duration::from_secs(3);
        assert_eq!(WindowMode::Circular.capacity(12, d), 12);
        assert_eq!(WindowMode::Circular.capacity(0, d), DEFAULT_DATA_CAPACITY);
        assert_eq!(WindowMode::DurationBounded.capacity(0, d), 12);
        assert_eq!(WindowMode::DurationBounded.capacity(0, Duration::ZERO), 4);
    }
}
