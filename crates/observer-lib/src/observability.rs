//! Observability infrastructure for the workload observer
//!
//! Provides:
//! - Prometheus metrics (cycle duration, monitored entities, reports, errors)
//! - Structured JSON logging with tracing

use crate::models::{HealthReport, HealthState};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, info, warn};

/// Histogram buckets for cycle durations (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ObserverMetricsInner> = OnceLock::new();

struct ObserverMetricsInner {
    cycle_duration_seconds: Histogram,
    monitored_entities: IntGauge,
    health_reports: IntCounterVec,
    directory_errors: IntCounter,
    sampling_errors: IntCounter,
}

impl ObserverMetricsInner {
    fn new() -> Self {
        Self {
            cycle_duration_seconds: register_histogram!(
                "workload_observer_cycle_duration_seconds",
                "Time spent on one resolve, sample and evaluate cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_duration_seconds"),

            monitored_entities: register_int_gauge!(
                "workload_observer_monitored_entities",
                "Number of entities resolved in the last cycle"
            )
            .expect("Failed to register monitored_entities"),

            health_reports: register_int_counter_vec!(
                "workload_observer_health_reports_total",
                "Health reports emitted, by state",
                &["state"]
            )
            .expect("Failed to register health_reports"),

            directory_errors: register_int_counter!(
                "workload_observer_directory_errors_total",
                "Directory service queries that failed or timed out"
            )
            .expect("Failed to register directory_errors"),

            sampling_errors: register_int_counter!(
                "workload_observer_sampling_errors_total",
                "Metric sampling calls that failed unexpectedly"
            )
            .expect("Failed to register sampling_errors"),
        }
    }
}

/// Observer metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share it.
#[derive(Clone)]
pub struct ObserverMetrics {
    _private: (),
}

impl Default for ObserverMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ObserverMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ObserverMetricsInner {
        GLOBAL_METRICS.get_or_init(ObserverMetricsInner::new)
    }

    pub fn observe_cycle_duration(&self, duration: Duration) {
        self.inner().cycle_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn set_monitored_entities(&self, count: usize) {
        self.inner().monitored_entities.set(count as i64);
    }

    pub fn inc_health_reports(&self, state: HealthState) {
        self.inner()
            .health_reports
            .with_label_values(&[state.as_str()])
            .inc();
    }

    pub fn inc_directory_errors(&self) {
        self.inner().directory_errors.inc();
    }

    pub fn inc_sampling_errors(&self) {
        self.inner().sampling_errors.inc();
    }
}

/// Structured logger for observer events
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, platform: &str) {
        info!(
            event = "observer_started",
            node = %self.node_name,
            observer_version = %version,
            platform = %platform,
            "Workload observer started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "observer_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Workload observer shutting down"
        );
    }

    pub fn log_cycle_complete(&self, entities: usize, reports: usize, duration: Duration) {
        info!(
            event = "cycle_complete",
            node = %self.node_name,
            entities = entities,
            reports = reports,
            duration_ms = duration.as_millis() as u64,
            "Monitoring cycle complete"
        );
    }

    /// Log an emitted health report
    pub fn log_health_report(&self, report: &HealthReport) {
        match report.state {
            HealthState::Ok => info!(
                event = "health_report",
                node = %self.node_name,
                entity = %report.entity.id,
                property = %report.property,
                state = report.state.as_str(),
                ttl_secs = report.ttl.as_secs(),
                "Health report cleared"
            ),
            _ => warn!(
                event = "health_report",
                node = %self.node_name,
                entity = %report.entity.id,
                property = %report.property,
                state = report.state.as_str(),
                value = ?report.value,
                ttl_secs = report.ttl.as_secs(),
                message = %report.message,
                "Health threshold breached"
            ),
        }
    }

    /// Log loss of the elevated helper's capabilities
    pub fn log_capabilities_lost(&self, details: &str) {
        error!(
            event = "capabilities_lost",
            node = %self.node_name,
            details = %details,
            "Elevated helper lost its capabilities, restart required"
        );
    }
}
