//! Workload observer core
//!
//! This crate provides the node-resident monitoring engine:
//! - Resolution of cluster workloads to the processes that run them
//! - Per-platform process metrics (CPU, memory, handles, TCP ports)
//! - Bounded descendant process discovery
//! - Rolling usage windows and threshold evaluation into health reports
//! - Health checks and observability

pub mod error;
pub mod evaluator;
pub mod health;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod provider;
pub mod reporting;
pub mod topology;
pub mod tree;
pub mod window;

pub use error::{is_sentinel, DirectoryError, ObserverError, SENTINEL};
pub use evaluator::{EvaluatorConfig, MetricThresholds, ThresholdEvaluator, Thresholds};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use monitor::{CycleSummary, Monitor, MonitorConfig};
pub use observability::{ObserverMetrics, StructuredLogger};
pub use provider::{create_provider, MetricsProvider, ProviderConfig};
pub use reporting::{DirectoryHealthReporter, HealthReporter};
pub use topology::{AppFilter, ConnectionManager, StaticDirectory, TopologyResolver};
pub use tree::ProcessTreeWalker;
pub use window::{ResourceUsageWindow, WindowMode};
