//! Per-platform process metrics
//!
//! One [`MetricsProvider`] implementation is picked at startup for the host
//! OS and shared for the life of the agent. Linux reads procfs directly;
//! other platforms go through `sysinfo`.
//!
//! Expected failures (process gone, pid reused, access denied) come back as
//! [`SENTINEL`](crate::error::SENTINEL). `Err` is reserved for unexpected
//! failures and for capability loss of the elevated helper.

mod cpu;
mod helper;
mod ports;
mod snapshot;

#[cfg(target_os = "linux")]
mod procfs;
#[cfg(not(target_os = "linux"))]
mod portable;

#[cfg(all(test, target_os = "linux"))]
mod tests;

pub use cpu::{
    clamped_delta, logical_processors, tick_cpu_percent, wall_clock_cpu_percent, CpuMode,
    CpuReading, CpuTracker, FIRST_SAMPLE_DELAY,
};
pub use helper::{interpret_output, ElevatedHelper, HELPER_TIMEOUT};
pub use ports::{parse_port_range, parse_socket_table, socket_inode, SocketEntry};
pub use snapshot::{ProcessEntry, ProcessSnapshot};

#[cfg(not(target_os = "linux"))]
pub use portable::SysinfoProvider;
#[cfg(target_os = "linux")]
pub use procfs::{capture_snapshot, parse_pid_stat, PidStat, ProcfsProvider};

use crate::error::Result;
use crate::models::ChildProcessInfo;
use crate::tree::DEFAULT_EXCLUDED_NAMES;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use async_trait::async_trait;

/// Process metrics capability set, identical on every platform
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// Short name of the backing implementation
    fn platform(&self) -> &'static str;

    /// CPU usage since the previous call for this pid, as a percentage of
    /// the whole machine. Sentinel when the process is gone or its name no
    /// longer matches `expected_name`.
    async fn cpu_percent(&self, pid: u32, expected_name: Option<&str>) -> Result<f64>;

    /// Resident memory in MB, or only the private part when `private`
    async fn working_set_mb(&self, pid: u32, private: bool) -> Result<f64>;

    async fn allocated_handles(&self, pid: u32) -> Result<f64>;

    async fn active_ports(&self, pid: u32) -> Result<f64>;

    async fn ephemeral_ports(&self, pid: u32) -> Result<f64>;

    async fn process_name(&self, pid: u32) -> Option<String>;

    async fn process_start_time(&self, pid: u32) -> Option<DateTime<Utc>>;

    /// Bounded descendants of `pid`, empty when there are none
    async fn child_processes(&self, pid: u32, cancel: &CancellationToken) -> Vec<ChildProcessInfo>;

    /// Process table for one cycle, when the platform can build one cheaply
    async fn snapshot(&self) -> Option<Arc<ProcessSnapshot>> {
        None
    }

    /// Names never reported as descendants
    fn excluded_child_names(&self) -> &[String];

    /// Drop per-pid state kept between calls
    fn forget(&self, _pid: u32) {}
}

/// Provider settings
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Root of the proc filesystem (Linux only)
    pub proc_root: PathBuf,
    pub cpu_mode: CpuMode,
    /// Privileged helper used for handle counts
    pub elevated_helper: Option<PathBuf>,
    pub excluded_child_names: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            cpu_mode: CpuMode::default(),
            elevated_helper: None,
            excluded_child_names: DEFAULT_EXCLUDED_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Create the provider for the host platform
pub fn create_provider(config: &ProviderConfig) -> Arc<dyn MetricsProvider> {
    #[cfg(target_os = "linux")]
    {
        tracing::info!(
            proc_root = %config.proc_root.display(),
            cpu_mode = ?config.cpu_mode,
            elevated_helper = config.elevated_helper.is_some(),
            "Using procfs metrics provider"
        );
        Arc::new(ProcfsProvider::new(config))
    }

    #[cfg(not(target_os = "linux"))]
    {
        tracing::info!("Using sysinfo metrics provider");
        Arc::new(SysinfoProvider::new(config))
    }
}
