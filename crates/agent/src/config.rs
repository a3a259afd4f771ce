//! Observer configuration
//!
//! Read from an optional file named by `OBSERVER_CONFIG`, then overridden by
//! `OBSERVER_*` environment variables (`__` separates nested keys, e.g.
//! `OBSERVER_THRESHOLDS__CPU_PERCENT__ERROR=90`).

use anyhow::Result;
use observer_lib::evaluator::{EvaluatorConfig, MetricThresholds};
use observer_lib::provider::{CpuMode, ProviderConfig};
use observer_lib::topology::{AppFilter, ResolverConfig, DEFAULT_RUNTIME_HOST_NAME};
use observer_lib::tree::DEFAULT_EXCLUDED_NAMES;
use observer_lib::{MonitorConfig, ObserverError, WindowMode};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "OBSERVER_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Port for health and metrics endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// JSON description of the deployed topology
    #[serde(default)]
    pub topology_file: Option<PathBuf>,

    /// Seconds between the start of two monitoring cycles
    #[serde(default = "default_run_interval")]
    pub run_interval_secs: u64,

    /// Seconds CPU is sampled per entity and cycle
    #[serde(default = "default_monitor_duration")]
    pub monitor_duration_secs: u64,

    #[serde(default)]
    pub window_mode: WindowMode,

    /// Circular window capacity, defaults to 5
    #[serde(default)]
    pub data_capacity: Option<usize>,

    #[serde(default = "default_true")]
    pub enable_child_process_monitoring: bool,

    #[serde(default = "default_true")]
    pub enable_concurrent_monitoring: bool,

    #[serde(default)]
    pub max_concurrency: Option<usize>,

    #[serde(default = "default_report_ttl")]
    pub health_report_ttl_secs: u64,

    #[serde(default = "default_source_id")]
    pub health_source_id: String,

    #[serde(default = "default_runtime_host")]
    pub runtime_host_process_name: String,

    #[serde(default)]
    pub elevated_helper_path: Option<PathBuf>,

    #[serde(default)]
    pub enable_resource_governance: bool,

    #[serde(default)]
    pub private_working_set: bool,

    #[serde(default)]
    pub cpu_mode: CpuMode,

    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    #[serde(default = "default_excluded_children")]
    pub excluded_child_names: Vec<String>,

    /// Applications to monitor, `*` or `all` for every application
    #[serde(default)]
    pub app_include: Vec<String>,

    #[serde(default)]
    pub app_exclude: Vec<String>,

    #[serde(default)]
    pub thresholds: MetricThresholds,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_run_interval() -> u64 {
    60
}

fn default_monitor_duration() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

fn default_report_ttl() -> u64 {
    300
}

fn default_source_id() -> String {
    "AppObserver".to_string()
}

fn default_runtime_host() -> String {
    DEFAULT_RUNTIME_HOST_NAME.to_string()
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_excluded_children() -> Vec<String> {
    DEFAULT_EXCLUDED_NAMES.iter().map(|s| s.to_string()).collect()
}

impl AgentConfig {
    /// Load configuration from the file named by `OBSERVER_CONFIG` (if any)
    /// and the environment
    pub fn load() -> Result<Self> {
        let file = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::from_sources(file.as_deref())
    }

    pub fn from_sources(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("OBSERVER")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("app_include")
                    .with_list_parse_key("app_exclude")
                    .with_list_parse_key("excluded_child_names")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Reject settings the observer cannot run with
    pub fn validate(&self) -> Result<(), ObserverError> {
        if self.node_name.trim().is_empty() {
            return Err(ObserverError::InvalidConfig("node_name is empty".to_string()));
        }
        if self.run_interval_secs == 0 {
            return Err(ObserverError::InvalidConfig(
                "run_interval_secs must be positive".to_string(),
            ));
        }
        if self.window_mode == WindowMode::Circular && self.data_capacity == Some(0) {
            return Err(ObserverError::InvalidConfig(
                "data_capacity must be positive in circular mode".to_string(),
            ));
        }
        self.thresholds.validate()
    }

    pub fn run_interval(&self) -> Duration {
        Duration::from_secs(self.run_interval_secs)
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            proc_root: self.proc_root.clone(),
            cpu_mode: self.cpu_mode,
            elevated_helper: self.elevated_helper_path.clone(),
            excluded_child_names: self.excluded_child_names.clone(),
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            enable_child_process_monitoring: self.enable_child_process_monitoring,
            enable_concurrency: self.enable_concurrent_monitoring,
            max_concurrency: self.max_concurrency,
            runtime_host_process_name: self.runtime_host_process_name.clone(),
            enable_resource_governance: self.enable_resource_governance,
            ..ResolverConfig::default()
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        let defaults = MonitorConfig::default();
        MonitorConfig {
            node_name: self.node_name.clone(),
            monitor_duration: Duration::from_secs(self.monitor_duration_secs),
            window_mode: self.window_mode,
            data_capacity: self.data_capacity.unwrap_or(defaults.data_capacity),
            thresholds: self.thresholds,
            app_filter: AppFilter::new(self.app_include.clone(), self.app_exclude.clone()),
            private_working_set: self.private_working_set,
            evaluator: EvaluatorConfig {
                source_id: self.health_source_id.clone(),
                ttl: Duration::from_secs(self.health_report_ttl_secs),
            },
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::from_sources(None).unwrap();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.run_interval_secs, 60);
        assert_eq!(config.window_mode, WindowMode::Circular);
        assert!(config.enable_child_process_monitoring);
        assert_eq!(config.runtime_host_process_name, "Fabric");
        assert!(config.validate().is_ok());

        let monitor = config.monitor_config();
        assert_eq!(monitor.data_capacity, 5);
        assert!(monitor.app_filter.includes_all());
        assert_eq!(monitor.evaluator.ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_file_settings() {
        let file = write_config(
            r#"
node_name = "node-7"
monitor_duration_secs = 5
window_mode = "duration_bounded"
app_include = ["fabric:/Voting"]

[thresholds.cpu_percent]
error = 90.0
warning = 70.0

[thresholds.memory_mb]
warning = 1024.0
"#,
        );
        let config = AgentConfig::from_sources(Some(file.path())).unwrap();
        assert_eq!(config.node_name, "node-7");
        assert_eq!(config.thresholds.cpu_percent.error, 90.0);
        assert_eq!(config.thresholds.memory_mb.error, 0.0);
        assert_eq!(config.thresholds.memory_mb.warning, 1024.0);

        let monitor = config.monitor_config();
        assert_eq!(monitor.monitor_duration, Duration::from_secs(5));
        assert_eq!(monitor.app_filter.directory_filter(), Some("fabric:/Voting"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_cpu_threshold_rejected() {
        let file = write_config(
            r#"
[thresholds.cpu_percent]
error = 150.0
"#,
        );
        let config = AgentConfig::from_sources(Some(file.path())).unwrap();
        let error = config.validate().unwrap_err();
        assert!(error.is_fatal());
    }

    #[test]
    fn test_zero_capacity_and_interval_rejected() {
        let file = write_config("data_capacity = 0\n");
        let config = AgentConfig::from_sources(Some(file.path())).unwrap();
        assert!(matches!(config.validate(), Err(ObserverError::InvalidConfig(_))));

        let file = write_config("run_interval_secs = 0\n");
        let config = AgentConfig::from_sources(Some(file.path())).unwrap();
        assert!(matches!(config.validate(), Err(ObserverError::InvalidConfig(_))));
    }
}
