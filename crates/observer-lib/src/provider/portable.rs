//! Metrics provider for hosts without procfs
//!
//! Backed by `sysinfo`. Names and start times are looked up per process.
//! Handle and port counts have no portable source and come back as the
//! sentinel unless an elevated helper is configured for handles.

use super::helper::ElevatedHelper;
use super::snapshot::{ProcessEntry, ProcessSnapshot};
use super::{MetricsProvider, ProviderConfig};
use crate::error::{Result, SENTINEL};
use crate::models::ChildProcessInfo;
use crate::tree::ProcessTreeWalker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use std::sync::Mutex;
use sysinfo::{Pid, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tokio_util::sync::CancellationToken;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub struct SysinfoProvider {
    system: Mutex<System>,
    logical_processors: usize,
    /// Pids with a CPU baseline in `system`
    primed: DashSet<u32>,
    helper: Option<ElevatedHelper>,
    excluded: Vec<String>,
}

impl SysinfoProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            system: Mutex::new(System::new()),
            logical_processors: super::logical_processors(),
            primed: DashSet::new(),
            helper: config
                .elevated_helper
                .as_ref()
                .map(|path| ElevatedHelper::new(path.clone())),
            excluded: config.excluded_child_names.clone(),
        }
    }

    /// Refresh one process and read from it. `None` when it is gone.
    fn with_process<T>(&self, pid: u32, f: impl FnOnce(&sysinfo::Process) -> T) -> Option<T> {
        let mut system = self.system.lock().ok()?;
        let pid = Pid::from_u32(pid);
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(f)
    }

    fn table(&self) -> ProcessSnapshot {
        let mut system = System::new();
        system.refresh_processes();
        let entries = system.processes().iter().map(|(pid, p)| ProcessEntry {
            pid: pid.as_u32(),
            ppid: p.parent().map(|pp| pp.as_u32()).unwrap_or(0),
            name: p.name().to_string(),
            start_time: DateTime::<Utc>::from_timestamp(p.start_time() as i64, 0),
        });
        ProcessSnapshot::from_entries(entries)
    }
}

#[async_trait]
impl MetricsProvider for SysinfoProvider {
    fn platform(&self) -> &'static str {
        "sysinfo"
    }

    async fn cpu_percent(&self, pid: u32, expected_name: Option<&str>) -> Result<f64> {
        let name = self.with_process(pid, |p| p.name().to_string());
        let Some(name) = name else {
            self.primed.remove(&pid);
            return Ok(SENTINEL);
        };
        if let Some(expected) = expected_name {
            if !name.eq_ignore_ascii_case(expected) {
                self.primed.remove(&pid);
                return Ok(SENTINEL);
            }
        }

        // sysinfo derives usage from the previous refresh of the same pid
        if self.primed.insert(pid) {
            tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
        }

        match self.with_process(pid, |p| p.cpu_usage() as f64) {
            Some(usage) => Ok((usage / self.logical_processors as f64).min(100.0)),
            None => {
                self.primed.remove(&pid);
                Ok(SENTINEL)
            }
        }
    }

    async fn working_set_mb(&self, pid: u32, _private: bool) -> Result<f64> {
        Ok(self
            .with_process(pid, |p| p.memory() as f64 / BYTES_PER_MB)
            .unwrap_or(SENTINEL))
    }

    async fn allocated_handles(&self, pid: u32) -> Result<f64> {
        match &self.helper {
            Some(helper) => helper.query(pid).await,
            None => Ok(SENTINEL),
        }
    }

    async fn active_ports(&self, _pid: u32) -> Result<f64> {
        Ok(SENTINEL)
    }

    async fn ephemeral_ports(&self, _pid: u32) -> Result<f64> {
        Ok(SENTINEL)
    }

    async fn process_name(&self, pid: u32) -> Option<String> {
        self.with_process(pid, |p| p.name().to_string())
    }

    async fn process_start_time(&self, pid: u32) -> Option<DateTime<Utc>> {
        self.with_process(pid, |p| p.start_time())
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0))
    }

    async fn child_processes(&self, pid: u32, cancel: &CancellationToken) -> Vec<ChildProcessInfo> {
        let table = self.table();
        ProcessTreeWalker::new(&table)
            .with_excluded(&self.excluded)
            .descendants(pid, cancel)
    }

    fn excluded_child_names(&self) -> &[String] {
        &self.excluded
    }

    fn forget(&self, pid: u32) {
        self.primed.remove(&pid);
    }
}
