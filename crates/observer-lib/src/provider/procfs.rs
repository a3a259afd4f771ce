//! Linux metrics provider backed by procfs
//!
//! Reads:
//! - `/proc/<pid>/stat` for name, parent, CPU ticks and start time
//! - `/proc/stat` for system-wide ticks and boot time
//! - `/proc/<pid>/status` for resident memory
//! - `/proc/<pid>/fd` for handle counts and socket inodes
//! - `/proc/<pid>/net/tcp{,6}` for port ownership

use super::cpu::{logical_processors, CpuReading, CpuTracker, FIRST_SAMPLE_DELAY};
use super::helper::ElevatedHelper;
use super::ports::{self, SocketEntry, DEFAULT_EPHEMERAL_RANGE};
use super::snapshot::{ProcessEntry, ProcessSnapshot};
use super::{MetricsProvider, ProviderConfig};
use crate::error::{ObserverError, Result, SENTINEL};
use crate::models::ChildProcessInfo;
use crate::tree::ProcessTreeWalker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const BYTES_PER_KB: f64 = 1024.0;

/// Fields of `/proc/<pid>/stat` the provider uses
#[derive(Debug, Clone, PartialEq)]
pub struct PidStat {
    pub pid: u32,
    pub comm: String,
    pub ppid: u32,
    pub utime: u64,
    pub stime: u64,
    /// Start time in clock ticks after boot
    pub starttime: u64,
}

/// Parse `/proc/<pid>/stat`. The comm field may contain spaces and parens.
pub fn parse_pid_stat(content: &str) -> Option<PidStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    if close < open {
        return None;
    }
    let pid = content[..open].trim().parse().ok()?;
    let comm = content[open + 1..close].to_string();

    // fields after comm, starting at field 3 (state)
    let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
    if rest.len() < 20 {
        return None;
    }
    Some(PidStat {
        pid,
        comm,
        ppid: rest[1].parse().ok()?,
        utime: rest[11].parse().ok()?,
        stime: rest[12].parse().ok()?,
        starttime: rest[19].parse().ok()?,
    })
}

/// Total ticks of the aggregate `cpu` line (user through steal)
pub fn parse_system_ticks(content: &str) -> Option<u64> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let ticks: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|v| v.parse().ok())
        .collect::<Option<Vec<u64>>>()?;
    if ticks.len() < 4 {
        return None;
    }
    Some(ticks.iter().sum())
}

/// Boot time in seconds since the epoch
pub fn parse_boot_time(content: &str) -> Option<i64> {
    content
        .lines()
        .find_map(|l| l.strip_prefix("btime "))
        .and_then(|v| v.trim().parse().ok())
}

/// Value of a `Key:   123 kB` line in `/proc/<pid>/status`
pub fn parse_status_kb(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name != key {
            return None;
        }
        value.split_whitespace().next()?.parse().ok()
    })
}

/// Wall-clock start of a process from its stat start ticks
pub fn start_time_from(boot_time: i64, start_ticks: u64, clock_ticks: u64) -> Option<DateTime<Utc>> {
    let clock_ticks = clock_ticks.max(1);
    let secs = boot_time + (start_ticks / clock_ticks) as i64;
    let nanos = ((start_ticks % clock_ticks) * 1_000_000_000 / clock_ticks) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
}

/// Scheduler clock ticks per second
pub fn clock_ticks() -> u64 {
    // SAFETY: sysconf has no preconditions
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

/// Build a process snapshot from one scan of the proc root
pub fn capture_snapshot(proc_root: &Path, clock_ticks: u64) -> io::Result<ProcessSnapshot> {
    let boot_time = std::fs::read_to_string(proc_root.join("stat"))
        .ok()
        .and_then(|c| parse_boot_time(&c));

    let mut entries = Vec::new();
    for dirent in std::fs::read_dir(proc_root)? {
        let Ok(dirent) = dirent else { continue };
        let Some(pid) = dirent.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        // processes exit during the scan
        let Ok(content) = std::fs::read_to_string(dirent.path().join("stat")) else {
            continue;
        };
        let Some(stat) = parse_pid_stat(&content) else {
            continue;
        };
        entries.push(ProcessEntry {
            pid,
            ppid: stat.ppid,
            start_time: boot_time.and_then(|b| start_time_from(b, stat.starttime, clock_ticks)),
            name: stat.comm,
        });
    }

    Ok(ProcessSnapshot::from_entries(entries))
}

fn is_expected(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
    ) || e.raw_os_error() == Some(libc::ESRCH)
}

/// Metrics provider for Linux hosts
pub struct ProcfsProvider {
    proc_root: PathBuf,
    clock_ticks: u64,
    cpu: CpuTracker,
    helper: Option<ElevatedHelper>,
    excluded: Vec<String>,
}

impl ProcfsProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            proc_root: config.proc_root.clone(),
            clock_ticks: clock_ticks(),
            cpu: CpuTracker::new(config.cpu_mode, logical_processors()),
            helper: config
                .elevated_helper
                .as_ref()
                .map(|path| ElevatedHelper::new(path.clone())),
            excluded: config.excluded_child_names.clone(),
        }
    }

    /// Create a provider over a custom proc root (for testing)
    pub fn with_proc_path(proc_root: impl Into<PathBuf>) -> Self {
        Self::new(&ProviderConfig {
            proc_root: proc_root.into(),
            ..ProviderConfig::default()
        })
    }

    async fn read_proc(&self, relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(self.proc_root.join(relative)).await
    }

    /// `None` when the process is gone or unreadable
    async fn pid_stat(&self, pid: u32) -> Result<Option<PidStat>> {
        match self.read_proc(format!("{}/stat", pid)).await {
            Ok(content) => parse_pid_stat(&content)
                .map(Some)
                .ok_or_else(|| ObserverError::parse("pid stat", format!("pid {}", pid))),
            Err(e) if is_expected(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn cpu_reading(&self, pid: u32) -> Result<Option<(PidStat, CpuReading)>> {
        let Some(stat) = self.pid_stat(pid).await? else {
            return Ok(None);
        };
        let system = self.read_proc("stat").await?;
        let system_ticks = parse_system_ticks(&system)
            .ok_or_else(|| ObserverError::parse("/proc/stat", "missing aggregate cpu line"))?;

        let process_ticks = stat.utime + stat.stime;
        let reading = CpuReading {
            process_ticks,
            system_ticks,
            processor_time: Duration::from_secs_f64(process_ticks as f64 / self.clock_ticks as f64),
            wall: Instant::now(),
            start_marker: stat.starttime,
        };
        Ok(Some((stat, reading)))
    }

    async fn fd_targets(&self, pid: u32) -> io::Result<Vec<PathBuf>> {
        let mut dir = fs::read_dir(self.proc_root.join(format!("{}/fd", pid))).await?;
        let mut targets = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            // fds close while we iterate
            if let Ok(target) = fs::read_link(entry.path()).await {
                targets.push(target);
            }
        }
        Ok(targets)
    }

    async fn fd_count(&self, pid: u32) -> io::Result<usize> {
        let mut dir = fs::read_dir(self.proc_root.join(format!("{}/fd", pid))).await?;
        let mut count = 0;
        while dir.next_entry().await?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    async fn owned_sockets(&self, pid: u32) -> io::Result<(Vec<SocketEntry>, HashSet<u64>)> {
        let inodes: HashSet<u64> = self
            .fd_targets(pid)
            .await?
            .iter()
            .filter_map(|t| t.to_str().and_then(ports::socket_inode))
            .collect();

        let mut entries = ports::parse_socket_table(&self.read_proc(format!("{}/net/tcp", pid)).await?);
        match self.read_proc(format!("{}/net/tcp6", pid)).await {
            Ok(content) => entries.extend(ports::parse_socket_table(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok((entries, inodes))
    }

    async fn ephemeral_range(&self) -> (u16, u16) {
        self.read_proc("sys/net/ipv4/ip_local_port_range")
            .await
            .ok()
            .and_then(|c| ports::parse_port_range(&c))
            .unwrap_or(DEFAULT_EPHEMERAL_RANGE)
    }

    async fn capture(&self) -> Option<ProcessSnapshot> {
        let root = self.proc_root.clone();
        let ticks = self.clock_ticks;
        match tokio::task::spawn_blocking(move || capture_snapshot(&root, ticks)).await {
            Ok(Ok(snapshot)) => Some(snapshot),
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to scan process table");
                None
            }
            Err(e) => {
                warn!(error = %e, "Process table scan task failed");
                None
            }
        }
    }
}

#[async_trait]
impl MetricsProvider for ProcfsProvider {
    fn platform(&self) -> &'static str {
        "procfs"
    }

    async fn cpu_percent(&self, pid: u32, expected_name: Option<&str>) -> Result<f64> {
        let Some((stat, reading)) = self.cpu_reading(pid).await? else {
            self.cpu.forget(pid);
            return Ok(SENTINEL);
        };
        if let Some(expected) = expected_name {
            if !stat.comm.eq_ignore_ascii_case(expected) {
                debug!(pid, expected, actual = %stat.comm, "Process id was reused");
                self.cpu.forget(pid);
                return Ok(SENTINEL);
            }
        }

        if let Some(percent) = self.cpu.record(pid, reading) {
            return Ok(percent);
        }

        tokio::time::sleep(FIRST_SAMPLE_DELAY).await;
        match self.cpu_reading(pid).await? {
            Some((_, reading)) => Ok(self.cpu.record(pid, reading).unwrap_or(0.0)),
            None => {
                self.cpu.forget(pid);
                Ok(SENTINEL)
            }
        }
    }

    async fn working_set_mb(&self, pid: u32, private: bool) -> Result<f64> {
        let status = match self.read_proc(format!("{}/status", pid)).await {
            Ok(content) => content,
            Err(e) if is_expected(&e) => return Ok(SENTINEL),
            Err(e) => return Err(e.into()),
        };
        // kernel threads and zombies have no VmRSS
        let Some(rss_kb) = parse_status_kb(&status, "VmRSS") else {
            return Ok(SENTINEL);
        };
        let kb = if private {
            rss_kb.saturating_sub(parse_status_kb(&status, "RssFile").unwrap_or(0))
        } else {
            rss_kb
        };
        Ok(kb as f64 / BYTES_PER_KB)
    }

    async fn allocated_handles(&self, pid: u32) -> Result<f64> {
        if let Some(helper) = &self.helper {
            return helper.query(pid).await;
        }
        match self.fd_count(pid).await {
            Ok(count) => Ok(count as f64),
            Err(e) if is_expected(&e) => Ok(SENTINEL),
            Err(e) => Err(e.into()),
        }
    }

    async fn active_ports(&self, pid: u32) -> Result<f64> {
        match self.owned_sockets(pid).await {
            Ok((entries, inodes)) => Ok(ports::count_owned(&entries, &inodes) as f64),
            Err(e) if is_expected(&e) => Ok(SENTINEL),
            Err(e) => Err(e.into()),
        }
    }

    async fn ephemeral_ports(&self, pid: u32) -> Result<f64> {
        let range = self.ephemeral_range().await;
        match self.owned_sockets(pid).await {
            Ok((entries, inodes)) => Ok(ports::count_ephemeral(&entries, &inodes, range) as f64),
            Err(e) if is_expected(&e) => Ok(SENTINEL),
            Err(e) => Err(e.into()),
        }
    }

    async fn process_name(&self, pid: u32) -> Option<String> {
        self.pid_stat(pid).await.ok().flatten().map(|s| s.comm)
    }

    async fn process_start_time(&self, pid: u32) -> Option<DateTime<Utc>> {
        let stat = self.pid_stat(pid).await.ok().flatten()?;
        let boot = parse_boot_time(&self.read_proc("stat").await.ok()?)?;
        start_time_from(boot, stat.starttime, self.clock_ticks)
    }

    async fn child_processes(&self, pid: u32, cancel: &CancellationToken) -> Vec<ChildProcessInfo> {
        match self.capture().await {
            Some(snapshot) => ProcessTreeWalker::new(&snapshot)
                .with_excluded(&self.excluded)
                .descendants(pid, cancel),
            None => Vec::new(),
        }
    }

    async fn snapshot(&self) -> Option<Arc<ProcessSnapshot>> {
        self.capture().await.map(Arc::new)
    }

    fn excluded_child_names(&self) -> &[String] {
        &self.excluded
    }

    fn forget(&self, pid: u32) {
        self.cpu.forget(pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "4242 (my (odd) svc) S 1 4242 4242 0 -1 4194560 1234 0 0 0 250 50 0 0 20 0 8 0 12000 123456789 2048 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0";

    #[test]
    fn test_parse_pid_stat_with_parens_in_comm() {
        let stat = parse_pid_stat(STAT).unwrap();
        assert_eq!(stat.pid, 4242);
        assert_eq!(stat.comm, "my (odd) svc");
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.utime, 250);
        assert_eq!(stat.stime, 50);
        assert_eq!(stat.starttime, 12000);
    }

    #[test]
    fn test_parse_truncated_stat() {
        assert!(parse_pid_stat("12 (x) S 1 2 3").is_none());
        assert!(parse_pid_stat("garbage").is_none());
    }

    #[test]
    fn test_parse_system_ticks() {
        let content = "cpu  100 20 30 800 10 5 5 0 0 0\ncpu0 50 10 15 400 5 2 3 0 0 0\nbtime 1700000000\n";
        assert_eq!(parse_system_ticks(content), Some(970));
        assert_eq!(parse_boot_time(content), Some(1_700_000_000));
    }

    #[test]
    fn test_parse_status_kb() {
        let status = "Name:\tsvc\nVmRSS:\t  20480 kB\nRssFile:\t   4096 kB\n";
        assert_eq!(parse_status_kb(status, "VmRSS"), Some(20480));
        assert_eq!(parse_status_kb(status, "RssFile"), Some(4096));
        assert_eq!(parse_status_kb(status, "VmSwap"), None);
    }

    #[test]
    fn test_start_time_from_ticks() {
        let start = start_time_from(1_700_000_000, 12_050, 100).unwrap();
        assert_eq!(start.timestamp(), 1_700_000_120);
        assert_eq!(start.timestamp_subsec_millis(), 500);
    }
}
