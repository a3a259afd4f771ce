//! Tests for the procfs provider
//!
//! These tests build a fake proc filesystem in a temp dir so metric parsing
//! can be checked without depending on the processes of the test host.

#[cfg(test)]
mod mock_procfs_tests {
    use crate::error::SENTINEL;
    use crate::provider::{MetricsProvider, ProcfsProvider};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use tokio::fs;
    use tokio_util::sync::CancellationToken;

    const HOST_PID: u32 = 100;
    const CHILD_PID: u32 = 101;

    fn stat_line(pid: u32, comm: &str, ppid: u32, utime: u64, stime: u64) -> String {
        format!(
            "{pid} ({comm}) S {ppid} {pid} {pid} 0 -1 4194560 1234 0 0 0 {utime} {stime} 0 0 20 0 4 0 12050 123456789 2048 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 1 0 0 0 0 0\n"
        )
    }

    async fn write_system_stat(root: &Path, user: u64, system: u64, idle: u64) {
        let content = format!(
            "cpu  {user} 0 {system} {idle} 0 0 0 0 0 0\ncpu0 {user} 0 {system} {idle} 0 0 0 0 0 0\nbtime 1700000000\n"
        );
        fs::write(root.join("stat"), content).await.unwrap();
    }

    /// Fake proc root with a host process, one child and three fds
    async fn create_mock_proc(temp_dir: &TempDir) -> PathBuf {
        let root = temp_dir.path().to_path_buf();
        write_system_stat(&root, 600, 200, 200).await;

        let host = root.join(HOST_PID.to_string());
        fs::create_dir_all(host.join("fd")).await.unwrap();
        fs::create_dir_all(host.join("net")).await.unwrap();
        fs::write(host.join("stat"), stat_line(HOST_PID, "VotingData", 1, 250, 50))
            .await
            .unwrap();
        fs::write(
            host.join("status"),
            "Name:\tVotingData\nVmRSS:\t   20480 kB\nRssAnon:\t   16384 kB\nRssFile:\t    4096 kB\n",
        )
        .await
        .unwrap();

        std::os::unix::fs::symlink("/dev/null", host.join("fd/0")).unwrap();
        std::os::unix::fs::symlink("socket:[5001]", host.join("fd/1")).unwrap();
        std::os::unix::fs::symlink("socket:[5002]", host.join("fd/2")).unwrap();

        let tcp = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 5001 1 0000000000000000 100 0 0 10 0
   1: 0100007F:9C40 0100007F:1F90 01 00000000:00000000 00:00000000 00000000  1000        0 5002 1 0000000000000000 20 4 30 10 -1
   2: 0100007F:D431 0100007F:0050 01 00000000:00000000 00:00000000 00000000  1000        0 7777 1 0000000000000000 20 4 30 10 -1
";
        fs::write(host.join("net/tcp"), tcp).await.unwrap();

        let child = root.join(CHILD_PID.to_string());
        fs::create_dir_all(&child).await.unwrap();
        fs::write(child.join("stat"), stat_line(CHILD_PID, "worker", HOST_PID, 10, 5))
            .await
            .unwrap();

        fs::create_dir_all(root.join("sys/net/ipv4")).await.unwrap();
        fs::write(root.join("sys/net/ipv4/ip_local_port_range"), "32768\t60999\n")
            .await
            .unwrap();

        root
    }

    #[tokio::test]
    async fn test_process_identity() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_mock_proc(&temp_dir).await;
        let provider = ProcfsProvider::with_proc_path(&root);

        assert_eq!(provider.process_name(HOST_PID).await.as_deref(), Some("VotingData"));
        let start = provider.process_start_time(HOST_PID).await.unwrap();
        let expected_secs = 1_700_000_000 + 12_050 / crate::provider::procfs::clock_ticks() as i64;
        assert_eq!(start.timestamp(), expected_secs);
        assert!(provider.process_name(9999).await.is_none());
    }

    #[tokio::test]
    async fn test_working_set() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_mock_proc(&temp_dir).await;
        let provider = ProcfsProvider::with_proc_path(&root);

        assert_eq!(provider.working_set_mb(HOST_PID, false).await.unwrap(), 20.0);
        assert_eq!(provider.working_set_mb(HOST_PID, true).await.unwrap(), 16.0);
        // child has no status file
        assert_eq!(provider.working_set_mb(CHILD_PID, false).await.unwrap(), SENTINEL);
    }

    #[tokio::test]
    async fn test_handles_and_ports() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_mock_proc(&temp_dir).await;
        let provider = ProcfsProvider::with_proc_path(&root);

        assert_eq!(provider.allocated_handles(HOST_PID).await.unwrap(), 3.0);
        assert_eq!(provider.active_ports(HOST_PID).await.unwrap(), 2.0);
        assert_eq!(provider.ephemeral_ports(HOST_PID).await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_gone_process_returns_sentinel() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_mock_proc(&temp_dir).await;
        let provider = ProcfsProvider::with_proc_path(&root);

        assert_eq!(provider.cpu_percent(4040, None).await.unwrap(), SENTINEL);
        assert_eq!(provider.working_set_mb(4040, false).await.unwrap(), SENTINEL);
        assert_eq!(provider.allocated_handles(4040).await.unwrap(), SENTINEL);
        assert_eq!(provider.active_ports(4040).await.unwrap(), SENTINEL);
        assert_eq!(provider.ephemeral_ports(4040).await.unwrap(), SENTINEL);
    }

    #[tokio::test]
    async fn test_cpu_percent_from_tick_deltas() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_mock_proc(&temp_dir).await;
        let provider = ProcfsProvider::with_proc_path(&root);

        // counters don't move during the first-sample pause
        assert_eq!(provider.cpu_percent(HOST_PID, Some("VotingData")).await.unwrap(), 0.0);

        fs::write(
            root.join(format!("{}/stat", HOST_PID)),
            stat_line(HOST_PID, "VotingData", 1, 300, 100),
        )
        .await
        .unwrap();
        write_system_stat(&root, 700, 300, 400).await;

        // process +100 ticks, system +400 ticks
        let pct = provider.cpu_percent(HOST_PID, Some("VotingData")).await.unwrap();
        assert!((pct - 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cpu_percent_detects_pid_reuse() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_mock_proc(&temp_dir).await;
        let provider = ProcfsProvider::with_proc_path(&root);

        assert_eq!(
            provider.cpu_percent(HOST_PID, Some("SomethingElse")).await.unwrap(),
            SENTINEL
        );
    }

    #[tokio::test]
    async fn test_snapshot_and_children() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_mock_proc(&temp_dir).await;
        let provider = ProcfsProvider::with_proc_path(&root);

        let snapshot = provider.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.name(CHILD_PID), Some("worker"));

        let children = provider
            .child_processes(HOST_PID, &CancellationToken::new())
            .await;
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].pid, CHILD_PID);
        assert_eq!(children[0].name, "worker");
    }
}
