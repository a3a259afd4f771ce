//! End-to-end tests: topology file -> resolver -> monitor -> directory reports

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use observer_lib::error::Result;
use observer_lib::evaluator::Thresholds;
use observer_lib::topology::{ConnectionManager, DirectoryService, ResolverConfig};
use observer_lib::{
    AppFilter, ChildProcessInfo, DirectoryHealthReporter, HealthState, MetricKind,
    MetricThresholds, MetricsProvider, Monitor, MonitorConfig, StaticDirectory, TopologyResolver,
    SENTINEL,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

const TOPOLOGY: &str = r#"{
    "applications": [
        {
            "application_name": "fabric:/Voting",
            "application_type_name": "VotingType",
            "application_type_version": "1.0.0",
            "parameters": { "Web_MemoryLimit": "768" },
            "replicas": [
                {
                    "service_name": "fabric:/Voting/VotingWeb",
                    "service_manifest_name": "VotingWebPkg",
                    "code_package_name": "Code",
                    "partition_id": "8a1f",
                    "replica_or_instance_id": 1,
                    "service_kind": "stateless",
                    "host_process_id": 100
                },
                {
                    "service_name": "fabric:/Voting/VotingData",
                    "service_manifest_name": "VotingDataPkg",
                    "code_package_name": "Code",
                    "partition_id": "9b2e",
                    "replica_or_instance_id": 2,
                    "service_kind": "stateful",
                    "replica_role": "primary",
                    "host_process_id": 200
                },
                {
                    "service_name": "fabric:/Voting/VotingData",
                    "service_manifest_name": "VotingDataPkg",
                    "code_package_name": "Code",
                    "partition_id": "9b2f",
                    "replica_or_instance_id": 3,
                    "service_kind": "stateful",
                    "replica_role": "idle_secondary",
                    "host_process_id": 201
                }
            ],
            "code_packages": [
                { "code_package_name": "Code", "service_manifest_name": "VotingWebPkg", "entry_point_pid": 100 },
                { "code_package_name": "Sidecar", "service_manifest_name": "VotingWebPkg", "entry_point_pid": 110 },
                { "code_package_name": "Code", "service_manifest_name": "VotingDataPkg", "entry_point_pid": 200 }
            ]
        },
        {
            "application_name": "fabric:/Elsewhere",
            "application_type_name": "OtherType",
            "nodes": ["node-2"],
            "replicas": [
                {
                    "service_name": "fabric:/Elsewhere/S",
                    "service_manifest_name": "SPkg",
                    "code_package_name": "Code",
                    "partition_id": "1",
                    "replica_or_instance_id": 4,
                    "service_kind": "stateless",
                    "host_process_id": 300
                }
            ]
        }
    ],
    "application_types": [
        {
            "name": "VotingType",
            "version": "1.0.0",
            "default_parameters": { "Web_MemoryLimit": "512" },
            "application_manifest": "<ApplicationManifest><ServiceManifestImport><ServiceManifestRef ServiceManifestName=\"VotingWebPkg\" ServiceManifestVersion=\"1.0.0\" /><Policies><ResourceGovernancePolicy CodePackageRef=\"Code\" MemoryInMBLimit=\"[Web_MemoryLimit]\" /></Policies></ServiceManifestImport></ApplicationManifest>",
            "service_manifests": {
                "VotingWebPkg": "<ServiceManifest Name=\"VotingWebPkg\"><CodePackage Name=\"Code\" /><CodePackage Name=\"Sidecar\" /></ServiceManifest>"
            }
        }
    ]
}"#;

/// Provider backed by a fixed process table
struct ProcessTable {
    names: HashMap<u32, &'static str>,
    cpu: Mutex<HashMap<u32, f64>>,
    excluded: Vec<String>,
}

impl ProcessTable {
    fn new() -> Self {
        Self {
            names: HashMap::from([
                (100, "VotingWeb"),
                (101, "node"),
                (110, "sidecar"),
                (200, "VotingData"),
                (201, "VotingData"),
            ]),
            cpu: Mutex::new(HashMap::from([(100, 30.0), (101, 40.0), (110, 5.0), (200, 10.0)])),
            excluded: Vec::new(),
        }
    }
}

#[async_trait]
impl MetricsProvider for ProcessTable {
    fn platform(&self) -> &'static str {
        "table"
    }
    async fn cpu_percent(&self, pid: u32, _expected: Option<&str>) -> Result<f64> {
        Ok(self.cpu.lock().unwrap().get(&pid).copied().unwrap_or(SENTINEL))
    }
    async fn working_set_mb(&self, _pid: u32, _private: bool) -> Result<f64> {
        Ok(64.0)
    }
    async fn allocated_handles(&self, _pid: u32) -> Result<f64> {
        Ok(100.0)
    }
    async fn active_ports(&self, _pid: u32) -> Result<f64> {
        Ok(3.0)
    }
    async fn ephemeral_ports(&self, _pid: u32) -> Result<f64> {
        Ok(1.0)
    }
    async fn process_name(&self, pid: u32) -> Option<String> {
        self.names.get(&pid).map(|n| n.to_string())
    }
    async fn process_start_time(&self, _pid: u32) -> Option<DateTime<Utc>> {
        None
    }
    async fn child_processes(&self, pid: u32, _cancel: &CancellationToken) -> Vec<ChildProcessInfo> {
        match pid {
            100 => vec![ChildProcessInfo {
                name: "node".to_string(),
                pid: 101,
                start_time: None,
            }],
            _ => Vec::new(),
        }
    }
    fn excluded_child_names(&self) -> &[String] {
        &self.excluded
    }
}

fn setup() -> (Arc<StaticDirectory>, Arc<ConnectionManager>) {
    let directory = Arc::new(StaticDirectory::from_json(TOPOLOGY).unwrap());
    let client: Arc<dyn DirectoryService> = directory.clone();
    (directory, Arc::new(ConnectionManager::with_client(client)))
}

fn resolver_config() -> ResolverConfig {
    ResolverConfig {
        enable_concurrency: false,
        enable_resource_governance: true,
        ..ResolverConfig::default()
    }
}

#[tokio::test]
async fn test_resolve_node_topology() {
    let (_, connections) = setup();
    let resolver = TopologyResolver::new(connections, Arc::new(ProcessTable::new()), resolver_config());

    let entities = resolver
        .resolve("node-1", &AppFilter::all(), &CancellationToken::new())
        .await
        .unwrap();

    let bound: Vec<(&str, u32, bool)> = entities
        .iter()
        .map(|e| (e.service_name.as_str(), e.host_process_id, e.is_helper))
        .collect();
    assert_eq!(
        bound,
        vec![
            ("fabric:/Voting/VotingData", 200, false),
            ("fabric:/Voting/VotingWeb", 100, false),
            ("fabric:/Voting/VotingWeb", 110, true),
        ]
    );

    let web = &entities[1];
    assert_eq!(web.child_processes.len(), 1);
    assert_eq!(web.child_processes[0].name, "node");
    assert_eq!(
        web.resource_governance.and_then(|l| l.memory_limit_mb),
        Some(768.0)
    );

    let sidecar = &entities[2];
    assert_eq!(sidecar.code_package_name, "Sidecar");
    assert_eq!(sidecar.partition_id, web.partition_id);
    assert!(sidecar.resource_governance.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_monitor_cycle_reports_through_directory() {
    let (directory, connections) = setup();
    let provider = Arc::new(ProcessTable::new());
    let resolver = TopologyResolver::new(connections.clone(), provider.clone(), resolver_config());
    let config = MonitorConfig {
        node_name: "node-1".to_string(),
        thresholds: MetricThresholds {
            cpu_percent: Thresholds::new(90.0, 60.0),
            ..MetricThresholds::default()
        },
        ..MonitorConfig::default()
    };
    let reporter = Arc::new(DirectoryHealthReporter::new(connections));
    let monitor = Monitor::new(resolver, provider.clone(), reporter, config).unwrap();
    let cancel = CancellationToken::new();

    // VotingWeb 30% plus its child at 40%
    let summary = monitor.run_cycle(&cancel).await.unwrap();
    assert_eq!(summary.entities, 3);
    assert_eq!(summary.reports, 1);

    let reports = directory.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].state, HealthState::Warning);
    assert_eq!(reports[0].metric, MetricKind::CpuPercent);
    assert_eq!(reports[0].entity.process_id, 100);
    assert_eq!(reports[0].entity.node_name, "node-1");
    assert_eq!(reports[0].source_id, "AppObserver");

    provider.cpu.lock().unwrap().insert(101, 0.0);
    monitor.run_cycle(&cancel).await.unwrap();
    // the clear replaces the warning in the store
    let reports = directory.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].state, HealthState::Ok);
    assert_eq!(reports[0].entity.process_id, 100);

    assert_eq!(monitor.clear_reports().await, 0);
}
