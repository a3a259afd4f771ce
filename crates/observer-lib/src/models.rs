//! Core data models for the workload observer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Stateful replicas vs stateless instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Stateful,
    Stateless,
}

/// Replica role as reported by the directory service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaRole {
    #[default]
    None,
    Primary,
    ActiveSecondary,
    IdleSecondary,
    Unknown,
}

impl ReplicaRole {
    /// Roles whose process is actively serving
    pub fn is_serving(self) -> bool {
        matches!(self, ReplicaRole::Primary | ReplicaRole::ActiveSecondary)
    }
}

/// How a service package is hosted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationMode {
    SharedProcess,
    ExclusiveProcess,
}

impl ActivationMode {
    /// Exclusive when the service package carries an activation id
    pub fn from_activation_id(activation_id: Option<&str>) -> Self {
        match activation_id {
            Some(id) if !id.trim().is_empty() => ActivationMode::ExclusiveProcess,
            _ => ActivationMode::SharedProcess,
        }
    }
}

/// A descendant process of a monitored host process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildProcessInfo {
    pub name: String,
    pub pid: u32,
    pub start_time: Option<DateTime<Utc>>,
}

/// Resource governance limits declared for a code package
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceGovernanceLimits {
    pub memory_limit_mb: Option<f64>,
    pub cpu_limit_cores: Option<f64>,
}

impl ResourceGovernanceLimits {
    pub fn is_empty(&self) -> bool {
        self.memory_limit_mb.is_none() && self.cpu_limit_cores.is_none()
    }
}

/// One logical workload instance bound to a host process.
///
/// Built by the topology resolver for a single cycle and not mutated after it
/// leaves the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredEntity {
    pub application_name: String,
    pub application_type_name: Option<String>,
    pub service_name: String,
    pub service_manifest_name: String,
    pub code_package_name: String,
    pub partition_id: String,
    pub replica_or_instance_id: i64,
    pub service_kind: ServiceKind,
    pub replica_role: ReplicaRole,
    pub host_process_id: u32,
    pub host_process_name: String,
    pub host_process_start_time: Option<DateTime<Utc>>,
    pub container_id: Option<String>,
    pub activation_id: Option<String>,
    pub activation_mode: ActivationMode,
    /// True when this entity was synthesized for a helper code package
    pub is_helper: bool,
    pub child_processes: Vec<ChildProcessInfo>,
    pub resource_governance: Option<ResourceGovernanceLimits>,
}

impl MonitoredEntity {
    /// Stable identifier used to key windows and report state across cycles
    pub fn id(&self) -> String {
        format!(
            "{}:{}:{}",
            self.service_name, self.host_process_name, self.host_process_id
        )
    }

    pub fn entity_ref(&self, node_name: &str) -> EntityRef {
        EntityRef {
            id: self.id(),
            entity_type: EntityType::Service,
            node_name: node_name.to_string(),
            application_name: Some(self.application_name.clone()),
            service_name: Some(self.service_name.clone()),
            process_name: self.host_process_name.clone(),
            process_id: self.host_process_id,
        }
    }
}

/// Metrics sampled per entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    CpuPercent,
    MemoryMb,
    Handles,
    ActivePorts,
    EphemeralPorts,
}

impl MetricKind {
    pub const ALL: [MetricKind; 5] = [
        MetricKind::CpuPercent,
        MetricKind::MemoryMb,
        MetricKind::Handles,
        MetricKind::ActivePorts,
        MetricKind::EphemeralPorts,
    ];

    /// Health report property name for this metric
    pub fn property_name(self) -> &'static str {
        match self {
            MetricKind::CpuPercent => "CPU Utilization",
            MetricKind::MemoryMb => "Memory Consumption MB",
            MetricKind::Handles => "Allocated Handles",
            MetricKind::ActivePorts => "Active TCP Ports",
            MetricKind::EphemeralPorts => "Active Ephemeral Ports",
        }
    }

    /// Property a process's report is filed under. Primary and helper
    /// processes of one service get distinct properties.
    pub fn report_property(self, process_name: &str) -> String {
        format!("{} ({})", self.property_name(), process_name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::CpuPercent => "cpu_percent",
            MetricKind::MemoryMb => "memory_mb",
            MetricKind::Handles => "handles",
            MetricKind::ActivePorts => "active_ports",
            MetricKind::EphemeralPorts => "ephemeral_ports",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            MetricKind::CpuPercent => "%",
            MetricKind::MemoryMb => " MB",
            _ => "",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health state carried by a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Ok,
    Warning,
    Error,
}

impl HealthState {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Ok => "ok",
            HealthState::Warning => "warning",
            HealthState::Error => "error",
        }
    }
}

/// Directory entity a health report is filed against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Node,
    Application,
    Service,
}

/// Reference to the entity a report describes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: String,
    pub entity_type: EntityType,
    pub node_name: String,
    pub application_name: Option<String>,
    pub service_name: Option<String>,
    pub process_name: String,
    pub process_id: u32,
}

/// Transient health statement handed to the reporting collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub entity: EntityRef,
    pub metric: MetricKind,
    pub property: String,
    pub state: HealthState,
    pub message: String,
    pub ttl: Duration,
    pub source_id: String,
    /// Window average the decision was based on, absent for retractions
    pub value: Option<f64>,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity() -> MonitoredEntity {
        MonitoredEntity {
            application_name: "fabric:/Voting".into(),
            application_type_name: Some("VotingType".into()),
            service_name: "fabric:/Voting/VotingData".into(),
            service_manifest_name: "VotingDataPkg".into(),
            code_package_name: "Code".into(),
            partition_id: "b3e1c8f4".into(),
            replica_or_instance_id: 1,
            service_kind: ServiceKind::Stateful,
            replica_role: ReplicaRole::Primary,
            host_process_id: 4242,
            host_process_name: "VotingData".into(),
            host_process_start_time: None,
            container_id: None,
            activation_id: None,
            activation_mode: ActivationMode::SharedProcess,
            is_helper: false,
            child_processes: Vec::new(),
            resource_governance: None,
        }
    }

    #[test]
    fn test_entity_id_includes_process_identity() {
        assert_eq!(entity().id(), "fabric:/Voting/VotingData:VotingData:4242");
    }

    #[test]
    fn test_activation_mode_from_id() {
        assert_eq!(
            ActivationMode::from_activation_id(Some("a1b2")),
            ActivationMode::ExclusiveProcess
        );
        assert_eq!(
            ActivationMode::from_activation_id(Some("")),
            ActivationMode::SharedProcess
        );
        assert_eq!(
            ActivationMode::from_activation_id(None),
            ActivationMode::SharedProcess
        );
    }

    #[test]
    fn test_serving_roles() {
        assert!(ReplicaRole::Primary.is_serving());
        assert!(ReplicaRole::ActiveSecondary.is_serving());
        assert!(!ReplicaRole::IdleSecondary.is_serving());
        assert!(!ReplicaRole::Unknown.is_serving());
    }

    #[test]
    fn test_entity_ref() {
        let r = entity().entity_ref("node-1");
        assert_eq!(r.entity_type, EntityType::Service);
        assert_eq!(r.process_id, 4242);
        assert_eq!(r.node_name, "node-1");
    }
}
