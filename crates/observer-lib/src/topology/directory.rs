//! Directory service abstraction
//!
//! The cluster's management API as the resolver sees it: paged listing of
//! deployed applications per node, deployed replicas and code packages per
//! application, application metadata and manifests, and health submission.
//! Every query carries the timeout the caller is willing to wait.

use crate::error::DirectoryError;
use crate::models::{HealthReport, ReplicaRole, ServiceKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Page size used when listing deployed applications
pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedApplication {
    pub application_name: String,
    pub application_type_name: String,
}

/// Query for the applications deployed on one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedApplicationQuery {
    pub node_name: String,
    /// Restrict the result to one application
    pub application_name_filter: Option<String>,
    pub continuation_token: Option<String>,
    pub max_results: usize,
}

/// One page of results plus the token for the next one
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub continuation_token: Option<String>,
}

/// A replica (stateful) or instance (stateless) deployed on the node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployedReplica {
    pub service_name: String,
    pub service_manifest_name: String,
    pub code_package_name: String,
    pub partition_id: String,
    pub replica_or_instance_id: i64,
    pub service_kind: ServiceKind,
    #[serde(default)]
    pub replica_role: ReplicaRole,
    pub host_process_id: u32,
    #[serde(default)]
    pub service_package_activation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployedCodePackage {
    pub code_package_name: String,
    pub service_manifest_name: String,
    /// Entry point process id, 0 when the package is not running
    #[serde(default)]
    pub entry_point_pid: u32,
    #[serde(default)]
    pub service_package_activation_id: Option<String>,
    #[serde(default)]
    pub container_id: Option<String>,
}

/// Application instance metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub application_name: String,
    pub application_type_name: String,
    pub application_type_version: String,
    /// Parameters set on the application instance
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[async_trait]
pub trait DirectoryService: Send + Sync {
    async fn deployed_applications(
        &self,
        query: &DeployedApplicationQuery,
        timeout: Duration,
    ) -> Result<Page<DeployedApplication>, DirectoryError>;

    async fn deployed_replicas(
        &self,
        node_name: &str,
        application_name: &str,
        timeout: Duration,
    ) -> Result<Vec<DeployedReplica>, DirectoryError>;

    async fn deployed_code_packages(
        &self,
        node_name: &str,
        application_name: &str,
        service_manifest_name: &str,
        timeout: Duration,
    ) -> Result<Vec<DeployedCodePackage>, DirectoryError>;

    async fn application_info(
        &self,
        application_name: &str,
        timeout: Duration,
    ) -> Result<ApplicationInfo, DirectoryError>;

    /// Default parameter values declared by the application type
    async fn application_type_parameters(
        &self,
        application_type_name: &str,
        application_type_version: &str,
        timeout: Duration,
    ) -> Result<BTreeMap<String, String>, DirectoryError>;

    async fn application_manifest(
        &self,
        application_type_name: &str,
        application_type_version: &str,
        timeout: Duration,
    ) -> Result<String, DirectoryError>;

    async fn service_manifest(
        &self,
        application_type_name: &str,
        application_type_version: &str,
        service_manifest_name: &str,
        timeout: Duration,
    ) -> Result<String, DirectoryError>;

    async fn report_health(&self, report: &HealthReport) -> Result<(), DirectoryError>;

    /// True once the underlying connection has been disposed
    fn is_closed(&self) -> bool {
        false
    }
}
