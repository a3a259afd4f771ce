//! In-memory directory service
//!
//! Serves a fixed topology loaded from JSON. The agent uses it when running
//! against a topology file instead of a live cluster, and the test suites use
//! it as the directory stub. The latest health report per entity, source and
//! property is kept, the way the health store replaces them.

use super::directory::{
    ApplicationInfo, DeployedApplication, DeployedApplicationQuery, DeployedCodePackage,
    DeployedReplica, DirectoryService, Page,
};
use crate::error::{DirectoryError, ObserverError};
use crate::models::HealthReport;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One application as deployed on the described node(s)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationTopology {
    pub application_name: String,
    pub application_type_name: String,
    #[serde(default = "default_type_version")]
    pub application_type_version: String,
    /// Nodes the application is deployed on, empty for every node
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub replicas: Vec<DeployedReplica>,
    #[serde(default)]
    pub code_packages: Vec<DeployedCodePackage>,
}

fn default_type_version() -> String {
    "1.0.0".to_string()
}

/// Application type metadata and manifests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationTypeTopology {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub default_parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub application_manifest: Option<String>,
    /// Service manifest XML by service manifest name
    #[serde(default)]
    pub service_manifests: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub applications: Vec<ApplicationTopology>,
    #[serde(default)]
    pub application_types: Vec<ApplicationTypeTopology>,
}

/// Entity id, source id and property
type ReportKey = (String, String, String);

#[derive(Debug, Default)]
pub struct StaticDirectory {
    topology: Topology,
    page_size: Option<usize>,
    failures: Mutex<HashMap<String, DirectoryError>>,
    reports: DashMap<ReportKey, HealthReport>,
    application_page_requests: AtomicUsize,
    replica_requests: AtomicUsize,
    closed: AtomicBool,
}

impl StaticDirectory {
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            ..Self::default()
        }
    }

    pub fn from_json(content: &str) -> Result<Self, ObserverError> {
        let topology: Topology = serde_json::from_str(content)
            .map_err(|e| ObserverError::parse("topology", e.to_string()))?;
        Ok(Self::new(topology))
    }

    /// Load a topology description from a JSON file
    pub async fn load(path: &Path) -> Result<Self, ObserverError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_json(&content)
    }

    /// Serve pages smaller than the requested size
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size.max(1));
        self
    }

    /// Make replica queries for `application_name` fail with `error`
    pub fn fail_application(&self, application_name: &str, error: DirectoryError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(application_name.to_string(), error);
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Mark this client disposed
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Current health reports, ordered by entity, source and property
    pub fn reports(&self) -> Vec<HealthReport> {
        let mut reports: Vec<(ReportKey, HealthReport)> = self
            .reports
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        reports.sort_by(|a, b| a.0.cmp(&b.0));
        reports.into_iter().map(|(_, report)| report).collect()
    }

    pub fn application_page_requests(&self) -> usize {
        self.application_page_requests.load(Ordering::SeqCst)
    }

    pub fn replica_requests(&self) -> usize {
        self.replica_requests.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), DirectoryError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DirectoryError::Closed)
        } else {
            Ok(())
        }
    }

    fn on_node<'a>(&'a self, node_name: &'a str) -> impl Iterator<Item = &'a ApplicationTopology> {
        self.topology
            .applications
            .iter()
            .filter(move |a| a.nodes.is_empty() || a.nodes.iter().any(|n| n == node_name))
    }

    fn application(&self, application_name: &str) -> Result<&ApplicationTopology, DirectoryError> {
        self.topology
            .applications
            .iter()
            .find(|a| a.application_name == application_name)
            .ok_or_else(|| DirectoryError::NotFound(application_name.to_string()))
    }

    fn application_type(&self, name: &str, version: &str) -> Result<&ApplicationTypeTopology, DirectoryError> {
        self.topology
            .application_types
            .iter()
            .find(|t| t.name == name && t.version == version)
            .ok_or_else(|| DirectoryError::NotFound(format!("{} {}", name, version)))
    }
}

#[async_trait]
impl DirectoryService for StaticDirectory {
    async fn deployed_applications(
        &self,
        query: &DeployedApplicationQuery,
        _timeout: Duration,
    ) -> Result<Page<DeployedApplication>, DirectoryError> {
        self.ensure_open()?;
        self.application_page_requests.fetch_add(1, Ordering::SeqCst);

        let start = match &query.continuation_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| DirectoryError::InvalidArgument(format!("continuation token {}", token)))?,
            None => 0,
        };
        let page_size = self
            .page_size
            .unwrap_or(query.max_results)
            .min(query.max_results.max(1));

        let matching: Vec<DeployedApplication> = self
            .on_node(&query.node_name)
            .filter(|a| {
                query
                    .application_name_filter
                    .as_ref()
                    .map_or(true, |f| &a.application_name == f)
            })
            .map(|a| DeployedApplication {
                application_name: a.application_name.clone(),
                application_type_name: a.application_type_name.clone(),
            })
            .collect();

        let end = (start + page_size).min(matching.len());
        let items = matching.get(start..end).map(|s| s.to_vec()).unwrap_or_default();
        let continuation_token = (end < matching.len()).then(|| end.to_string());

        Ok(Page {
            items,
            continuation_token,
        })
    }

    async fn deployed_replicas(
        &self,
        node_name: &str,
        application_name: &str,
        _timeout: Duration,
    ) -> Result<Vec<DeployedReplica>, DirectoryError> {
        self.ensure_open()?;
        self.replica_requests.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self
            .failures
            .lock()
            .ok()
            .and_then(|f| f.get(application_name).cloned())
        {
            return Err(error);
        }

        Ok(self
            .on_node(node_name)
            .find(|a| a.application_name == application_name)
            .map(|a| a.replicas.clone())
            .unwrap_or_default())
    }

    async fn deployed_code_packages(
        &self,
        node_name: &str,
        application_name: &str,
        service_manifest_name: &str,
        _timeout: Duration,
    ) -> Result<Vec<DeployedCodePackage>, DirectoryError> {
        self.ensure_open()?;
        Ok(self
            .on_node(node_name)
            .find(|a| a.application_name == application_name)
            .map(|a| {
                a.code_packages
                    .iter()
                    .filter(|c| c.service_manifest_name == service_manifest_name)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn application_info(
        &self,
        application_name: &str,
        _timeout: Duration,
    ) -> Result<ApplicationInfo, DirectoryError> {
        self.ensure_open()?;
        let app = self.application(application_name)?;
        Ok(ApplicationInfo {
            application_name: app.application_name.clone(),
            application_type_name: app.application_type_name.clone(),
            application_type_version: app.application_type_version.clone(),
            parameters: app.parameters.clone(),
        })
    }

    async fn application_type_parameters(
        &self,
        application_type_name: &str,
        application_type_version: &str,
        _timeout: Duration,
    ) -> Result<BTreeMap<String, String>, DirectoryError> {
        self.ensure_open()?;
        Ok(self
            .application_type(application_type_name, application_type_version)?
            .default_parameters
            .clone())
    }

    async fn application_manifest(
        &self,
        application_type_name: &str,
        application_type_version: &str,
        _timeout: Duration,
    ) -> Result<String, DirectoryError> {
        self.ensure_open()?;
        self.application_type(application_type_name, application_type_version)?
            .application_manifest
            .clone()
            .ok_or_else(|| DirectoryError::NotFound(format!("{} application manifest", application_type_name)))
    }

    async fn service_manifest(
        &self,
        application_type_name: &str,
        application_type_version: &str,
        service_manifest_name: &str,
        _timeout: Duration,
    ) -> Result<String, DirectoryError> {
        self.ensure_open()?;
        self.application_type(application_type_name, application_type_version)?
            .service_manifests
            .get(service_manifest_name)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(service_manifest_name.to_string()))
    }

    async fn report_health(&self, report: &HealthReport) -> Result<(), DirectoryError> {
        self.ensure_open()?;
        let key = (
            report.entity.id.clone(),
            report.source_id.clone(),
            report.property.clone(),
        );
        self.reports.insert(key, report.clone());
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
