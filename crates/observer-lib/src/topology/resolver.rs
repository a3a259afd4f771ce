//! Topology-to-process resolution
//!
//! Turns the directory's view of what is deployed on a node into the
//! [`MonitoredEntity`] list for one cycle: serving replicas bound to their
//! host processes, helper code packages bound to their own processes,
//! descendant processes, and optional resource governance limits.

use super::connection::ConnectionManager;
use super::directory::{
    DeployedApplication, DeployedApplicationQuery, DeployedCodePackage, DeployedReplica,
    DirectoryService, DEFAULT_PAGE_SIZE,
};
use super::filter::AppFilter;
use super::manifest::{has_governance_policy, resource_governance_limits};
use crate::error::{DirectoryError, ObserverError, Result};
use crate::models::{
    ActivationMode, ChildProcessInfo, MonitoredEntity, ResourceGovernanceLimits, ServiceKind,
};
use crate::observability::ObserverMetrics;
use crate::provider::{logical_processors, MetricsProvider, ProcessSnapshot};
use crate::tree::ProcessTreeWalker;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Process name of the orchestration runtime's own host
pub const DEFAULT_RUNTIME_HOST_NAME: &str = "Fabric";

/// Parallel resolution is only enabled from this many logical processors up
pub const MIN_PARALLEL_PROCESSORS: usize = 4;

/// Resolver settings
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub enable_child_process_monitoring: bool,
    pub enable_concurrency: bool,
    /// Upper bound on parallel entity tasks, defaults to the processor count
    pub max_concurrency: Option<usize>,
    /// Timeout for per-application directory queries
    pub query_timeout: Duration,
    /// Timeout for each deployed-application page
    pub application_query_timeout: Duration,
    pub page_size: usize,
    /// Pause before each continuation page
    pub page_delay: Duration,
    pub runtime_host_process_name: String,
    pub enable_resource_governance: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            enable_child_process_monitoring: true,
            enable_concurrency: true,
            max_concurrency: None,
            query_timeout: Duration::from_secs(60),
            application_query_timeout: Duration::from_secs(120),
            page_size: DEFAULT_PAGE_SIZE,
            page_delay: Duration::from_millis(250),
            runtime_host_process_name: DEFAULT_RUNTIME_HOST_NAME.to_string(),
            enable_resource_governance: false,
        }
    }
}

/// Number of entity tasks allowed to run at once.
///
/// Serial below [`MIN_PARALLEL_PROCESSORS`] or when disabled, otherwise
/// bounded by the processor count.
pub fn effective_concurrency(enabled: bool, max: Option<usize>, processors: usize) -> usize {
    if !enabled || processors < MIN_PARALLEL_PROCESSORS {
        return 1;
    }
    max.filter(|m| *m > 0)
        .map_or(processors, |m| m.min(processors))
}

async fn timed<T>(
    operation: &'static str,
    timeout: Duration,
    query: impl Future<Output = Result<T, DirectoryError>>,
) -> Result<T, DirectoryError> {
    tokio::time::timeout(timeout, query)
        .await
        .map_err(|_| DirectoryError::Timeout { operation, timeout })?
}

fn is_monitorable(replica: &DeployedReplica) -> bool {
    match replica.service_kind {
        ServiceKind::Stateless => true,
        ServiceKind::Stateful => replica.replica_role.is_serving(),
    }
}

/// Serving replicas, first one per host process
fn serving_replicas(replicas: Vec<DeployedReplica>) -> Vec<DeployedReplica> {
    let mut hosts = HashSet::new();
    replicas
        .into_iter()
        .filter(|r| {
            if is_monitorable(r) {
                return true;
            }
            debug!(
                service = %r.service_name,
                role = ?r.replica_role,
                "Skipping replica that is not serving"
            );
            false
        })
        .filter(|r| hosts.insert(r.host_process_id))
        .collect()
}

fn bind(
    application: &DeployedApplication,
    replica: &DeployedReplica,
    pid: u32,
    name: String,
    start_time: Option<DateTime<Utc>>,
) -> MonitoredEntity {
    MonitoredEntity {
        application_name: application.application_name.clone(),
        application_type_name: Some(application.application_type_name.clone())
            .filter(|t| !t.is_empty()),
        service_name: replica.service_name.clone(),
        service_manifest_name: replica.service_manifest_name.clone(),
        code_package_name: replica.code_package_name.clone(),
        partition_id: replica.partition_id.clone(),
        replica_or_instance_id: replica.replica_or_instance_id,
        service_kind: replica.service_kind,
        replica_role: replica.replica_role,
        host_process_id: pid,
        host_process_name: name,
        host_process_start_time: start_time,
        container_id: None,
        activation_id: replica.service_package_activation_id.clone(),
        activation_mode: ActivationMode::from_activation_id(
            replica.service_package_activation_id.as_deref(),
        ),
        is_helper: false,
        child_processes: Vec::new(),
        resource_governance: None,
    }
}

/// Per-application inputs to governance enrichment, fetched once per cycle
struct ApplicationGovernance {
    type_name: String,
    type_version: String,
    parameters: BTreeMap<String, String>,
    application_manifest: String,
}

/// State shared by the entity tasks of one cycle
struct CycleContext {
    connections: Arc<ConnectionManager>,
    client: Arc<dyn DirectoryService>,
    provider: Arc<dyn MetricsProvider>,
    config: ResolverConfig,
    node_name: String,
    snapshot: Option<Arc<ProcessSnapshot>>,
    seen: DashSet<(u32, String)>,
    cancel: CancellationToken,
    metrics: Option<ObserverMetrics>,
}

impl CycleContext {
    fn directory_failure(&self, application_name: &str, error: &DirectoryError) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_directory_errors();
        }
        if *error == DirectoryError::Closed {
            self.connections.invalidate();
        }
        if error.is_transient() {
            info!(app = %application_name, error = %error, "Directory query failed, skipping");
        } else {
            warn!(app = %application_name, error = %error, "Directory query failed, skipping");
        }
    }

    fn is_runtime_host(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case(&self.config.runtime_host_process_name)
    }

    async fn process_identity(&self, pid: u32) -> Option<(String, Option<DateTime<Utc>>)> {
        if pid == 0 {
            return None;
        }
        if let Some(entry) = self.snapshot.as_ref().and_then(|s| s.get(pid)) {
            return Some((entry.name.clone(), entry.start_time));
        }
        // started after the snapshot was taken
        let name = self.provider.process_name(pid).await?;
        let start_time = self.provider.process_start_time(pid).await;
        Some((name, start_time))
    }

    async fn children(&self, pid: u32) -> Vec<ChildProcessInfo> {
        match &self.snapshot {
            Some(snapshot) => ProcessTreeWalker::new(snapshot.as_ref())
                .with_excluded(self.provider.excluded_child_names())
                .descendants(pid, &self.cancel),
            None => self.provider.child_processes(pid, &self.cancel).await,
        }
    }

    async fn governance_limits(
        &self,
        governance: &ApplicationGovernance,
        entity: &MonitoredEntity,
    ) -> Option<ResourceGovernanceLimits> {
        let service_manifest = match timed(
            "service_manifest",
            self.config.query_timeout,
            self.client.service_manifest(
                &governance.type_name,
                &governance.type_version,
                &entity.service_manifest_name,
                self.config.query_timeout,
            ),
        )
        .await
        {
            Ok(xml) => Some(xml),
            Err(e) => {
                self.directory_failure(&entity.application_name, &e);
                None
            }
        };

        match resource_governance_limits(
            &governance.application_manifest,
            service_manifest.as_deref(),
            &entity.service_manifest_name,
            &entity.code_package_name,
            &governance.parameters,
        ) {
            Ok(limits) => limits,
            Err(e) => {
                warn!(
                    service = %entity.service_name,
                    code_package = %entity.code_package_name,
                    error = %e,
                    "Could not read resource governance limits"
                );
                None
            }
        }
    }

    async fn enrich(&self, entity: &mut MonitoredEntity, governance: Option<&ApplicationGovernance>) {
        if self.config.enable_child_process_monitoring {
            entity.child_processes = self.children(entity.host_process_id).await;
            if !entity.child_processes.is_empty() {
                debug!(
                    service = %entity.service_name,
                    pid = entity.host_process_id,
                    children = entity.child_processes.len(),
                    "Attached child processes"
                );
            }
        }
        if let Some(governance) = governance {
            entity.resource_governance = self.governance_limits(governance, entity).await;
        }
    }

    async fn helper_entity(
        &self,
        application: &DeployedApplication,
        replica: &DeployedReplica,
        package: &DeployedCodePackage,
    ) -> Option<MonitoredEntity> {
        let pid = package.entry_point_pid;
        let Some((name, start_time)) = self.process_identity(pid).await else {
            debug!(
                service = %replica.service_name,
                code_package = %package.code_package_name,
                pid,
                "Helper code package has no live process"
            );
            return None;
        };
        if self.is_runtime_host(&name) || !self.seen.insert((pid, name.clone())) {
            return None;
        }

        let activation_id = package
            .service_package_activation_id
            .clone()
            .filter(|id| !id.trim().is_empty());

        Some(MonitoredEntity {
            service_manifest_name: package.service_manifest_name.clone(),
            code_package_name: package.code_package_name.clone(),
            container_id: package.container_id.clone(),
            activation_mode: ActivationMode::from_activation_id(activation_id.as_deref()),
            activation_id: activation_id.or_else(|| replica.service_package_activation_id.clone()),
            is_helper: true,
            ..bind(application, replica, pid, name, start_time)
        })
    }

    /// Entities for one replica: its host process unless that is the
    /// runtime itself, plus one per helper code package.
    ///
    /// Packages whose entry point hosts any serving replica of the
    /// application in `replica_hosts` belong to that replica and are never
    /// bound as helpers.
    async fn resolve_replica(
        &self,
        application: &DeployedApplication,
        replica: DeployedReplica,
        replica_hosts: &HashSet<u32>,
        governance: Option<&ApplicationGovernance>,
    ) -> Vec<MonitoredEntity> {
        let mut entities = Vec::new();
        if self.cancel.is_cancelled() {
            return entities;
        }

        let pid = replica.host_process_id;
        let Some((name, start_time)) = self.process_identity(pid).await else {
            debug!(service = %replica.service_name, pid, "Host process is gone, skipping replica");
            return entities;
        };
        let hosted_by_runtime = self.is_runtime_host(&name);

        let code_packages = match timed(
            "deployed_code_packages",
            self.config.query_timeout,
            self.client.deployed_code_packages(
                &self.node_name,
                &application.application_name,
                &replica.service_manifest_name,
                self.config.query_timeout,
            ),
        )
        .await
        {
            Ok(packages) => packages,
            Err(e) => {
                self.directory_failure(&application.application_name, &e);
                Vec::new()
            }
        };

        if hosted_by_runtime {
            debug!(service = %replica.service_name, pid, "Replica hosted by the runtime, resolving code packages");
        } else if self.seen.insert((pid, name.clone())) {
            let mut entity = bind(application, &replica, pid, name, start_time);
            entity.container_id = code_packages
                .iter()
                .find(|c| c.code_package_name == replica.code_package_name)
                .and_then(|c| c.container_id.clone());
            self.enrich(&mut entity, governance).await;
            entities.push(entity);
        }

        if code_packages.len() < 2 && !hosted_by_runtime {
            return entities;
        }

        for package in code_packages
            .iter()
            .filter(|c| c.code_package_name != replica.code_package_name)
            .filter(|c| !replica_hosts.contains(&c.entry_point_pid))
        {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Some(mut entity) = self.helper_entity(application, &replica, package).await {
                self.enrich(&mut entity, governance).await;
                entities.push(entity);
            }
        }

        entities
    }
}

/// Maps deployed workloads on a node to the processes that run them
pub struct TopologyResolver {
    connections: Arc<ConnectionManager>,
    provider: Arc<dyn MetricsProvider>,
    config: ResolverConfig,
    metrics: Option<ObserverMetrics>,
}

impl TopologyResolver {
    pub fn new(
        connections: Arc<ConnectionManager>,
        provider: Arc<dyn MetricsProvider>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            connections,
            provider,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ObserverMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Entity tasks run at once on this host
    pub fn concurrency(&self) -> usize {
        effective_concurrency(
            self.config.enable_concurrency,
            self.config.max_concurrency,
            logical_processors(),
        )
    }

    fn client(&self) -> Result<Arc<dyn DirectoryService>> {
        self.connections.get_or_create().map_err(|e| {
            if let Some(metrics) = &self.metrics {
                metrics.inc_directory_errors();
            }
            ObserverError::Directory(e)
        })
    }

    /// Every deployed application on `node_name` that passes `filter`,
    /// across all pages
    pub async fn deployed_applications(
        &self,
        node_name: &str,
        filter: &AppFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeployedApplication>> {
        let client = self.client()?;
        let timeout = self.config.application_query_timeout;
        let mut query = DeployedApplicationQuery {
            node_name: node_name.to_string(),
            application_name_filter: filter.directory_filter().map(String::from),
            continuation_token: None,
            max_results: self.config.page_size.max(1),
        };

        let mut applications = Vec::new();
        loop {
            let page = timed(
                "deployed_applications",
                timeout,
                client.deployed_applications(&query, timeout),
            )
            .await
            .map_err(|e| {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_directory_errors();
                }
                if e == DirectoryError::Closed {
                    self.connections.invalidate();
                }
                e
            })?;

            applications.extend(
                page.items
                    .into_iter()
                    .filter(|a| filter.matches(&a.application_name)),
            );

            match page.continuation_token {
                Some(token) if !token.is_empty() => {
                    query.continuation_token = Some(token);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ObserverError::Cancelled),
                        _ = tokio::time::sleep(self.config.page_delay) => {}
                    }
                }
                _ => break,
            }
        }

        Ok(applications)
    }

    async fn application_governance(
        &self,
        client: &Arc<dyn DirectoryService>,
        application: &DeployedApplication,
    ) -> Result<Option<ApplicationGovernance>, DirectoryError> {
        let timeout = self.config.query_timeout;
        let info = timed(
            "application_info",
            timeout,
            client.application_info(&application.application_name, timeout),
        )
        .await?;

        let application_manifest = timed(
            "application_manifest",
            timeout,
            client.application_manifest(
                &info.application_type_name,
                &info.application_type_version,
                timeout,
            ),
        )
        .await?;
        if !has_governance_policy(&application_manifest) {
            return Ok(None);
        }

        let mut parameters = timed(
            "application_type_parameters",
            timeout,
            client.application_type_parameters(
                &info.application_type_name,
                &info.application_type_version,
                timeout,
            ),
        )
        .await?;
        parameters.extend(info.parameters);

        Ok(Some(ApplicationGovernance {
            type_name: info.application_type_name,
            type_version: info.application_type_version,
            parameters,
            application_manifest,
        }))
    }

    /// Resolve the monitored entities deployed on `node_name`.
    ///
    /// A failing application is logged and skipped. Failing to list
    /// applications at all fails the call. Returns
    /// [`ObserverError::Cancelled`] when `cancel` fires.
    pub async fn resolve(
        &self,
        node_name: &str,
        filter: &AppFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<MonitoredEntity>> {
        let applications = self.deployed_applications(node_name, filter, cancel).await?;
        let client = self.client()?;

        let context = Arc::new(CycleContext {
            connections: self.connections.clone(),
            client: client.clone(),
            provider: self.provider.clone(),
            config: self.config.clone(),
            node_name: node_name.to_string(),
            snapshot: self.provider.snapshot().await,
            seen: DashSet::new(),
            cancel: cancel.clone(),
            metrics: self.metrics.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(self.concurrency()));
        let mut tasks = JoinSet::new();

        for application in applications {
            if cancel.is_cancelled() {
                break;
            }

            let replicas = match timed(
                "deployed_replicas",
                self.config.query_timeout,
                client.deployed_replicas(
                    node_name,
                    &application.application_name,
                    self.config.query_timeout,
                ),
            )
            .await
            {
                Ok(replicas) => serving_replicas(replicas),
                Err(e) => {
                    context.directory_failure(&application.application_name, &e);
                    continue;
                }
            };
            if replicas.is_empty() {
                continue;
            }

            let governance = if self.config.enable_resource_governance {
                match self.application_governance(&client, &application).await {
                    Ok(governance) => governance.map(Arc::new),
                    Err(e) => {
                        context.directory_failure(&application.application_name, &e);
                        None
                    }
                }
            } else {
                None
            };

            let application = Arc::new(application);
            let replica_hosts: Arc<HashSet<u32>> =
                Arc::new(replicas.iter().map(|r| r.host_process_id).collect());
            for replica in replicas {
                let context = context.clone();
                let semaphore = semaphore.clone();
                let application = application.clone();
                let replica_hosts = replica_hosts.clone();
                let governance = governance.clone();
                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return Vec::new();
                    };
                    context
                        .resolve_replica(&application, replica, &replica_hosts, governance.as_deref())
                        .await
                });
            }
        }

        let mut entities = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(mut resolved) => entities.append(&mut resolved),
                Err(e) => warn!(error = %e, "Entity resolution task failed"),
            }
        }

        if cancel.is_cancelled() {
            debug!("Resolution cancelled");
            return Err(ObserverError::Cancelled);
        }

        // false sorts before true: a service's primary precedes its helpers
        entities.sort_by(|a, b| {
            (&a.application_name, &a.service_name, a.is_helper, a.host_process_id).cmp(&(
                &b.application_name,
                &b.service_name,
                b.is_helper,
                b.host_process_id,
            ))
        });
        info!(node = %node_name, entities = entities.len(), "Topology resolved");
        Ok(entities)
    }
}
