//! Monitoring cycle driver
//!
//! One call to [`Monitor::run_cycle`] resolves the node's entities, samples
//! every enabled metric for each of them, evaluates the windows and hands
//! the resulting reports to the reporter. Scheduling cycles is the caller's
//! job.

use crate::error::{is_sentinel, ObserverError, Result, SENTINEL};
use crate::evaluator::{EvaluatorConfig, MetricThresholds, ThresholdEvaluator};
use crate::models::{HealthReport, MetricKind, MonitoredEntity};
use crate::observability::{ObserverMetrics, StructuredLogger};
use crate::provider::MetricsProvider;
use crate::reporting::HealthReporter;
use crate::topology::{AppFilter, TopologyResolver};
use crate::window::{ResourceUsageWindow, WindowMode, DEFAULT_DATA_CAPACITY};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Pause between CPU samples within one pass
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// Cycle driver settings
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub node_name: String,
    /// How long CPU is sampled per entity and pass
    pub monitor_duration: Duration,
    pub sample_interval: Duration,
    pub window_mode: WindowMode,
    /// Circular window capacity
    pub data_capacity: usize,
    pub thresholds: MetricThresholds,
    pub app_filter: AppFilter,
    /// Report private working set instead of full resident memory
    pub private_working_set: bool,
    pub evaluator: EvaluatorConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            node_name: "localhost".to_string(),
            monitor_duration: Duration::from_secs(1),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            window_mode: WindowMode::default(),
            data_capacity: DEFAULT_DATA_CAPACITY,
            thresholds: MetricThresholds::default(),
            app_filter: AppFilter::all(),
            private_working_set: false,
            evaluator: EvaluatorConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;
        if self.node_name.trim().is_empty() {
            return Err(ObserverError::InvalidConfig("node name is empty".to_string()));
        }
        if self.sample_interval.is_zero() {
            return Err(ObserverError::InvalidConfig("sample interval is zero".to_string()));
        }
        Ok(())
    }

    /// CPU samples taken per entity and pass, at least one
    pub fn cpu_rounds(&self) -> usize {
        let interval = self.sample_interval.as_millis().max(1);
        ((self.monitor_duration.as_millis() / interval) as usize).max(1)
    }

    fn window_capacity(&self) -> usize {
        self.window_mode
            .capacity(self.data_capacity, self.monitor_duration)
    }
}

/// Outcome of one monitoring cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub entities: usize,
    pub reports: usize,
    pub duration: Duration,
}

async fn read_metric(
    provider: &dyn MetricsProvider,
    metric: MetricKind,
    pid: u32,
    name: &str,
    private: bool,
) -> Result<f64> {
    match metric {
        MetricKind::CpuPercent => provider.cpu_percent(pid, Some(name)).await,
        MetricKind::MemoryMb => provider.working_set_mb(pid, private).await,
        MetricKind::Handles => provider.allocated_handles(pid).await,
        MetricKind::ActivePorts => provider.active_ports(pid).await,
        MetricKind::EphemeralPorts => provider.ephemeral_ports(pid).await,
    }
}

/// State the per-entity tasks share
struct Shared {
    provider: Arc<dyn MetricsProvider>,
    evaluator: ThresholdEvaluator,
    reporter: Arc<dyn HealthReporter>,
    windows: DashMap<(String, MetricKind), ResourceUsageWindow>,
    config: MonitorConfig,
    metrics: Option<ObserverMetrics>,
    logger: StructuredLogger,
}

impl Shared {
    async fn read(&self, pid: u32, name: &str, metric: MetricKind) -> Result<f64> {
        match read_metric(
            self.provider.as_ref(),
            metric,
            pid,
            name,
            self.config.private_working_set,
        )
        .await
        {
            Ok(value) => Ok(value),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_sampling_errors();
                }
                warn!(pid, metric = %metric, error = %e, "Metric sampling failed");
                Ok(SENTINEL)
            }
        }
    }

    /// Host process value plus its children's. `None` when the host value
    /// is unavailable; unavailable children are left out.
    async fn entity_value(&self, entity: &MonitoredEntity, metric: MetricKind) -> Result<Option<f64>> {
        let host = self
            .read(entity.host_process_id, &entity.host_process_name, metric)
            .await?;
        if is_sentinel(host) {
            return Ok(None);
        }

        let mut total = host;
        for child in &entity.child_processes {
            let value = self.read(child.pid, &child.name, metric).await?;
            if !is_sentinel(value) {
                total += value;
            }
        }
        Ok(Some(total))
    }

    async fn sample(
        &self,
        entity: &MonitoredEntity,
        cancel: &CancellationToken,
    ) -> Result<Vec<(MetricKind, Vec<f64>)>> {
        let enabled = self.config.thresholds.enabled_metrics();
        let mut samples = Vec::with_capacity(enabled.len());

        if enabled.contains(&MetricKind::CpuPercent) {
            let rounds = self.config.cpu_rounds();
            let mut cpu = Vec::with_capacity(rounds);
            for round in 0..rounds {
                if cancel.is_cancelled() {
                    return Err(ObserverError::Cancelled);
                }
                match self.entity_value(entity, MetricKind::CpuPercent).await? {
                    Some(value) => cpu.push(value),
                    None => {
                        debug!(
                            entity = %entity.id(),
                            pid = entity.host_process_id,
                            "Process gone or pid reused, stopping sampling"
                        );
                        if !cpu.is_empty() {
                            samples.push((MetricKind::CpuPercent, cpu));
                        }
                        return Ok(samples);
                    }
                }
                if round + 1 < rounds {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ObserverError::Cancelled),
                        _ = tokio::time::sleep(self.config.sample_interval) => {}
                    }
                }
            }
            samples.push((MetricKind::CpuPercent, cpu));
        }

        for metric in enabled.into_iter().filter(|m| *m != MetricKind::CpuPercent) {
            if cancel.is_cancelled() {
                return Err(ObserverError::Cancelled);
            }
            if let Some(value) = self.entity_value(entity, metric).await? {
                samples.push((metric, vec![value]));
            }
        }
        Ok(samples)
    }

    /// Sample, evaluate and report one entity. Returns the number of
    /// reports delivered.
    async fn observe(&self, entity: MonitoredEntity, cancel: CancellationToken) -> Result<usize> {
        let samples = self.sample(&entity, &cancel).await?;
        let id = entity.id();
        let entity_ref = entity.entity_ref(&self.config.node_name);
        let capacity = self.config.window_capacity();

        let mut delivered = 0;
        for (metric, values) in samples {
            let outcome = {
                let mut window = self
                    .windows
                    .entry((id.clone(), metric))
                    .or_insert_with(|| {
                        ResourceUsageWindow::new(id.clone(), metric, capacity, self.config.window_mode)
                    });
                for value in values {
                    window.push(value);
                }
                self.evaluator
                    .evaluate(&entity_ref, window.value_mut(), self.config.thresholds.get(metric))
            };

            let Some(report) = outcome? else {
                continue;
            };
            if let Some(metrics) = &self.metrics {
                metrics.inc_health_reports(report.state);
            }
            self.logger.log_health_report(&report);

            match self.reporter.report(&report).await {
                Ok(()) => delivered += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(
                    entity = %id,
                    metric = %metric,
                    error = %e,
                    "Health report delivery failed"
                ),
            }
        }
        Ok(delivered)
    }
}

/// Drives resolve, sample, evaluate and report for a node
pub struct Monitor {
    resolver: TopologyResolver,
    shared: Arc<Shared>,
    /// Pids sampled in the previous cycle
    tracked: Mutex<HashSet<u32>>,
}

impl Monitor {
    /// Fails on invalid thresholds or settings
    pub fn new(
        resolver: TopologyResolver,
        provider: Arc<dyn MetricsProvider>,
        reporter: Arc<dyn HealthReporter>,
        config: MonitorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            resolver,
            shared: Arc::new(Shared {
                provider,
                evaluator: ThresholdEvaluator::new(config.evaluator.clone()),
                reporter,
                windows: DashMap::new(),
                logger: StructuredLogger::new(config.node_name.clone()),
                config,
                metrics: None,
            }),
            tracked: Mutex::new(HashSet::new()),
        })
    }

    /// Record cycle metrics; call before the first cycle
    pub fn with_metrics(mut self, metrics: ObserverMetrics) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.metrics = Some(metrics);
        }
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.shared.config
    }

    pub fn evaluator(&self) -> &ThresholdEvaluator {
        &self.shared.evaluator
    }

    pub fn resolver(&self) -> &TopologyResolver {
        &self.resolver
    }

    /// Windows currently held across cycles
    pub fn window_count(&self) -> usize {
        self.shared.windows.len()
    }

    /// Run one monitoring pass.
    ///
    /// Per-entity failures are logged and skipped. Capability loss and
    /// invalid thresholds abort the cycle and are returned.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary> {
        let started = Instant::now();
        let config = &self.shared.config;
        let entities = self
            .resolver
            .resolve(&config.node_name, &config.app_filter, cancel)
            .await?;
        let entity_count = entities.len();

        let live: HashSet<String> = entities.iter().map(|e| e.id()).collect();
        let pids: HashSet<u32> = entities
            .iter()
            .flat_map(|e| {
                std::iter::once(e.host_process_id).chain(e.child_processes.iter().map(|c| c.pid))
            })
            .collect();

        let mut reports = self.prune(&live, pids).await;

        let semaphore = Arc::new(Semaphore::new(self.resolver.concurrency()));
        let mut tasks = JoinSet::new();
        for entity in entities {
            let shared = self.shared.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Ok(0);
                };
                shared.observe(entity, cancel).await
            });
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(delivered)) => reports += delivered,
                Ok(Err(e)) if e.is_fatal() => {
                    tasks.abort_all();
                    failure.get_or_insert(e);
                }
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(error = %e, "Entity monitoring failed"),
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!(error = %e, "Entity monitoring task panicked"),
            }
        }

        if let Some(error) = failure {
            if let ObserverError::CapabilitiesLost(details) = &error {
                self.shared.logger.log_capabilities_lost(details);
            }
            return Err(error);
        }
        if cancel.is_cancelled() {
            debug!("Monitoring cycle cancelled");
            return Err(ObserverError::Cancelled);
        }

        let duration = started.elapsed();
        if let Some(metrics) = &self.shared.metrics {
            metrics.observe_cycle_duration(duration);
            metrics.set_monitored_entities(entity_count);
        }
        self.shared
            .logger
            .log_cycle_complete(entity_count, reports, duration);

        Ok(CycleSummary {
            entities: entity_count,
            reports,
            duration,
        })
    }

    /// Drop windows and provider state of vanished entities and retract
    /// their active reports. Runs before sampling so a retraction never
    /// lands after a newer report for the same property. Returns the number
    /// of retractions delivered.
    async fn prune(&self, live: &HashSet<String>, pids: HashSet<u32>) -> usize {
        self.shared.windows.retain(|(id, _), _| live.contains(id));

        if let Ok(mut tracked) = self.tracked.lock() {
            for pid in tracked.difference(&pids) {
                self.shared.provider.forget(*pid);
            }
            *tracked = pids;
        }

        let retired = self.shared.evaluator.retire_entities(live);
        if !retired.is_empty() {
            debug!(count = retired.len(), "Retracting reports of vanished entities");
        }
        self.deliver_clears(retired).await
    }

    /// Retract every active Warning/Error with a short-lived Ok report.
    /// Returns the number delivered.
    pub async fn clear_reports(&self) -> usize {
        self.deliver_clears(self.shared.evaluator.clear_reports()).await
    }

    async fn deliver_clears(&self, reports: Vec<HealthReport>) -> usize {
        let mut delivered = 0;
        for report in reports {
            self.shared.logger.log_health_report(&report);
            match self.shared.reporter.report(&report).await {
                Ok(()) => {
                    delivered += 1;
                    if let Some(metrics) = &self.shared.metrics {
                        metrics.inc_health_reports(report.state);
                    }
                }
                Err(e) => warn!(
                    entity = %report.entity.id,
                    property = %report.property,
                    error = %e,
                    "Failed to clear health report"
                ),
            }
        }
        delivered
    }
}
