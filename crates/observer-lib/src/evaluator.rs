//! Threshold evaluation
//!
//! Reduces a window to a health decision. Warning and Error reports are
//! re-emitted every pass while the condition holds so their TTL keeps being
//! refreshed. A single Ok report retracts a previously active Warning/Error;
//! entities that were always healthy produce no reports at all.

use crate::error::{ObserverError, Result};
use crate::models::{EntityRef, HealthReport, HealthState, MetricKind};
use crate::window::ResourceUsageWindow;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

/// TTL used when retracting reports at shutdown
pub const CLEAR_REPORT_TTL: Duration = Duration::from_secs(1);

/// Error/warning limits for one metric. Values <= 0 disable a level.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default)]
    pub error: f64,
    #[serde(default)]
    pub warning: f64,
}

impl Thresholds {
    pub fn new(error: f64, warning: f64) -> Self {
        Self { error, warning }
    }

    pub fn is_disabled(&self) -> bool {
        self.error <= 0.0 && self.warning <= 0.0
    }

    /// Reject limits that can never be evaluated meaningfully
    pub fn validate(&self, metric: MetricKind) -> Result<()> {
        for value in [self.error, self.warning] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(metric, value, "must be a non-negative number"));
            }
            if metric == MetricKind::CpuPercent && value > 100.0 {
                return Err(invalid(metric, value, "percentage must be within 0-100"));
            }
        }
        if self.error > 0.0 && self.warning > self.error {
            return Err(invalid(
                metric,
                self.warning,
                "warning threshold exceeds error threshold",
            ));
        }
        Ok(())
    }

    fn classify(&self, average: f64) -> HealthState {
        if self.error > 0.0 && average >= self.error {
            HealthState::Error
        } else if self.warning > 0.0 && average >= self.warning {
            HealthState::Warning
        } else {
            HealthState::Ok
        }
    }

    fn limit_for(&self, state: HealthState) -> f64 {
        match state {
            HealthState::Error => self.error,
            _ => self.warning,
        }
    }
}

fn invalid(metric: MetricKind, value: f64, reason: &str) -> ObserverError {
    ObserverError::InvalidThreshold {
        metric: metric.as_str(),
        value,
        reason: reason.to_string(),
    }
}

/// Thresholds for every sampled metric
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricThresholds {
    pub cpu_percent: Thresholds,
    pub memory_mb: Thresholds,
    pub handles: Thresholds,
    pub active_ports: Thresholds,
    pub ephemeral_ports: Thresholds,
}

impl MetricThresholds {
    pub fn get(&self, metric: MetricKind) -> Thresholds {
        match metric {
            MetricKind::CpuPercent => self.cpu_percent,
            MetricKind::MemoryMb => self.memory_mb,
            MetricKind::Handles => self.handles,
            MetricKind::ActivePorts => self.active_ports,
            MetricKind::EphemeralPorts => self.ephemeral_ports,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for metric in MetricKind::ALL {
            self.get(metric).validate(metric)?;
        }
        Ok(())
    }

    /// Metrics with at least one enabled level
    pub fn enabled_metrics(&self) -> Vec<MetricKind> {
        MetricKind::ALL
            .into_iter()
            .filter(|m| !self.get(*m).is_disabled())
            .collect()
    }
}

/// Report identity and lifetime settings
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    pub source_id: String,
    pub ttl: Duration,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            source_id: "AppObserver".to_string(),
            ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveReport {
    state: HealthState,
    entity: EntityRef,
}

/// Turns windows into health reports and remembers which ones are active
pub struct ThresholdEvaluator {
    config: EvaluatorConfig,
    active: DashMap<(String, MetricKind), ActiveReport>,
}

impl ThresholdEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self {
            config,
            active: DashMap::new(),
        }
    }

    /// Evaluate a window and clear it.
    ///
    /// Returns `None` when both levels are disabled, the window is empty, or
    /// the entity is healthy and had nothing to retract.
    pub fn evaluate(
        &self,
        entity: &EntityRef,
        window: &mut ResourceUsageWindow,
        thresholds: Thresholds,
    ) -> Result<Option<HealthReport>> {
        let outcome = self.decide(entity, window, thresholds);
        window.clear();
        outcome
    }

    fn decide(
        &self,
        entity: &EntityRef,
        window: &ResourceUsageWindow,
        thresholds: Thresholds,
    ) -> Result<Option<HealthReport>> {
        let metric = window.metric();
        thresholds.validate(metric)?;

        if thresholds.is_disabled() {
            return Ok(None);
        }
        let Some(average) = window.average() else {
            return Ok(None);
        };

        let key = (entity.id.clone(), metric);
        let state = thresholds.classify(average);

        if state == HealthState::Ok {
            let Some((_, previous)) = self.active.remove(&key) else {
                return Ok(None);
            };
            debug!(
                entity = %entity.id,
                metric = %metric,
                previous = previous.state.as_str(),
                "Retracting active health report"
            );
            let message = format!(
                "{}({}) {} average {:.2}{} is back below thresholds",
                entity.process_name,
                entity.process_id,
                metric.property_name(),
                average,
                metric.unit()
            );
            return Ok(Some(self.report(entity, metric, state, message, Some(average), self.config.ttl)));
        }

        let limit = thresholds.limit_for(state);
        let message = format!(
            "{}({}) {} average {:.2}{} (max {:.2}) over {} samples is at or above {} threshold {}",
            entity.process_name,
            entity.process_id,
            metric.property_name(),
            average,
            metric.unit(),
            window.max().unwrap_or(average),
            window.len(),
            state.as_str(),
            limit
        );
        self.active.insert(
            key,
            ActiveReport {
                state,
                entity: entity.clone(),
            },
        );
        Ok(Some(self.report(entity, metric, state, message, Some(average), self.config.ttl)))
    }

    fn report(
        &self,
        entity: &EntityRef,
        metric: MetricKind,
        state: HealthState,
        message: String,
        value: Option<f64>,
        ttl: Duration,
    ) -> HealthReport {
        HealthReport {
            entity: entity.clone(),
            metric,
            property: metric.report_property(&entity.process_name),
            state,
            message,
            ttl,
            source_id: self.config.source_id.clone(),
            value,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Last emitted non-Ok state for an entity/metric
    pub fn active_state(&self, entity_id: &str, metric: MetricKind) -> Option<HealthState> {
        self.active
            .get(&(entity_id.to_string(), metric))
            .map(|a| a.state)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Ok reports with a short TTL for every active Warning/Error.
    ///
    /// Used on shutdown so reports of a stopped agent do not linger.
    pub fn clear_reports(&self) -> Vec<HealthReport> {
        let keys: Vec<(String, MetricKind)> = self.active.iter().map(|e| e.key().clone()).collect();
        self.retract(keys)
    }

    /// Forget entities that no longer exist, returning Ok reports that
    /// retract whatever they still had active
    pub fn retire_entities(&self, live: &HashSet<String>) -> Vec<HealthReport> {
        let keys: Vec<(String, MetricKind)> = self
            .active
            .iter()
            .filter(|e| !live.contains(&e.key().0))
            .map(|e| e.key().clone())
            .collect();
        self.retract(keys)
    }

    fn retract(&self, keys: Vec<(String, MetricKind)>) -> Vec<HealthReport> {
        let mut reports = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(((_, metric), active)) = self.active.remove(&key) {
                let message = format!(
                    "Clearing {} report for {}({})",
                    metric.property_name(),
                    active.entity.process_name,
                    active.entity.process_id
                );
                reports.push(self.report(
                    &active.entity,
                    metric,
                    HealthState::Ok,
                    message,
                    None,
                    CLEAR_REPORT_TTL,
                ));
            }
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityType;
    use crate::window::WindowMode;

    fn entity() -> EntityRef {
        EntityRef {
            id: "fabric:/App/Svc:svc:100".into(),
            entity_type: EntityType::Service,
            node_name: "node-1".into(),
            application_name: Some("fabric:/App".into()),
            service_name: Some("fabric:/App/Svc".into()),
            process_name: "svc".into(),
            process_id: 100,
        }
    }

    fn window_with(values: &[f64]) -> ResourceUsageWindow {
        let mut w = ResourceUsageWindow::new("fabric:/App/Svc:svc:100", MetricKind::CpuPercent, 8, WindowMode::Circular);
        for v in values {
            w.push(*v);
        }
        w
    }

    #[test]
    fn test_empty_window_yields_nothing() {
        let evaluator = ThresholdEvaluator::new(EvaluatorConfig::default());
        let mut window = window_with(&[]);
        let report = evaluator
            .evaluate(&entity(), &mut window, Thresholds::new(90.0, 60.0))
            .unwrap();
        assert!(report.is_none());
    }

    #[test]
    fn test_disabled_thresholds_yield_nothing_and_clear() {
        let evaluator = ThresholdEvaluator::new(EvaluatorConfig::default());
        let mut window = window_with(&[99.0, 99.0]);
        let report = evaluator
            .evaluate(&entity(), &mut window, Thresholds::new(0.0, 0.0))
            .unwrap();
        assert!(report.is_none());
        assert!(window.is_empty());
    }

    #[test]
    fn test_equal_to_error_threshold_is_error() {
        let evaluator = ThresholdEvaluator::new(EvaluatorConfig::default());
        let mut window = window_with(&[80.0, 80.0]);
        let report = evaluator
            .evaluate(&entity(), &mut window, Thresholds::new(80.0, 50.0))
            .unwrap()
            .unwrap();
        assert_eq!(report.state, HealthState::Error);
        assert_eq!(report.property, "CPU Utilization (svc)");
        assert!(window.is_empty());
    }

    #[test]
    fn test_between_thresholds_is_warning() {
        let evaluator = ThresholdEvaluator::new(EvaluatorConfig::default());
        let mut window = window_with(&[60.0, 70.0]);
        let report = evaluator
            .evaluate(&entity(), &mut window, Thresholds::new(80.0, 50.0))
            .unwrap()
            .unwrap();
        assert_eq!(report.state, HealthState::Warning);
        assert_eq!(report.value, Some(65.0));
    }

    #[test]
    fn test_single_clear_after_warning() {
        let evaluator = ThresholdEvaluator::new(EvaluatorConfig::default());
        let thresholds = Thresholds::new(80.0, 50.0);

        let mut window = window_with(&[55.0]);
        let warning = evaluator.evaluate(&entity(), &mut window, thresholds).unwrap();
        assert_eq!(warning.map(|r| r.state), Some(HealthState::Warning));

        window.push(10.0);
        let clear = evaluator.evaluate(&entity(), &mut window, thresholds).unwrap();
        assert_eq!(clear.map(|r| r.state), Some(HealthState::Ok));

        window.push(10.0);
        let quiet = evaluator.evaluate(&entity(), &mut window, thresholds).unwrap();
        assert!(quiet.is_none());
    }

    #[test]
    fn test_healthy_entity_never_reports() {
        let evaluator = ThresholdEvaluator::new(EvaluatorConfig::default());
        let mut window = window_with(&[5.0, 6.0]);
        let report = evaluator
            .evaluate(&entity(), &mut window, Thresholds::new(80.0, 50.0))
            .unwrap();
        assert!(report.is_none());
    }

    #[test]
    fn test_cpu_threshold_out_of_range_is_rejected() {
        let evaluator = ThresholdEvaluator::new(EvaluatorConfig::default());
        let mut window = window_with(&[5.0]);
        let err = evaluator
            .evaluate(&entity(), &mut window, Thresholds::new(150.0, 50.0))
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(window.is_empty());
    }

    #[test]
    fn test_warning_above_error_is_rejected() {
        let t = Thresholds::new(100.0, 200.0);
        assert!(t.validate(MetricKind::MemoryMb).is_err());
        assert!(Thresholds::new(0.0, 200.0).validate(MetricKind::MemoryMb).is_ok());
    }

    #[test]
    fn test_clear_reports_retracts_active_states() {
        let evaluator = ThresholdEvaluator::new(EvaluatorConfig::default());
        let mut window = window_with(&[95.0]);
        evaluator
            .evaluate(&entity(), &mut window, Thresholds::new(90.0, 0.0))
            .unwrap();
        assert_eq!(
            evaluator.active_state(&entity().id, MetricKind::CpuPercent),
            Some(HealthState::Error)
        );

        let cleared = evaluator.clear_reports();
        assert_eq!(cleared.len(), 1);
        assert_eq!(cleared[0].state, HealthState::Ok);
        assert_eq!(cleared[0].ttl, CLEAR_REPORT_TTL);
        assert_eq!(evaluator.active_count(), 0);
    }

    #[test]
    fn test_retired_entity_is_retracted() {
        let evaluator = ThresholdEvaluator::new(EvaluatorConfig::default());
        let thresholds = Thresholds::new(90.0, 50.0);
        let mut other = entity();
        other.id = "fabric:/App/Other:other:200".into();
        other.process_name = "other".into();
        other.process_id = 200;

        let mut window = window_with(&[95.0]);
        evaluator.evaluate(&entity(), &mut window, thresholds).unwrap();
        window.push(60.0);
        evaluator.evaluate(&other, &mut window, thresholds).unwrap();
        assert_eq!(evaluator.active_count(), 2);

        let live = HashSet::from([other.id.clone()]);
        let retracted = evaluator.retire_entities(&live);
        assert_eq!(retracted.len(), 1);
        assert_eq!(retracted[0].entity.id, entity().id);
        assert_eq!(retracted[0].state, HealthState::Ok);
        assert_eq!(retracted[0].property, "CPU Utilization (svc)");
        assert_eq!(retracted[0].ttl, CLEAR_REPORT_TTL);

        assert_eq!(evaluator.active_count(), 1);
        assert_eq!(
            evaluator.active_state(&other.id, MetricKind::CpuPercent),
            Some(HealthState::Warning)
        );
        assert!(evaluator.retire_entities(&live).is_empty());
    }

    #[test]
    fn test_helper_clear_does_not_share_primary_property() {
        let evaluator = ThresholdEvaluator::new(EvaluatorConfig::default());
        let thresholds = Thresholds::new(90.0, 50.0);
        let primary = entity();
        let mut helper = entity();
        helper.id = "fabric:/App/Svc:sidecar:110".into();
        helper.process_name = "sidecar".into();
        helper.process_id = 110;

        let mut window = window_with(&[95.0]);
        let error = evaluator.evaluate(&primary, &mut window, thresholds).unwrap().unwrap();
        window.push(60.0);
        let warning = evaluator.evaluate(&helper, &mut window, thresholds).unwrap().unwrap();
        window.push(5.0);
        let clear = evaluator.evaluate(&helper, &mut window, thresholds).unwrap().unwrap();

        assert_eq!(error.state, HealthState::Error);
        assert_eq!(warning.property, clear.property);
        assert_eq!(clear.state, HealthState::Ok);
        assert_eq!(error.entity.service_name, clear.entity.service_name);
        assert_ne!(error.property, clear.property);
        assert_eq!(
            evaluator.active_state(&primary.id, MetricKind::CpuPercent),
            Some(HealthState::Error)
        );
    }

    #[test]
    fn test_enabled_metrics() {
        let thresholds = MetricThresholds {
            cpu_percent: Thresholds::new(90.0, 0.0),
            handles: Thresholds::new(0.0, 5000.0),
            ..Default::default()
        };
        assert_eq!(
            thresholds.enabled_metrics(),
            vec![MetricKind::CpuPercent, MetricKind::Handles]
        );
    }
}
