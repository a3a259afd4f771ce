//! Liveness and readiness tracking
//!
//! Components of the observer record their state here after every cycle;
//! the agent's HTTP probes read it back.

use crate::error::{ObserverError, Result};
use crate::monitor::CycleSummary;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still operating, last cycle partly failed
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        let mut status = ComponentStatus::Healthy;
        for health in components.values() {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => status = ComponentStatus::Degraded,
                ComponentStatus::Healthy => {}
            }
        }
        status
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const RESOLVER: &str = "resolver";
    pub const PROVIDER: &str = "provider";
    pub const REPORTER: &str = "reporter";
}

/// Health registry for tracking component health
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
        }
    }

    /// Register a component with initial healthy status
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components.write().await.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Reflect the outcome of a monitoring cycle in component health.
    ///
    /// Capability loss marks the provider unhealthy, directory failures
    /// degrade the resolver. Cancellation changes nothing.
    pub async fn record_cycle(&self, outcome: &Result<CycleSummary>) {
        match outcome {
            Ok(_) => {
                self.set_healthy(components::RESOLVER).await;
                self.set_healthy(components::PROVIDER).await;
            }
            Err(ObserverError::Cancelled) => {}
            Err(e @ ObserverError::CapabilitiesLost(_)) => {
                self.set_unhealthy(components::PROVIDER, e.to_string()).await;
            }
            Err(e @ ObserverError::Directory(_)) => {
                self.set_degraded(components::RESOLVER, e.to_string()).await;
            }
            Err(e) if e.is_fatal() => {
                self.set_unhealthy(components::RESOLVER, e.to_string()).await;
            }
            Err(e) => {
                self.set_degraded(components::RESOLVER, e.to_string()).await;
            }
        }
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        let health = self.health().await;

        let reason = if !ready {
            Some("No monitoring cycle has completed yet")
        } else if health.status == ComponentStatus::Unhealthy {
            Some("Critical component unhealthy")
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason: reason.map(String::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DirectoryError;
    use std::time::Duration;

    #[tokio::test]
    async fn test_health_registry_initial_state() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_health_registry_component_registration() {
        let registry = HealthRegistry::new();
        registry.register(components::RESOLVER).await;

        let health = registry.health().await;
        assert_eq!(
            health.components[components::RESOLVER].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_directory_failure_degrades_resolver() {
        let registry = HealthRegistry::new();
        registry.register(components::RESOLVER).await;
        registry.register(components::PROVIDER).await;

        let outcome: Result<CycleSummary> = Err(ObserverError::Directory(DirectoryError::Timeout {
            operation: "deployed_applications",
            timeout: Duration::from_secs(120),
        }));
        registry.record_cycle(&outcome).await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert!(health.components[components::RESOLVER].message.is_some());
    }

    #[tokio::test]
    async fn test_capability_loss_is_unhealthy() {
        let registry = HealthRegistry::new();
        registry.register(components::PROVIDER).await;
        registry.set_ready(true).await;

        let outcome: Result<CycleSummary> =
            Err(ObserverError::CapabilitiesLost("permission denied".to_string()));
        registry.record_cycle(&outcome).await;

        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
        assert!(!registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_successful_cycle_restores_health() {
        let registry = HealthRegistry::new();
        registry.set_degraded(components::RESOLVER, "timeout").await;

        let outcome = Ok(CycleSummary {
            entities: 3,
            reports: 0,
            duration: Duration::from_secs(2),
        });
        registry.record_cycle(&outcome).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_readiness_not_ready_initially() {
        let registry = HealthRegistry::new();
        let readiness = registry.readiness().await;

        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }

    #[tokio::test]
    async fn test_readiness_ready_when_set() {
        let registry = HealthRegistry::new();
        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);
    }
}
