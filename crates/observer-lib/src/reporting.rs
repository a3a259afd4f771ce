//! Health report delivery

use crate::error::{DirectoryError, Result};
use crate::models::HealthReport;
use crate::topology::ConnectionManager;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Receives every report the evaluator emits. Delivery is attempted once;
/// a report is only valid for its TTL anyway.
#[async_trait]
pub trait HealthReporter: Send + Sync {
    async fn report(&self, report: &HealthReport) -> Result<()>;
}

/// Submits reports through the shared directory client
pub struct DirectoryHealthReporter {
    connections: Arc<ConnectionManager>,
}

impl DirectoryHealthReporter {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }
}

#[async_trait]
impl HealthReporter for DirectoryHealthReporter {
    async fn report(&self, report: &HealthReport) -> Result<()> {
        let client = self.connections.get_or_create()?;
        match client.report_health(report).await {
            Ok(()) => {
                debug!(
                    entity = %report.entity.id,
                    property = %report.property,
                    state = report.state.as_str(),
                    "Health report submitted"
                );
                Ok(())
            }
            Err(e) => {
                if e == DirectoryError::Closed {
                    self.connections.invalidate();
                }
                Err(e.into())
            }
        }
    }
}
