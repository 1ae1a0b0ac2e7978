//! ---
//! dbaas_section: "04-guest-agent"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Periodic datastore health evaluation feeding the status book."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use r_dbaas_metrics::AgentMetrics;
use r_dbaas_rpc::{ServiceStatus, StatusRecord};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::collaborators::{AppHealth, Application};
use crate::status::{StatusBook, TransitionError};

/// Status a heartbeat observation moves the instance to, if any.
pub fn evaluate(
    current: ServiceStatus,
    health: AppHealth,
    stopping: bool,
) -> Option<ServiceStatus> {
    match (current, health) {
        (ServiceStatus::New | ServiceStatus::Building, _) => None,
        (ServiceStatus::Running, AppHealth::Alive) => None,
        (ServiceStatus::Running, AppHealth::Exited) if stopping => Some(ServiceStatus::Shutdown),
        (ServiceStatus::Running, AppHealth::Exited | AppHealth::Crashed) => {
            Some(ServiceStatus::Failed)
        }
        (ServiceStatus::Shutdown, AppHealth::Crashed) => Some(ServiceStatus::Failed),
        (ServiceStatus::Shutdown, _) | (ServiceStatus::Failed, _) => None,
    }
}

/// Probes the datastore and reports what it saw to the status book.
#[derive(Clone)]
pub struct Heartbeat {
    book: Arc<StatusBook>,
    application: Arc<dyn Application>,
    metrics: Option<AgentMetrics>,
}

impl Heartbeat {
    pub fn new(
        book: Arc<StatusBook>,
        application: Arc<dyn Application>,
        metrics: Option<AgentMetrics>,
    ) -> Self {
        Self {
            book,
            application,
            metrics,
        }
    }

    /// One evaluation. Skips the probe entirely while the instance is new or building.
    pub async fn beat(&self) -> Result<Option<StatusRecord>, TransitionError> {
        if let Some(metrics) = &self.metrics {
            metrics.inc_heartbeat();
        }
        if matches!(
            self.book.status(),
            ServiceStatus::New | ServiceStatus::Building
        ) {
            return Ok(None);
        }
        let health = self.application.health().await;
        debug!(instance = %self.book.instance_id(), %health, "heartbeat probe");
        self.book.observe_health(health)
    }

    /// Run [`Heartbeat::beat`] on a fixed cadence until shutdown.
    pub fn spawn(self, period: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!(
                            instance = %self.book.instance_id(),
                            "heartbeat shutdown signal received"
                        );
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = self.beat().await {
                            warn!(
                                instance = %self.book.instance_id(),
                                error = %err,
                                "heartbeat could not update status"
                            );
                        }
                    }
                }
            }
        })
    }
}
