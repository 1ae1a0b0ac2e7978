//! ---
//! dbaas_section: "02-rpc-protocol"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Instance status record shared by agent and control plane."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::InstanceId;

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    /// Provisioned, nothing installed yet.
    New,
    /// Prepare in progress.
    Building,
    /// Datastore serving.
    Running,
    /// Deliberately stopped.
    Shutdown,
    /// Install failed or the process crashed.
    Failed,
}

impl ServiceStatus {
    /// Upper-case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::New => "NEW",
            ServiceStatus::Building => "BUILDING",
            ServiceStatus::Running => "RUNNING",
            ServiceStatus::Shutdown => "SHUTDOWN",
            ServiceStatus::Failed => "FAILED",
        }
    }

    /// All states, in graph order.
    pub const ALL: [ServiceStatus; 5] = [
        ServiceStatus::New,
        ServiceStatus::Building,
        ServiceStatus::Running,
        ServiceStatus::Shutdown,
        ServiceStatus::Failed,
    ];
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted status of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Instance the record belongs to.
    pub instance_id: InstanceId,
    /// Current status.
    pub status: ServiceStatus,
    /// Last time the record was written.
    pub updated_at: DateTime<Utc>,
    /// Why the instance failed, when it did.
    #[serde(default)]
    pub reason: Option<String>,
}

impl StatusRecord {
    /// Fresh record in the initial state.
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            status: ServiceStatus::New,
            updated_at: Utc::now(),
            reason: None,
        }
    }
}
