//! ---
//! dbaas_section: "04-guest-agent"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Contracts for the datastore collaborators the agent drives."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use r_dbaas_rpc::{
    BackupInfo, ClusterConfig, ClusterMember, ConfigOverrides, DatabaseSpec, ListQuery, Page,
    UserSpec,
};
use serde::{Deserialize, Serialize};

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{component}: {message}")]
pub struct CollaboratorError {
    /// Collaborator that failed, e.g. `volume` or `admin`.
    pub component: &'static str,
    /// Collaborator supplied detail.
    pub message: String,
}

impl CollaboratorError {
    pub fn new(component: &'static str, message: impl Into<String>) -> Self {
        Self {
            component,
            message: message.into(),
        }
    }
}

pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

/// Outcome of probing the datastore process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppHealth {
    /// Process is up and answering.
    Alive,
    /// Process exited cleanly.
    Exited,
    /// Process died unexpectedly.
    Crashed,
}

impl fmt::Display for AppHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AppHealth::Alive => "alive",
            AppHealth::Exited => "exited",
            AppHealth::Crashed => "crashed",
        };
        f.write_str(label)
    }
}

/// Block device preparation.
#[async_trait]
pub trait Volume: Send + Sync {
    /// Create a fresh filesystem on the device.
    async fn format(&self, device: &str) -> CollaboratorResult<()>;
    async fn mount(&self, device: &str, mount_point: &Path) -> CollaboratorResult<()>;
    /// Mount points currently backed by the device.
    async fn mount_points(&self, device: &str) -> CollaboratorResult<Vec<PathBuf>>;
}

/// Native package manager.
#[async_trait]
pub trait Package: Send + Sync {
    /// Whether every package is already present.
    async fn is_installed(&self, packages: &[String]) -> CollaboratorResult<bool>;
    async fn install(&self, packages: &[String]) -> CollaboratorResult<()>;
}

/// Datastore process control.
#[async_trait]
pub trait Application: Send + Sync {
    /// Start with an empty data directory.
    async fn start(&self, overrides: Option<&ConfigOverrides>) -> CollaboratorResult<()>;
    /// Start from a backup instead of an empty data directory.
    async fn restore(
        &self,
        backup: &BackupInfo,
        overrides: Option<&ConfigOverrides>,
    ) -> CollaboratorResult<()>;
    /// Stop the process, optionally disabling start on boot.
    async fn stop(&self, do_not_start_on_reboot: bool) -> CollaboratorResult<()>;
    async fn restart(&self) -> CollaboratorResult<()>;
    /// Hand the data directory to the datastore service account.
    async fn change_ownership(&self, mount_point: &Path) -> CollaboratorResult<()>;
    /// Write configuration before the first start.
    async fn write_config(&self, contents: &str) -> CollaboratorResult<()>;
    /// Replace the stored configuration of a running datastore.
    async fn reset_configuration(&self, contents: &str) -> CollaboratorResult<()>;
    /// Probe used after start and by every heartbeat.
    async fn health(&self) -> AppHealth;
}

/// Engine administration commands.
#[async_trait]
pub trait Admin: Send + Sync {
    /// Create the given databases.
    async fn create_database(&self, databases: &[DatabaseSpec]) -> CollaboratorResult<()>;
    async fn delete_database(&self, databases: &[DatabaseSpec]) -> CollaboratorResult<()>;
    async fn create_user(&self, users: &[UserSpec]) -> CollaboratorResult<()>;
    async fn delete_user(&self, users: &[UserSpec]) -> CollaboratorResult<()>;
    /// One page of databases, ordered by name.
    async fn list_databases(&self, query: &ListQuery) -> CollaboratorResult<Page<DatabaseSpec>>;
    /// One page of users, ordered by name.
    async fn list_users(&self, query: &ListQuery) -> CollaboratorResult<Page<UserSpec>>;
    /// Look up a user; `None` when it does not exist.
    async fn get_user(
        &self,
        username: &str,
        hostname: Option<&str>,
    ) -> CollaboratorResult<Option<UserSpec>>;
}

/// Member side of a cluster-capable datastore.
#[async_trait]
pub trait ClusterExtension: Send + Sync {
    /// Public keys of `user` on this member.
    async fn get_public_keys(&self, user: &str) -> CollaboratorResult<Vec<String>>;
    /// Trust `keys` for `user` on this member.
    async fn authorize_public_keys(&self, user: &str, keys: &[String]) -> CollaboratorResult<()>;
    /// Install the cluster across the given members.
    async fn install_cluster(&self, members: &[ClusterMember]) -> CollaboratorResult<()>;
    /// Acknowledge that bootstrap finished.
    async fn cluster_complete(&self) -> CollaboratorResult<()>;
    /// Called at the end of prepare for instances created as cluster members.
    async fn join(&self, config: &ClusterConfig) -> CollaboratorResult<()>;
}

/// Constructor-injected collaborator set for one instance.
#[derive(Clone)]
pub struct Collaborators {
    pub volume: Arc<dyn Volume>,
    pub package: Arc<dyn Package>,
    pub application: Arc<dyn Application>,
    pub admin: Arc<dyn Admin>,
    /// Present only for datastores that ship a cluster strategy.
    pub cluster: Option<Arc<dyn ClusterExtension>>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("cluster", &self.cluster.is_some())
            .finish_non_exhaustive()
    }
}
