//! ---
//! dbaas_section: "04-guest-agent"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Multi-phase install sequence run once per instance."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
//! The install sequence ("prepare").
//!
//! Phases run strictly in order and any failure aborts the rest. The instance
//! is moved to `BUILDING` before the first collaborator call and ends either
//! `RUNNING` or `FAILED` with the failing phase recorded as the reason.

use std::fmt;
use std::sync::Arc;

use r_dbaas_rpc::{PrepareRequest, ServiceStatus};
use tracing::{debug, error, info};

use crate::collaborators::{AppHealth, CollaboratorError, Collaborators};
use crate::status::{StatusBook, TransitionCause, TransitionError};
use crate::AgentError;

/// Install phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPhase {
    /// Format and mount the data device.
    Volume,
    /// Install missing datastore packages.
    Packages,
    /// Hand the mount point to the service account.
    Ownership,
    /// Write the initial configuration.
    Configuration,
    /// First start, or restore from backup.
    Start,
    /// Create the requested databases and users.
    Objects,
    /// Join the cluster named in the request.
    ClusterJoin,
}

impl InstallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallPhase::Volume => "volume",
            InstallPhase::Packages => "packages",
            InstallPhase::Ownership => "ownership",
            InstallPhase::Configuration => "configuration",
            InstallPhase::Start => "start",
            InstallPhase::Objects => "objects",
            InstallPhase::ClusterJoin => "cluster_join",
        }
    }
}

impl fmt::Display for InstallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct PhaseError {
    phase: InstallPhase,
    source: CollaboratorError,
}

trait InPhase<T> {
    fn in_phase(self, phase: InstallPhase) -> Result<T, PhaseError>;
}

impl<T> InPhase<T> for Result<T, CollaboratorError> {
    fn in_phase(self, phase: InstallPhase) -> Result<T, PhaseError> {
        self.map_err(|source| PhaseError { phase, source })
    }
}

/// Runs the one-time install for an instance.
#[derive(Debug, Clone)]
pub struct InstallOrchestrator {
    book: Arc<StatusBook>,
    collaborators: Collaborators,
}

impl InstallOrchestrator {
    pub fn new(book: Arc<StatusBook>, collaborators: Collaborators) -> Self {
        Self {
            book,
            collaborators,
        }
    }

    /// Run prepare. Rejected with [`AgentError::InvalidState`] and no
    /// collaborator calls unless the instance is `NEW`.
    pub async fn run(&self, request: &PrepareRequest) -> Result<(), AgentError> {
        self.book.begin_install().map_err(|err| match err {
            TransitionError::Illegal { from, .. } => AgentError::InvalidState {
                operation: "prepare",
                status: from,
            },
            other => AgentError::Transition(other),
        })?;
        info!(
            instance = %self.book.instance_id(),
            mount_point = %request.mount_point.display(),
            "prepare started"
        );

        match self.execute(request).await {
            Ok(()) => {
                let recorded = self
                    .book
                    .transition(ServiceStatus::Running, TransitionCause::Install, None);
                if let Err(err) = recorded {
                    error!(
                        instance = %self.book.instance_id(),
                        error = %err,
                        "prepare could not record RUNNING"
                    );
                    let _ = self.book.abandon_install(format!("persist: {err}"));
                    return Err(err.into());
                }
                info!(instance = %self.book.instance_id(), "prepare completed");
                Ok(())
            }
            Err(PhaseError { phase, source }) => {
                error!(
                    instance = %self.book.instance_id(),
                    %phase,
                    error = %source,
                    "prepare failed"
                );
                let _ = self.book.abandon_install(format!("{phase}: {source}"));
                Err(AgentError::PhaseFailed { phase, source })
            }
        }
    }

    async fn execute(&self, request: &PrepareRequest) -> Result<(), PhaseError> {
        let c = &self.collaborators;

        if let Some(device) = &request.device_path {
            debug!(%device, "preparing volume");
            c.volume.format(device).await.in_phase(InstallPhase::Volume)?;
            c.volume
                .mount(device, &request.mount_point)
                .await
                .in_phase(InstallPhase::Volume)?;
            let mounted = c
                .volume
                .mount_points(device)
                .await
                .in_phase(InstallPhase::Volume)?;
            if !mounted.iter().any(|point| point == &request.mount_point) {
                return Err(PhaseError {
                    phase: InstallPhase::Volume,
                    source: CollaboratorError::new(
                        "volume",
                        format!(
                            "{} is not mounted at {}",
                            device,
                            request.mount_point.display()
                        ),
                    ),
                });
            }
        }

        if let Some(packages) = &request.packages {
            let installed = c
                .package
                .is_installed(packages)
                .await
                .in_phase(InstallPhase::Packages)?;
            if !installed {
                c.package
                    .install(packages)
                    .await
                    .in_phase(InstallPhase::Packages)?;
            }
        }

        c.application
            .change_ownership(&request.mount_point)
            .await
            .in_phase(InstallPhase::Ownership)?;

        if let Some(contents) = &request.config_contents {
            c.application
                .write_config(contents)
                .await
                .in_phase(InstallPhase::Configuration)?;
        }

        let overrides = request.overrides.as_ref();
        match &request.backup_info {
            Some(backup) => {
                info!(backup = %backup.id, "restoring from backup");
                c.application
                    .restore(backup, overrides)
                    .await
                    .in_phase(InstallPhase::Start)?;
            }
            None => c
                .application
                .start(overrides)
                .await
                .in_phase(InstallPhase::Start)?,
        }
        let health = c.application.health().await;
        if health != AppHealth::Alive {
            return Err(PhaseError {
                phase: InstallPhase::Start,
                source: CollaboratorError::new(
                    "application",
                    format!("datastore {health} after start"),
                ),
            });
        }

        if let Some(databases) = &request.databases {
            c.admin
                .create_database(databases)
                .await
                .in_phase(InstallPhase::Objects)?;
        }
        if let Some(users) = &request.users {
            c.admin
                .create_user(users)
                .await
                .in_phase(InstallPhase::Objects)?;
        }

        if let Some(cluster) = &request.cluster_config {
            let extension = c.cluster.as_ref().ok_or_else(|| PhaseError {
                phase: InstallPhase::ClusterJoin,
                source: CollaboratorError::new("cluster", "datastore has no cluster extension"),
            })?;
            extension
                .join(cluster)
                .await
                .in_phase(InstallPhase::ClusterJoin)?;
        }

        Ok(())
    }
}
