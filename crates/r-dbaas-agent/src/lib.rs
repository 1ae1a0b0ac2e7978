//! ---
//! dbaas_section: "04-guest-agent"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Guest agent dispatcher, lifecycle state machine, and install orchestrator."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
//! Guest agent running inside each database instance.
//!
//! The [`server::AgentServer`] drains the instance mailbox one delivery at a
//! time and hands each request to the [`manager::Manager`], which checks the
//! protocol version, decodes the verb and runs it against the datastore
//! collaborators. [`status::StatusBook`] is the single owner of the instance
//! status; the dispatcher and the heartbeat both write through it.

use r_dbaas_common::ProtocolVersion;
use r_dbaas_rpc::{FailureDescriptor, FailureKind, ServiceStatus};

pub mod collaborators;
pub mod heartbeat;
pub mod manager;
pub mod memory;
pub mod prepare;
pub mod server;
pub mod status;

pub use collaborators::{
    Admin, AppHealth, Application, ClusterExtension, CollaboratorError, CollaboratorResult,
    Collaborators, Package, Volume,
};
pub use heartbeat::Heartbeat;
pub use manager::Manager;
pub use memory::{MemoryDatastore, RecordedCall};
pub use prepare::{InstallOrchestrator, InstallPhase};
pub use server::{AgentRuntime, AgentServer, AgentSpec};
pub use status::{
    FileStatusStore, MemoryStatusStore, StatusBook, StatusReporter, StatusStore, StatusUpdate,
    StoreError, TransitionCause, TransitionError,
};

/// Result alias used across the agent.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Failures raised while serving an operation.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The request ceiling or the verb is outside what this agent serves.
    #[error("agent speaks {supported}, request requires {requested}")]
    VersionMismatch {
        /// Version the request asked for.
        requested: ProtocolVersion,
        /// Version this agent advertises.
        supported: ProtocolVersion,
    },
    /// The instance status does not admit the operation.
    #[error("{operation} is not allowed while {status}")]
    InvalidState {
        /// Verb that was rejected.
        operation: &'static str,
        /// Status at the time of the request.
        status: ServiceStatus,
    },
    /// No handler is registered for the verb.
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),
    /// Arguments did not decode into the verb's shape.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// An install phase failed; the instance has been marked failed.
    #[error("prepare failed during {phase}: {source}")]
    PhaseFailed {
        /// Phase that aborted the install.
        phase: InstallPhase,
        /// Collaborator failure.
        source: CollaboratorError,
    },
    /// A datastore collaborator failed.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    /// The status record could not be updated.
    #[error(transparent)]
    Transition(#[from] TransitionError),
    /// A result could not be encoded.
    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

impl AgentError {
    /// Failure kind carried back to the control plane.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AgentError::VersionMismatch { .. } => FailureKind::VersionMismatch,
            AgentError::InvalidState { .. } => FailureKind::InvalidState,
            AgentError::Transition(TransitionError::Illegal { .. }) => FailureKind::InvalidState,
            AgentError::UnknownOperation(_) => FailureKind::UnknownOperation,
            AgentError::InvalidArguments(_) => FailureKind::InvalidArguments,
            AgentError::PhaseFailed { .. }
            | AgentError::Collaborator(_)
            | AgentError::Transition(_)
            | AgentError::Encode(_) => FailureKind::Execution,
        }
    }

    /// Reply payload for this failure.
    pub fn to_failure(&self) -> FailureDescriptor {
        FailureDescriptor::new(self.failure_kind(), self.to_string())
    }
}
