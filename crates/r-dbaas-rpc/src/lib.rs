//! ---
//! dbaas_section: "02-rpc-protocol"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Guest operation protocol, verb table, and transport contract."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
//! Remote operation protocol spoken between the control plane and guest agents.
//!
//! The control plane builds an [`OperationRequest`] from a typed [`Operation`]
//! or [`ClusterOperation`], ships it through a [`Transport`], and the agent
//! decodes the name/argument pair back into the same tagged union.
#![warn(missing_docs)]

use std::time::Duration;

use r_dbaas_common::ProtocolVersion;

pub mod ops;
pub mod status;
pub mod transport;
pub mod types;

/// Shared result type for protocol operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Failures surfaced to callers of the remote operation proxy.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The agent could not be reached; safe to retry.
    #[error("agent for instance {instance} is unreachable: {reason}")]
    TransportUnreachable {
        /// Target instance.
        instance: InstanceId,
        /// Transport level explanation.
        reason: String,
    },
    /// No reply arrived in time. The remote side may or may not have acted.
    #[error("{operation} on instance {instance} timed out after {timeout:?}")]
    Timeout {
        /// Target instance.
        instance: InstanceId,
        /// Operation name.
        operation: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// The request version ceiling is not servable by the agent, or the verb
    /// is newer than the caller's ceiling.
    #[error("protocol version mismatch for {operation}: {detail}")]
    VersionMismatch {
        /// Operation name.
        operation: String,
        /// Human readable explanation.
        detail: String,
    },
    /// The agent ran the action and it failed.
    #[error("remote execution of {operation} failed: {failure}")]
    RemoteExecution {
        /// Operation name.
        operation: String,
        /// Failure reported by the agent.
        failure: FailureDescriptor,
    },
    /// The instance was not in a state that admits the operation.
    #[error("invalid state for {operation}: {detail}")]
    InvalidState {
        /// Operation name.
        operation: String,
        /// Human readable explanation.
        detail: String,
    },
    /// The agent has no handler for the operation.
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),
    /// Arguments or results could not be (de)serialized.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl RpcError {
    /// Rebuild a caller-side error from the failure an agent replied with.
    pub fn from_failure(operation: &str, failure: FailureDescriptor) -> Self {
        match failure.kind {
            FailureKind::VersionMismatch => RpcError::VersionMismatch {
                operation: operation.to_owned(),
                detail: failure.message,
            },
            FailureKind::InvalidState => RpcError::InvalidState {
                operation: operation.to_owned(),
                detail: failure.message,
            },
            FailureKind::UnknownOperation => RpcError::UnknownOperation(operation.to_owned()),
            FailureKind::InvalidArguments | FailureKind::Execution => RpcError::RemoteExecution {
                operation: operation.to_owned(),
                failure,
            },
        }
    }

    /// Only transport failures are known not to have reached the agent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::TransportUnreachable { .. })
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RpcError::TransportUnreachable { .. } => "unreachable",
            RpcError::Timeout { .. } => "timeout",
            RpcError::VersionMismatch { .. } => "version_mismatch",
            RpcError::RemoteExecution { .. } => "remote_error",
            RpcError::InvalidState { .. } => "invalid_state",
            RpcError::UnknownOperation(_) => "unknown_operation",
            RpcError::Codec(_) => "codec",
        }
    }
}

/// Oldest protocol version; carries the base lifecycle verbs.
pub const BASE_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0);
/// Version that introduced the cluster verbs.
pub const CLUSTER_VERSION: ProtocolVersion = ProtocolVersion::new(1, 1);

pub use ops::{
    AuthorizeKeysArgs, ClusterOperation, CreateDatabaseArgs, CreateUserArgs, DeleteDatabaseArgs,
    DeleteUserArgs, GetUserArgs, InstallClusterArgs, ListQuery, Operation, PublicKeysArgs,
    ResetConfigurationArgs, StopDbArgs,
};
pub use status::{ServiceStatus, StatusRecord};
pub use transport::{Delivery, InMemoryTransport, Mailbox, Transport};
pub use types::{
    BackupInfo, CallMode, ClusterConfig, ClusterMember, ConfigOverrides, DatabaseSpec,
    FailureDescriptor, FailureKind, InstanceId, MemberRole, OperationReply, OperationRequest,
    Page, PrepareRequest, TimeoutClass, UserSpec,
};
