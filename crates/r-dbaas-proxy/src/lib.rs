//! ---
//! dbaas_section: "03-control-plane-proxy"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Control-plane proxies for guest agents and cluster bootstrap."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
//! Control-plane side of the guest protocol.
//!
//! [`GuestProxy`] turns typed verbs into [`r_dbaas_rpc::OperationRequest`]s,
//! [`ClusterProxy`] adds the cluster verbs, and [`ClusterBootstrap`] drives
//! a whole cluster through key exchange, install and completion.

pub mod bootstrap;
pub mod cluster;
pub mod guest;

use r_dbaas_common::DatastoreKind;
use r_dbaas_rpc::{InstanceId, RpcError};

pub use bootstrap::{ClusterBootstrap, ClusterReport};
pub use cluster::{ClusterProxy, ClusterStrategy, ClusterStrategyRegistry, VerticaStrategy};
pub use guest::GuestProxy;

/// Failures while assembling a cluster.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("no cluster strategy registered for datastore {0}")]
    NoStrategy(DatastoreKind),
    #[error("cluster {0} has no members")]
    EmptyCluster(String),
    #[error("{operation} failed on member {instance}: {source}")]
    Member {
        instance: InstanceId,
        operation: &'static str,
        #[source]
        source: RpcError,
    },
}
