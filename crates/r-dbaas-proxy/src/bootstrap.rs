//! ---
//! dbaas_section: "03-control-plane-proxy"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Drives key exchange, cluster install, and completion acknowledgements."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
//! Cluster bootstrap.
//!
//! 1. Every member hands out its public keys; every member is told to trust all of them.
//! 2. The first member installs the cluster across the full membership.
//! 3. Every member is asked to acknowledge completion. The cluster is ready
//!    only when all of them did.

use std::sync::Arc;

use futures::future::join_all;
use r_dbaas_rpc::{ClusterMember, InstanceId, MemberRole};
use tracing::{info, warn};

use crate::cluster::{ClusterProxy, ClusterStrategy};
use crate::guest::GuestProxy;
use crate::ClusterError;

/// Outcome of a bootstrap run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterReport {
    pub cluster_id: String,
    /// Members that acknowledged, in membership order.
    pub acknowledged: Vec<InstanceId>,
    /// Members that did not, in membership order.
    pub pending: Vec<InstanceId>,
}

impl ClusterReport {
    pub fn is_ready(&self) -> bool {
        self.pending.is_empty() && !self.acknowledged.is_empty()
    }
}

/// One cluster being brought up from already-prepared members.
pub struct ClusterBootstrap {
    cluster_id: String,
    strategy: Arc<dyn ClusterStrategy>,
    members: Vec<(ClusterProxy, ClusterMember)>,
}

impl ClusterBootstrap {
    /// Members are `(proxy, address)` pairs; the first becomes the primary.
    pub fn new(
        cluster_id: impl Into<String>,
        strategy: Arc<dyn ClusterStrategy>,
        members: Vec<(GuestProxy, String)>,
    ) -> Self {
        let members = members
            .into_iter()
            .enumerate()
            .map(|(index, (guest, address))| {
                let descriptor = ClusterMember {
                    instance_id: guest.instance().clone(),
                    address,
                    role: if index == 0 {
                        MemberRole::Primary
                    } else {
                        MemberRole::Member
                    },
                };
                (strategy.guest_client(guest), descriptor)
            })
            .collect();
        Self {
            cluster_id: cluster_id.into(),
            strategy,
            members,
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Membership descriptor sent with `install_cluster`.
    pub fn descriptors(&self) -> Vec<ClusterMember> {
        self.members
            .iter()
            .map(|(_, descriptor)| descriptor.clone())
            .collect()
    }

    pub async fn run(&self) -> Result<ClusterReport, ClusterError> {
        let Some((primary, _)) = self.members.first() else {
            return Err(ClusterError::EmptyCluster(self.cluster_id.clone()));
        };
        let user = self.strategy.key_user();
        info!(
            cluster = %self.cluster_id,
            members = self.members.len(),
            datastore = %self.strategy.datastore(),
            "bootstrapping cluster"
        );

        let key_sets = join_all(
            self.members
                .iter()
                .map(|(proxy, _)| async move { (proxy, proxy.get_public_keys(user).await) }),
        )
        .await;
        let mut keys = Vec::new();
        for (proxy, result) in key_sets {
            keys.extend(result.map_err(|source| rpc_failure(proxy, "get_public_keys", source))?);
        }

        let authorized = join_all(self.members.iter().map(|(proxy, _)| {
            let keys = keys.clone();
            async move { (proxy, proxy.authorize_public_keys(user, keys).await) }
        }))
        .await;
        for (proxy, result) in authorized {
            result.map_err(|source| rpc_failure(proxy, "authorize_public_keys", source))?;
        }

        primary
            .install_cluster(self.descriptors())
            .await
            .map_err(|source| rpc_failure(primary, "install_cluster", source))?;

        let acks = join_all(
            self.members
                .iter()
                .map(|(proxy, _)| async move { (proxy, proxy.cluster_complete().await) }),
        )
        .await;
        let mut report = ClusterReport {
            cluster_id: self.cluster_id.clone(),
            acknowledged: Vec::new(),
            pending: Vec::new(),
        };
        for (proxy, result) in acks {
            let instance = proxy.guest().instance().clone();
            match result {
                Ok(()) => report.acknowledged.push(instance),
                Err(err) => {
                    warn!(
                        cluster = %self.cluster_id,
                        %instance,
                        error = %err,
                        "member did not acknowledge completion"
                    );
                    report.pending.push(instance);
                }
            }
        }

        if report.is_ready() {
            info!(cluster = %self.cluster_id, "cluster ready");
        }
        Ok(report)
    }
}

fn rpc_failure(
    proxy: &ClusterProxy,
    operation: &'static str,
    source: r_dbaas_rpc::RpcError,
) -> ClusterError {
    ClusterError::Member {
        instance: proxy.guest().instance().clone(),
        operation,
        source,
    }
}
