//! ---
//! dbaas_section: "06-daemon"
//! dbaas_subsection: "binary"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "In-process fleet of guest agents driven through control-plane proxies."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
use std::cmp::min;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use indexmap::IndexMap;
use r_dbaas_agent::{AgentRuntime, AgentSpec, MemoryDatastore};
use r_dbaas_common::{AppConfig, InstanceConfig};
use r_dbaas_metrics::{AgentMetrics, ProxyMetrics, SharedRegistry};
use r_dbaas_proxy::{ClusterBootstrap, ClusterReport, ClusterStrategyRegistry, GuestProxy};
use r_dbaas_rpc::{
    BackupInfo, ClusterConfig, DatabaseSpec, InMemoryTransport, PrepareRequest, ServiceStatus,
    Transport, UserSpec,
};
use tracing::{info, warn};

/// One simulated instance: its agent and the proxy that talks to it.
pub struct Node {
    pub runtime: AgentRuntime,
    pub guest: GuestProxy,
    pub config: InstanceConfig,
}

pub struct Fleet {
    nodes: IndexMap<String, Node>,
    strategies: ClusterStrategyRegistry,
}

impl Fleet {
    /// Start one agent per configured instance on a shared in-memory transport.
    pub fn start(config: &AppConfig, registry: SharedRegistry) -> Result<Self> {
        let transport = InMemoryTransport::new();
        let shared: Arc<dyn Transport> = Arc::new(transport.clone());
        let agent_metrics = AgentMetrics::new(registry.clone())?;
        let proxy_metrics = ProxyMetrics::new(registry)?;

        let mut nodes = IndexMap::new();
        for (instance_id, instance) in &config.fleet {
            let datastore = Arc::new(MemoryDatastore::new(instance_id.as_str()));
            let clustered = instance.datastore.supports_clustering();
            let agent_version = instance
                .protocol_version
                .unwrap_or(config.agent.protocol_version);
            let spec = AgentSpec::new(instance_id.as_str(), datastore.collaborators(clustered))
                .with_config(&config.agent)
                .with_protocol_version(agent_version)
                .with_metrics(agent_metrics.clone());
            let runtime = AgentRuntime::start(spec, &transport)
                .with_context(|| format!("failed to start agent for {}", instance_id))?;

            // Never send more than the agent understands.
            let guest = GuestProxy::new(instance_id.as_str(), shared.clone(), &config.proxy)
                .with_metrics(proxy_metrics.clone())
                .with_version_cap(min(config.proxy.version_cap, agent_version));
            info!(
                instance = %instance_id,
                datastore = %instance.datastore,
                agent_version = %agent_version,
                version_cap = %guest.version_cap(),
                "instance registered"
            );
            nodes.insert(
                instance_id.clone(),
                Node {
                    runtime,
                    guest,
                    config: instance.clone(),
                },
            );
        }

        Ok(Self {
            nodes,
            strategies: ClusterStrategyRegistry::with_defaults(),
        })
    }

    pub fn instance_count(&self) -> usize {
        self.nodes.len()
    }

    /// Prepare every instance concurrently. Returns how many reached `RUNNING`.
    pub async fn prepare_all(&self) -> usize {
        let outcomes = join_all(self.nodes.iter().map(|(instance_id, node)| async move {
            let request = prepare_request(instance_id, &node.config);
            let outcome = node.guest.prepare(request).await;
            (instance_id, node, outcome)
        }))
        .await;

        let mut running = 0;
        for (instance_id, node, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    running += 1;
                    info!(instance = %instance_id, "instance prepared");
                }
                Err(err) => {
                    let status = node.runtime.book().snapshot();
                    warn!(
                        instance = %instance_id,
                        error = %err,
                        status = %status.status,
                        reason = status.reason.as_deref().unwrap_or(""),
                        "prepare failed"
                    );
                }
            }
        }
        running
    }

    /// Bootstrap every configured cluster group from its running members.
    pub async fn bootstrap_clusters(&self, config: &AppConfig) -> Result<Vec<ClusterReport>> {
        let mut reports = Vec::new();
        for (cluster_id, members) in config.clusters() {
            let mut datastore = None;
            let mut guests = Vec::new();
            for member in &members {
                let node = self.nodes.get(member).ok_or_else(|| {
                    anyhow!("cluster {} names unknown instance {}", cluster_id, member)
                })?;
                if node.runtime.book().status() != ServiceStatus::Running {
                    warn!(
                        cluster = %cluster_id,
                        instance = %member,
                        "member not running; skipping"
                    );
                    continue;
                }
                datastore.get_or_insert(node.config.datastore);
                guests.push((node.guest.clone(), member.clone()));
            }
            let Some(datastore) = datastore else {
                warn!(cluster = %cluster_id, "no running members; cluster not bootstrapped");
                continue;
            };

            let strategy = self.strategies.strategy(datastore)?;
            let report = ClusterBootstrap::new(cluster_id.clone(), strategy, guests)
                .run()
                .await
                .with_context(|| format!("cluster {} bootstrap failed", cluster_id))?;
            if !report.is_ready() {
                warn!(cluster = %cluster_id, pending = ?report.pending, "cluster incomplete");
            }
            reports.push(report);
        }
        Ok(reports)
    }

    pub async fn shutdown(&self) {
        for node in self.nodes.values() {
            node.runtime.shutdown().await;
        }
    }
}

fn prepare_request(instance_id: &str, instance: &InstanceConfig) -> PrepareRequest {
    let mut request = PrepareRequest::new(instance.memory_mb, instance.mount_point.clone());
    request.device_path = instance.device_path.clone();
    request.packages = instance.packages.clone();
    request.databases = instance
        .databases
        .as_ref()
        .map(|names| names.iter().map(DatabaseSpec::named).collect());
    request.users = instance
        .users
        .as_ref()
        .map(|names| names.iter().map(UserSpec::named).collect());
    request.backup_info = instance.backup_id.as_ref().map(|id| BackupInfo {
        id: id.clone(),
        location: format!("memory://{}/{}", instance_id, id),
        checksum: None,
    });
    request.cluster_config = instance.cluster.as_ref().map(|cluster_id| ClusterConfig {
        cluster_id: cluster_id.clone(),
        instance_type: None,
    });
    request
}
