//! ---
//! dbaas_section: "04-guest-agent"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Mailbox server loop and per-instance agent runtime."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use r_dbaas_common::{AgentConfig, ProtocolVersion};
use r_dbaas_metrics::AgentMetrics;
use r_dbaas_rpc::{CallMode, Delivery, InMemoryTransport, InstanceId, Mailbox, OperationReply};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collaborators::Collaborators;
use crate::manager::Manager;
use crate::status::{
    FileStatusStore, MemoryStatusStore, StatusBook, StatusReporter, StatusStore, TransitionError,
};

/// Drains one instance mailbox, serving requests strictly in delivery order.
pub struct AgentServer {
    manager: Manager,
    mailbox: Mailbox,
}

impl AgentServer {
    pub fn new(manager: Manager, mailbox: Mailbox) -> Self {
        Self { manager, mailbox }
    }

    pub fn spawn(mut self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let instance = self.mailbox.instance().clone();
            let mut served: u64 = 0;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!(%instance, "agent server shutdown signal received");
                        break;
                    }
                    delivery = self.mailbox.recv() => {
                        let Some(delivery) = delivery else {
                            debug!(%instance, "agent mailbox closed");
                            break;
                        };
                        self.serve(delivery).await;
                        served += 1;
                    }
                }
            }
            debug!(%instance, served, "agent server loop exited");
        })
    }

    async fn serve(&self, delivery: Delivery) {
        let mode = delivery.mode();
        let (request, reply_to) = delivery.into_parts();
        let reply = self.manager.dispatch(&request).await;
        match (mode, reply_to) {
            (CallMode::Call, Some(reply_to)) => {
                if reply_to.send(reply).is_err() {
                    debug!(
                        operation = %request.operation,
                        request_id = %request.id,
                        "caller stopped waiting for reply"
                    );
                }
            }
            _ => {
                if let OperationReply::Failure(failure) = reply {
                    warn!(
                        operation = %request.operation,
                        request_id = %request.id,
                        %failure,
                        "cast operation failed"
                    );
                }
            }
        }
    }
}

/// Everything needed to bring up the agent of one instance.
#[derive(Clone)]
pub struct AgentSpec {
    pub instance_id: InstanceId,
    pub protocol_version: ProtocolVersion,
    pub heartbeat_interval: Duration,
    pub mailbox_capacity: usize,
    pub collaborators: Collaborators,
    pub store: Arc<dyn StatusStore>,
    pub metrics: Option<AgentMetrics>,
}

impl AgentSpec {
    /// Default agent settings with a volatile status store.
    pub fn new(instance_id: impl Into<InstanceId>, collaborators: Collaborators) -> Self {
        let defaults = AgentConfig::default();
        Self {
            instance_id: instance_id.into(),
            protocol_version: defaults.protocol_version,
            heartbeat_interval: defaults.heartbeat_interval,
            mailbox_capacity: defaults.mailbox_capacity,
            collaborators,
            store: Arc::new(MemoryStatusStore::new()),
            metrics: None,
        }
    }

    /// Apply agent configuration, including the file store when a status directory is set.
    pub fn with_config(mut self, config: &AgentConfig) -> Self {
        self.protocol_version = config.protocol_version;
        self.heartbeat_interval = config.heartbeat_interval;
        self.mailbox_capacity = config.mailbox_capacity;
        if let Some(directory) = &config.status_directory {
            self.store = Arc::new(FileStatusStore::new(directory));
        }
        self
    }

    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StatusStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Running agent: mailbox server plus heartbeat task.
pub struct AgentRuntime {
    instance_id: InstanceId,
    manager: Manager,
    transport: InMemoryTransport,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentRuntime {
    /// Open the status book, register the mailbox, and spawn the agent tasks.
    pub fn start(spec: AgentSpec, transport: &InMemoryTransport) -> Result<Self, TransitionError> {
        let book = Arc::new(StatusBook::open(
            spec.instance_id.clone(),
            spec.store,
            StatusReporter::default(),
            spec.metrics.clone(),
        )?);
        let manager = Manager::new(
            spec.protocol_version,
            book.clone(),
            spec.collaborators,
            spec.metrics,
        );
        let mailbox = transport.register(spec.instance_id.clone(), spec.mailbox_capacity);
        let (shutdown, _) = broadcast::channel(4);

        let server = AgentServer::new(manager.clone(), mailbox).spawn(shutdown.subscribe());
        let heartbeat = manager
            .heartbeat()
            .spawn(spec.heartbeat_interval, shutdown.subscribe());

        info!(
            instance = %spec.instance_id,
            protocol = %spec.protocol_version,
            status = %book.status(),
            "guest agent started"
        );
        Ok(Self {
            instance_id: spec.instance_id,
            manager,
            transport: transport.clone(),
            shutdown,
            tasks: Mutex::new(vec![server, heartbeat]),
        })
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn book(&self) -> &Arc<StatusBook> {
        self.manager.book()
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Deregister the mailbox and wait for both tasks to exit.
    pub async fn shutdown(&self) {
        self.transport.deregister(&self.instance_id);
        let _ = self.shutdown.send(());
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(instance = %self.instance_id, error = %err, "agent task join error");
            }
        }
        debug!(instance = %self.instance_id, "guest agent stopped");
    }
}
