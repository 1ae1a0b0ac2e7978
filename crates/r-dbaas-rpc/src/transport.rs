//! ---
//! dbaas_section: "02-rpc-protocol"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Transport contract and in-process transport."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::types::{CallMode, InstanceId, OperationReply, OperationRequest};
use crate::{Result, RpcError};

/// Delivers operations to the agent of a specific instance.
///
/// Implementations own the wire; the protocol only needs named operations with
/// serializable arguments routed to one instance.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send and wait for exactly one reply, or fail with [`RpcError::Timeout`].
    async fn call(
        &self,
        instance: &InstanceId,
        request: OperationRequest,
        timeout: Duration,
    ) -> Result<OperationReply>;

    /// Enqueue without waiting for the agent.
    async fn cast(&self, instance: &InstanceId, request: OperationRequest) -> Result<()>;

    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// One request handed to an agent, with its reply slot for calls.
#[derive(Debug)]
pub struct Delivery {
    /// The request as sent.
    pub request: OperationRequest,
    reply_to: Option<oneshot::Sender<OperationReply>>,
}

impl Delivery {
    /// Whether the sender is waiting.
    pub fn mode(&self) -> CallMode {
        if self.reply_to.is_some() {
            CallMode::Call
        } else {
            CallMode::Cast
        }
    }

    /// Split into the request and the reply slot.
    pub fn into_parts(self) -> (OperationRequest, Option<oneshot::Sender<OperationReply>>) {
        (self.request, self.reply_to)
    }
}

/// Receiving half registered for one instance.
#[derive(Debug)]
pub struct Mailbox {
    instance: InstanceId,
    receiver: mpsc::Receiver<Delivery>,
}

impl Mailbox {
    /// Instance this mailbox serves.
    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// Next delivery in transport order, `None` once deregistered.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

/// In-process transport routing requests over bounded tokio channels.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    routes: Arc<RwLock<HashMap<InstanceId, mpsc::Sender<Delivery>>>>,
}

impl InMemoryTransport {
    /// Create a transport with no registered agents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent mailbox, replacing any previous registration.
    pub fn register(&self, instance: InstanceId, capacity: usize) -> Mailbox {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        if self
            .routes
            .write()
            .insert(instance.clone(), sender)
            .is_some()
        {
            debug!(%instance, "replaced existing agent mailbox");
        }
        Mailbox { instance, receiver }
    }

    /// Drop the route to an instance. Later sends fail as unreachable.
    pub fn deregister(&self, instance: &InstanceId) -> bool {
        self.routes.write().remove(instance).is_some()
    }

    /// Whether an agent is registered for the instance.
    pub fn is_registered(&self, instance: &InstanceId) -> bool {
        self.routes.read().contains_key(instance)
    }

    fn route(&self, instance: &InstanceId) -> Result<mpsc::Sender<Delivery>> {
        self.routes
            .read()
            .get(instance)
            .cloned()
            .ok_or_else(|| RpcError::TransportUnreachable {
                instance: instance.clone(),
                reason: "no agent registered".to_owned(),
            })
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn call(
        &self,
        instance: &InstanceId,
        request: OperationRequest,
        timeout: Duration,
    ) -> Result<OperationReply> {
        let sender = self.route(instance)?;
        let operation = request.operation.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        let delivery = Delivery {
            request,
            reply_to: Some(reply_tx),
        };

        let exchange = async {
            sender
                .send(delivery)
                .await
                .map_err(|_| RpcError::TransportUnreachable {
                    instance: instance.clone(),
                    reason: "agent mailbox closed".to_owned(),
                })?;
            reply_rx.await.map_err(|_| RpcError::TransportUnreachable {
                instance: instance.clone(),
                reason: "agent dropped the reply".to_owned(),
            })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%instance, %operation, ?timeout, "call timed out");
                Err(RpcError::Timeout {
                    instance: instance.clone(),
                    operation,
                    timeout,
                })
            }
        }
    }

    async fn cast(&self, instance: &InstanceId, request: OperationRequest) -> Result<()> {
        let sender = self.route(instance)?;
        sender
            .try_send(Delivery {
                request,
                reply_to: None,
            })
            .map_err(|err| {
                let reason = match err {
                    mpsc::error::TrySendError::Full(_) => "agent mailbox full",
                    mpsc::error::TrySendError::Closed(_) => "agent mailbox closed",
                };
                RpcError::TransportUnreachable {
                    instance: instance.clone(),
                    reason: reason.to_owned(),
                }
            })
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
