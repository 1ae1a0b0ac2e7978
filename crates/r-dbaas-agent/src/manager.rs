//! ---
//! dbaas_section: "04-guest-agent"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Operation dispatcher mapping decoded verbs onto lifecycle actions."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
use std::sync::Arc;

use r_dbaas_common::ProtocolVersion;
use r_dbaas_metrics::AgentMetrics;
use r_dbaas_rpc::{
    ClusterOperation, ListQuery, Operation, OperationReply, OperationRequest,
    ResetConfigurationArgs, RpcError, ServiceStatus, StopDbArgs,
};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::collaborators::{ClusterExtension, Collaborators};
use crate::heartbeat::Heartbeat;
use crate::prepare::InstallOrchestrator;
use crate::status::{StatusBook, TransitionCause};
use crate::{AgentError, Result};

/// Dispatches decoded operations for one instance.
#[derive(Clone)]
pub struct Manager {
    protocol_version: ProtocolVersion,
    book: Arc<StatusBook>,
    collaborators: Collaborators,
    installer: InstallOrchestrator,
    heartbeat: Heartbeat,
    metrics: Option<AgentMetrics>,
}

impl Manager {
    pub fn new(
        protocol_version: ProtocolVersion,
        book: Arc<StatusBook>,
        collaborators: Collaborators,
        metrics: Option<AgentMetrics>,
    ) -> Self {
        let installer = InstallOrchestrator::new(book.clone(), collaborators.clone());
        let heartbeat = Heartbeat::new(
            book.clone(),
            collaborators.application.clone(),
            metrics.clone(),
        );
        Self {
            protocol_version,
            book,
            collaborators,
            installer,
            heartbeat,
            metrics,
        }
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub fn book(&self) -> &Arc<StatusBook> {
        &self.book
    }

    /// Heartbeat sharing this manager's status book and application.
    pub fn heartbeat(&self) -> Heartbeat {
        self.heartbeat.clone()
    }

    /// Serve one request. Never fails; errors become failure replies.
    pub async fn dispatch(&self, request: &OperationRequest) -> OperationReply {
        debug!(
            instance = %self.book.instance_id(),
            operation = %request.operation,
            request_id = %request.id,
            version_cap = %request.version_cap,
            "dispatching operation"
        );
        let outcome = self.serve(request).await;
        let label = match &outcome {
            Ok(_) => "ok",
            Err(err) => {
                warn!(
                    instance = %self.book.instance_id(),
                    operation = %request.operation,
                    error = %err,
                    "operation failed"
                );
                failure_label(err)
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_dispatch(self.book.instance_id().as_str(), &request.operation, label);
        }
        match outcome {
            Ok(value) => OperationReply::Result(value),
            Err(err) => OperationReply::Failure(err.to_failure()),
        }
    }

    async fn serve(&self, request: &OperationRequest) -> Result<JsonValue> {
        if !self.protocol_version.can_serve(request.version_cap) {
            return Err(AgentError::VersionMismatch {
                requested: request.version_cap,
                supported: self.protocol_version,
            });
        }

        match Operation::decode(&request.operation, request.args.clone()) {
            Ok(operation) => {
                self.ensure_servable(operation.since(), request)?;
                self.handle(operation).await
            }
            Err(RpcError::UnknownOperation(_)) => {
                match ClusterOperation::decode(&request.operation, request.args.clone()) {
                    Ok(operation) => {
                        self.ensure_servable(operation.since(), request)?;
                        self.handle_cluster(operation).await
                    }
                    Err(RpcError::UnknownOperation(name)) => {
                        Err(AgentError::UnknownOperation(name))
                    }
                    Err(err) => Err(AgentError::InvalidArguments(err.to_string())),
                }
            }
            Err(err) => Err(AgentError::InvalidArguments(err.to_string())),
        }
    }

    fn ensure_servable(&self, since: ProtocolVersion, request: &OperationRequest) -> Result<()> {
        if !self.protocol_version.can_serve(since) || !request.version_cap.can_serve(since) {
            return Err(AgentError::VersionMismatch {
                requested: since,
                supported: self.protocol_version,
            });
        }
        Ok(())
    }

    /// Run a base verb.
    pub async fn handle(&self, operation: Operation) -> Result<JsonValue> {
        let admin = &self.collaborators.admin;
        let value = match operation {
            Operation::Prepare(request) => {
                self.installer.run(&request).await?;
                JsonValue::Null
            }
            Operation::Restart => {
                self.restart().await?;
                JsonValue::Null
            }
            Operation::StopDb(args) => {
                self.stop_db(args).await?;
                JsonValue::Null
            }
            Operation::CreateDatabase(args) => {
                admin.create_database(&args.databases).await?;
                JsonValue::Null
            }
            Operation::CreateUser(args) => {
                admin.create_user(&args.users).await?;
                JsonValue::Null
            }
            Operation::DeleteDatabase(args) => {
                admin.delete_database(&args.databases).await?;
                JsonValue::Null
            }
            Operation::DeleteUser(args) => {
                admin.delete_user(&args.users).await?;
                JsonValue::Null
            }
            Operation::ListDatabases(query) => self.list_databases(&query).await?,
            Operation::ListUsers(query) => serde_json::to_value(admin.list_users(&query).await?)?,
            Operation::GetUser(args) => serde_json::to_value(
                admin
                    .get_user(&args.username, args.hostname.as_deref())
                    .await?,
            )?,
            Operation::ResetConfiguration(args) => {
                self.reset_configuration(args).await?;
                JsonValue::Null
            }
            Operation::UpdateStatus => {
                self.heartbeat.beat().await?;
                serde_json::to_value(self.book.snapshot())?
            }
            Operation::RpcPing => json!(true),
            Operation::GetStatus => serde_json::to_value(self.book.snapshot())?,
        };
        Ok(value)
    }

    async fn list_databases(&self, query: &ListQuery) -> Result<JsonValue> {
        let page = self.collaborators.admin.list_databases(query).await?;
        Ok(serde_json::to_value(page)?)
    }

    async fn restart(&self) -> Result<()> {
        let status = self.book.status();
        if !matches!(status, ServiceStatus::Running | ServiceStatus::Shutdown) {
            return Err(AgentError::InvalidState {
                operation: "restart",
                status,
            });
        }
        match self.collaborators.application.restart().await {
            Ok(()) => {
                self.book
                    .transition(ServiceStatus::Running, TransitionCause::Operator, None)?;
                Ok(())
            }
            Err(err) => {
                self.book.transition(
                    ServiceStatus::Failed,
                    TransitionCause::Operator,
                    Some(format!("restart: {err}")),
                )?;
                Err(err.into())
            }
        }
    }

    async fn stop_db(&self, args: StopDbArgs) -> Result<()> {
        let status = self.book.status();
        if !matches!(status, ServiceStatus::Running | ServiceStatus::Shutdown) {
            return Err(AgentError::InvalidState {
                operation: "stop_db",
                status,
            });
        }
        // The flag stays up until SHUTDOWN is recorded so a heartbeat in
        // between cannot read the exit as a crash.
        self.book.begin_stop();
        let stopped: Result<()> = async {
            self.collaborators
                .application
                .stop(args.do_not_start_on_reboot)
                .await?;
            self.book
                .transition(ServiceStatus::Shutdown, TransitionCause::Operator, None)?;
            Ok(())
        }
        .await;
        self.book.end_stop();
        stopped
    }

    /// Apply `config_contents` from the payload when present.
    async fn reset_configuration(&self, args: ResetConfigurationArgs) -> Result<()> {
        match args.configuration.get("config_contents") {
            None | Some(JsonValue::Null) => {
                debug!("reset_configuration without config_contents; nothing to apply");
                Ok(())
            }
            Some(JsonValue::String(contents)) => {
                self.collaborators
                    .application
                    .reset_configuration(contents)
                    .await?;
                Ok(())
            }
            Some(other) => {
                warn!(
                    instance = %self.book.instance_id(),
                    kind = json_kind(other),
                    "config_contents is not a string; applying its JSON text"
                );
                self.collaborators
                    .application
                    .reset_configuration(&other.to_string())
                    .await?;
                Ok(())
            }
        }
    }

    fn extension(&self, name: &str) -> Result<&Arc<dyn ClusterExtension>> {
        self.collaborators
            .cluster
            .as_ref()
            .ok_or_else(|| AgentError::UnknownOperation(name.to_owned()))
    }

    /// Run a cluster verb through the datastore's extension.
    pub async fn handle_cluster(&self, operation: ClusterOperation) -> Result<JsonValue> {
        let extension = self.extension(operation.name())?;
        let value = match operation {
            ClusterOperation::GetPublicKeys(args) => {
                serde_json::to_value(extension.get_public_keys(&args.user).await?)?
            }
            ClusterOperation::AuthorizePublicKeys(args) => {
                extension
                    .authorize_public_keys(&args.user, &args.public_keys)
                    .await?;
                JsonValue::Null
            }
            ClusterOperation::InstallCluster(args) => {
                extension.install_cluster(&args.members).await?;
                JsonValue::Null
            }
            ClusterOperation::ClusterComplete => {
                extension.cluster_complete().await?;
                JsonValue::Null
            }
        };
        Ok(value)
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn failure_label(err: &AgentError) -> &'static str {
    match err {
        AgentError::VersionMismatch { .. } => "version_mismatch",
        AgentError::InvalidState { .. } => "invalid_state",
        AgentError::UnknownOperation(_) => "unknown_operation",
        AgentError::InvalidArguments(_) => "invalid_arguments",
        AgentError::PhaseFailed { .. } => "phase_failed",
        AgentError::Collaborator(_) => "collaborator_error",
        AgentError::Transition(_) => "transition_error",
        AgentError::Encode(_) => "encode_error",
    }
}
