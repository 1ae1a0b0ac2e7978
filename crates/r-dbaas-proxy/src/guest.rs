//! ---
//! dbaas_section: "03-control-plane-proxy"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Typed remote operation proxy for one guest agent."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use r_dbaas_common::{ProtocolVersion, ProxyConfig, TimeoutConfig};
use r_dbaas_metrics::ProxyMetrics;
use r_dbaas_rpc::{
    CallMode, CreateDatabaseArgs, CreateUserArgs, DatabaseSpec, DeleteDatabaseArgs,
    DeleteUserArgs, GetUserArgs, InstanceId, ListQuery, Operation, OperationReply,
    OperationRequest, Page, PrepareRequest, ResetConfigurationArgs, Result, RpcError,
    StatusRecord, StopDbArgs, TimeoutClass, Transport, UserSpec,
};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

/// Proxy for the agent of one instance.
///
/// Every request carries the proxy's version ceiling. Verbs newer than the
/// ceiling are refused locally, so an old agent never sees them.
#[derive(Clone)]
pub struct GuestProxy {
    instance: InstanceId,
    transport: Arc<dyn Transport>,
    timeouts: TimeoutConfig,
    version_cap: ProtocolVersion,
    metrics: Option<ProxyMetrics>,
}

impl fmt::Debug for GuestProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestProxy")
            .field("instance", &self.instance)
            .field("transport", &self.transport.name())
            .field("version_cap", &self.version_cap)
            .finish_non_exhaustive()
    }
}

impl GuestProxy {
    pub fn new(
        instance: impl Into<InstanceId>,
        transport: Arc<dyn Transport>,
        config: &ProxyConfig,
    ) -> Self {
        Self {
            instance: instance.into(),
            transport,
            timeouts: config.timeouts.clone(),
            version_cap: config.version_cap,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ProxyMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Pin the ceiling, e.g. to the oldest agent during a rolling upgrade.
    pub fn with_version_cap(mut self, version_cap: ProtocolVersion) -> Self {
        self.version_cap = version_cap;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn version_cap(&self) -> ProtocolVersion {
        self.version_cap
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    fn admit(&self, operation: &'static str, since: ProtocolVersion, mode: CallMode) -> Result<()> {
        if self.version_cap.can_serve(since) {
            return Ok(());
        }
        self.record(operation, mode, "version_mismatch");
        Err(RpcError::VersionMismatch {
            operation: operation.to_owned(),
            detail: format!(
                "{} was introduced in {} but the version cap is {}",
                operation, since, self.version_cap
            ),
        })
    }

    fn record(&self, operation: &str, mode: CallMode, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            let mode = match mode {
                CallMode::Call => "call",
                CallMode::Cast => "cast",
            };
            metrics.record(operation, mode, outcome);
        }
    }

    /// Blocking call of a raw verb. Used by the typed methods and by extension proxies.
    pub async fn call_raw(
        &self,
        operation: &'static str,
        since: ProtocolVersion,
        class: TimeoutClass,
        args: JsonValue,
    ) -> Result<JsonValue> {
        self.admit(operation, since, CallMode::Call)?;
        let timeout = class.resolve(&self.timeouts);
        let request = OperationRequest::new(operation, args, class, self.version_cap);
        debug!(
            instance = %self.instance,
            operation,
            timeout_class = class.label(),
            ?timeout,
            request_id = %request.id,
            "calling guest"
        );

        let started = Instant::now();
        let outcome = match self.transport.call(&self.instance, request, timeout).await {
            Ok(OperationReply::Result(value)) => Ok(value),
            Ok(OperationReply::Failure(failure)) => Err(RpcError::from_failure(operation, failure)),
            Err(err) => Err(err),
        };
        if let Some(metrics) = &self.metrics {
            metrics.observe_call(operation, class.label(), started.elapsed().as_secs_f64());
        }

        match &outcome {
            Ok(_) => self.record(operation, CallMode::Call, "ok"),
            Err(err) => {
                warn!(instance = %self.instance, operation, error = %err, "guest call failed");
                self.record(operation, CallMode::Call, err.kind());
            }
        }
        outcome
    }

    /// Fire-and-forget delivery of a raw verb.
    pub async fn cast_raw(
        &self,
        operation: &'static str,
        since: ProtocolVersion,
        class: TimeoutClass,
        args: JsonValue,
    ) -> Result<()> {
        self.admit(operation, since, CallMode::Cast)?;
        let request = OperationRequest::new(operation, args, class, self.version_cap);
        debug!(instance = %self.instance, operation, request_id = %request.id, "casting to guest");
        match self.transport.cast(&self.instance, request).await {
            Ok(()) => {
                self.record(operation, CallMode::Cast, "ok");
                Ok(())
            }
            Err(err) => {
                warn!(instance = %self.instance, operation, error = %err, "guest cast failed");
                self.record(operation, CallMode::Cast, err.kind());
                Err(err)
            }
        }
    }

    async fn call(&self, operation: Operation) -> Result<JsonValue> {
        let args = operation.encode_args()?;
        self.call_raw(
            operation.name(),
            operation.since(),
            operation.timeout_class(),
            args,
        )
        .await
    }

    async fn call_typed<T: DeserializeOwned>(&self, operation: Operation) -> Result<T> {
        let value = self.call(operation).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Run the one-time install. Rejected by the agent unless the instance is `NEW`.
    pub async fn prepare(&self, request: PrepareRequest) -> Result<()> {
        self.call(Operation::Prepare(Box::new(request))).await?;
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        self.call(Operation::Restart).await?;
        Ok(())
    }

    pub async fn stop_db(&self, do_not_start_on_reboot: bool) -> Result<()> {
        self.call(Operation::StopDb(StopDbArgs {
            do_not_start_on_reboot,
        }))
        .await?;
        Ok(())
    }

    pub async fn create_database(&self, databases: Vec<DatabaseSpec>) -> Result<()> {
        self.call(Operation::CreateDatabase(CreateDatabaseArgs { databases }))
            .await?;
        Ok(())
    }

    pub async fn create_user(&self, users: Vec<UserSpec>) -> Result<()> {
        self.call(Operation::CreateUser(CreateUserArgs { users }))
            .await?;
        Ok(())
    }

    pub async fn delete_database(&self, databases: Vec<DatabaseSpec>) -> Result<()> {
        self.call(Operation::DeleteDatabase(DeleteDatabaseArgs { databases }))
            .await?;
        Ok(())
    }

    pub async fn delete_user(&self, users: Vec<UserSpec>) -> Result<()> {
        self.call(Operation::DeleteUser(DeleteUserArgs { users }))
            .await?;
        Ok(())
    }

    pub async fn list_databases(&self, query: ListQuery) -> Result<Page<DatabaseSpec>> {
        self.call_typed(Operation::ListDatabases(query)).await
    }

    pub async fn list_users(&self, query: ListQuery) -> Result<Page<UserSpec>> {
        self.call_typed(Operation::ListUsers(query)).await
    }

    pub async fn get_user(
        &self,
        username: impl Into<String>,
        hostname: Option<String>,
    ) -> Result<Option<UserSpec>> {
        self.call_typed(Operation::GetUser(GetUserArgs {
            username: username.into(),
            hostname,
        }))
        .await
    }

    pub async fn reset_configuration(&self, configuration: JsonValue) -> Result<()> {
        self.call(Operation::ResetConfiguration(ResetConfigurationArgs {
            configuration,
        }))
        .await?;
        Ok(())
    }

    /// Ask the agent for an immediate heartbeat; returns the resulting record.
    pub async fn update_status(&self) -> Result<StatusRecord> {
        self.call_typed(Operation::UpdateStatus).await
    }

    pub async fn rpc_ping(&self) -> Result<bool> {
        self.call_typed(Operation::RpcPing).await
    }

    /// Read the agent's status record. Query this before resubmitting a timed-out call.
    pub async fn get_status(&self) -> Result<StatusRecord> {
        self.call_typed(Operation::GetStatus).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use r_dbaas_rpc::{ClusterMember, FailureDescriptor, FailureKind, MemberRole};
    use serde_json::json;

    use super::*;
    use crate::ClusterProxy;

    enum Script {
        Reply(OperationReply),
        Timeout,
        Unreachable,
    }

    /// Replies with a fixed answer and remembers what it was asked.
    struct ScriptedTransport {
        script: Script,
        calls: AtomicUsize,
        seen: Mutex<Vec<(OperationRequest, Option<Duration>)>>,
    }

    impl ScriptedTransport {
        fn with(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn replying(reply: OperationReply) -> Arc<Self> {
            Self::with(Script::Reply(reply))
        }

        fn last(&self) -> (OperationRequest, Option<Duration>) {
            self.seen.lock().last().cloned().expect("a request was sent")
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn call(
            &self,
            instance: &InstanceId,
            request: OperationRequest,
            timeout: Duration,
        ) -> Result<OperationReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push((request.clone(), Some(timeout)));
            match &self.script {
                Script::Reply(reply) => Ok(reply.clone()),
                Script::Timeout => Err(RpcError::Timeout {
                    instance: instance.clone(),
                    operation: request.operation,
                    timeout,
                }),
                Script::Unreachable => Err(RpcError::TransportUnreachable {
                    instance: instance.clone(),
                    reason: "connection refused".into(),
                }),
            }
        }

        async fn cast(&self, _instance: &InstanceId, request: OperationRequest) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push((request, None));
            Ok(())
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn proxy(transport: Arc<ScriptedTransport>) -> GuestProxy {
        GuestProxy::new("inst-1", transport, &ProxyConfig::default())
    }

    fn member(id: &str) -> ClusterMember {
        ClusterMember {
            instance_id: InstanceId::from(id),
            address: format!("10.0.0.{}", id.len()),
            role: MemberRole::Member,
        }
    }

    #[tokio::test]
    async fn verbs_pick_their_timeout_class() {
        let transport = ScriptedTransport::replying(OperationReply::Result(JsonValue::Null));
        let guest = proxy(transport.clone());
        let defaults = TimeoutConfig::default();

        guest
            .prepare(PrepareRequest::new(1024, "/var/lib/mysql"))
            .await
            .unwrap();
        let (request, timeout) = transport.last();
        assert_eq!(request.operation, "prepare");
        assert_eq!(request.timeout_class, TimeoutClass::Usage);
        assert_eq!(timeout, Some(defaults.usage));

        guest.stop_db(false).await.unwrap();
        let (request, timeout) = transport.last();
        assert_eq!(request.args, json!({ "do_not_start_on_reboot": false }));
        assert_eq!(timeout, Some(defaults.high));

        guest.create_database(vec![DatabaseSpec::named("app_db")]).await.unwrap();
        assert_eq!(transport.last().1, Some(defaults.low));

        let cluster = ClusterProxy::new(guest.clone());
        cluster
            .install_cluster(vec![member("a"), member("bb"), member("ccc")])
            .await
            .unwrap();
        let (request, timeout) = transport.last();
        assert_eq!(request.timeout_class, TimeoutClass::Cluster { members: 3 });
        assert_eq!(timeout, Some(defaults.cluster_usage * 3));
    }

    #[tokio::test]
    async fn requests_carry_the_version_cap() {
        let transport = ScriptedTransport::replying(OperationReply::Result(json!(true)));
        let guest = proxy(transport.clone()).with_version_cap(r_dbaas_rpc::BASE_VERSION);
        assert!(guest.rpc_ping().await.unwrap());
        assert_eq!(transport.last().0.version_cap, r_dbaas_rpc::BASE_VERSION);
    }

    #[tokio::test]
    async fn verbs_newer_than_the_cap_never_reach_the_transport() {
        let transport = ScriptedTransport::replying(OperationReply::Result(json!([])));
        let guest = proxy(transport.clone()).with_version_cap(r_dbaas_rpc::BASE_VERSION);
        let cluster = ClusterProxy::new(guest);

        let err = cluster.get_public_keys("dbadmin").await.unwrap_err();
        assert!(matches!(err, RpcError::VersionMismatch { .. }), "{err}");
        let err = cluster.announce_cluster_complete().await.unwrap_err();
        assert!(matches!(err, RpcError::VersionMismatch { .. }), "{err}");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn agent_failures_map_to_caller_errors() {
        let cases = [
            (FailureKind::Execution, "remote_error"),
            (FailureKind::InvalidArguments, "remote_error"),
            (FailureKind::InvalidState, "invalid_state"),
            (FailureKind::VersionMismatch, "version_mismatch"),
            (FailureKind::UnknownOperation, "unknown_operation"),
        ];
        for (kind, expected) in cases {
            let transport = ScriptedTransport::replying(OperationReply::Failure(
                FailureDescriptor::new(kind, "application: disk full"),
            ));
            let err = proxy(transport).restart().await.unwrap_err();
            assert_eq!(err.kind(), expected, "{kind:?}");
        }

        let transport = ScriptedTransport::replying(OperationReply::Failure(
            FailureDescriptor::new(FailureKind::Execution, "admin: duplicate database"),
        ));
        match proxy(transport).create_user(vec![UserSpec::named("app")]).await {
            Err(RpcError::RemoteExecution { operation, failure }) => {
                assert_eq!(operation, "create_user");
                assert_eq!(failure.message, "admin: duplicate database");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_errors_pass_through_unchanged() {
        let err = proxy(ScriptedTransport::with(Script::Timeout))
            .restart()
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
        assert!(!err.is_retryable());

        let err = proxy(ScriptedTransport::with(Script::Unreachable))
            .rpc_ping()
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn typed_results_are_decoded() {
        let transport = ScriptedTransport::replying(OperationReply::Result(json!({
            "items": [{ "name": "app_db" }],
            "next_marker": "app_db",
        })));
        let page = proxy(transport.clone())
            .list_databases(ListQuery::default())
            .await
            .unwrap();
        assert_eq!(page.items, vec![DatabaseSpec::named("app_db")]);
        assert_eq!(page.next_marker.as_deref(), Some("app_db"));

        let transport = ScriptedTransport::replying(OperationReply::Result(JsonValue::Null));
        let user = proxy(transport.clone())
            .get_user("app", Some("%".into()))
            .await
            .unwrap();
        assert!(user.is_none());
        assert_eq!(transport.last().0.args, json!({ "username": "app", "hostname": "%" }));
    }
}
