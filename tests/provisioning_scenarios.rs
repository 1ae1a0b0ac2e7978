//! ---
//! dbaas_section: "15-testing-qa-runbook"
//! dbaas_subsection: "integration-tests"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "End-to-end provisioning and lifecycle scenarios over the in-memory transport."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use r_dbaas_agent::{AgentRuntime, AgentSpec, AppHealth, MemoryDatastore};
use r_dbaas_common::ProxyConfig;
use r_dbaas_proxy::GuestProxy;
use r_dbaas_rpc::{
    BackupInfo, DatabaseSpec, FailureKind, InMemoryTransport, ListQuery, PrepareRequest, RpcError,
    ServiceStatus, UserSpec,
};
use serde_json::json;

struct Harness {
    datastore: Arc<MemoryDatastore>,
    runtime: AgentRuntime,
    guest: GuestProxy,
}

impl Harness {
    fn start(id: &str) -> Self {
        let transport = InMemoryTransport::new();
        let datastore = Arc::new(MemoryDatastore::new(id));
        let spec = AgentSpec::new(id, datastore.collaborators(false))
            .with_heartbeat_interval(Duration::from_millis(25));
        let runtime = AgentRuntime::start(spec, &transport).expect("agent starts");
        let guest = GuestProxy::new(id, Arc::new(transport), &ProxyConfig::default());
        Self {
            datastore,
            runtime,
            guest,
        }
    }

    async fn prepared(id: &str) -> Self {
        let harness = Self::start(id);
        harness
            .guest
            .prepare(PrepareRequest::new(1024, "/var/lib/mysql"))
            .await
            .expect("prepare succeeds");
        harness
    }

    async fn status(&self) -> ServiceStatus {
        self.guest.get_status().await.expect("status readable").status
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_install_with_volume_and_one_database() {
    let harness = Harness::start("db2-a");
    let mut request = PrepareRequest::new(2048, "/home/db2inst1/db2inst1");
    request.device_path = Some("/dev/vdb".into());
    request.databases = Some(vec![DatabaseSpec::named("app_db")]);

    harness.guest.prepare(request).await.unwrap();

    let datastore = &harness.datastore;
    assert_eq!(datastore.count("format"), 1);
    assert_eq!(datastore.count("mount"), 1);
    assert_eq!(datastore.count("is_installed"), 0);
    assert_eq!(datastore.count("change_ownership"), 1);
    assert_eq!(
        datastore.calls_to("create_database"),
        vec![json!({ "databases": [{ "name": "app_db" }] })]
    );
    assert_eq!(datastore.count("create_user"), 0);
    assert_eq!(datastore.count("start"), 1);
    assert_eq!(harness.status().await, ServiceStatus::Running);
    harness.runtime.shutdown().await;
}

fn backup() -> BackupInfo {
    BackupInfo {
        id: "bk-0412".into(),
        location: "swift://backups/bk-0412".into(),
        checksum: Some("9f2c".into()),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn backup_restore_replaces_fresh_start() {
    let harness = Harness::start("db2-b");
    let mut request = PrepareRequest::new(2048, "/home/db2inst1/db2inst1");
    request.backup_info = Some(backup());

    harness.guest.prepare(request).await.unwrap();

    assert_eq!(harness.datastore.count("restore"), 1);
    assert_eq!(harness.datastore.count("start"), 0);
    assert_eq!(harness.status().await, ServiceStatus::Running);
    harness.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_restore_marks_the_instance_failed_with_a_reason() {
    let harness = Harness::start("db2-c");
    harness
        .datastore
        .fail_on("restore", "backup checksum mismatch");
    let mut request = PrepareRequest::new(2048, "/home/db2inst1/db2inst1");
    request.backup_info = Some(backup());
    request.databases = Some(vec![DatabaseSpec::named("app_db")]);

    let err = harness.guest.prepare(request).await.unwrap_err();
    let RpcError::RemoteExecution { failure, .. } = err else {
        panic!("expected a remote execution error, got {err}");
    };
    assert_eq!(failure.kind, FailureKind::Execution);
    assert!(failure.message.contains("backup checksum mismatch"));

    let record = harness.guest.get_status().await.unwrap();
    assert_eq!(record.status, ServiceStatus::Failed);
    assert_eq!(
        record.reason.as_deref(),
        Some("start: application: backup checksum mismatch")
    );
    assert_eq!(harness.datastore.count("create_database"), 0);
    harness.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn prepare_runs_at_most_once_even_when_raced() {
    let harness = Harness::start("my-a");
    let first = harness.guest.clone();
    let second = harness.guest.clone();
    let (a, b) = tokio::join!(
        first.prepare(PrepareRequest::new(1024, "/var/lib/mysql")),
        second.prepare(PrepareRequest::new(1024, "/var/lib/mysql")),
    );
    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|outcome| matches!(outcome, Err(RpcError::InvalidState { .. }))));
    assert_eq!(harness.datastore.count("change_ownership"), 1);

    let calls_before = harness.datastore.calls().len();
    let err = harness
        .guest
        .prepare(PrepareRequest::new(1024, "/var/lib/mysql"))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::InvalidState { .. }), "{err}");
    assert_eq!(harness.datastore.calls().len(), calls_before);
    harness.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_flag_controls_start_on_boot() {
    let harness = Harness::prepared("my-b").await;

    harness.guest.stop_db(false).await.unwrap();
    assert_eq!(harness.status().await, ServiceStatus::Shutdown);
    assert!(harness.datastore.starts_on_boot());

    // Several heartbeats pass; an orderly stop is not a crash.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.status().await, ServiceStatus::Shutdown);

    harness.guest.restart().await.unwrap();
    assert_eq!(harness.status().await, ServiceStatus::Running);

    harness.guest.stop_db(true).await.unwrap();
    assert!(!harness.datastore.starts_on_boot());
    assert_eq!(
        harness.datastore.calls_to("stop").last().cloned(),
        Some(json!({ "do_not_start_on_reboot": true }))
    );
    harness.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_is_detected_by_the_heartbeat() {
    let harness = Harness::prepared("my-c").await;
    harness.datastore.set_health(AppHealth::Crashed);

    let record = harness.guest.update_status().await.unwrap();
    assert_eq!(record.status, ServiceStatus::Failed);
    assert!(record.reason.is_some());

    let err = harness.guest.stop_db(false).await.unwrap_err();
    assert!(matches!(err, RpcError::InvalidState { .. }), "{err}");
    harness.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_restart_is_recorded() {
    let harness = Harness::prepared("my-d").await;
    harness.datastore.fail_on("restart", "port 3306 in use");

    let err = harness.guest.restart().await.unwrap_err();
    assert!(matches!(err, RpcError::RemoteExecution { .. }), "{err}");
    let record = harness.guest.get_status().await.unwrap();
    assert_eq!(record.status, ServiceStatus::Failed);
    assert_eq!(
        record.reason.as_deref(),
        Some("restart: application: port 3306 in use")
    );
    harness.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn object_failures_do_not_touch_status() {
    let harness = Harness::prepared("my-e").await;
    harness
        .datastore
        .fail_on("create_user", "password too weak");

    let err = harness
        .guest
        .create_user(vec![UserSpec::named("app")])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::RemoteExecution { .. }), "{err}");
    assert_eq!(harness.status().await, ServiceStatus::Running);
    harness.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn listing_pages_through_the_collaborator_marker() {
    let harness = Harness::prepared("my-f").await;
    let databases = ["alpha", "bravo", "charlie"]
        .into_iter()
        .map(DatabaseSpec::named)
        .collect();
    harness.guest.create_database(databases).await.unwrap();

    let first = harness
        .guest
        .list_databases(ListQuery {
            limit: Some(2),
            ..ListQuery::default()
        })
        .await
        .unwrap();
    let names: Vec<_> = first.items.iter().map(|db| db.name.as_str()).collect();
    assert_eq!(names, ["alpha", "bravo"]);
    assert_eq!(first.next_marker.as_deref(), Some("bravo"));

    let rest = harness
        .guest
        .list_databases(ListQuery {
            limit: Some(2),
            marker: first.next_marker.clone(),
            include_system: false,
        })
        .await
        .unwrap();
    assert_eq!(rest.items, vec![DatabaseSpec::named("charlie")]);
    assert!(rest.next_marker.is_none());

    let everything = harness
        .guest
        .list_databases(ListQuery {
            include_system: true,
            ..ListQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(everything.items.len(), 6);

    harness
        .guest
        .delete_database(vec![DatabaseSpec::named("bravo")])
        .await
        .unwrap();
    let after = harness.guest.list_databases(ListQuery::default()).await.unwrap();
    assert_eq!(after.items.len(), 2);
    harness.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn users_are_created_fetched_and_deleted() {
    let harness = Harness::prepared("my-g").await;
    let mut user = UserSpec::named("app");
    user.password = Some("s3cret".into());
    user.host = Some("%".into());
    harness.guest.create_user(vec![user]).await.unwrap();

    let fetched = harness
        .guest
        .get_user("app", Some("%".into()))
        .await
        .unwrap()
        .expect("user exists");
    assert_eq!(fetched.name, "app");
    assert!(fetched.password.is_none());
    assert!(harness.guest.get_user("ghost", None).await.unwrap().is_none());

    harness
        .guest
        .delete_user(vec![UserSpec::named("app")])
        .await
        .unwrap();
    let page = harness.guest.list_users(ListQuery::default()).await.unwrap();
    assert!(page.items.is_empty());
    harness.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_configuration_applies_whatever_contents_arrive() {
    let harness = Harness::prepared("my-h").await;

    harness
        .guest
        .reset_configuration(json!({ "config_contents": "[mysqld]\nmax_connections=200\n" }))
        .await
        .unwrap();
    assert_eq!(
        harness.datastore.config().as_deref(),
        Some("[mysqld]\nmax_connections=200\n")
    );

    harness.guest.reset_configuration(json!({})).await.unwrap();
    assert_eq!(harness.datastore.count("reset_configuration"), 1);

    harness
        .guest
        .reset_configuration(json!({ "config_contents": 42 }))
        .await
        .unwrap();
    assert_eq!(harness.datastore.count("reset_configuration"), 2);
    assert_eq!(harness.datastore.config().as_deref(), Some("42"));
    assert_eq!(
        harness.guest.get_status().await.unwrap().status,
        ServiceStatus::Running
    );
    harness.runtime.shutdown().await;
}
