//! ---
//! dbaas_section: "03-control-plane-proxy"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Proxy and cluster bootstrap against live in-memory agents."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use r_dbaas_agent::{AgentRuntime, AgentSpec, MemoryDatastore};
use r_dbaas_common::{DatastoreKind, ProxyConfig, TimeoutConfig};
use r_dbaas_proxy::{
    ClusterBootstrap, ClusterError, ClusterProxy, ClusterStrategyRegistry, GuestProxy,
};
use r_dbaas_rpc::{
    DatabaseSpec, InMemoryTransport, InstanceId, PrepareRequest, RpcError, ServiceStatus,
};

struct Node {
    datastore: Arc<MemoryDatastore>,
    runtime: AgentRuntime,
    guest: GuestProxy,
}

fn start(transport: &InMemoryTransport, id: &str, clustered: bool) -> Node {
    let datastore = Arc::new(MemoryDatastore::new(id));
    let spec = AgentSpec::new(id, datastore.collaborators(clustered))
        .with_heartbeat_interval(Duration::from_millis(50));
    let runtime = AgentRuntime::start(spec, transport).unwrap();
    let guest = GuestProxy::new(id, Arc::new(transport.clone()), &ProxyConfig::default());
    Node {
        datastore,
        runtime,
        guest,
    }
}

fn prepare_request(mount_point: &str) -> PrepareRequest {
    let mut request = PrepareRequest::new(2048, mount_point);
    request.device_path = Some("/dev/vdb".into());
    request
}

#[tokio::test(flavor = "multi_thread")]
async fn timed_out_call_leaves_status_untouched() {
    let transport = InMemoryTransport::new();
    let node = start(&transport, "my-1", false);
    node.guest
        .prepare(prepare_request("/var/lib/mysql"))
        .await
        .unwrap();
    let before = node.guest.get_status().await.unwrap();
    assert_eq!(before.status, ServiceStatus::Running);

    node.datastore
        .delay("create_database", Duration::from_millis(300));
    let impatient = node.guest.clone().with_timeouts(TimeoutConfig {
        low: Duration::from_millis(50),
        ..TimeoutConfig::default()
    });
    let err = impatient
        .create_database(vec![DatabaseSpec::named("late_db")])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout { .. }), "{err}");

    // The agent still finishes the work; only the caller gave up.
    let after = node.guest.get_status().await.unwrap();
    assert_eq!(after.status, before.status);
    assert_eq!(after.reason, before.reason);
    assert!(node.datastore.database_names().contains(&"late_db".to_owned()));
    node.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn three_members_acknowledge_before_the_cluster_is_ready() {
    let transport = InMemoryTransport::new();
    let nodes: Vec<Node> = ["vt-a", "vt-b", "vt-c"]
        .into_iter()
        .map(|id| start(&transport, id, true))
        .collect();
    for node in &nodes {
        node.guest
            .prepare(prepare_request("/home/dbadmin"))
            .await
            .unwrap();
    }

    let strategy = ClusterStrategyRegistry::with_defaults()
        .strategy(DatastoreKind::Vertica)
        .unwrap();
    let bootstrap = ClusterBootstrap::new(
        "vt",
        strategy,
        nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (node.guest.clone(), format!("10.0.0.{}", index + 1)))
            .collect(),
    );
    let report = bootstrap.run().await.unwrap();
    assert!(report.is_ready());
    assert_eq!(
        report.acknowledged,
        vec![
            InstanceId::from("vt-a"),
            InstanceId::from("vt-b"),
            InstanceId::from("vt-c")
        ]
    );

    let expected_keys: Vec<String> = nodes
        .iter()
        .map(|node| node.datastore.public_key("dbadmin"))
        .collect();
    for node in &nodes {
        assert!(node.datastore.cluster_acknowledged());
        assert_eq!(node.datastore.authorized_keys(), expected_keys);
    }
    assert_eq!(nodes[0].datastore.count("install_cluster"), 1);
    assert_eq!(nodes[0].datastore.cluster_members().len(), 3);
    assert_eq!(nodes[1].datastore.count("install_cluster"), 0);

    for node in &nodes {
        node.runtime.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_acknowledgement_keeps_the_cluster_pending() {
    let transport = InMemoryTransport::new();
    let nodes: Vec<Node> = ["vt-a", "vt-b"]
        .into_iter()
        .map(|id| start(&transport, id, true))
        .collect();
    nodes[1]
        .datastore
        .fail_on("cluster_complete", "catalog not synced");

    let strategy = ClusterStrategyRegistry::with_defaults()
        .strategy(DatastoreKind::Vertica)
        .unwrap();
    let bootstrap = ClusterBootstrap::new(
        "vt",
        strategy,
        nodes
            .iter()
            .map(|node| (node.guest.clone(), node.datastore.name().to_owned()))
            .collect(),
    );
    let report = bootstrap.run().await.unwrap();
    assert!(!report.is_ready());
    assert_eq!(report.pending, vec![InstanceId::from("vt-b")]);

    for node in &nodes {
        node.runtime.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn install_failure_names_the_member() {
    let transport = InMemoryTransport::new();
    let node = start(&transport, "vt-a", true);
    node.datastore.fail_on("install_cluster", "license expired");

    let strategy = ClusterStrategyRegistry::with_defaults()
        .strategy(DatastoreKind::Vertica)
        .unwrap();
    let bootstrap = ClusterBootstrap::new("vt", strategy, vec![(node.guest.clone(), "a".into())]);
    match bootstrap.run().await {
        Err(ClusterError::Member {
            instance,
            operation,
            source: RpcError::RemoteExecution { failure, .. },
        }) => {
            assert_eq!(instance, InstanceId::from("vt-a"));
            assert_eq!(operation, "install_cluster");
            assert_eq!(failure.message, "cluster: license expired");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    node.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn announced_completion_is_applied_in_order() {
    let transport = InMemoryTransport::new();
    let node = start(&transport, "vt-a", true);
    let cluster = ClusterProxy::new(node.guest.clone());

    cluster.announce_cluster_complete().await.unwrap();
    // The mailbox is served serially, so the ping lands after the cast.
    assert!(node.guest.rpc_ping().await.unwrap());
    assert!(node.datastore.cluster_acknowledged());
    node.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn non_cluster_agent_rejects_cluster_verbs() {
    let transport = InMemoryTransport::new();
    let node = start(&transport, "db2-1", false);
    let err = ClusterProxy::new(node.guest.clone())
        .get_public_keys("db2inst1")
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::UnknownOperation(_)), "{err}");
    node.runtime.shutdown().await;
}

#[tokio::test]
async fn strategies_are_selected_by_datastore() {
    let registry = ClusterStrategyRegistry::with_defaults();
    let strategy = registry.strategy(DatastoreKind::Vertica).unwrap();
    assert_eq!(strategy.key_user(), "dbadmin");
    assert!(matches!(
        registry.strategy(DatastoreKind::Mysql),
        Err(ClusterError::NoStrategy(DatastoreKind::Mysql))
    ));
    assert!(ClusterBootstrap::new("empty", strategy, Vec::new())
        .run()
        .await
        .is_err());
}
