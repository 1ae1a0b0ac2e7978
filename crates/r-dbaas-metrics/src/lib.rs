//! ---
//! dbaas_section: "05-observability"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Metrics collection and export utilities."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Bound address, useful when listening on port 0.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Control-plane metrics for remote operations.
#[derive(Clone, Debug)]
pub struct ProxyMetrics {
    operations: IntCounterVec,
    latency: HistogramVec,
}

impl ProxyMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let operations = IntCounterVec::new(
            Opts::new(
                "r_dbaas_proxy_operations_total",
                "Remote operations issued by the control plane, by verb, mode, and outcome",
            ),
            &["operation", "mode", "outcome"],
        )?;
        registry.register(Box::new(operations.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let latency = HistogramVec::new(
            HistogramOpts::new(
                "r_dbaas_proxy_call_seconds",
                "Wall time of call-mode operations including timeouts",
            )
            .buckets(buckets),
            &["operation", "timeout_class"],
        )?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            operations,
            latency,
        })
    }

    pub fn record(&self, operation: &str, mode: &str, outcome: &str) {
        self.operations
            .with_label_values(&[operation, mode, outcome])
            .inc();
    }

    pub fn observe_call(&self, operation: &str, timeout_class: &str, seconds: f64) {
        self.latency
            .with_label_values(&[operation, timeout_class])
            .observe(seconds);
    }

    pub fn count(&self, operation: &str, mode: &str, outcome: &str) -> u64 {
        self.operations
            .with_label_values(&[operation, mode, outcome])
            .get()
    }
}

/// Guest agent metrics for dispatched operations and lifecycle state.
#[derive(Clone, Debug)]
pub struct AgentMetrics {
    dispatched: IntCounterVec,
    status: IntGaugeVec,
    heartbeats: IntCounter,
}

impl AgentMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let dispatched = IntCounterVec::new(
            Opts::new(
                "r_dbaas_agent_operations_total",
                "Operations handled by guest agents, by instance, verb, and outcome",
            ),
            &["instance", "operation", "outcome"],
        )?;
        registry.register(Box::new(dispatched.clone()))?;

        let status = IntGaugeVec::new(
            Opts::new(
                "r_dbaas_instance_status",
                "Indicator (0/1) of the current lifecycle status per instance",
            ),
            &["instance", "status"],
        )?;
        registry.register(Box::new(status.clone()))?;

        let heartbeats = IntCounter::with_opts(Opts::new(
            "r_dbaas_agent_heartbeats_total",
            "Heartbeat evaluations performed by guest agents",
        ))?;
        registry.register(Box::new(heartbeats.clone()))?;

        Ok(Self {
            dispatched,
            status,
            heartbeats,
        })
    }

    pub fn record_dispatch(&self, instance: &str, operation: &str, outcome: &str) {
        self.dispatched
            .with_label_values(&[instance, operation, outcome])
            .inc();
    }

    /// Flip the status indicator so exactly `current` reads 1 for the instance.
    pub fn set_status(&self, instance: &str, all: &[&str], current: &str) {
        for status in all {
            let gauge = self.status.with_label_values(&[instance, status]);
            gauge.set(if *status == current { 1 } else { 0 });
        }
    }

    pub fn inc_heartbeat(&self) {
        self.heartbeats.inc();
    }

    pub fn dispatched(&self, instance: &str, operation: &str, outcome: &str) -> u64 {
        self.dispatched
            .with_label_values(&[instance, operation, outcome])
            .get()
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone, Debug)]
pub struct DaemonMetrics {
    starts_total: IntCounter,
    build_info: IntGaugeVec,
    ready_clusters: Gauge,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "r_dbaasd_starts_total",
            "Total number of times the daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let build_info = IntGaugeVec::new(
            Opts::new("r_dbaasd_build_info", "Build metadata for the running daemon"),
            &["version", "git_sha", "protocol"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        let ready_clusters = Gauge::with_opts(Opts::new(
            "r_dbaasd_ready_clusters",
            "Clusters whose members all acknowledged completion",
        ))?;
        registry.register(Box::new(ready_clusters.clone()))?;

        Ok(Self {
            starts_total,
            build_info,
            ready_clusters,
        })
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn set_build_info(&self, version: &str, git_sha: &str, protocol: &str) {
        self.build_info
            .with_label_values(&[version, git_sha, protocol])
            .set(1);
    }

    pub fn set_ready_clusters(&self, count: usize) {
        self.ready_clusters.set(count as f64);
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_status_indicator_is_exclusive() {
        let registry = new_registry();
        let metrics = AgentMetrics::new(registry.clone()).unwrap();
        let all = ["NEW", "BUILDING", "RUNNING"];
        metrics.set_status("inst-a", &all, "BUILDING");
        metrics.set_status("inst-a", &all, "RUNNING");

        let encoded = TextEncoder::new()
            .encode_to_string(&registry.gather())
            .unwrap();
        assert!(encoded
            .contains(r#"r_dbaas_instance_status{instance="inst-a",status="RUNNING"} 1"#));
        assert!(encoded
            .contains(r#"r_dbaas_instance_status{instance="inst-a",status="BUILDING"} 0"#));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = new_registry();
        ProxyMetrics::new(registry.clone()).unwrap();
        assert!(ProxyMetrics::new(registry).is_err());
    }

    #[tokio::test]
    async fn exporter_binds_and_shuts_down() {
        let registry = new_registry();
        let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(server.addr().port(), 0);
        server.shutdown().await.unwrap();
    }
}
