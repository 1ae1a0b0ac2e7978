//! ---
//! dbaas_section: "01-shared-primitives"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Configuration model and loader for the control plane and guest agent."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;
use crate::version::{ProtocolVersion, PROTOCOL_VERSION};

fn default_low_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_high_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_usage_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_cluster_usage_timeout() -> Duration {
    Duration::from_secs(675)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_mailbox_capacity() -> usize {
    64
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    false
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9899))
}

fn default_memory_mb() -> u32 {
    2048
}

/// Primary configuration object for R-DBaaS processes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    /// Instances provisioned by the simulation daemon, keyed by instance id.
    #[serde(default)]
    pub fleet: IndexMap<String, InstanceConfig>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "R_DBAAS_CONFIG";

    /// Load configuration from disk, respecting the `R_DBAAS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.proxy.timeouts.validate()?;
        if self.agent.heartbeat_interval.is_zero() {
            return Err(anyhow!("agent.heartbeat_interval must be non-zero"));
        }
        if self.agent.mailbox_capacity == 0 {
            return Err(anyhow!("agent.mailbox_capacity must be at least 1"));
        }
        if self.proxy.version_cap.major != self.agent.protocol_version.major {
            return Err(anyhow!(
                "proxy.version_cap {} and agent.protocol_version {} differ in major version",
                self.proxy.version_cap,
                self.agent.protocol_version
            ));
        }
        for (instance_id, instance) in &self.fleet {
            instance.validate(instance_id)?;
        }
        Ok(())
    }

    /// Group fleet instances by cluster name, preserving declaration order.
    pub fn clusters(&self) -> IndexMap<String, Vec<String>> {
        let mut clusters: IndexMap<String, Vec<String>> = IndexMap::new();
        for (instance_id, instance) in &self.fleet {
            if let Some(cluster) = &instance.cluster {
                clusters
                    .entry(cluster.clone())
                    .or_default()
                    .push(instance_id.clone());
            }
        }
        clusters
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the daily rolling log file. Stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Control-plane side settings for the remote operation proxy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Highest protocol version the control plane will send. Pin this to the
    /// oldest agent in the fleet during a rolling upgrade.
    #[serde(default)]
    pub version_cap: ProtocolVersion,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Ceilings for each timeout class.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_low_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub low: Duration,
    #[serde(default = "default_high_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub high: Duration,
    #[serde(default = "default_usage_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub usage: Duration,
    /// Per-member ceiling for cluster installation; scaled by member count.
    #[serde(default = "default_cluster_usage_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub cluster_usage: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            low: default_low_timeout(),
            high: default_high_timeout(),
            usage: default_usage_timeout(),
            cluster_usage: default_cluster_usage_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("low", self.low),
            ("high", self.high),
            ("usage", self.usage),
            ("cluster_usage", self.cluster_usage),
        ] {
            if value.is_zero() {
                return Err(anyhow!("proxy.timeouts.{} must be non-zero", name));
            }
        }
        if self.low > self.high {
            return Err(anyhow!("proxy.timeouts.low must not exceed proxy.timeouts.high"));
        }
        Ok(())
    }
}

/// Guest agent settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Protocol version advertised by the agent.
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    #[serde(default = "default_heartbeat_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub heartbeat_interval: Duration,
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    /// Directory for persisted status records. In-memory when unset.
    #[serde(default)]
    pub status_directory: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            heartbeat_interval: default_heartbeat_interval(),
            mailbox_capacity: default_mailbox_capacity(),
            status_directory: None,
        }
    }
}

/// Supported datastore engines.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatastoreKind {
    #[default]
    Mysql,
    Postgresql,
    Db2,
    Vertica,
}

impl DatastoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatastoreKind::Mysql => "mysql",
            DatastoreKind::Postgresql => "postgresql",
            DatastoreKind::Db2 => "db2",
            DatastoreKind::Vertica => "vertica",
        }
    }

    /// Whether the engine ships a cluster strategy.
    pub fn supports_clustering(&self) -> bool {
        matches!(self, DatastoreKind::Vertica)
    }

    /// Data directory owned by the service account after install.
    pub fn service_account(&self) -> &'static str {
        match self {
            DatastoreKind::Mysql => "mysql",
            DatastoreKind::Postgresql => "postgres",
            DatastoreKind::Db2 => "db2inst1",
            DatastoreKind::Vertica => "dbadmin",
        }
    }
}

impl std::fmt::Display for DatastoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DatastoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mysql" => Ok(DatastoreKind::Mysql),
            "postgresql" | "postgres" => Ok(DatastoreKind::Postgresql),
            "db2" => Ok(DatastoreKind::Db2),
            "vertica" => Ok(DatastoreKind::Vertica),
            other => Err(format!("unknown datastore: {}", other)),
        }
    }
}

/// Per-instance provisioning request used by the simulation daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default)]
    pub datastore: DatastoreKind,
    #[serde(default)]
    pub device_path: Option<String>,
    pub mount_point: PathBuf,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default)]
    pub packages: Option<Vec<String>>,
    #[serde(default)]
    pub databases: Option<Vec<String>>,
    #[serde(default)]
    pub users: Option<Vec<String>>,
    #[serde(default)]
    pub backup_id: Option<String>,
    /// Cluster group this instance joins after its base install.
    #[serde(default)]
    pub cluster: Option<String>,
    /// Override for the agent protocol version, to model a not-yet-upgraded guest.
    #[serde(default)]
    pub protocol_version: Option<ProtocolVersion>,
}

impl InstanceConfig {
    pub fn validate(&self, instance_id: &str) -> Result<()> {
        if instance_id.trim().is_empty() {
            return Err(anyhow!("fleet instance ids must not be empty"));
        }
        if !self.mount_point.is_absolute() {
            return Err(anyhow!(
                "instance '{}' mount_point {} must be absolute",
                instance_id,
                self.mount_point.display()
            ));
        }
        if self.cluster.is_some() && !self.datastore.supports_clustering() {
            return Err(anyhow!(
                "instance '{}' requests cluster membership but datastore {} has no cluster strategy",
                instance_id,
                self.datastore
            ));
        }
        if let Some(databases) = &self.databases {
            let unique: BTreeSet<&String> = databases.iter().collect();
            if unique.len() != databases.len() {
                return Err(anyhow!(
                    "instance '{}' lists a database more than once",
                    instance_id
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[proxy]
version_cap = "1.0"

[proxy.timeouts]
low = 2
high = 30

[agent]
heartbeat_interval = 1

[fleet.db-a]
datastore = "db2"
device_path = "/dev/vdb"
mount_point = "/home/db2inst1/db2inst1"
databases = ["app_db"]

[fleet.vt-1]
datastore = "vertica"
mount_point = "/var/lib/vertica"
cluster = "analytics"

[fleet.vt-2]
datastore = "vertica"
mount_point = "/var/lib/vertica"
cluster = "analytics"
"#;

    #[test]
    fn parses_sample_configuration() {
        let config: AppConfig = SAMPLE.parse().expect("sample parses");
        assert_eq!(config.proxy.version_cap, ProtocolVersion::new(1, 0));
        assert_eq!(config.proxy.timeouts.low, Duration::from_secs(2));
        assert_eq!(config.proxy.timeouts.usage, default_usage_timeout());
        assert_eq!(config.agent.heartbeat_interval, Duration::from_secs(1));
        let db = config.fleet.get("db-a").expect("instance present");
        assert_eq!(db.datastore, DatastoreKind::Db2);
        assert_eq!(db.databases.as_deref(), Some(&["app_db".to_owned()][..]));
        assert!(db.users.is_none());
        assert_eq!(
            config.clusters().get("analytics"),
            Some(&vec!["vt-1".to_owned(), "vt-2".to_owned()])
        );
    }

    #[test]
    fn rejects_cluster_on_single_node_datastore() {
        let content = r#"
[fleet.my-1]
datastore = "mysql"
mount_point = "/var/lib/mysql"
cluster = "nope"
"#;
        let err = content.parse::<AppConfig>().unwrap_err();
        assert!(err.to_string().contains("no cluster strategy"));
    }

    #[test]
    fn rejects_relative_mount_point_and_zero_timeouts() {
        let relative = r#"
[fleet.my-1]
mount_point = "var/lib/mysql"
"#;
        assert!(relative.parse::<AppConfig>().is_err());

        let zero = r#"
[proxy.timeouts]
low = 0
"#;
        assert!(zero.parse::<AppConfig>().is_err());
    }

    #[test]
    fn rejects_major_version_split() {
        let content = r#"
[proxy]
version_cap = "2.0"
"#;
        assert!(content.parse::<AppConfig>().is_err());
    }
}
