//! ---
//! dbaas_section: "02-rpc-protocol"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Envelope and payload types carried by guest operations."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use r_dbaas_common::{ProtocolVersion, TimeoutConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Stable identifier of a provisioned database instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Wrap an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Whether the caller waits for a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    /// Blocking request that yields exactly one reply or a timeout.
    Call,
    /// Fire-and-forget request.
    Cast,
}

/// Named timeout ceiling assigned per verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum TimeoutClass {
    /// Quick status checks and object management.
    Low,
    /// Service control and credential exchange.
    High,
    /// Install style work proportional to data size.
    Usage,
    /// Cluster installation, scaled by member count.
    Cluster {
        /// Number of members taking part.
        members: usize,
    },
}

impl TimeoutClass {
    /// Resolve the class into a concrete duration.
    pub fn resolve(&self, config: &TimeoutConfig) -> Duration {
        match self {
            TimeoutClass::Low => config.low,
            TimeoutClass::High => config.high,
            TimeoutClass::Usage => config.usage,
            TimeoutClass::Cluster { members } => {
                let members = u32::try_from((*members).max(1)).unwrap_or(u32::MAX);
                config.cluster_usage.saturating_mul(members)
            }
        }
    }

    /// Label used for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            TimeoutClass::Low => "low",
            TimeoutClass::High => "high",
            TimeoutClass::Usage => "usage",
            TimeoutClass::Cluster { .. } => "cluster",
        }
    }
}

/// Request envelope handed to the transport. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Unique identifier for tracing.
    pub id: Uuid,
    /// Verb name.
    pub operation: String,
    /// Keyword arguments.
    #[serde(default)]
    pub args: JsonValue,
    /// Timeout class selected by the proxy.
    pub timeout_class: TimeoutClass,
    /// Highest protocol version the sender declares compatibility with.
    pub version_cap: ProtocolVersion,
    /// When the request was built.
    pub created_at: DateTime<Utc>,
}

impl OperationRequest {
    /// Construct a new request envelope.
    pub fn new(
        operation: impl Into<String>,
        args: JsonValue,
        timeout_class: TimeoutClass,
        version_cap: ProtocolVersion,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: operation.into(),
            args,
            timeout_class,
            version_cap,
            created_at: Utc::now(),
        }
    }
}

/// Category of a failure reported by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Request version ceiling not servable.
    VersionMismatch,
    /// Lifecycle state rejected the operation.
    InvalidState,
    /// No handler for the verb.
    UnknownOperation,
    /// Arguments did not decode.
    InvalidArguments,
    /// A datastore collaborator failed.
    Execution,
}

/// Failure payload returned in place of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDescriptor {
    /// Failure category.
    pub kind: FailureKind,
    /// Collaborator supplied detail.
    pub message: String,
}

impl FailureDescriptor {
    /// Construct a descriptor.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Reply to a call-mode request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "data", rename_all = "snake_case")]
pub enum OperationReply {
    /// Operation result.
    Result(JsonValue),
    /// Operation failure.
    Failure(FailureDescriptor),
}

/// Database object to create or drop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatabaseSpec {
    /// Database name.
    pub name: String,
    /// Optional character set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_set: Option<String>,
    /// Optional collation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collate: Option<String>,
}

impl DatabaseSpec {
    /// Database with engine defaults.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            character_set: None,
            collate: None,
        }
    }
}

/// Database user to create, drop, or fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserSpec {
    /// User name.
    pub name: String,
    /// Password; omitted from listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Host pattern the user may connect from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Databases the user is granted access to.
    #[serde(default)]
    pub databases: Vec<String>,
}

impl UserSpec {
    /// User with no host restriction and no grants.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
            host: None,
            databases: Vec::new(),
        }
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page, in collaborator order.
    pub items: Vec<T>,
    /// Marker to pass for the next page, if any.
    #[serde(default)]
    pub next_marker: Option<String>,
}

impl<T> Page<T> {
    /// Construct a page.
    pub fn new(items: Vec<T>, next_marker: Option<String>) -> Self {
        Self { items, next_marker }
    }
}

/// Backup to restore from instead of a fresh start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    /// Backup identifier.
    pub id: String,
    /// Storage location understood by the restore collaborator.
    pub location: String,
    /// Optional checksum for verification.
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Role a member plays in a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    /// Member that drives the cluster install.
    Primary,
    /// Any other member.
    Member,
}

/// One peer in a cluster membership descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Instance backing the member.
    pub instance_id: InstanceId,
    /// Address peers use to reach the member.
    pub address: String,
    /// Member role.
    pub role: MemberRole,
}

/// Cluster settings passed to prepare for members that join a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster identifier.
    pub cluster_id: String,
    /// Datastore specific member type, for engines with heterogeneous nodes.
    #[serde(default)]
    pub instance_type: Option<String>,
}

/// Datastore configuration overrides applied at start.
pub type ConfigOverrides = BTreeMap<String, JsonValue>;

/// Inputs to the one-time install sequence.
///
/// Every optional field distinguishes "absent" from "present but empty":
/// an absent database list skips database creation entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareRequest {
    /// Packages to install; absent means already present.
    #[serde(default)]
    pub packages: Option<Vec<String>>,
    /// Configuration file contents written before first start.
    #[serde(default)]
    pub config_contents: Option<String>,
    /// Databases to create after start.
    #[serde(default)]
    pub databases: Option<Vec<DatabaseSpec>>,
    /// Users to create after start.
    #[serde(default)]
    pub users: Option<Vec<UserSpec>>,
    /// Memory budget in megabytes.
    pub memory_mb: u32,
    /// Block device to format and mount.
    #[serde(default)]
    pub device_path: Option<String>,
    /// Mount point for the data volume.
    pub mount_point: PathBuf,
    /// Backup to restore instead of a fresh start.
    #[serde(default)]
    pub backup_info: Option<BackupInfo>,
    /// Configuration overrides applied on start or restore.
    #[serde(default)]
    pub overrides: Option<ConfigOverrides>,
    /// Cluster to join after the base install.
    #[serde(default)]
    pub cluster_config: Option<ClusterConfig>,
}

impl PrepareRequest {
    /// Minimal request: no device, no packages, no objects.
    pub fn new(memory_mb: u32, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            packages: None,
            config_contents: None,
            databases: None,
            users: None,
            memory_mb,
            device_path: None,
            mount_point: mount_point.into(),
            backup_info: None,
            overrides: None,
            cluster_config: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_timeout_scales_with_members() {
        let config = TimeoutConfig {
            cluster_usage: Duration::from_secs(10),
            ..TimeoutConfig::default()
        };
        assert_eq!(
            TimeoutClass::Cluster { members: 3 }.resolve(&config),
            Duration::from_secs(30)
        );
        assert_eq!(
            TimeoutClass::Cluster { members: 0 }.resolve(&config),
            Duration::from_secs(10)
        );
        assert_eq!(TimeoutClass::Low.resolve(&config), config.low);
    }

    #[test]
    fn absent_and_empty_database_lists_stay_distinct_on_the_wire() {
        let mut absent = PrepareRequest::new(512, "/var/lib/db");
        let encoded = serde_json::to_value(&absent).unwrap();
        let decoded: PrepareRequest = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.databases, None);

        absent.databases = Some(Vec::new());
        let encoded = serde_json::to_value(&absent).unwrap();
        let decoded: PrepareRequest = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.databases, Some(Vec::new()));
    }

    #[test]
    fn reply_is_tagged_by_outcome() {
        let reply = OperationReply::Failure(FailureDescriptor::new(
            FailureKind::Execution,
            "disk full",
        ));
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["outcome"], "failure");
        assert_eq!(json["data"]["kind"], "execution");
    }
}
