//! ---
//! dbaas_section: "02-rpc-protocol"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Statically checked verb table for guest operations."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
//! Verb tables.
//!
//! [`Operation`] holds the verbs every datastore answers. [`ClusterOperation`]
//! holds the verbs only cluster-capable datastores answer; agents route those
//! to their datastore extension at runtime.

use r_dbaas_common::ProtocolVersion;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::types::{ClusterMember, DatabaseSpec, PrepareRequest, TimeoutClass, UserSpec};
use crate::{RpcError, BASE_VERSION, CLUSTER_VERSION};

/// Arguments of `stop_db`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopDbArgs {
    /// Also keep the service from starting on reboot.
    #[serde(default)]
    pub do_not_start_on_reboot: bool,
}

/// Arguments of `create_database`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDatabaseArgs {
    /// Databases to create.
    pub databases: Vec<DatabaseSpec>,
}

/// Arguments of `delete_database`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteDatabaseArgs {
    /// Databases to drop.
    pub databases: Vec<DatabaseSpec>,
}

/// Arguments of `create_user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUserArgs {
    /// Users to create.
    pub users: Vec<UserSpec>,
}

/// Arguments of `delete_user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteUserArgs {
    /// Users to drop.
    pub users: Vec<UserSpec>,
}

/// Pagination arguments shared by `list_databases` and `list_users`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    /// Maximum number of items.
    #[serde(default)]
    pub limit: Option<u32>,
    /// Resume after this marker.
    #[serde(default)]
    pub marker: Option<String>,
    /// Include engine-internal databases.
    #[serde(default)]
    pub include_system: bool,
}

/// Arguments of `get_user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUserArgs {
    /// User name.
    pub username: String,
    /// Host pattern.
    #[serde(default)]
    pub hostname: Option<String>,
}

/// Arguments of `reset_configuration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetConfigurationArgs {
    /// Arbitrary configuration document; `config_contents` is applied when present.
    pub configuration: JsonValue,
}

/// Base verbs answered by every datastore.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// One-time install sequence.
    Prepare(Box<PrepareRequest>),
    /// Restart the datastore.
    Restart,
    /// Stop the datastore.
    StopDb(StopDbArgs),
    /// Create databases.
    CreateDatabase(CreateDatabaseArgs),
    /// Create users.
    CreateUser(CreateUserArgs),
    /// Drop databases.
    DeleteDatabase(DeleteDatabaseArgs),
    /// Drop users.
    DeleteUser(DeleteUserArgs),
    /// Page through databases.
    ListDatabases(ListQuery),
    /// Page through users.
    ListUsers(ListQuery),
    /// Fetch one user.
    GetUser(GetUserArgs),
    /// Overwrite stored configuration.
    ResetConfiguration(ResetConfigurationArgs),
    /// Force a heartbeat.
    UpdateStatus,
    /// Liveness check.
    RpcPing,
    /// Read the status record.
    GetStatus,
}

impl Operation {
    /// Every verb name in the table.
    pub const NAMES: &'static [&'static str] = &[
        "prepare",
        "restart",
        "stop_db",
        "create_database",
        "create_user",
        "delete_database",
        "delete_user",
        "list_databases",
        "list_users",
        "get_user",
        "reset_configuration",
        "update_status",
        "rpc_ping",
        "get_status",
    ];

    /// Wire name.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Prepare(_) => "prepare",
            Operation::Restart => "restart",
            Operation::StopDb(_) => "stop_db",
            Operation::CreateDatabase(_) => "create_database",
            Operation::CreateUser(_) => "create_user",
            Operation::DeleteDatabase(_) => "delete_database",
            Operation::DeleteUser(_) => "delete_user",
            Operation::ListDatabases(_) => "list_databases",
            Operation::ListUsers(_) => "list_users",
            Operation::GetUser(_) => "get_user",
            Operation::ResetConfiguration(_) => "reset_configuration",
            Operation::UpdateStatus => "update_status",
            Operation::RpcPing => "rpc_ping",
            Operation::GetStatus => "get_status",
        }
    }

    /// Protocol version that introduced the verb.
    pub fn since(&self) -> ProtocolVersion {
        BASE_VERSION
    }

    /// Timeout class the proxy assigns.
    pub fn timeout_class(&self) -> TimeoutClass {
        match self {
            Operation::Prepare(_) => TimeoutClass::Usage,
            Operation::Restart | Operation::StopDb(_) => TimeoutClass::High,
            _ => TimeoutClass::Low,
        }
    }

    /// Encode the keyword arguments.
    pub fn encode_args(&self) -> Result<JsonValue, RpcError> {
        let args = match self {
            Operation::Prepare(args) => serde_json::to_value(args)?,
            Operation::StopDb(args) => serde_json::to_value(args)?,
            Operation::CreateDatabase(args) => serde_json::to_value(args)?,
            Operation::CreateUser(args) => serde_json::to_value(args)?,
            Operation::DeleteDatabase(args) => serde_json::to_value(args)?,
            Operation::DeleteUser(args) => serde_json::to_value(args)?,
            Operation::ListDatabases(args) | Operation::ListUsers(args) => {
                serde_json::to_value(args)?
            }
            Operation::GetUser(args) => serde_json::to_value(args)?,
            Operation::ResetConfiguration(args) => serde_json::to_value(args)?,
            Operation::Restart
            | Operation::UpdateStatus
            | Operation::RpcPing
            | Operation::GetStatus => json!({}),
        };
        Ok(args)
    }

    /// Decode a verb received from the transport.
    ///
    /// Returns [`RpcError::UnknownOperation`] for names outside the table and
    /// [`RpcError::Codec`] when the arguments do not match the verb.
    pub fn decode(name: &str, args: JsonValue) -> Result<Self, RpcError> {
        let operation = match name {
            "prepare" => Operation::Prepare(Box::new(serde_json::from_value(args)?)),
            "restart" => Operation::Restart,
            "stop_db" => Operation::StopDb(from_args_or_default(args)?),
            "create_database" => Operation::CreateDatabase(serde_json::from_value(args)?),
            "create_user" => Operation::CreateUser(serde_json::from_value(args)?),
            "delete_database" => Operation::DeleteDatabase(serde_json::from_value(args)?),
            "delete_user" => Operation::DeleteUser(serde_json::from_value(args)?),
            "list_databases" => Operation::ListDatabases(from_args_or_default(args)?),
            "list_users" => Operation::ListUsers(from_args_or_default(args)?),
            "get_user" => Operation::GetUser(serde_json::from_value(args)?),
            "reset_configuration" => Operation::ResetConfiguration(serde_json::from_value(args)?),
            "update_status" => Operation::UpdateStatus,
            "rpc_ping" => Operation::RpcPing,
            "get_status" => Operation::GetStatus,
            other => return Err(RpcError::UnknownOperation(other.to_owned())),
        };
        Ok(operation)
    }
}

/// Arguments of `get_public_keys`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeysArgs {
    /// OS user whose keys are exchanged.
    pub user: String,
}

/// Arguments of `authorize_public_keys`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizeKeysArgs {
    /// OS user receiving the keys.
    pub user: String,
    /// Public keys of every peer.
    pub public_keys: Vec<String>,
}

/// Arguments of `install_cluster`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallClusterArgs {
    /// Ordered membership descriptor.
    pub members: Vec<ClusterMember>,
}

/// Verbs answered only by cluster-capable datastores.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterOperation {
    /// Return this member's public keys.
    GetPublicKeys(PublicKeysArgs),
    /// Trust the given peer keys.
    AuthorizePublicKeys(AuthorizeKeysArgs),
    /// Install the cluster across the named members.
    InstallCluster(InstallClusterArgs),
    /// Acknowledge that the member finished joining.
    ClusterComplete,
}

impl ClusterOperation {
    /// Every verb name in the table.
    pub const NAMES: &'static [&'static str] = &[
        "get_public_keys",
        "authorize_public_keys",
        "install_cluster",
        "cluster_complete",
    ];

    /// Wire name.
    pub fn name(&self) -> &'static str {
        match self {
            ClusterOperation::GetPublicKeys(_) => "get_public_keys",
            ClusterOperation::AuthorizePublicKeys(_) => "authorize_public_keys",
            ClusterOperation::InstallCluster(_) => "install_cluster",
            ClusterOperation::ClusterComplete => "cluster_complete",
        }
    }

    /// Protocol version that introduced the verb.
    pub fn since(&self) -> ProtocolVersion {
        CLUSTER_VERSION
    }

    /// Timeout class the proxy assigns.
    pub fn timeout_class(&self) -> TimeoutClass {
        match self {
            ClusterOperation::InstallCluster(args) => TimeoutClass::Cluster {
                members: args.members.len(),
            },
            _ => TimeoutClass::High,
        }
    }

    /// Encode the keyword arguments.
    pub fn encode_args(&self) -> Result<JsonValue, RpcError> {
        let args = match self {
            ClusterOperation::GetPublicKeys(args) => serde_json::to_value(args)?,
            ClusterOperation::AuthorizePublicKeys(args) => serde_json::to_value(args)?,
            ClusterOperation::InstallCluster(args) => serde_json::to_value(args)?,
            ClusterOperation::ClusterComplete => json!({}),
        };
        Ok(args)
    }

    /// Decode a cluster verb received from the transport.
    pub fn decode(name: &str, args: JsonValue) -> Result<Self, RpcError> {
        let operation = match name {
            "get_public_keys" => ClusterOperation::GetPublicKeys(serde_json::from_value(args)?),
            "authorize_public_keys" => {
                ClusterOperation::AuthorizePublicKeys(serde_json::from_value(args)?)
            }
            "install_cluster" => ClusterOperation::InstallCluster(serde_json::from_value(args)?),
            "cluster_complete" => ClusterOperation::ClusterComplete,
            other => return Err(RpcError::UnknownOperation(other.to_owned())),
        };
        Ok(operation)
    }
}

fn from_args_or_default<T>(args: JsonValue) -> Result<T, RpcError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if args.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(args)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_named_base_verb_decodes() {
        for name in Operation::NAMES {
            let args = match *name {
                "prepare" => serde_json::to_value(PrepareRequest::new(1024, "/mnt")).unwrap(),
                "create_database" | "delete_database" => json!({ "databases": [] }),
                "create_user" | "delete_user" => json!({ "users": [] }),
                "get_user" => json!({ "username": "u" }),
                "reset_configuration" => json!({ "configuration": {} }),
                _ => json!({}),
            };
            let op = Operation::decode(name, args).expect("decodes");
            assert_eq!(op.name(), *name);
        }
    }

    #[test]
    fn unknown_names_are_reported_not_guessed() {
        let err = Operation::decode("drop_everything", json!({})).unwrap_err();
        assert!(matches!(err, RpcError::UnknownOperation(name) if name == "drop_everything"));
        let err = Operation::decode("install_cluster", json!({})).unwrap_err();
        assert!(matches!(err, RpcError::UnknownOperation(_)));
    }

    #[test]
    fn stop_db_defaults_to_start_on_reboot() {
        let op = Operation::decode("stop_db", json!({})).unwrap();
        assert_eq!(op, Operation::StopDb(StopDbArgs::default()));
        let op = Operation::decode("stop_db", JsonValue::Null).unwrap();
        assert_eq!(
            op,
            Operation::StopDb(StopDbArgs {
                do_not_start_on_reboot: false
            })
        );
    }

    #[test]
    fn list_query_survives_encoding_unchanged() {
        let query = ListQuery {
            limit: Some(2),
            marker: Some("db_b".into()),
            include_system: true,
        };
        let op = Operation::ListUsers(query.clone());
        let decoded = Operation::decode(op.name(), op.encode_args().unwrap()).unwrap();
        assert_eq!(decoded, Operation::ListUsers(query));
    }

    #[test]
    fn install_cluster_timeout_tracks_member_count() {
        let members = ["a", "b", "c"]
            .iter()
            .map(|id| ClusterMember {
                instance_id: (*id).into(),
                address: format!("10.0.0.{}", id.len()),
                role: crate::types::MemberRole::Member,
            })
            .collect();
        let op = ClusterOperation::InstallCluster(InstallClusterArgs { members });
        assert_eq!(op.timeout_class(), TimeoutClass::Cluster { members: 3 });
        assert_eq!(op.since(), CLUSTER_VERSION);
    }

    #[test]
    fn malformed_arguments_are_codec_errors() {
        let err = Operation::decode("get_user", json!({ "user": 7 })).unwrap_err();
        assert!(matches!(err, RpcError::Codec(_)));
    }
}
