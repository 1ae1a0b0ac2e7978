//! ---
//! dbaas_section: "03-control-plane-proxy"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Cluster extension proxy and per-datastore cluster strategies."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use r_dbaas_common::DatastoreKind;
use r_dbaas_rpc::{
    AuthorizeKeysArgs, ClusterMember, ClusterOperation, InstallClusterArgs, PublicKeysArgs,
    Result,
};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::guest::GuestProxy;
use crate::ClusterError;

/// Base proxy plus the cluster verbs.
#[derive(Debug, Clone)]
pub struct ClusterProxy {
    guest: GuestProxy,
}

impl ClusterProxy {
    pub fn new(guest: GuestProxy) -> Self {
        Self { guest }
    }

    /// The wrapped base proxy, for the non-cluster verbs.
    pub fn guest(&self) -> &GuestProxy {
        &self.guest
    }

    async fn call(&self, operation: ClusterOperation) -> Result<JsonValue> {
        let args = operation.encode_args()?;
        self.guest
            .call_raw(
                operation.name(),
                operation.since(),
                operation.timeout_class(),
                args,
            )
            .await
    }

    pub async fn get_public_keys(&self, user: impl Into<String>) -> Result<Vec<String>> {
        let user = user.into();
        debug!(instance = %self.guest.instance(), %user, "getting public keys");
        let value = self
            .call(ClusterOperation::GetPublicKeys(PublicKeysArgs { user }))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn authorize_public_keys(
        &self,
        user: impl Into<String>,
        public_keys: Vec<String>,
    ) -> Result<()> {
        let user = user.into();
        debug!(
            instance = %self.guest.instance(),
            %user,
            keys = public_keys.len(),
            "authorizing public keys"
        );
        self.call(ClusterOperation::AuthorizePublicKeys(AuthorizeKeysArgs {
            user,
            public_keys,
        }))
        .await?;
        Ok(())
    }

    /// Install the cluster across `members`; the timeout scales with their count.
    pub async fn install_cluster(&self, members: Vec<ClusterMember>) -> Result<()> {
        debug!(instance = %self.guest.instance(), members = members.len(), "installing cluster");
        self.call(ClusterOperation::InstallCluster(InstallClusterArgs { members }))
            .await?;
        Ok(())
    }

    /// Acknowledged completion: returns once the member recorded it.
    pub async fn cluster_complete(&self) -> Result<()> {
        self.call(ClusterOperation::ClusterComplete).await?;
        Ok(())
    }

    /// Peer notification of completion; returns as soon as it is enqueued.
    pub async fn announce_cluster_complete(&self) -> Result<()> {
        let operation = ClusterOperation::ClusterComplete;
        self.guest
            .cast_raw(
                operation.name(),
                operation.since(),
                operation.timeout_class(),
                operation.encode_args()?,
            )
            .await
    }
}

/// Datastore-specific cluster behaviour on the control-plane side.
pub trait ClusterStrategy: Send + Sync {
    fn datastore(&self) -> DatastoreKind;

    /// OS account whose keys members exchange before install.
    fn key_user(&self) -> &str;

    /// Wrap a base proxy into this datastore's cluster client.
    fn guest_client(&self, guest: GuestProxy) -> ClusterProxy {
        ClusterProxy::new(guest)
    }
}

/// Vertica: key exchange for the `dbadmin` account, then install from the first node.
#[derive(Debug, Clone, Default)]
pub struct VerticaStrategy;

impl ClusterStrategy for VerticaStrategy {
    fn datastore(&self) -> DatastoreKind {
        DatastoreKind::Vertica
    }

    fn key_user(&self) -> &str {
        DatastoreKind::Vertica.service_account()
    }
}

/// Strategy lookup keyed by datastore type.
#[derive(Clone, Default)]
pub struct ClusterStrategyRegistry {
    strategies: HashMap<DatastoreKind, Arc<dyn ClusterStrategy>>,
}

impl fmt::Debug for ClusterStrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.strategies.keys()).finish()
    }
}

impl ClusterStrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in strategy.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(VerticaStrategy));
        registry
    }

    pub fn register(&mut self, strategy: Arc<dyn ClusterStrategy>) {
        self.strategies.insert(strategy.datastore(), strategy);
    }

    pub fn get(&self, datastore: DatastoreKind) -> Option<Arc<dyn ClusterStrategy>> {
        self.strategies.get(&datastore).cloned()
    }

    pub fn strategy(
        &self,
        datastore: DatastoreKind,
    ) -> std::result::Result<Arc<dyn ClusterStrategy>, ClusterError> {
        self.get(datastore)
            .ok_or(ClusterError::NoStrategy(datastore))
    }
}
