//! ---
//! dbaas_section: "04-guest-agent"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "In-memory datastore implementing every collaborator contract."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
//! In-memory datastore used by the simulation daemon and the test suites.
//!
//! Every collaborator call is recorded with its arguments. Failures and
//! delays can be injected per method name.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use r_dbaas_rpc::{
    BackupInfo, ClusterConfig, ClusterMember, ConfigOverrides, DatabaseSpec, ListQuery, Page,
    UserSpec,
};
use serde_json::{json, Value as JsonValue};

use crate::collaborators::{
    Admin, AppHealth, Application, ClusterExtension, CollaboratorError, CollaboratorResult,
    Collaborators, Package, Volume,
};

/// Databases hidden from listings unless `include_system` is set.
pub const SYSTEM_DATABASES: &[&str] = &["information_schema", "performance_schema", "sys"];

/// One recorded collaborator invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: &'static str,
    pub args: JsonValue,
}

#[derive(Debug)]
struct DatastoreState {
    calls: Vec<RecordedCall>,
    failures: HashMap<&'static str, String>,
    delays: HashMap<&'static str, Duration>,
    packages_installed: bool,
    mounts: HashMap<String, PathBuf>,
    config: Option<String>,
    health: AppHealth,
    start_on_boot: bool,
    databases: BTreeMap<String, DatabaseSpec>,
    users: BTreeMap<String, UserSpec>,
    authorized_keys: Vec<String>,
    cluster_members: Vec<ClusterMember>,
    cluster: Option<ClusterConfig>,
    cluster_acknowledged: bool,
}

/// Datastore double backed by plain maps.
#[derive(Debug)]
pub struct MemoryDatastore {
    name: String,
    state: Mutex<DatastoreState>,
}

impl MemoryDatastore {
    /// Fresh datastore: packages present, process not started.
    pub fn new(name: impl Into<String>) -> Self {
        let databases = SYSTEM_DATABASES
            .iter()
            .map(|name| ((*name).to_owned(), DatabaseSpec::named(*name)))
            .collect();
        Self {
            name: name.into(),
            state: Mutex::new(DatastoreState {
                calls: Vec::new(),
                failures: HashMap::new(),
                delays: HashMap::new(),
                packages_installed: true,
                mounts: HashMap::new(),
                config: None,
                health: AppHealth::Exited,
                start_on_boot: true,
                databases,
                users: BTreeMap::new(),
                authorized_keys: Vec::new(),
                cluster_members: Vec::new(),
                cluster: None,
                cluster_acknowledged: false,
            }),
        }
    }

    /// Wire every contract to this datastore. The cluster extension is only
    /// attached for cluster-capable engines.
    pub fn collaborators(self: &Arc<Self>, clustered: bool) -> Collaborators {
        Collaborators {
            volume: self.clone(),
            package: self.clone(),
            application: self.clone(),
            admin: self.clone(),
            cluster: if clustered {
                Some(self.clone() as Arc<dyn ClusterExtension>)
            } else {
                None
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make the next and all later calls to `method` fail.
    pub fn fail_on(&self, method: &'static str, message: impl Into<String>) {
        self.state.lock().failures.insert(method, message.into());
    }

    pub fn clear_failure(&self, method: &'static str) {
        self.state.lock().failures.remove(method);
    }

    /// Delay `method` before it records and answers.
    pub fn delay(&self, method: &'static str, duration: Duration) {
        self.state.lock().delays.insert(method, duration);
    }

    pub fn set_packages_installed(&self, installed: bool) {
        self.state.lock().packages_installed = installed;
    }

    /// Override what the health probe reports, e.g. to simulate a crash.
    pub fn set_health(&self, health: AppHealth) {
        self.state.lock().health = health;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.method == method)
            .count()
    }

    /// Arguments of every call to `method`, in call order.
    pub fn calls_to(&self, method: &str) -> Vec<JsonValue> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.method == method)
            .map(|call| call.args.clone())
            .collect()
    }

    pub fn config(&self) -> Option<String> {
        self.state.lock().config.clone()
    }

    pub fn starts_on_boot(&self) -> bool {
        self.state.lock().start_on_boot
    }

    pub fn database_names(&self) -> Vec<String> {
        self.state.lock().databases.keys().cloned().collect()
    }

    pub fn cluster_acknowledged(&self) -> bool {
        self.state.lock().cluster_acknowledged
    }

    pub fn cluster_members(&self) -> Vec<ClusterMember> {
        self.state.lock().cluster_members.clone()
    }

    pub fn authorized_keys(&self) -> Vec<String> {
        self.state.lock().authorized_keys.clone()
    }

    /// Deterministic key this member hands out for `user`.
    pub fn public_key(&self, user: &str) -> String {
        format!("ssh-ed25519 {}-{} {}@{}", self.name, user, user, self.name)
    }

    async fn enter(
        &self,
        component: &'static str,
        method: &'static str,
        args: JsonValue,
    ) -> CollaboratorResult<()> {
        let delay = self.state.lock().delays.get(method).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        state.calls.push(RecordedCall { method, args });
        match state.failures.get(method) {
            Some(message) => Err(CollaboratorError::new(component, message.clone())),
            None => Ok(()),
        }
    }
}

fn page<T: Clone>(
    entries: impl Iterator<Item = (String, T)>,
    query: &ListQuery,
    visible: impl Fn(&str) -> bool,
) -> Page<T> {
    let mut remaining = entries
        .filter(|(name, _)| visible(name))
        .filter(|(name, _)| query.marker.as_deref().map_or(true, |marker| name.as_str() > marker))
        .peekable();
    // A zero limit still returns one item so the marker keeps advancing.
    let limit = query
        .limit
        .map_or(usize::MAX, |limit| (limit as usize).max(1));
    let mut items = Vec::new();
    let mut last = None;
    while items.len() < limit {
        match remaining.next() {
            Some((name, item)) => {
                last = Some(name);
                items.push(item);
            }
            None => break,
        }
    }
    let next_marker = if remaining.peek().is_some() { last } else { None };
    Page::new(items, next_marker)
}

#[async_trait]
impl Volume for MemoryDatastore {
    async fn format(&self, device: &str) -> CollaboratorResult<()> {
        self.enter("volume", "format", json!({ "device": device }))
            .await
    }

    async fn mount(&self, device: &str, mount_point: &Path) -> CollaboratorResult<()> {
        self.enter(
            "volume",
            "mount",
            json!({ "device": device, "mount_point": mount_point.display().to_string() }),
        )
        .await?;
        self.state
            .lock()
            .mounts
            .insert(device.to_owned(), mount_point.to_path_buf());
        Ok(())
    }

    async fn mount_points(&self, device: &str) -> CollaboratorResult<Vec<PathBuf>> {
        self.enter("volume", "mount_points", json!({ "device": device }))
            .await?;
        Ok(self.state.lock().mounts.get(device).cloned().into_iter().collect())
    }
}

#[async_trait]
impl Package for MemoryDatastore {
    async fn is_installed(&self, packages: &[String]) -> CollaboratorResult<bool> {
        self.enter("package", "is_installed", json!({ "packages": packages }))
            .await?;
        Ok(self.state.lock().packages_installed)
    }

    async fn install(&self, packages: &[String]) -> CollaboratorResult<()> {
        self.enter("package", "install", json!({ "packages": packages }))
            .await?;
        self.state.lock().packages_installed = true;
        Ok(())
    }
}

#[async_trait]
impl Application for MemoryDatastore {
    async fn start(&self, overrides: Option<&ConfigOverrides>) -> CollaboratorResult<()> {
        self.enter("application", "start", json!({ "overrides": overrides }))
            .await?;
        self.state.lock().health = AppHealth::Alive;
        Ok(())
    }

    async fn restore(
        &self,
        backup: &BackupInfo,
        overrides: Option<&ConfigOverrides>,
    ) -> CollaboratorResult<()> {
        self.enter(
            "application",
            "restore",
            json!({ "backup": backup, "overrides": overrides }),
        )
        .await?;
        self.state.lock().health = AppHealth::Alive;
        Ok(())
    }

    async fn stop(&self, do_not_start_on_reboot: bool) -> CollaboratorResult<()> {
        self.enter(
            "application",
            "stop",
            json!({ "do_not_start_on_reboot": do_not_start_on_reboot }),
        )
        .await?;
        let mut state = self.state.lock();
        state.health = AppHealth::Exited;
        state.start_on_boot = !do_not_start_on_reboot;
        Ok(())
    }

    async fn restart(&self) -> CollaboratorResult<()> {
        self.enter("application", "restart", json!({})).await?;
        self.state.lock().health = AppHealth::Alive;
        Ok(())
    }

    async fn change_ownership(&self, mount_point: &Path) -> CollaboratorResult<()> {
        self.enter(
            "application",
            "change_ownership",
            json!({ "mount_point": mount_point.display().to_string() }),
        )
        .await
    }

    async fn write_config(&self, contents: &str) -> CollaboratorResult<()> {
        self.enter("application", "write_config", json!({ "contents": contents }))
            .await?;
        self.state.lock().config = Some(contents.to_owned());
        Ok(())
    }

    async fn reset_configuration(&self, contents: &str) -> CollaboratorResult<()> {
        self.enter(
            "application",
            "reset_configuration",
            json!({ "contents": contents }),
        )
        .await?;
        self.state.lock().config = Some(contents.to_owned());
        Ok(())
    }

    async fn health(&self) -> AppHealth {
        self.state.lock().health
    }
}

#[async_trait]
impl Admin for MemoryDatastore {
    async fn create_database(&self, databases: &[DatabaseSpec]) -> CollaboratorResult<()> {
        self.enter("admin", "create_database", json!({ "databases": databases }))
            .await?;
        let mut state = self.state.lock();
        for database in databases {
            state
                .databases
                .insert(database.name.clone(), database.clone());
        }
        Ok(())
    }

    async fn delete_database(&self, databases: &[DatabaseSpec]) -> CollaboratorResult<()> {
        self.enter("admin", "delete_database", json!({ "databases": databases }))
            .await?;
        let mut state = self.state.lock();
        for database in databases {
            state.databases.remove(&database.name);
        }
        Ok(())
    }

    async fn create_user(&self, users: &[UserSpec]) -> CollaboratorResult<()> {
        self.enter("admin", "create_user", json!({ "users": users }))
            .await?;
        let mut state = self.state.lock();
        for user in users {
            let mut stored = user.clone();
            stored.password = None;
            state.users.insert(user.name.clone(), stored);
        }
        Ok(())
    }

    async fn delete_user(&self, users: &[UserSpec]) -> CollaboratorResult<()> {
        self.enter("admin", "delete_user", json!({ "users": users }))
            .await?;
        let mut state = self.state.lock();
        for user in users {
            state.users.remove(&user.name);
        }
        Ok(())
    }

    async fn list_databases(&self, query: &ListQuery) -> CollaboratorResult<Page<DatabaseSpec>> {
        self.enter("admin", "list_databases", json!(query)).await?;
        let state = self.state.lock();
        let entries = state
            .databases
            .iter()
            .map(|(name, spec)| (name.clone(), spec.clone()));
        Ok(page(entries, query, |name| {
            query.include_system || !SYSTEM_DATABASES.contains(&name)
        }))
    }

    async fn list_users(&self, query: &ListQuery) -> CollaboratorResult<Page<UserSpec>> {
        self.enter("admin", "list_users", json!(query)).await?;
        let state = self.state.lock();
        let entries = state
            .users
            .iter()
            .map(|(name, spec)| (name.clone(), spec.clone()));
        Ok(page(entries, query, |_| true))
    }

    async fn get_user(
        &self,
        username: &str,
        hostname: Option<&str>,
    ) -> CollaboratorResult<Option<UserSpec>> {
        self.enter(
            "admin",
            "get_user",
            json!({ "username": username, "hostname": hostname }),
        )
        .await?;
        let state = self.state.lock();
        Ok(state
            .users
            .get(username)
            .filter(|user| match (hostname, user.host.as_deref()) {
                (Some(wanted), Some(host)) => wanted == host,
                _ => true,
            })
            .cloned())
    }
}

#[async_trait]
impl ClusterExtension for MemoryDatastore {
    async fn get_public_keys(&self, user: &str) -> CollaboratorResult<Vec<String>> {
        self.enter("cluster", "get_public_keys", json!({ "user": user }))
            .await?;
        Ok(vec![self.public_key(user)])
    }

    async fn authorize_public_keys(&self, user: &str, keys: &[String]) -> CollaboratorResult<()> {
        self.enter(
            "cluster",
            "authorize_public_keys",
            json!({ "user": user, "public_keys": keys }),
        )
        .await?;
        let mut state = self.state.lock();
        for key in keys {
            if !state.authorized_keys.contains(key) {
                state.authorized_keys.push(key.clone());
            }
        }
        Ok(())
    }

    async fn install_cluster(&self, members: &[ClusterMember]) -> CollaboratorResult<()> {
        self.enter("cluster", "install_cluster", json!({ "members": members }))
            .await?;
        self.state.lock().cluster_members = members.to_vec();
        Ok(())
    }

    async fn cluster_complete(&self) -> CollaboratorResult<()> {
        self.enter("cluster", "cluster_complete", json!({})).await?;
        self.state.lock().cluster_acknowledged = true;
        Ok(())
    }

    async fn join(&self, config: &ClusterConfig) -> CollaboratorResult<()> {
        self.enter("cluster", "join", json!(config)).await?;
        self.state.lock().cluster = Some(config.clone());
        Ok(())
    }
}
