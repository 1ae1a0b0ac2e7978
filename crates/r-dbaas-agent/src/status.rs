//! ---
//! dbaas_section: "04-guest-agent"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Lifecycle state machine, status persistence, and status publication."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use r_dbaas_metrics::AgentMetrics;
use r_dbaas_rpc::{InstanceId, ServiceStatus, StatusRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::collaborators::AppHealth;
use crate::heartbeat;

/// Why a status changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    /// The prepare sequence.
    Install,
    /// A health observation.
    Heartbeat,
    /// An explicit verb such as `restart` or `stop_db`.
    Operator,
    /// Operator reset back to `NEW`.
    Rebuild,
}

impl TransitionCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionCause::Install => "install",
            TransitionCause::Heartbeat => "heartbeat",
            TransitionCause::Operator => "operator",
            TransitionCause::Rebuild => "rebuild",
        }
    }
}

impl fmt::Display for TransitionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `cause` may move a record from `from` to `to`.
pub fn is_allowed(from: ServiceStatus, to: ServiceStatus, cause: TransitionCause) -> bool {
    use ServiceStatus::*;
    use TransitionCause::*;
    matches!(
        (from, to, cause),
        (New, Building, Install)
            | (Building, Running, Install)
            | (Building, Failed, Install)
            | (Running, Shutdown, Operator)
            | (Running, Shutdown, Heartbeat)
            | (Shutdown, Shutdown, Operator)
            | (Running, Running, Operator)
            | (Shutdown, Running, Operator)
            | (Running, Failed, Operator)
            | (Shutdown, Failed, Operator)
            | (Running, Failed, Heartbeat)
            | (Shutdown, Failed, Heartbeat)
            | (Failed, New, Rebuild)
            | (Shutdown, New, Rebuild)
    )
}

/// Persistence failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("status file {0} failed integrity verification")]
    HashMismatch(PathBuf),
    #[error("instance id {0:?} cannot name a status file")]
    InvalidInstanceId(String),
}

/// Rejected or unpersisted transitions.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("transition {from} -> {to} is not allowed for cause {cause}")]
    Illegal {
        from: ServiceStatus,
        to: ServiceStatus,
        cause: TransitionCause,
    },
    #[error("failed to persist status: {0}")]
    Store(#[from] StoreError),
}

/// Durable home of status records.
pub trait StatusStore: Send + Sync {
    fn load(&self, instance: &InstanceId) -> Result<Option<StatusRecord>, StoreError>;
    fn save(&self, record: &StatusRecord) -> Result<(), StoreError>;
}

/// Volatile store, used when no status directory is configured.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: Mutex<HashMap<InstanceId, StatusRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusStore for MemoryStatusStore {
    fn load(&self, instance: &InstanceId) -> Result<Option<StatusRecord>, StoreError> {
        Ok(self.records.lock().get(instance).cloned())
    }

    fn save(&self, record: &StatusRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .insert(record.instance_id.clone(), record.clone());
        Ok(())
    }
}

const STATUS_FILE_VERSION: u16 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StatusEnvelope {
    version: u16,
    hash: String,
    record: StatusRecord,
}

/// One JSON file per instance, written via rename so readers never see a torn record.
#[derive(Debug, Clone)]
pub struct FileStatusStore {
    directory: PathBuf,
}

impl FileStatusStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Status file for `instance`. Ids that could leave the directory are rejected.
    pub fn path_for(&self, instance: &InstanceId) -> Result<PathBuf, StoreError> {
        let id = instance.as_str();
        let safe = !id.is_empty()
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !safe {
            return Err(StoreError::InvalidInstanceId(id.to_owned()));
        }
        Ok(self.directory.join(format!("{id}.status.json")))
    }
}

impl StatusStore for FileStatusStore {
    fn load(&self, instance: &InstanceId) -> Result<Option<StatusRecord>, StoreError> {
        let path = self.path_for(instance)?;
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let envelope: StatusEnvelope = serde_json::from_slice(&bytes)?;
        if envelope.hash != compute_hash(&envelope.record)? {
            return Err(StoreError::HashMismatch(path));
        }
        debug!(path = %path.display(), status = %envelope.record.status, "loaded status record");
        Ok(Some(envelope.record))
    }

    fn save(&self, record: &StatusRecord) -> Result<(), StoreError> {
        fs::create_dir_all(&self.directory)?;
        let path = self.path_for(&record.instance_id)?;
        let staging = path.with_extension("json.tmp");
        let envelope = StatusEnvelope {
            version: STATUS_FILE_VERSION,
            hash: compute_hash(record)?,
            record: record.clone(),
        };
        write_json(&staging, &envelope)?;
        fs::rename(&staging, &path)?;
        Ok(())
    }
}

fn write_json(path: &Path, envelope: &StatusEnvelope) -> Result<(), StoreError> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&serde_json::to_vec_pretty(envelope)?)?;
    writer.flush()?;
    Ok(())
}

fn compute_hash(record: &StatusRecord) -> Result<String, StoreError> {
    let serialized = serde_json::to_vec(record)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    Ok(hex::encode(hasher.finalize()))
}

/// Published after every applied transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub record: StatusRecord,
    pub previous: ServiceStatus,
    pub cause: TransitionCause,
}

/// External status channel. Lagging or absent subscribers never block the book.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    sender: broadcast::Sender<StatusUpdate>,
}

impl StatusReporter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.sender.subscribe()
    }

    fn publish(&self, update: StatusUpdate) {
        let _ = self.sender.send(update);
    }
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new(32)
    }
}

#[derive(Debug)]
struct BookState {
    record: StatusRecord,
    stopping: bool,
}

/// Owner of one instance's status record.
///
/// Every write goes through [`StatusBook::apply`] while the mutex is held, so
/// the prepare guard, operator transitions and heartbeats never interleave.
pub struct StatusBook {
    instance_id: InstanceId,
    inner: Mutex<BookState>,
    store: Arc<dyn StatusStore>,
    reporter: StatusReporter,
    metrics: Option<AgentMetrics>,
}

impl fmt::Debug for StatusBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusBook")
            .field("instance_id", &self.instance_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl StatusBook {
    /// Load the persisted record, or start from `NEW`.
    ///
    /// A record persisted as `BUILDING` belongs to an install that died with
    /// the previous agent process; it is failed so an operator can rebuild.
    pub fn open(
        instance_id: InstanceId,
        store: Arc<dyn StatusStore>,
        reporter: StatusReporter,
        metrics: Option<AgentMetrics>,
    ) -> Result<Self, TransitionError> {
        let loaded = store.load(&instance_id)?;
        let fresh = loaded.is_none();
        let record = loaded.unwrap_or_else(|| StatusRecord::new(instance_id.clone()));
        let book = Self {
            instance_id,
            inner: Mutex::new(BookState {
                record,
                stopping: false,
            }),
            store,
            reporter,
            metrics,
        };

        {
            let mut state = book.inner.lock();
            if fresh {
                book.store.save(&state.record)?;
            }
            if state.record.status == ServiceStatus::Building {
                warn!(instance = %book.instance_id, "install interrupted by agent restart");
                book.apply(
                    &mut state,
                    ServiceStatus::Failed,
                    TransitionCause::Install,
                    Some("agent restarted during install".to_owned()),
                )?;
            }
            book.export(state.record.status);
        }
        Ok(book)
    }

    /// Book backed by a volatile store.
    pub fn in_memory(instance_id: InstanceId) -> Self {
        let record = StatusRecord::new(instance_id.clone());
        Self {
            instance_id,
            inner: Mutex::new(BookState {
                record,
                stopping: false,
            }),
            store: Arc::new(MemoryStatusStore::new()),
            reporter: StatusReporter::default(),
            metrics: None,
        }
    }

    /// Instance this book tracks.
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Current in-memory status.
    pub fn status(&self) -> ServiceStatus {
        self.inner.lock().record.status
    }

    pub fn snapshot(&self) -> StatusRecord {
        self.inner.lock().record.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.reporter.subscribe()
    }

    /// Atomic `NEW -> BUILDING` check-and-set guarding prepare.
    pub fn begin_install(&self) -> Result<StatusRecord, TransitionError> {
        let mut state = self.inner.lock();
        if state.record.status != ServiceStatus::New {
            return Err(TransitionError::Illegal {
                from: state.record.status,
                to: ServiceStatus::Building,
                cause: TransitionCause::Install,
            });
        }
        self.apply(
            &mut state,
            ServiceStatus::Building,
            TransitionCause::Install,
            None,
        )
    }

    /// Validate and persist a move to `to`, then publish it.
    pub fn transition(
        &self,
        to: ServiceStatus,
        cause: TransitionCause,
        reason: Option<String>,
    ) -> Result<StatusRecord, TransitionError> {
        let mut state = self.inner.lock();
        self.apply(&mut state, to, cause, reason)
    }

    /// End an install as `FAILED`.
    ///
    /// The in-memory record leaves `BUILDING` even when the store rejects the
    /// write; the stale persisted `BUILDING` is failed again by [`StatusBook::open`].
    pub fn abandon_install(&self, reason: String) -> Result<StatusRecord, TransitionError> {
        let mut state = self.inner.lock();
        let from = state.record.status;
        if !is_allowed(from, ServiceStatus::Failed, TransitionCause::Install) {
            return Err(TransitionError::Illegal {
                from,
                to: ServiceStatus::Failed,
                cause: TransitionCause::Install,
            });
        }
        let next = StatusRecord {
            instance_id: self.instance_id.clone(),
            status: ServiceStatus::Failed,
            updated_at: Utc::now(),
            reason: Some(reason),
        };
        let saved = self.store.save(&next);
        if let Err(err) = &saved {
            warn!(instance = %self.instance_id, error = %err, "install failure not persisted");
        }
        self.commit(&mut state, next, from, TransitionCause::Install);
        saved.map(|()| state.record.clone()).map_err(TransitionError::from)
    }

    /// Explicit operator rebuild back to `NEW`.
    pub fn rebuild(&self) -> Result<StatusRecord, TransitionError> {
        self.transition(ServiceStatus::New, TransitionCause::Rebuild, None)
    }

    /// Mark a deliberate stop in progress so an observed exit reads as shutdown.
    pub fn begin_stop(&self) {
        self.inner.lock().stopping = true;
    }

    pub fn end_stop(&self) {
        self.inner.lock().stopping = false;
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.lock().stopping
    }

    /// Apply a heartbeat observation. Returns the new record when it changed.
    pub fn observe_health(
        &self,
        health: AppHealth,
    ) -> Result<Option<StatusRecord>, TransitionError> {
        let mut state = self.inner.lock();
        let Some(to) = heartbeat::evaluate(state.record.status, health, state.stopping) else {
            return Ok(None);
        };
        let reason = match to {
            ServiceStatus::Failed => Some(format!("datastore process {}", health)),
            _ => None,
        };
        self.apply(&mut state, to, TransitionCause::Heartbeat, reason)
            .map(Some)
    }

    fn apply(
        &self,
        state: &mut BookState,
        to: ServiceStatus,
        cause: TransitionCause,
        reason: Option<String>,
    ) -> Result<StatusRecord, TransitionError> {
        let from = state.record.status;
        if !is_allowed(from, to, cause) {
            return Err(TransitionError::Illegal { from, to, cause });
        }

        let next = StatusRecord {
            instance_id: self.instance_id.clone(),
            status: to,
            updated_at: Utc::now(),
            reason,
        };
        self.store.save(&next)?;
        Ok(self.commit(state, next, from, cause))
    }

    fn commit(
        &self,
        state: &mut BookState,
        next: StatusRecord,
        from: ServiceStatus,
        cause: TransitionCause,
    ) -> StatusRecord {
        let to = next.status;
        state.record = next.clone();

        if from != to {
            info!(
                instance = %self.instance_id,
                %from,
                %to,
                %cause,
                reason = next.reason.as_deref().unwrap_or(""),
                "status transition"
            );
        }
        self.export(to);
        self.reporter.publish(StatusUpdate {
            record: next.clone(),
            previous: from,
            cause,
        });
        next
    }

    fn export(&self, current: ServiceStatus) {
        if let Some(metrics) = &self.metrics {
            let all = ServiceStatus::ALL.map(|status| status.as_str());
            metrics.set_status(self.instance_id.as_str(), &all, current.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn book() -> StatusBook {
        StatusBook::in_memory(InstanceId::from("inst-1"))
    }

    #[test]
    fn install_guard_admits_exactly_one_caller() {
        let book = book();
        assert!(book.begin_install().is_ok());
        let err = book.begin_install().unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Illegal {
                from: ServiceStatus::Building,
                ..
            }
        ));
    }

    #[test]
    fn concurrent_install_guards_race_to_a_single_winner() {
        let book = Arc::new(book());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let book = book.clone();
                std::thread::spawn(move || book.begin_install().is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .filter_map(|handle| handle.join().ok())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn graph_rejects_shortcuts() {
        let book = book();
        assert!(book
            .transition(ServiceStatus::Running, TransitionCause::Operator, None)
            .is_err());
        assert!(book
            .transition(ServiceStatus::Running, TransitionCause::Install, None)
            .is_err());
        assert_eq!(book.status(), ServiceStatus::New);

        book.begin_install().unwrap();
        book.transition(ServiceStatus::Failed, TransitionCause::Install, Some("boom".into()))
            .unwrap();
        assert!(book
            .transition(ServiceStatus::Running, TransitionCause::Operator, None)
            .is_err());
        let record = book.rebuild().unwrap();
        assert_eq!(record.status, ServiceStatus::New);
        assert_eq!(record.reason, None);
    }

    #[test]
    fn heartbeat_leaves_new_and_building_alone() {
        let book = book();
        assert_eq!(book.observe_health(AppHealth::Crashed).unwrap(), None);
        book.begin_install().unwrap();
        assert_eq!(book.observe_health(AppHealth::Exited).unwrap(), None);
        assert_eq!(book.status(), ServiceStatus::Building);
    }

    #[test]
    fn exit_during_deliberate_stop_is_shutdown_not_failure() {
        let book = book();
        book.begin_install().unwrap();
        book.transition(ServiceStatus::Running, TransitionCause::Install, None)
            .unwrap();

        book.begin_stop();
        let record = book.observe_health(AppHealth::Exited).unwrap().unwrap();
        assert_eq!(record.status, ServiceStatus::Shutdown);
        book.end_stop();

        let record = book.observe_health(AppHealth::Crashed).unwrap().unwrap();
        assert_eq!(record.status, ServiceStatus::Failed);
        assert_eq!(record.reason.as_deref(), Some("datastore process crashed"));
    }

    #[test]
    fn transitions_are_published_with_cause() {
        let book = book();
        let mut updates = book.subscribe();
        book.begin_install().unwrap();
        let update = updates.try_recv().unwrap();
        assert_eq!(update.previous, ServiceStatus::New);
        assert_eq!(update.record.status, ServiceStatus::Building);
        assert_eq!(update.cause, TransitionCause::Install);
    }

    #[test]
    fn file_store_resumes_and_fails_interrupted_install() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn StatusStore> = Arc::new(FileStatusStore::new(dir.path()));
        let id = InstanceId::from("inst-file");

        let book = StatusBook::open(id.clone(), store.clone(), StatusReporter::default(), None)
            .unwrap();
        book.begin_install().unwrap();
        drop(book);

        let reopened =
            StatusBook::open(id.clone(), store.clone(), StatusReporter::default(), None).unwrap();
        let record = reopened.snapshot();
        assert_eq!(record.status, ServiceStatus::Failed);
        assert_eq!(
            record.reason.as_deref(),
            Some("agent restarted during install")
        );
        assert_eq!(store.load(&id).unwrap().unwrap().status, ServiceStatus::Failed);
    }

    #[test]
    fn file_store_detects_tampering() {
        let dir = tempdir().unwrap();
        let store = FileStatusStore::new(dir.path());
        let id = InstanceId::from("inst-t");
        store.save(&StatusRecord::new(id.clone())).unwrap();

        let path = store.path_for(&id).unwrap();
        let mut envelope: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        envelope["record"]["status"] = serde_json::json!("RUNNING");
        fs::write(&path, serde_json::to_vec(&envelope).unwrap()).unwrap();

        assert!(matches!(store.load(&id), Err(StoreError::HashMismatch(_))));
    }

    #[test]
    fn file_store_keeps_records_inside_its_directory() {
        let dir = tempdir().unwrap();
        let state = dir.path().join("state");
        let store = FileStatusStore::new(&state);

        for id in ["../escaped", "nested/inst", "..", "", ".hidden", "c:\\inst"] {
            let record = StatusRecord::new(InstanceId::from(id));
            let err = store.save(&record).unwrap_err();
            assert!(matches!(err, StoreError::InvalidInstanceId(_)), "{id}: {err}");
            assert!(matches!(
                store.load(&InstanceId::from(id)),
                Err(StoreError::InvalidInstanceId(_))
            ));
        }
        assert!(!dir.path().join("escaped.status.json").exists());

        let id = InstanceId::from("mysql-01.prod_a");
        store.save(&StatusRecord::new(id.clone())).unwrap();
        let path = store.path_for(&id).unwrap();
        assert_eq!(path, state.join("mysql-01.prod_a.status.json"));
        assert!(path.exists());
    }
}
