//! Persisted breaker mirror and monitor configuration.
//!
//! The full schema belongs to the platform's persistence layer. This crate
//! only needs the status mirror, the remote lock flag, control operation
//! records and the monitor interval, which is what [`BreakerStore`] exposes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{BreakerError, BreakerResult};
use crate::models::{Breaker, BreakerId, BreakerStatus, ControlOperation, ElectricalConfig, MonitorConfig};

#[async_trait]
pub trait BreakerStore: Send + Sync {
    async fn list_enabled(&self) -> BreakerResult<Vec<Breaker>>;

    async fn breaker(&self, id: BreakerId) -> BreakerResult<Breaker>;

    async fn upsert_breaker(&self, breaker: Breaker) -> BreakerResult<()>;

    /// Write a changed switch state. Also refreshes `last_update` and marks
    /// the breaker reachable, since a state is only known from a good read.
    async fn record_state(
        &self,
        id: BreakerId,
        status: BreakerStatus,
        local_lock: bool,
        at: DateTime<Utc>,
    ) -> BreakerResult<()>;

    /// Liveness only: `last_update` and reachability, never the status.
    async fn touch(&self, id: BreakerId, at: DateTime<Utc>, reachable: bool) -> BreakerResult<()>;

    async fn set_remote_lock(&self, id: BreakerId, locked: bool) -> BreakerResult<()>;

    async fn save_electrical(&self, id: BreakerId, config: ElectricalConfig) -> BreakerResult<()>;

    async fn save_operation(&self, operation: &ControlOperation) -> BreakerResult<()>;

    async fn operation(&self, control_id: &str) -> BreakerResult<Option<ControlOperation>>;

    async fn load_monitor_config(&self) -> BreakerResult<Option<MonitorConfig>>;

    async fn save_monitor_config(&self, config: &MonitorConfig) -> BreakerResult<()>;
}

/// Terminal operations kept unless configured otherwise.
pub const DEFAULT_OPERATION_HISTORY: usize = 1000;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    breakers: BTreeMap<BreakerId, Breaker>,
    #[serde(default)]
    monitor: Option<MonitorConfig>,
}

/// In-memory store, optionally mirrored to JSON files after every mutation.
/// Breakers and the monitor config live in `path`; control operations in a
/// sibling `*.operations.json` that liveness refreshes never rewrite.
pub struct JsonStore {
    state: RwLock<Snapshot>,
    operations: RwLock<HashMap<String, ControlOperation>>,
    history_limit: usize,
    path: Option<PathBuf>,
}

impl JsonStore {
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(Snapshot::default()),
            operations: RwLock::new(HashMap::new()),
            history_limit: DEFAULT_OPERATION_HISTORY,
            path: None,
        }
    }

    /// Load `path` if it exists, otherwise start empty and create it on the first write.
    pub async fn open(path: impl AsRef<Path>) -> BreakerResult<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot: Snapshot = read_json(&path).await?.unwrap_or_default();
        let operations: HashMap<String, ControlOperation> =
            read_json(&operations_path(&path)).await?.unwrap_or_default();
        info!(
            "Loaded {} breakers and {} operations from {}",
            snapshot.breakers.len(),
            operations.len(),
            path.display()
        );
        Ok(Self {
            state: RwLock::new(snapshot),
            operations: RwLock::new(operations),
            history_limit: DEFAULT_OPERATION_HISTORY,
            path: Some(path),
        })
    }

    /// Keep at most `limit` terminal operations, dropping the oldest first.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    async fn persist(&self, snapshot: &Snapshot) -> BreakerResult<()> {
        match &self.path {
            Some(path) => write_json(path, snapshot).await,
            None => Ok(()),
        }
    }

    async fn persist_operations(&self, operations: &HashMap<String, ControlOperation>) -> BreakerResult<()> {
        match &self.path {
            Some(path) => write_json(&operations_path(path), operations).await,
            None => Ok(()),
        }
    }

    async fn mutate_breaker<F>(&self, id: BreakerId, apply: F) -> BreakerResult<()>
    where
        F: FnOnce(&mut Breaker) + Send,
    {
        let mut state = self.state.write().await;
        let breaker = state.breakers.get_mut(&id).ok_or(BreakerError::BreakerNotFound(id))?;
        apply(breaker);
        self.persist(&state).await
    }
}

fn operations_path(path: &Path) -> PathBuf {
    path.with_extension("operations.json")
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> BreakerResult<Option<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| BreakerError::Store(format!("parse {}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("State file {} not found, starting empty", path.display());
            Ok(None)
        }
        Err(e) => Err(BreakerError::Store(format!("read {}: {}", path.display(), e))),
    }
}

async fn write_json<T: Serialize + Sync>(path: &Path, value: &T) -> BreakerResult<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| BreakerError::Store(format!("serialize {}: {}", path.display(), e)))?;
    // write-then-rename, readers never observe a partial file
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, text)
        .await
        .map_err(|e| BreakerError::Store(format!("write {}: {}", tmp.display(), e)))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| BreakerError::Store(format!("rename {}: {}", path.display(), e)))?;
    debug!("State persisted to {}", path.display());
    Ok(())
}

/// Drop the oldest terminal operations beyond `limit`. In-flight ones stay.
fn prune_history(operations: &mut HashMap<String, ControlOperation>, limit: usize) {
    let mut terminal: Vec<(DateTime<Utc>, String)> = operations
        .values()
        .filter(|op| op.is_terminal())
        .map(|op| (op.end_time.unwrap_or(op.start_time), op.control_id.clone()))
        .collect();
    if terminal.len() <= limit {
        return;
    }
    terminal.sort();
    let excess = terminal.len() - limit;
    for (_, control_id) in terminal.into_iter().take(excess) {
        operations.remove(&control_id);
    }
    debug!("Pruned {} old control operations", excess);
}

#[async_trait]
impl BreakerStore for JsonStore {
    async fn list_enabled(&self) -> BreakerResult<Vec<Breaker>> {
        let state = self.state.read().await;
        Ok(state.breakers.values().filter(|b| b.is_enabled).cloned().collect())
    }

    async fn breaker(&self, id: BreakerId) -> BreakerResult<Breaker> {
        let state = self.state.read().await;
        state.breakers.get(&id).cloned().ok_or(BreakerError::BreakerNotFound(id))
    }

    async fn upsert_breaker(&self, breaker: Breaker) -> BreakerResult<()> {
        let mut state = self.state.write().await;
        state.breakers.insert(breaker.id, breaker);
        self.persist(&state).await
    }

    async fn record_state(
        &self,
        id: BreakerId,
        status: BreakerStatus,
        local_lock: bool,
        at: DateTime<Utc>,
    ) -> BreakerResult<()> {
        self.mutate_breaker(id, |b| {
            b.status = status;
            b.local_lock = local_lock;
            b.reachable = true;
            b.last_update = Some(at);
        })
        .await
    }

    async fn touch(&self, id: BreakerId, at: DateTime<Utc>, reachable: bool) -> BreakerResult<()> {
        self.mutate_breaker(id, |b| {
            b.last_update = Some(at);
            b.reachable = reachable;
        })
        .await
    }

    async fn set_remote_lock(&self, id: BreakerId, locked: bool) -> BreakerResult<()> {
        self.mutate_breaker(id, |b| b.is_locked = locked).await
    }

    async fn save_electrical(&self, id: BreakerId, config: ElectricalConfig) -> BreakerResult<()> {
        self.mutate_breaker(id, |b| b.electrical = Some(config)).await
    }

    async fn save_operation(&self, operation: &ControlOperation) -> BreakerResult<()> {
        let mut operations = self.operations.write().await;
        if let Some(existing) = operations.get(&operation.control_id) {
            if existing.is_terminal() {
                return Err(BreakerError::Store(format!(
                    "operation {} is already terminal",
                    operation.control_id
                )));
            }
        }
        operations.insert(operation.control_id.clone(), operation.clone());
        if operation.is_terminal() {
            prune_history(&mut operations, self.history_limit);
        }
        self.persist_operations(&operations).await
    }

    async fn operation(&self, control_id: &str) -> BreakerResult<Option<ControlOperation>> {
        let operations = self.operations.read().await;
        Ok(operations.get(control_id).cloned())
    }

    async fn load_monitor_config(&self) -> BreakerResult<Option<MonitorConfig>> {
        Ok(self.state.read().await.monitor.clone())
    }

    async fn save_monitor_config(&self, config: &MonitorConfig) -> BreakerResult<()> {
        let mut state = self.state.write().await;
        state.monitor = Some(config.clone());
        self.persist(&state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ControlAction, ControlOutcome, Endpoint};

    fn breaker(id: BreakerId, enabled: bool) -> Breaker {
        let mut b = Breaker::new(id, format!("cb-{}", id), Endpoint::new("10.0.0.9", 502, id as u8));
        b.is_enabled = enabled;
        b
    }

    #[tokio::test]
    async fn only_enabled_breakers_are_listed() {
        let store = JsonStore::in_memory();
        store.upsert_breaker(breaker(1, true)).await.unwrap();
        store.upsert_breaker(breaker(2, false)).await.unwrap();
        let ids: Vec<_> = store.list_enabled().await.unwrap().iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn touch_never_changes_status() {
        let store = JsonStore::in_memory();
        store.upsert_breaker(breaker(1, true)).await.unwrap();
        store.record_state(1, BreakerStatus::On, false, Utc::now()).await.unwrap();
        store.touch(1, Utc::now(), false).await.unwrap();
        let b = store.breaker(1).await.unwrap();
        assert_eq!(b.status, BreakerStatus::On);
        assert!(!b.reachable);
        assert!(b.last_update.is_some());
    }

    #[tokio::test]
    async fn unknown_breaker_is_not_found() {
        let store = JsonStore::in_memory();
        assert!(matches!(
            store.touch(42, Utc::now(), true).await,
            Err(BreakerError::BreakerNotFound(42))
        ));
    }

    #[tokio::test]
    async fn terminal_operations_are_immutable() {
        let store = JsonStore::in_memory();
        let mut op = ControlOperation::new(1, ControlAction::On);
        store.save_operation(&op).await.unwrap();
        op.begin();
        store.save_operation(&op).await.unwrap();
        op.complete(ControlOutcome::Succeeded, 2);
        store.save_operation(&op).await.unwrap();
        assert!(store.save_operation(&op).await.is_err());
        let stored = store.operation(&op.control_id).await.unwrap().unwrap();
        assert!(stored.success);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = JsonStore::open(&path).await.unwrap();
            store.upsert_breaker(breaker(7, true)).await.unwrap();
            store.set_remote_lock(7, true).await.unwrap();
            store
                .save_monitor_config(&MonitorConfig { interval_secs: 30, max_retries: 1 })
                .await
                .unwrap();
        }
        let reopened = JsonStore::open(&path).await.unwrap();
        assert!(reopened.breaker(7).await.unwrap().is_locked);
        assert_eq!(reopened.load_monitor_config().await.unwrap().unwrap().interval_secs, 30);
    }

    fn finished(breaker_id: BreakerId) -> ControlOperation {
        let mut op = ControlOperation::new(breaker_id, ControlAction::Off);
        op.begin();
        op.complete(ControlOutcome::AlreadyAtTarget, 0);
        op
    }

    #[tokio::test]
    async fn terminal_history_is_bounded() {
        let store = JsonStore::in_memory().with_history_limit(3);
        let mut running = ControlOperation::new(9, ControlAction::On);
        running.begin();
        store.save_operation(&running).await.unwrap();

        let mut ids = Vec::new();
        for id in 0..5 {
            let op = finished(id);
            store.save_operation(&op).await.unwrap();
            ids.push(op.control_id);
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        assert!(store.operation(&ids[0]).await.unwrap().is_none());
        assert!(store.operation(&ids[1]).await.unwrap().is_none());
        for id in &ids[2..] {
            assert!(store.operation(id).await.unwrap().is_some());
        }
        assert!(store.operation(&running.control_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn liveness_refresh_leaves_operation_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = JsonStore::open(&path).await.unwrap();
        store.upsert_breaker(breaker(1, true)).await.unwrap();
        let op = finished(1);
        store.save_operation(&op).await.unwrap();

        let ops_file = operations_path(&path);
        assert!(ops_file.exists());
        std::fs::remove_file(&ops_file).unwrap();
        store.touch(1, Utc::now(), true).await.unwrap();
        store.record_state(1, BreakerStatus::On, false, Utc::now()).await.unwrap();
        assert!(!ops_file.exists());

        store.save_operation(&finished(1)).await.unwrap();
        let reopened = JsonStore::open(&path).await.unwrap();
        assert_eq!(reopened.breaker(1).await.unwrap().status, BreakerStatus::On);
        assert!(reopened.operation(&op.control_id).await.unwrap().is_some());
    }
}
