//! Key-value persistence for task state.
//!
//! The orchestrator treats its store as a plain async KV surface with
//! per-key TTLs ([`KvStore`]). Two implementations ship:
//!
//! - [`MemoryKvStore`]: a map behind an async lock, for tests and
//!   single-process deployments that do not need durability.
//! - [`FileKvStore`]: one JSON file per key under a directory, so task
//!   state survives process restarts and resume can replay from the last
//!   persisted stage.
//!
//! On top of the raw surface this module provides typed helpers for
//! [`TaskState`] records and the soft lease that prevents a live run and a
//! resume-recovery run from writing the same task concurrently. A lease is
//! LOCK-then-overwrite with a short TTL: acquiring an expired lease steals
//! it, acquiring a live one fails with
//! [`TaskLocked`](OrchestratorError::TaskLocked).

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::makerflow::error::OrchestratorError;
use crate::makerflow::task::{lock_key, task_key, TaskState};

/// Default lease lifetime: 5 minutes.
pub const LEASE_TTL: Duration = Duration::from_secs(300);

/// Minimal async KV surface with optional per-key TTL.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), OrchestratorError>;

    /// Returns `None` for missing or expired keys.
    async fn get(&self, key: &str) -> Result<Option<String>, OrchestratorError>;

    async fn delete(&self, key: &str) -> Result<(), OrchestratorError>;
}

/// Stored envelope: the value plus its expiry wall-clock time.
///
/// Wall-clock expiry (rather than a monotonic instant) keeps TTLs meaningful
/// across process restarts for the file store.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Envelope {
    fn expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if at <= Utc::now())
    }
}

fn make_envelope(value: String, ttl: Option<Duration>) -> Envelope {
    Envelope {
        value,
        expires_at: ttl.and_then(|t| {
            chrono::TimeDelta::from_std(t)
                .ok()
                .map(|delta| Utc::now() + delta)
        }),
    }
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Envelope>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn put(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), OrchestratorError> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), make_envelope(value, ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, OrchestratorError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| !e.expired())
            .map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), OrchestratorError> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }
}

/// One JSON file per key under a directory.
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    /// Create the store, creating the directory if needed.
    pub fn open(dir: PathBuf) -> Result<Self, OrchestratorError> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn put(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), OrchestratorError> {
        let envelope = make_envelope(value, ttl);
        let path = self.path_for(key);
        let json = serde_json::to_string(&envelope)?;
        tokio::fs::write(&path, json).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, OrchestratorError> {
        let path = self.path_for(key);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let envelope: Envelope = serde_json::from_str(&json)?;
        if envelope.expired() {
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }
        Ok(Some(envelope.value))
    }

    async fn delete(&self, key: &str) -> Result<(), OrchestratorError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Persist a task under `task:{id}` with the configured TTL.
pub async fn save_task(
    store: &dyn KvStore,
    task: &TaskState,
    ttl: Duration,
) -> Result<(), OrchestratorError> {
    let json = serde_json::to_string(task)?;
    store.put(&task.store_key(), json, Some(ttl)).await
}

/// Load a task by id. `Ok(None)` when absent or expired.
pub async fn load_task(
    store: &dyn KvStore,
    task_id: &str,
) -> Result<Option<TaskState>, OrchestratorError> {
    match store.get(&task_key(task_id)).await? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Lease record stored under `task:{id}:lock`.
#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    owner: String,
    acquired_at: DateTime<Utc>,
}

/// Acquire the soft lease for a task, returning the owner token.
///
/// A missing or expired lease is taken over; a live lease held by someone
/// else yields [`TaskLocked`](OrchestratorError::TaskLocked). The lease TTL
/// is enforced by the store itself, so a crashed owner frees the task within
/// [`LEASE_TTL`].
pub async fn acquire_lease(
    store: &dyn KvStore,
    task_id: &str,
) -> Result<String, OrchestratorError> {
    let key = lock_key(task_id);
    if store.get(&key).await?.is_some() {
        return Err(OrchestratorError::TaskLocked(task_id.to_string()));
    }
    let record = LeaseRecord {
        owner: Uuid::new_v4().to_string(),
        acquired_at: Utc::now(),
    };
    store
        .put(&key, serde_json::to_string(&record)?, Some(LEASE_TTL))
        .await?;
    Ok(record.owner)
}

/// Release a lease if the token still owns it. Releasing a lease that was
/// stolen or already expired is a no-op, so release is idempotent.
pub async fn release_lease(
    store: &dyn KvStore,
    task_id: &str,
    owner: &str,
) -> Result<(), OrchestratorError> {
    let key = lock_key(task_id);
    if let Some(json) = store.get(&key).await? {
        if let Ok(record) = serde_json::from_str::<LeaseRecord>(&json) {
            if record.owner == owner {
                store.delete(&key).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::makerflow::task::TaskStatus;

    #[tokio::test]
    async fn test_memory_round_trip_and_ttl() {
        let store = MemoryKvStore::new();
        store.put("k", "v".into(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        store
            .put("short", "v".into(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("short").await.unwrap(), None);

        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path().to_path_buf()).unwrap();

        store.put("task:abc", "{\"x\":1}".into(), None).await.unwrap();
        assert_eq!(
            store.get("task:abc").await.unwrap().as_deref(),
            Some("{\"x\":1}")
        );

        // Unknown keys and deletes of unknown keys are fine.
        assert_eq!(store.get("task:nope").await.unwrap(), None);
        store.delete("task:nope").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_ttl_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path().to_path_buf()).unwrap();
        store
            .put("k", "v".into(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_task_round_trip_equality() {
        let store = MemoryKvStore::new();
        let mut task = TaskState::new("do the thing", 3);
        task.set_status(TaskStatus::Planning);
        task.preprocessed = Some("normalized".into());

        save_task(&store, &task, Duration::from_secs(60)).await.unwrap();
        let loaded = load_task(&store, &task.task_id).await.unwrap().unwrap();
        assert_eq!(loaded, task);

        assert!(load_task(&store, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_conflict_and_release() {
        let store = MemoryKvStore::new();
        let owner = acquire_lease(&store, "t1").await.unwrap();

        let err = acquire_lease(&store, "t1").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::TaskLocked(_)));

        release_lease(&store, "t1", &owner).await.unwrap();
        // Released, so it can be taken again.
        acquire_lease(&store, "t1").await.unwrap();

        // Releasing with a stale token does not free the live lease.
        release_lease(&store, "t1", &owner).await.unwrap();
        assert!(acquire_lease(&store, "t1").await.is_err());
    }

    #[tokio::test]
    async fn test_expired_lease_is_stolen() {
        let store = MemoryKvStore::new();
        // Plant a lease that is already expired.
        let record = LeaseRecord {
            owner: "dead-owner".into(),
            acquired_at: Utc::now(),
        };
        store
            .put(
                &lock_key("t1"),
                serde_json::to_string(&record).unwrap(),
                Some(Duration::from_millis(10)),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let owner = acquire_lease(&store, "t1").await.unwrap();
        assert_ne!(owner, "dead-owner");
    }
}
