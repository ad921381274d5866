//! Persistence collaborator interfaces and in-memory reference
//! implementations.
//!
//! The core never owns durable storage; it speaks to a [`ThreadStore`]
//! for snapshots/checkpoints, an optional [`AssetStore`] for binary
//! artifacts, and an optional [`PermissionStore`] for persisted
//! permission choices. The in-memory implementations make the crate
//! usable stand-alone and back the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::permission::{PermissionChoice, PermissionScope};
use crate::thread::ThreadSnapshot;

/// Failure reported by a store.
///
/// Transient failures during checkpointing are logged and skipped;
/// durable failures fail the run with `checkpoint_failure`.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Retryable failure (contention, connectivity).
    #[error("transient store failure: {0}")]
    Transient(String),
    /// Permanent failure (corruption, quota, schema).
    #[error("durable store failure: {0}")]
    Durable(String),
}

/// Identifying record of one persisted checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    /// Store-assigned checkpoint id.
    pub id: String,
    /// Iteration recorded in the snapshot's loop state, if any.
    pub iteration: Option<u32>,
    /// When the checkpoint was persisted.
    pub created_at: DateTime<Utc>,
}

/// Persistence of thread snapshots and checkpoint records by thread id.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Persist a snapshot, returning its checkpoint id.
    ///
    /// When `retain_history` is `false` the store may garbage-collect
    /// older checkpoints for the same thread; `full_history` checkpoint
    /// mode passes `true`.
    ///
    /// # Errors
    ///
    /// [`StoreError`] on persistence failure.
    async fn save_snapshot(
        &self,
        snapshot: ThreadSnapshot,
        retain_history: bool,
    ) -> Result<String, StoreError>;

    /// Load the latest snapshot for a thread, if one exists.
    ///
    /// # Errors
    ///
    /// [`StoreError`] on read failure.
    async fn load_snapshot(&self, thread_id: Uuid) -> Result<Option<ThreadSnapshot>, StoreError>;

    /// List retained checkpoints for a thread, oldest first.
    ///
    /// # Errors
    ///
    /// [`StoreError`] on read failure.
    async fn list_checkpoints(&self, thread_id: Uuid) -> Result<Vec<CheckpointRecord>, StoreError>;

    /// Delete all state for a thread.
    ///
    /// # Errors
    ///
    /// [`StoreError`] on delete failure.
    async fn delete(&self, thread_id: Uuid) -> Result<(), StoreError>;
}

/// Map-backed thread store.
#[derive(Debug, Default)]
pub struct InMemoryThreadStore {
    inner: Mutex<HashMap<Uuid, Vec<(CheckpointRecord, ThreadSnapshot)>>>,
}

impl InMemoryThreadStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<R>(
        &self,
        f: impl FnOnce(&mut HashMap<Uuid, Vec<(CheckpointRecord, ThreadSnapshot)>>) -> R,
    ) -> R {
        match self.inner.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl ThreadStore for InMemoryThreadStore {
    async fn save_snapshot(
        &self,
        snapshot: ThreadSnapshot,
        retain_history: bool,
    ) -> Result<String, StoreError> {
        let record = CheckpointRecord {
            id: Uuid::new_v4().to_string(),
            iteration: snapshot.loop_state.as_ref().map(|s| s.iteration),
            created_at: Utc::now(),
        };
        let id = record.id.clone();
        self.with_inner(|map| {
            let entry = map.entry(snapshot.thread_id).or_default();
            if !retain_history {
                entry.clear();
            }
            entry.push((record, snapshot));
        });
        Ok(id)
    }

    async fn load_snapshot(&self, thread_id: Uuid) -> Result<Option<ThreadSnapshot>, StoreError> {
        Ok(self.with_inner(|map| {
            map.get(&thread_id)
                .and_then(|entries| entries.last())
                .map(|(_, snapshot)| snapshot.clone())
        }))
    }

    async fn list_checkpoints(&self, thread_id: Uuid) -> Result<Vec<CheckpointRecord>, StoreError> {
        Ok(self.with_inner(|map| {
            map.get(&thread_id)
                .map(|entries| entries.iter().map(|(record, _)| record.clone()).collect())
                .unwrap_or_default()
        }))
    }

    async fn delete(&self, thread_id: Uuid) -> Result<(), StoreError> {
        self.with_inner(|map| {
            map.remove(&thread_id);
        });
        Ok(())
    }
}

/// Reference to a stored asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRef {
    /// Opaque asset id.
    pub id: String,
    /// URI form (`asset://{id}`) for embedding in messages.
    pub uri: String,
}

/// Store-and-retrieve for binary artifacts referenced by messages.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Store bytes, returning the asset reference.
    ///
    /// # Errors
    ///
    /// [`StoreError`] on persistence failure.
    async fn put(&self, bytes: Vec<u8>, media_type: Option<String>) -> Result<AssetRef, StoreError>;

    /// Fetch bytes by asset id.
    ///
    /// # Errors
    ///
    /// [`StoreError`] on read failure.
    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Map-backed asset store.
#[derive(Debug, Default)]
pub struct InMemoryAssetStore {
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryAssetStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AssetStore for InMemoryAssetStore {
    async fn put(
        &self,
        bytes: Vec<u8>,
        _media_type: Option<String>,
    ) -> Result<AssetRef, StoreError> {
        let id = Uuid::new_v4().simple().to_string();
        let uri = format!("asset://{id}");
        match self.inner.lock() {
            Ok(mut map) => {
                map.insert(id.clone(), bytes);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(id.clone(), bytes);
            }
        }
        Ok(AssetRef { id, uri })
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let bytes = match self.inner.lock() {
            Ok(map) => map.get(id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(id).cloned(),
        };
        Ok(bytes)
    }
}

/// Persisted permission choices by (function, scope, scope id).
#[async_trait]
pub trait PermissionStore: Send + Sync {
    /// Fetch a stored choice covering the given scope.
    ///
    /// # Errors
    ///
    /// [`StoreError`] on read failure.
    async fn lookup(
        &self,
        function: &str,
        scope: PermissionScope,
        scope_id: &str,
    ) -> Result<Option<PermissionChoice>, StoreError>;

    /// Record a choice for the given scope.
    ///
    /// # Errors
    ///
    /// [`StoreError`] on persistence failure.
    async fn record(
        &self,
        function: &str,
        scope: PermissionScope,
        scope_id: &str,
        choice: PermissionChoice,
    ) -> Result<(), StoreError>;
}

/// Map-backed permission store.
#[derive(Debug, Default)]
pub struct InMemoryPermissionStore {
    inner: Mutex<HashMap<(String, PermissionScope, String), PermissionChoice>>,
}

impl InMemoryPermissionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PermissionStore for InMemoryPermissionStore {
    async fn lookup(
        &self,
        function: &str,
        scope: PermissionScope,
        scope_id: &str,
    ) -> Result<Option<PermissionChoice>, StoreError> {
        let key = (function.to_owned(), scope, scope_id.to_owned());
        let choice = match self.inner.lock() {
            Ok(map) => map.get(&key).copied(),
            Err(poisoned) => poisoned.into_inner().get(&key).copied(),
        };
        Ok(choice)
    }

    async fn record(
        &self,
        function: &str,
        scope: PermissionScope,
        scope_id: &str,
        choice: PermissionChoice,
    ) -> Result<(), StoreError> {
        let key = (function.to_owned(), scope, scope_id.to_owned());
        match self.inner.lock() {
            Ok(mut map) => {
                map.insert(key, choice);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(key, choice);
            }
        }
        Ok(())
    }
}
