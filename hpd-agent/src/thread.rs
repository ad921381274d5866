//! Conversation threads: append-only message log with token accounting,
//! optional resumable loop state, and snapshot/restore.
//!
//! The external surface is push-only. Reading the full log is reserved
//! for the core driver (and for [`ThreadSnapshot`], which captures a
//! consistent prefix of the append history).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::message::Message;
use crate::state::LoopState;

/// Snapshot format version written by this crate.
pub const SNAPSHOT_VERSION: u32 = 1;

/// A named container owning an ordered message log and, while a run is
/// in progress or suspended, its [`LoopState`].
#[derive(Debug, Clone)]
pub struct ConversationThread {
    id: Uuid,
    name: Option<String>,
    project: Option<String>,
    created_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    messages: Vec<Message>,
    metadata: HashMap<String, Value>,
    loop_state: Option<LoopState>,
}

impl ConversationThread {
    /// Create an empty thread with a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    /// Create an empty thread with a caller-chosen id.
    #[must_use]
    pub fn with_id(id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: None,
            project: None,
            created_at: now,
            last_active_at: now,
            messages: Vec::new(),
            metadata: HashMap::new(),
            loop_state: None,
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the project reference.
    #[must_use]
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// The thread id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// The display name, if set.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The project reference, if set.
    #[must_use]
    pub fn project(&self) -> Option<&str> {
        self.project.as_deref()
    }

    /// Append one message and bump the last-activity timestamp.
    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
        self.last_active_at = Utc::now();
    }

    /// Append several messages.
    pub fn add_messages(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
        self.last_active_at = Utc::now();
    }

    /// Number of messages in the log.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Estimated token footprint of the log. Uses provider usage records
    /// where present and a character-based fallback otherwise.
    #[must_use]
    pub fn token_estimate(&self) -> u64 {
        self.messages.iter().map(Message::estimated_tokens).sum()
    }

    /// Full ordered log. Reserved for the core driver.
    pub(crate) fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Replace the log wholesale. Used only by history reduction, which
    /// runs between iterations.
    pub(crate) fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.last_active_at = Utc::now();
    }

    /// The resumable loop state, when a run is in progress or suspended.
    #[must_use]
    pub const fn loop_state(&self) -> Option<&LoopState> {
        self.loop_state.as_ref()
    }

    pub(crate) fn set_loop_state(&mut self, state: LoopState) {
        self.loop_state = Some(state);
    }

    pub(crate) fn clear_loop_state(&mut self) {
        self.loop_state = None;
    }

    /// Thread metadata.
    #[must_use]
    pub const fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// Insert a metadata entry.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    /// Capture a value snapshot of the full thread.
    #[must_use]
    pub fn snapshot(&self) -> ThreadSnapshot {
        ThreadSnapshot {
            version: SNAPSHOT_VERSION,
            thread_id: self.id,
            name: self.name.clone(),
            project: self.project.clone(),
            messages: self.messages.clone(),
            metadata: self.metadata.clone(),
            loop_state: self.loop_state.clone(),
            created_at: self.created_at,
            last_active_at: self.last_active_at,
            service_thread_id: None,
            conversation_id: None,
        }
    }

    /// Rebuild a thread from a snapshot. Inverse of
    /// [`snapshot`](Self::snapshot).
    #[must_use]
    pub fn restore(snapshot: ThreadSnapshot) -> Self {
        Self {
            id: snapshot.thread_id,
            name: snapshot.name,
            project: snapshot.project,
            created_at: snapshot.created_at,
            last_active_at: snapshot.last_active_at,
            messages: snapshot.messages,
            metadata: snapshot.metadata,
            loop_state: snapshot.loop_state,
        }
    }

    /// Empty the log and reset any loop state.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.loop_state = None;
        self.last_active_at = Utc::now();
    }
}

impl Default for ConversationThread {
    fn default() -> Self {
        Self::new()
    }
}

/// Versioned, serializable capture of a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    /// Snapshot format version.
    pub version: u32,
    /// The captured thread's id.
    pub thread_id: Uuid,
    /// Display name, if set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Project reference, if set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Full message log.
    pub messages: Vec<Message>,
    /// Thread metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    /// In-band resumable state, when the run was in progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_state: Option<LoopState>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-activity timestamp.
    pub last_active_at: DateTime<Utc>,
    /// Provider-side thread id, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_thread_id: Option<String>,
    /// Owning conversation id, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// A thread shared between the caller and a running driver.
///
/// The driver is the single writer during a run; read-only snapshots may
/// be taken concurrently. The external surface is push-only; the full
/// log is only observable through [`snapshot`](Self::snapshot).
#[derive(Debug, Clone, Default)]
pub struct SharedThread {
    inner: Arc<RwLock<ConversationThread>>,
}

impl SharedThread {
    /// Wrap a thread for sharing with a run.
    #[must_use]
    pub fn new(thread: ConversationThread) -> Self {
        Self {
            inner: Arc::new(RwLock::new(thread)),
        }
    }

    /// The thread id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.read(|t| t.id())
    }

    /// Append one message.
    pub fn add_message(&self, message: Message) {
        self.write(|t| t.add_message(message));
    }

    /// Append several messages.
    pub fn add_messages(&self, messages: Vec<Message>) {
        self.write(|t| t.add_messages(messages));
    }

    /// Number of messages in the log.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.read(ConversationThread::message_count)
    }

    /// Estimated token footprint of the log.
    #[must_use]
    pub fn token_estimate(&self) -> u64 {
        self.read(ConversationThread::token_estimate)
    }

    /// Capture a consistent snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ThreadSnapshot {
        self.read(ConversationThread::snapshot)
    }

    /// The resumable loop state, cloned.
    #[must_use]
    pub fn loop_state(&self) -> Option<LoopState> {
        self.read(|t| t.loop_state().cloned())
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&ConversationThread) -> R) -> R {
        match self.inner.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut ConversationThread) -> R) -> R {
        match self.inner.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl From<ConversationThread> for SharedThread {
    fn from(thread: ConversationThread) -> Self {
        Self::new(thread)
    }
}
