//! The agent core: capabilities, the loop entry points, and run
//! configuration.
//!
//! The core has no builder dependency; construction is explicit. An
//! [`AgenticLoop`] owns a typed [`Capabilities`] record populated at
//! build time plus the registered filters, and exposes one output: a
//! lazy sequence of typed events over a thread-scoped, resumable state
//! object.

pub mod context;
pub mod options;
pub(crate) mod runner;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};
use uuid::Uuid;

use crate::chat::ChatClient;
use crate::error::{AgentError, Result};
use crate::event::{EventSink, EventStream};
use crate::filter::{
    FilterSet, PostInvokeFilter, PromptFilter, ToolFilter, TurnFilter,
};
use crate::message::Message;
use crate::store::{AssetStore, PermissionStore, ThreadStore};
use crate::thread::{ConversationThread, SharedThread};
use crate::tool::ToolRegistry;
use crate::waiter::{FilterResponder, WaiterHandle, WaiterTable};

use self::context::RunContext;
use self::options::{CheckpointFrequency, RunOptions};
use self::runner::Driver;

/// The collaborator capabilities an agent consumes, assembled once at
/// construction time.
#[derive(Clone)]
pub struct Capabilities {
    /// The model capability.
    pub chat: Arc<dyn ChatClient>,
    /// Optional distinct summarizer model for history reduction; the
    /// main client is used when absent.
    pub summarizer: Option<Arc<dyn ChatClient>>,
    /// Function resolution.
    pub registry: Arc<dyn ToolRegistry>,
    /// Snapshot/checkpoint persistence.
    pub thread_store: Option<Arc<dyn ThreadStore>>,
    /// Binary artifact storage.
    pub asset_store: Option<Arc<dyn AssetStore>>,
    /// Persistent permission choices.
    pub permission_store: Option<Arc<dyn PermissionStore>>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("summarizer", &self.summarizer.is_some())
            .field("thread_store", &self.thread_store.is_some())
            .field("asset_store", &self.asset_store.is_some())
            .field("permission_store", &self.permission_store.is_some())
            .finish_non_exhaustive()
    }
}

impl Capabilities {
    /// Assemble the required capabilities.
    #[must_use]
    pub fn new(chat: Arc<dyn ChatClient>, registry: Arc<dyn ToolRegistry>) -> Self {
        Self {
            chat,
            summarizer: None,
            registry,
            thread_store: None,
            asset_store: None,
            permission_store: None,
        }
    }

    /// Set a distinct summarizer client.
    #[must_use]
    pub fn with_summarizer(mut self, summarizer: Arc<dyn ChatClient>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Set the thread store.
    #[must_use]
    pub fn with_thread_store(mut self, store: Arc<dyn ThreadStore>) -> Self {
        self.thread_store = Some(store);
        self
    }

    /// Set the asset store.
    #[must_use]
    pub fn with_asset_store(mut self, store: Arc<dyn AssetStore>) -> Self {
        self.asset_store = Some(store);
        self
    }

    /// Set the permission store.
    #[must_use]
    pub fn with_permission_store(mut self, store: Arc<dyn PermissionStore>) -> Self {
        self.permission_store = Some(store);
        self
    }
}

/// The protocol-agnostic execution engine.
#[derive(Debug, Clone)]
pub struct AgenticLoop {
    caps: Capabilities,
    filters: FilterSet,
}

impl AgenticLoop {
    /// Create an engine over the given capabilities.
    #[must_use]
    pub fn new(caps: Capabilities) -> Self {
        Self {
            caps,
            filters: FilterSet::new(),
        }
    }

    /// Replace the filter set.
    #[must_use]
    pub fn with_filters(mut self, filters: FilterSet) -> Self {
        self.filters = filters;
        self
    }

    /// Register a tool filter. First registered runs outermost; built-in
    /// filters (permission, clarification) always run before these.
    #[must_use]
    pub fn with_tool_filter(mut self, filter: Arc<dyn ToolFilter>) -> Self {
        self.filters = self.filters.with_tool_filter(filter);
        self
    }

    /// Register a prompt filter.
    #[must_use]
    pub fn with_prompt_filter(mut self, filter: Arc<dyn PromptFilter>) -> Self {
        self.filters = self.filters.with_prompt_filter(filter);
        self
    }

    /// Register a post-invoke filter.
    #[must_use]
    pub fn with_post_invoke_filter(mut self, filter: Arc<dyn PostInvokeFilter>) -> Self {
        self.filters = self.filters.with_post_invoke_filter(filter);
        self
    }

    /// Register a message-turn filter.
    #[must_use]
    pub fn with_turn_filter(mut self, filter: Arc<dyn TurnFilter>) -> Self {
        self.filters = self.filters.with_turn_filter(filter);
        self
    }

    /// Start a run over the thread.
    ///
    /// Returns the run's lazy event sequence. The first event is always
    /// `RunStarted`; the last is exactly one of `RunFinished` or
    /// `RunFailed`. Dropping the stream cancels the run cooperatively.
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn run(
        &self,
        thread: SharedThread,
        messages: Vec<Message>,
        options: RunOptions,
    ) -> EventStream {
        let run_id = Uuid::new_v4();
        let thread_id = thread.id();
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(run_id, tx);
        let cancel = CancellationToken::new();
        let table = WaiterTable::new();
        let waiters = WaiterHandle::new(Arc::clone(&table), cancel.clone(), options.response_timeout);
        let responder = FilterResponder::new(table);

        let run = Arc::new(RunContext::new(
            run_id,
            thread_id,
            options.conversation_id.clone(),
            thread.read(|t| t.project().map(ToOwned::to_owned)),
            options.context_data.clone(),
        ));

        let span = info_span!(
            "run",
            run.id = %run_id,
            run.thread = %thread_id,
            run.iteration_cap = options.iteration_cap,
        );
        let driver = Driver {
            caps: self.caps.clone(),
            filters: self.filters.clone(),
            options,
            thread,
            new_messages: messages,
            sink,
            waiters,
            cancel: cancel.clone(),
            run,
        };
        drop(tokio::spawn(driver.drive().instrument(span)));

        EventStream::new(run_id, rx, cancel, responder)
    }

    /// Convenience variant that loads the thread from the configured
    /// [`ThreadStore`] (or creates it) and enables checkpointing.
    ///
    /// # Errors
    ///
    /// [`AgentError::Configuration`] when no thread store is configured;
    /// [`AgentError::CheckpointFailure`] when the load fails durably.
    pub async fn run_checkpointed(
        &self,
        thread_id: Uuid,
        messages: Vec<Message>,
        mut options: RunOptions,
    ) -> Result<(SharedThread, EventStream)> {
        let store = self.caps.thread_store.clone().ok_or_else(|| {
            AgentError::configuration("run_checkpointed requires a thread store")
        })?;
        let snapshot = store
            .load_snapshot(thread_id)
            .await
            .map_err(|err| AgentError::CheckpointFailure {
                message: err.to_string(),
            })?;
        let thread = SharedThread::new(match snapshot {
            Some(snapshot) => ConversationThread::restore(snapshot),
            None => ConversationThread::with_id(thread_id),
        });
        if !options.checkpoint_frequency.is_enabled() {
            options.checkpoint_frequency = CheckpointFrequency::PerIteration;
        }
        let events = self.run(thread.clone(), messages, options);
        Ok((thread, events))
    }
}
