#![cfg_attr(docsrs, feature(doc_cfg))]
//! Protocol-agnostic agentic execution engine.
//!
//! The core is a state machine that drives an LLM-backed agent through a
//! bounded iteration loop: it alternates model calls and tool dispatch,
//! mediates between model output and tool results, enforces safety
//! bounds (iteration caps, a circuit breaker, per-call timeouts, a
//! consecutive-error cap), emits a structured event stream for streaming
//! consumers, checkpoints mid-run for durable execution, and coordinates
//! bidirectional request/response interactions (permission prompts,
//! clarification, continuation approval) back to an external handler.
//!
//! Everything around the core (provider adapters, builders, plugin
//! authoring, protocol translation) is an external collaborator behind
//! a narrow capability: [`chat::ChatClient`], [`tool::ToolRegistry`],
//! [`store::ThreadStore`], [`store::AssetStore`],
//! [`store::PermissionStore`].
//!
//! ```rust,ignore
//! use hpd_agent::prelude::*;
//! use futures::StreamExt;
//!
//! let caps = Capabilities::new(chat_client, registry);
//! let agent = AgenticLoop::new(caps);
//! let thread = SharedThread::new(ConversationThread::new());
//!
//! let mut events = agent.run(thread, vec![Message::user("add 2 and 3")], RunOptions::new());
//! while let Some(event) = events.next().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod agent;
pub mod breaker;
pub mod chat;
pub(crate) mod dispatch;
pub mod error;
pub mod event;
pub mod filter;
pub mod message;
pub mod permission;
pub mod prelude;
pub mod reduction;
pub mod state;
pub mod store;
pub mod stream;
pub mod thread;
pub mod tool;
pub mod usage;
pub mod waiter;

pub use agent::{AgenticLoop, Capabilities};
pub use agent::context::RunContext;
pub use agent::options::{AgentMessages, CheckpointFrequency, RunOptions};
pub use error::{AgentError, ErrorKind, Result, ToolError};
pub use event::{Event, EventKind, EventStream, FinishReason};
pub use message::{ContentPart, Message, Role, ToolCall, ToolOutput};
pub use thread::{ConversationThread, SharedThread, ThreadSnapshot};
pub use waiter::{FilterResponder, FilterResponse};
