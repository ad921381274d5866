//! Convenience re-exports of the working set.

pub use crate::agent::context::RunContext;
pub use crate::agent::options::{AgentMessages, CheckpointFrequency, RunOptions};
pub use crate::agent::{AgenticLoop, Capabilities};
pub use crate::chat::{ChatClient, ChatRequest, ChatResponse, ClientError, ToolSelection};
pub use crate::error::{AgentError, ErrorKind, Result, ToolError};
pub use crate::event::{Event, EventKind, EventStream, FinishReason};
pub use crate::filter::{
    FilterContext, FilterSet, Next, PostInvokeFilter, PromptFilter, PromptNext, ToolFilter,
    TurnFilter,
};
pub use crate::message::{ContentPart, Message, Role, ToolCall, ToolOutput};
pub use crate::permission::{PermissionChoice, PermissionScope};
pub use crate::reduction::{HistoryReductionPolicy, ReductionConfig};
pub use crate::state::{LoopState, TerminationReason};
pub use crate::store::{
    AssetStore, InMemoryAssetStore, InMemoryPermissionStore, InMemoryThreadStore, PermissionStore,
    StoreError, ThreadStore,
};
pub use crate::stream::{ChunkAggregator, ModelChunk, ModelStream};
pub use crate::thread::{ConversationThread, SharedThread, ThreadSnapshot};
pub use crate::tool::{
    FunctionTool, RegisteredTool, StaticRegistry, Tool, ToolDescriptor, ToolHandler, ToolRegistry,
};
pub use crate::usage::Usage;
pub use crate::waiter::{FilterResponder, FilterResponse, WaitError, WaiterHandle};
