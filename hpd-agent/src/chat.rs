//! The model-facing capability consumed by the loop driver.
//!
//! Provider adapters (OpenAI, Anthropic, Ollama, Bedrock, …) live outside
//! the core and reduce to one [`ChatClient`]. Providers normalize their
//! concrete errors into [`ClientError`] before they reach the core.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::Message;
use crate::stream::{ModelStream, chunks_from_message};
use crate::tool::ToolDescriptor;
use crate::usage::Usage;

/// Controls how the model may use the tool catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ToolSelection {
    /// Model decides whether to call tools.
    #[default]
    Auto,
    /// Model cannot call any tools.
    None,
    /// Model must call at least one tool.
    RequireAny,
    /// Model must call the named function.
    RequireSpecific {
        /// The required function name.
        name: String,
    },
}

/// A model invocation request: messages plus the visible tool catalog.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Conversation messages, in thread order.
    pub messages: Vec<Message>,
    /// Tool catalog visible to the model.
    pub tools: Vec<ToolDescriptor>,
    /// Tool selection mode.
    pub selection: ToolSelection,
}

impl ChatRequest {
    /// Create a request from messages with no tools.
    #[must_use]
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            selection: ToolSelection::Auto,
        }
    }

    /// Set the tool catalog.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDescriptor>) -> Self {
        self.tools = tools;
        self
    }

    /// Set the tool selection mode.
    #[must_use]
    pub fn with_selection(mut self, selection: ToolSelection) -> Self {
        self.selection = selection;
        self
    }
}

/// A complete model response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// The assistant message produced by the model.
    pub message: Message,
    /// Token usage for this call, when reported.
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// Create a response from an assistant message, lifting its usage.
    #[must_use]
    pub fn new(message: Message) -> Self {
        let usage = message.usage;
        Self { message, usage }
    }
}

/// Normalized model-call error.
///
/// Transient errors are retried by the driver with exponential backoff;
/// permanent errors fail the run.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Retryable transport or throttling failure.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Non-retryable provider failure.
    #[error("provider error: {0}")]
    Permanent(String),
}

impl ClientError {
    /// Returns `true` if the driver should retry the call.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// The single model capability the core consumes.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Produce a complete response for the request.
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ClientError>;

    /// Produce a streamed response for the request.
    ///
    /// The default implementation derives a chunk stream from
    /// [`complete`](Self::complete), so clients that only support
    /// whole-message responses still work with the streaming driver.
    async fn stream(&self, request: ChatRequest) -> Result<ModelStream, ClientError> {
        let response = self.complete(request).await?;
        let chunks = chunks_from_message(&response.message);
        Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::{ContentPart, ToolCall};
    use crate::stream::ModelChunk;
    use futures::StreamExt;
    use serde_json::json;

    struct OneShot(Message);

    #[async_trait]
    impl ChatClient for OneShot {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, ClientError> {
            Ok(ChatResponse::new(self.0.clone()))
        }
    }

    #[tokio::test]
    async fn default_stream_derives_from_complete() {
        let message = Message::assistant_parts(vec![
            ContentPart::text("calling"),
            ContentPart::ToolRequest {
                call: ToolCall::new("c1", "add", json!({"a": 1})),
            },
        ]);
        let client = OneShot(message);
        let mut stream = client
            .stream(ChatRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Some(chunk) = stream.next().await {
            kinds.push(chunk.unwrap());
        }
        assert!(matches!(kinds.first(), Some(ModelChunk::TextDelta { .. })));
        assert!(matches!(kinds.last(), Some(ModelChunk::Done)));
    }

    #[test]
    fn selection_serde() {
        let json = serde_json::to_string(&ToolSelection::RequireSpecific {
            name: "add".into(),
        })
        .unwrap();
        assert!(json.contains("require_specific"));
        let back: ToolSelection = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ToolSelection::RequireSpecific { name: "add".into() });
    }

    #[test]
    fn client_error_transient_flag() {
        assert!(ClientError::Transient("x".into()).is_transient());
        assert!(!ClientError::Permanent("x".into()).is_transient());
    }
}
