//! Message types for the conversation log.
//!
//! A [`Message`] is an ordered record in a thread: a role plus a list of
//! content parts. Messages are append-only: once added to a thread they
//! are never mutated.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::usage::Usage;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message providing instructions.
    System,
    /// User message.
    User,
    /// Assistant (model) message.
    Assistant,
    /// Tool result message.
    Tool,
}

impl Role {
    /// Get the string representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call id, unique within the run.
    pub id: String,
    /// Name of the function to invoke.
    pub name: String,
    /// Argument map (JSON-shaped values keyed by string).
    pub arguments: Value,
}

impl ToolCall {
    /// Create a new tool call.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Parse the arguments as a typed value.
    ///
    /// Handles both object arguments and providers that deliver the
    /// argument map as a JSON-encoded string.
    ///
    /// # Errors
    ///
    /// Returns the underlying deserialization error.
    pub fn parse_arguments<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        match &self.arguments {
            Value::String(s) => serde_json::from_str(s),
            other => serde_json::from_value(other.clone()),
        }
    }
}

/// The materialized result of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Opaque result value. Consumers round-trip it losslessly.
    pub value: Value,
    /// Whether the result represents an error.
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutput {
    /// A successful result.
    #[must_use]
    pub const fn ok(value: Value) -> Self {
        Self {
            value,
            is_error: false,
        }
    }

    /// An error result carrying a message for the model.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            value: Value::String(message.into()),
            is_error: true,
        }
    }
}

/// One part of a message's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// Model reasoning text.
    Reasoning {
        /// The reasoning content.
        text: String,
    },
    /// A tool invocation requested by the model.
    ToolRequest {
        /// The requested call.
        call: ToolCall,
    },
    /// The result of a tool invocation.
    ToolResult {
        /// Id of the call this result answers.
        call_id: String,
        /// The materialized output.
        output: ToolOutput,
    },
    /// A binary artifact referenced by URI (e.g. `asset://{id}`).
    Asset {
        /// Asset URI.
        uri: String,
        /// Media type, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
}

impl ContentPart {
    /// Create a text part.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Get the text if this is a text part.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// An ordered record in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message author.
    pub role: Role,
    /// Ordered content parts.
    pub parts: Vec<ContentPart>,
    /// Optional author name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Optional message id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Provider-supplied usage record, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Free-form metadata (e.g. the history-reduction summary marker).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Message {
    /// Create a message with a role and a single text part.
    #[must_use]
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ContentPart::text(text)],
            author: None,
            id: None,
            usage: None,
            metadata: HashMap::new(),
        }
    }

    /// Create a system message.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    /// Create a user message.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    /// Create an assistant message from explicit parts.
    #[must_use]
    pub fn assistant_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::Assistant,
            parts,
            author: None,
            id: None,
            usage: None,
            metadata: HashMap::new(),
        }
    }

    /// Create a tool result message for a single call.
    #[must_use]
    pub fn tool_result(call_id: impl Into<String>, output: ToolOutput) -> Self {
        Self {
            role: Role::Tool,
            parts: vec![ContentPart::ToolResult {
                call_id: call_id.into(),
                output,
            }],
            author: None,
            id: None,
            usage: None,
            metadata: HashMap::new(),
        }
    }

    /// Set the message id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the author name.
    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Set the usage record.
    #[must_use]
    pub const fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Concatenated text of all text parts, or `None` if there are none.
    #[must_use]
    pub fn text_content(&self) -> Option<String> {
        let texts: Vec<&str> = self.parts.iter().filter_map(ContentPart::as_text).collect();
        if texts.is_empty() {
            None
        } else {
            Some(texts.join("\n"))
        }
    }

    /// All tool calls requested by this message, in part order.
    #[must_use]
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolRequest { call } => Some(call),
                _ => None,
            })
            .collect()
    }

    /// Returns `true` if this message requests any tool calls.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ContentPart::ToolRequest { .. }))
    }

    /// The tool result carried by this message, if it is one.
    #[must_use]
    pub fn tool_result_for(&self, call_id: &str) -> Option<&ToolOutput> {
        self.parts.iter().find_map(|p| match p {
            ContentPart::ToolResult { call_id: id, output } if id == call_id => Some(output),
            _ => None,
        })
    }

    /// A rough character-based token estimate for messages without a
    /// provider usage record.
    #[must_use]
    pub fn estimated_tokens(&self) -> u64 {
        if let Some(usage) = self.usage {
            return usage.total_tokens;
        }
        let chars: usize = self
            .parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } | ContentPart::Reasoning { text } => text.len(),
                ContentPart::ToolRequest { call } => {
                    call.name.len() + call.arguments.to_string().len()
                }
                ContentPart::ToolResult { output, .. } => output.value.to_string().len(),
                ContentPart::Asset { uri, .. } => uri.len(),
            })
            .sum();
        (chars / 4) as u64
    }
}
