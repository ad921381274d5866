//! Streamed model output: chunks and aggregation.
//!
//! Providers deliver assistant output as a sequence of [`ModelChunk`]s;
//! the loop driver translates text and reasoning chunks into events while
//! a [`ChunkAggregator`] folds the full sequence back into one complete
//! assistant [`Message`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::pin::Pin;

use futures::Stream;

use crate::chat::ClientError;
use crate::message::{ContentPart, Message, ToolCall};
use crate::usage::Usage;

/// A boxed stream of model chunks.
pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelChunk, ClientError>> + Send>>;

/// One chunk of a streamed model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ModelChunk {
    /// Incremental text content.
    TextDelta {
        /// The text fragment.
        text: String,
    },
    /// Incremental reasoning content.
    ReasoningDelta {
        /// The reasoning fragment.
        text: String,
    },
    /// Start of a tool call.
    ToolCallStart {
        /// Index of this call within the response.
        index: usize,
        /// Call id.
        id: String,
        /// Function name.
        name: String,
    },
    /// Partial JSON arguments for an in-progress tool call.
    ToolCallDelta {
        /// Index of the call being extended.
        index: usize,
        /// Partial JSON fragment.
        partial_json: String,
    },
    /// Token usage, usually delivered once near the end of the stream.
    Usage {
        /// The usage record.
        usage: Usage,
    },
    /// The stream is complete.
    Done,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds a chunk sequence into a complete assistant message.
#[derive(Debug, Default)]
pub struct ChunkAggregator {
    text: String,
    reasoning: String,
    calls: BTreeMap<usize, PartialCall>,
    usage: Option<Usage>,
}

impl ChunkAggregator {
    /// Create an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one chunk.
    pub fn apply(&mut self, chunk: &ModelChunk) {
        match chunk {
            ModelChunk::TextDelta { text } => self.text.push_str(text),
            ModelChunk::ReasoningDelta { text } => self.reasoning.push_str(text),
            ModelChunk::ToolCallStart { index, id, name } => {
                let entry = self.calls.entry(*index).or_default();
                entry.id.clone_from(id);
                entry.name.clone_from(name);
            }
            ModelChunk::ToolCallDelta {
                index,
                partial_json,
            } => {
                self.calls
                    .entry(*index)
                    .or_default()
                    .arguments
                    .push_str(partial_json);
            }
            ModelChunk::Usage { usage } => self.usage = Some(*usage),
            ModelChunk::Done => {}
        }
    }

    /// Build the assistant message from the accumulated chunks.
    ///
    /// Tool arguments that fail to parse as JSON are kept as a raw
    /// string; [`ToolCall::parse_arguments`] handles that form.
    #[must_use]
    pub fn finish(self, message_id: impl Into<String>) -> Message {
        let mut parts = Vec::new();
        if !self.reasoning.is_empty() {
            parts.push(ContentPart::Reasoning {
                text: self.reasoning,
            });
        }
        if !self.text.is_empty() {
            parts.push(ContentPart::text(self.text));
        }
        for (_, call) in self.calls {
            let arguments = if call.arguments.is_empty() {
                Value::Object(serde_json::Map::new())
            } else {
                serde_json::from_str(&call.arguments)
                    .unwrap_or(Value::String(call.arguments))
            };
            parts.push(ContentPart::ToolRequest {
                call: ToolCall::new(call.id, call.name, arguments),
            });
        }
        let mut message = Message::assistant_parts(parts).with_id(message_id);
        message.usage = self.usage;
        message
    }
}

/// Render a complete response message as a chunk sequence.
///
/// Used by [`ChatClient`](crate::chat::ChatClient)'s default `stream`
/// implementation to derive streaming from `complete`.
#[must_use]
pub fn chunks_from_message(message: &Message) -> Vec<ModelChunk> {
    let mut chunks = Vec::new();
    let mut index = 0;
    for part in &message.parts {
        match part {
            ContentPart::Text { text } => chunks.push(ModelChunk::TextDelta { text: text.clone() }),
            ContentPart::Reasoning { text } => {
                chunks.push(ModelChunk::ReasoningDelta { text: text.clone() });
            }
            ContentPart::ToolRequest { call } => {
                chunks.push(ModelChunk::ToolCallStart {
                    index,
                    id: call.id.clone(),
                    name: call.name.clone(),
                });
                chunks.push(ModelChunk::ToolCallDelta {
                    index,
                    partial_json: call.arguments.to_string(),
                });
                index += 1;
            }
            _ => {}
        }
    }
    if let Some(usage) = message.usage {
        chunks.push(ModelChunk::Usage { usage });
    }
    chunks.push(ModelChunk::Done);
    chunks
}
