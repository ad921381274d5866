//! Run configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::chat::ToolSelection;
use crate::reduction::ReductionConfig;

/// When the loop asks the thread store to persist its state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFrequency {
    /// Never checkpoint.
    #[default]
    Off,
    /// Snapshot after each iteration.
    PerIteration,
    /// Snapshot after each tool completion and each iteration.
    OnToolCompletion,
    /// Snapshot after each iteration, retaining every checkpoint.
    FullHistory,
}

impl CheckpointFrequency {
    /// Returns `true` when any checkpointing is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !matches!(self, Self::Off)
    }

    /// Returns `true` when the store should retain every checkpoint.
    #[must_use]
    pub const fn retains_history(&self) -> bool {
        matches!(self, Self::FullHistory)
    }
}

/// Localized strings appended to the thread on terminal conditions and
/// synthesized tool results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMessages {
    /// Appended when the iteration cap is final.
    pub max_iterations: String,
    /// Synthesized tool result when the circuit breaker trips.
    pub circuit_breaker: String,
    /// Appended when the consecutive-error cap is hit.
    pub max_consecutive_errors: String,
    /// Tool result for a denied permission request.
    pub permission_denied: String,
    /// Tool result for an unresolved function name; `{name}` is
    /// substituted.
    pub unknown_function: String,
    /// Tool result for a call that timed out after all retries.
    pub tool_timeout: String,
    /// Tool result for calls skipped because dispatch terminated.
    pub skipped_call: String,
    /// Tool result when a filter short-circuits without setting a value.
    pub filter_short_circuit: String,
    /// Tool result when a clarification request times out.
    pub clarification_timeout: String,
}

impl Default for AgentMessages {
    fn default() -> Self {
        Self {
            max_iterations: "The run stopped because the maximum number of iterations was reached."
                .to_owned(),
            circuit_breaker: "The run stopped because this tool was called repeatedly with the \
                              same arguments."
                .to_owned(),
            max_consecutive_errors: "The run stopped after too many consecutive failing \
                                     iterations."
                .to_owned(),
            permission_denied: "Permission denied by user.".to_owned(),
            unknown_function: "Function '{name}' not found".to_owned(),
            tool_timeout: "The tool call timed out.".to_owned(),
            skipped_call: "The call was skipped because dispatch was terminated.".to_owned(),
            filter_short_circuit: "A filter short-circuited the call without producing a value."
                .to_owned(),
            clarification_timeout: "The clarification request timed out.".to_owned(),
        }
    }
}

impl AgentMessages {
    /// Render the unknown-function message for a name.
    #[must_use]
    pub fn unknown_function_for(&self, name: &str) -> String {
        self.unknown_function.replace("{name}", name)
    }
}

/// Configuration for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Hard maximum iterations before the continuation prompt.
    pub iteration_cap: u32,
    /// Iterations added on continuation approval.
    pub extension_amount: u32,
    /// Wall-clock timeout for one tool invocation.
    pub per_call_timeout: Duration,
    /// Retry count for transient failures (model and tool).
    pub max_retries: u32,
    /// Exponential backoff base delay.
    pub retry_base_delay: Duration,
    /// Terminate after this many all-error iterations.
    pub max_consecutive_errors: u32,
    /// Same-call repetition count that terminates the run. Zero
    /// disables the breaker.
    pub circuit_breaker_threshold: u32,
    /// Max in-flight concurrent tool calls.
    pub parallel_tool_cap: usize,
    /// Checkpoint policy.
    pub checkpoint_frequency: CheckpointFrequency,
    /// History-reduction policy.
    pub reduction: ReductionConfig,
    /// Tool selection mode passed to the model.
    pub tool_selection: ToolSelection,
    /// Whether an unresolved function name terminates the run.
    pub terminate_on_unknown_call: bool,
    /// Timeout for bidirectional response waiters.
    pub response_timeout: Duration,
    /// Optional wall-clock cap for one whole iteration.
    pub iteration_timeout: Option<Duration>,
    /// Whether the built-in clarification function is offered to the
    /// model.
    pub enable_clarification: bool,
    /// Session id used for persisted permission scopes.
    pub session_id: Option<String>,
    /// Conversation id used for persisted permission scopes and the
    /// snapshot record.
    pub conversation_id: Option<String>,
    /// Extension-friendly user data exposed on the run context.
    pub context_data: std::collections::HashMap<String, serde_json::Value>,
    /// Localized terminal strings.
    pub messages: AgentMessages,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            iteration_cap: 10,
            extension_amount: 5,
            per_call_timeout: Duration::from_secs(60),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(200),
            max_consecutive_errors: 3,
            circuit_breaker_threshold: 3,
            parallel_tool_cap: 4,
            checkpoint_frequency: CheckpointFrequency::Off,
            reduction: ReductionConfig::off(),
            tool_selection: ToolSelection::Auto,
            terminate_on_unknown_call: false,
            response_timeout: Duration::from_secs(300),
            iteration_timeout: None,
            enable_clarification: true,
            session_id: None,
            conversation_id: None,
            context_data: std::collections::HashMap::new(),
            messages: AgentMessages::default(),
        }
    }
}

impl RunOptions {
    /// Create options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the iteration cap.
    #[must_use]
    pub const fn with_iteration_cap(mut self, cap: u32) -> Self {
        self.iteration_cap = cap;
        self
    }

    /// Set the continuation extension amount.
    #[must_use]
    pub const fn with_extension_amount(mut self, amount: u32) -> Self {
        self.extension_amount = amount;
        self
    }

    /// Set the per-call tool timeout.
    #[must_use]
    pub const fn with_per_call_timeout(mut self, timeout: Duration) -> Self {
        self.per_call_timeout = timeout;
        self
    }

    /// Set the retry policy for transient failures.
    #[must_use]
    pub const fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay;
        self
    }

    /// Set the consecutive-error cap.
    #[must_use]
    pub const fn with_max_consecutive_errors(mut self, cap: u32) -> Self {
        self.max_consecutive_errors = cap;
        self
    }

    /// Set the circuit-breaker threshold.
    #[must_use]
    pub const fn with_circuit_breaker_threshold(mut self, threshold: u32) -> Self {
        self.circuit_breaker_threshold = threshold;
        self
    }

    /// Set the parallel tool fan-out cap.
    #[must_use]
    pub const fn with_parallel_tool_cap(mut self, cap: usize) -> Self {
        self.parallel_tool_cap = cap;
        self
    }

    /// Set the checkpoint frequency.
    #[must_use]
    pub const fn with_checkpoint_frequency(mut self, frequency: CheckpointFrequency) -> Self {
        self.checkpoint_frequency = frequency;
        self
    }

    /// Set the history-reduction policy.
    #[must_use]
    pub fn with_reduction(mut self, reduction: ReductionConfig) -> Self {
        self.reduction = reduction;
        self
    }

    /// Set the tool selection mode.
    #[must_use]
    pub fn with_tool_selection(mut self, selection: ToolSelection) -> Self {
        self.tool_selection = selection;
        self
    }

    /// Set whether unknown functions terminate the run.
    #[must_use]
    pub const fn with_terminate_on_unknown_call(mut self, terminate: bool) -> Self {
        self.terminate_on_unknown_call = terminate;
        self
    }

    /// Set the bidirectional response timeout.
    #[must_use]
    pub const fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the per-iteration wall-clock cap.
    #[must_use]
    pub const fn with_iteration_timeout(mut self, timeout: Duration) -> Self {
        self.iteration_timeout = Some(timeout);
        self
    }

    /// Enable or disable the built-in clarification function.
    #[must_use]
    pub const fn with_clarification(mut self, enabled: bool) -> Self {
        self.enable_clarification = enabled;
        self
    }

    /// Set the session id for permission scoping.
    #[must_use]
    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Set the conversation id.
    #[must_use]
    pub fn with_conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    /// Attach user data to the run context.
    #[must_use]
    pub fn with_context_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context_data.insert(key.into(), value);
        self
    }

    /// Set the localized terminal strings.
    #[must_use]
    pub fn with_messages(mut self, messages: AgentMessages) -> Self {
        self.messages = messages;
        self
    }
}
