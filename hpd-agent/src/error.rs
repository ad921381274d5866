//! Error types for the agent core.
//!
//! The abstract taxonomy lives in [`ErrorKind`]; [`AgentError`] is the
//! concrete error carried by run failures. Tool-level failures
//! (`tool_error`, `tool_timeout`, `permission_denied`) are recovered
//! locally as error tool-results and never surface as an `AgentError`,
//! but their kinds remain part of the taxonomy so events can name them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A type alias for `Result<T, AgentError>`.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Abstract classification of every failure the core can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorKind {
    /// Transient model/transport error; retried with backoff.
    ProviderTransient,
    /// Non-retryable model error; fails the run.
    ProviderPermanent,
    /// Tool raised an error; materialized as an error tool-result.
    ToolError,
    /// Tool exceeded its per-call budget; retried per policy.
    ToolTimeout,
    /// A filter denied a tool call.
    PermissionDenied,
    /// Iteration cap reached and continuation denied or timed out.
    MaxIterations,
    /// Same call/args repeated beyond the configured threshold.
    CircuitBreaker,
    /// Every tool call errored for too many iterations in a row.
    MaxConsecutiveErrors,
    /// Cooperative cancellation received.
    Cancelled,
    /// Per-iteration wall-clock cap hit.
    IterationTimeout,
    /// The thread store reported a durable persistence error.
    CheckpointFailure,
    /// Resumed state failed its invariants.
    CorruptCheckpoint,
}

impl ErrorKind {
    /// Returns the string representation used in events and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ProviderTransient => "provider_transient",
            Self::ProviderPermanent => "provider_permanent",
            Self::ToolError => "tool_error",
            Self::ToolTimeout => "tool_timeout",
            Self::PermissionDenied => "permission_denied",
            Self::MaxIterations => "max_iterations",
            Self::CircuitBreaker => "circuit_breaker",
            Self::MaxConsecutiveErrors => "max_consecutive_errors",
            Self::Cancelled => "cancelled",
            Self::IterationTimeout => "iteration_timeout",
            Self::CheckpointFailure => "checkpoint_failure",
            Self::CorruptCheckpoint => "corrupt_checkpoint",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type for run-terminating failures.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum AgentError {
    /// Model call failed after any configured retries.
    #[error("model call failed: {message}")]
    Provider {
        /// Whether the failure was classified as transient.
        transient: bool,
        /// Normalized provider message.
        message: String,
    },

    /// Iteration cap reached and continuation denied or timed out.
    #[error("maximum iterations reached (cap {cap})")]
    MaxIterations {
        /// The cap in force when the run terminated.
        cap: u32,
    },

    /// The circuit breaker tripped for a repeated call.
    #[error("circuit breaker triggered for '{function}'")]
    CircuitBreaker {
        /// Function whose repetition crossed the threshold.
        function: String,
    },

    /// Too many consecutive all-error iterations.
    #[error("reached {count} consecutive all-error iterations")]
    MaxConsecutiveErrors {
        /// The configured cap that was hit.
        count: u32,
    },

    /// The run was cancelled cooperatively.
    #[error("run cancelled")]
    Cancelled,

    /// An iteration exceeded its wall-clock budget.
    #[error("iteration {iteration} exceeded its wall-clock budget")]
    IterationTimeout {
        /// The iteration that timed out.
        iteration: u32,
    },

    /// The thread store reported a durable persistence failure.
    #[error("checkpoint persistence failed: {message}")]
    CheckpointFailure {
        /// Store-reported message.
        message: String,
    },

    /// A resumed `LoopState` failed validation against its thread.
    #[error("resumed state failed validation: {message}")]
    CorruptCheckpoint {
        /// Which invariant was violated.
        message: String,
    },

    /// The run was configured inconsistently.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Description of the configuration issue.
        message: String,
    },
}

impl AgentError {
    /// Create a transient provider error.
    #[must_use]
    pub fn provider_transient(message: impl Into<String>) -> Self {
        Self::Provider {
            transient: true,
            message: message.into(),
        }
    }

    /// Create a permanent provider error.
    #[must_use]
    pub fn provider_permanent(message: impl Into<String>) -> Self {
        Self::Provider {
            transient: false,
            message: message.into(),
        }
    }

    /// Create a corrupt-checkpoint error.
    #[must_use]
    pub fn corrupt_checkpoint(message: impl Into<String>) -> Self {
        Self::CorruptCheckpoint {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// The abstract kind of this error, as carried by `RunFailed` events.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Provider { transient: true, .. } => ErrorKind::ProviderTransient,
            Self::Provider { transient: false, .. } | Self::Configuration { .. } => {
                ErrorKind::ProviderPermanent
            }
            Self::MaxIterations { .. } => ErrorKind::MaxIterations,
            Self::CircuitBreaker { .. } => ErrorKind::CircuitBreaker,
            Self::MaxConsecutiveErrors { .. } => ErrorKind::MaxConsecutiveErrors,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::IterationTimeout { .. } => ErrorKind::IterationTimeout,
            Self::CheckpointFailure { .. } => ErrorKind::CheckpointFailure,
            Self::CorruptCheckpoint { .. } => ErrorKind::CorruptCheckpoint,
        }
    }
}

/// Error raised by a tool handler.
///
/// Tool errors never terminate the run directly; the dispatcher turns
/// them into error tool-results. `Transient` failures are retried under
/// the per-call retry policy, `Execution` failures are not.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ToolError {
    /// Arguments did not match the tool's parameter schema.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The tool failed; not retried.
    #[error("{0}")]
    Execution(String),

    /// The tool failed in a way worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl ToolError {
    /// Create an execution error.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    /// Create a transient (retryable) error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Returns `true` if the retry policy should re-attempt the call.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
