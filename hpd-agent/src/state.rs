//! Resumable mid-run state.
//!
//! [`LoopState`] is the checkpoint payload: everything needed to resume a
//! run mid-iteration. Working messages are referenced as a prefix length
//! into the thread log rather than duplicated; pending tool results are
//! serialized inline.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::message::{Message, ToolOutput};

/// Why a run reached a terminal state, as recorded in the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TerminationReason {
    /// The model produced a message with no tool calls.
    NaturalStop,
    /// A filter or the unknown-function policy terminated the run.
    FilterTerminated,
    /// Iteration cap reached, continuation denied or timed out.
    MaxIterations,
    /// Same call repeated beyond the breaker threshold.
    CircuitBreaker,
    /// Consecutive all-error iteration cap reached.
    MaxConsecutiveErrors,
}

/// Serializable mid-run state enabling resume after crash or pause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopState {
    /// Current iteration number (0-based).
    pub iteration: u32,
    /// The iteration cap in force (continuation approval may have
    /// extended it beyond the configured value).
    pub iteration_cap: u32,
    /// Length of the thread-log prefix that formed the working messages
    /// at the start of the current iteration.
    pub working_len: usize,
    /// Completed-this-iteration tool results not yet appended to the
    /// thread, keyed by call id.
    #[serde(default)]
    pub pending_writes: BTreeMap<String, ToolOutput>,
    /// Expanded plugin/skill scopes.
    #[serde(default)]
    pub expanded_scopes: BTreeSet<String>,
    /// Circuit-breaker counters keyed by call fingerprint.
    #[serde(default)]
    pub breaker_counts: BTreeMap<String, u32>,
    /// Count of consecutive all-error iterations.
    #[serde(default)]
    pub consecutive_errors: u32,
    /// Set while a history reduction is in progress.
    #[serde(default)]
    pub reduction_in_progress: bool,
    /// Terminal reason, when the loop has reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<TerminationReason>,
}

impl LoopState {
    /// Fresh state for a new run.
    #[must_use]
    pub const fn new(iteration_cap: u32) -> Self {
        Self {
            iteration: 0,
            iteration_cap,
            working_len: 0,
            pending_writes: BTreeMap::new(),
            expanded_scopes: BTreeSet::new(),
            breaker_counts: BTreeMap::new(),
            consecutive_errors: 0,
            reduction_in_progress: false,
            termination: None,
        }
    }

    /// Validate this state against the thread's message log.
    ///
    /// # Errors
    ///
    /// Returns a description of the violated invariant: iteration beyond
    /// the cap, a working prefix longer than the log, or a pending write
    /// whose call id has no matching assistant tool-call request.
    pub fn validate(&self, messages: &[Message]) -> Result<(), String> {
        if self.iteration > self.iteration_cap {
            return Err(format!(
                "iteration {} exceeds cap {}",
                self.iteration, self.iteration_cap
            ));
        }
        if self.working_len > messages.len() {
            return Err(format!(
                "working prefix {} exceeds thread length {}",
                self.working_len,
                messages.len()
            ));
        }
        for call_id in self.pending_writes.keys() {
            let matched = messages[..self.working_len]
                .iter()
                .flat_map(Message::tool_calls)
                .any(|call| call.id == *call_id);
            if !matched {
                return Err(format!(
                    "pending write '{call_id}' has no matching tool-call request"
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::{ContentPart, Message, ToolCall};
    use serde_json::json;

    fn thread_with_call(call_id: &str) -> Vec<Message> {
        vec![
            Message::user("do it"),
            Message::assistant_parts(vec![ContentPart::ToolRequest {
                call: ToolCall::new(call_id, "add", json!({"a": 1})),
            }]),
        ]
    }

    #[test]
    fn fresh_state_validates_against_empty_thread() {
        let state = LoopState::new(10);
        assert!(state.validate(&[]).is_ok());
    }

    #[test]
    fn pending_write_requires_matching_request() {
        let messages = thread_with_call("c1");
        let mut state = LoopState::new(10);
        state.working_len = messages.len();
        state
            .pending_writes
            .insert("c1".into(), ToolOutput::ok(json!(5)));
        assert!(state.validate(&messages).is_ok());

        state
            .pending_writes
            .insert("ghost".into(), ToolOutput::ok(json!(1)));
        let err = state.validate(&messages).unwrap_err();
        assert!(err.contains("ghost"));
    }

    #[test]
    fn iteration_beyond_cap_is_invalid() {
        let mut state = LoopState::new(2);
        state.iteration = 3;
        assert!(state.validate(&[]).is_err());
    }

    #[test]
    fn working_prefix_beyond_log_is_invalid() {
        let mut state = LoopState::new(2);
        state.working_len = 4;
        assert!(state.validate(&[Message::user("hi")]).is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let mut state = LoopState::new(8);
        state.iteration = 3;
        state.expanded_scopes.insert("files".into());
        state.breaker_counts.insert("search:{\"q\":\"x\"}".into(), 2);
        state
            .pending_writes
            .insert("c9".into(), ToolOutput::error("boom"));
        state.termination = Some(TerminationReason::CircuitBreaker);

        let json = serde_json::to_string(&state).unwrap();
        let back: LoopState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
