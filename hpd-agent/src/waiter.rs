//! Bidirectional request/response coordination.
//!
//! Filters (and the continuation flow) emit a request event, register the
//! request id here, and await a typed response. A single external entry
//! point, [`FilterResponder::send`], completes the waiter. Responses
//! for unknown ids are discarded; delivering the same response twice is a
//! no-op the second time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::permission::PermissionChoice;

/// A typed response delivered to a pending waiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum FilterResponse {
    /// Answer to a `PermissionRequested` event.
    Permission {
        /// Whether the call is approved.
        approved: bool,
        /// Optional reason (surfaced in the resolved event).
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Persistence choice for the decision.
        choice: PermissionChoice,
    },
    /// Answer to a `ClarificationRequested` event.
    Clarification {
        /// The user's reply.
        reply: String,
    },
    /// Answer to a `ContinuationRequested` event.
    Continuation {
        /// Whether the run may continue.
        approved: bool,
        /// Iterations to grant; the configured extension amount applies
        /// when absent.
        #[serde(skip_serializing_if = "Option::is_none")]
        extension: Option<u32>,
    },
    /// Answer to a user-defined filter request.
    Custom {
        /// Filter-defined payload.
        payload: Value,
    },
}

/// How a pending wait ended without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    /// No response arrived within the timeout.
    #[error("request timed out")]
    TimedOut,
    /// The run was cancelled while waiting.
    #[error("run cancelled")]
    Cancelled,
}

#[derive(Debug, Default)]
pub(crate) struct WaiterTable {
    pending: Mutex<HashMap<String, oneshot::Sender<FilterResponse>>>,
}

impl WaiterTable {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, request_id: &str) -> oneshot::Receiver<FilterResponse> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(request_id.to_owned(), tx);
        }
        rx
    }

    fn complete(&self, request_id: &str, response: FilterResponse) -> bool {
        let Some(tx) = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(request_id))
        else {
            return false;
        };
        tx.send(response).is_ok()
    }

    fn remove(&self, request_id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(request_id);
        }
    }
}

/// Handle used by filters to raise requests and await responses.
#[derive(Debug, Clone)]
pub struct WaiterHandle {
    table: Arc<WaiterTable>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl WaiterHandle {
    pub(crate) fn new(table: Arc<WaiterTable>, cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            table,
            cancel,
            timeout,
        }
    }

    /// Generate a fresh request id.
    #[must_use]
    pub fn new_request_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Register a request id before emitting the request event, so a
    /// response can never race past an unregistered waiter.
    #[must_use]
    pub fn register(&self, request_id: &str) -> PendingResponse {
        PendingResponse {
            rx: self.table.register(request_id),
            request_id: request_id.to_owned(),
            table: Arc::clone(&self.table),
            cancel: self.cancel.clone(),
            timeout: self.timeout,
        }
    }
}

/// A registered wait, resolved by the external responder or by
/// timeout/cancellation.
#[derive(Debug)]
pub struct PendingResponse {
    rx: oneshot::Receiver<FilterResponse>,
    request_id: String,
    table: Arc<WaiterTable>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl PendingResponse {
    /// Await the response under the default timeout.
    ///
    /// # Errors
    ///
    /// [`WaitError::TimedOut`] when no response arrives in time,
    /// [`WaitError::Cancelled`] when the run is cancelled first.
    pub async fn wait(self) -> Result<FilterResponse, WaitError> {
        let timeout = self.timeout;
        self.wait_with_timeout(timeout).await
    }

    /// Await the response under an explicit timeout.
    ///
    /// # Errors
    ///
    /// See [`wait`](Self::wait).
    pub async fn wait_with_timeout(mut self, timeout: Duration) -> Result<FilterResponse, WaitError> {
        let outcome = tokio::select! {
            response = &mut self.rx => response.map_err(|_| WaitError::Cancelled),
            () = tokio::time::sleep(timeout) => Err(WaitError::TimedOut),
            () = self.cancel.cancelled() => Err(WaitError::Cancelled),
        };
        if outcome.is_err() {
            self.table.remove(&self.request_id);
        }
        outcome
    }
}

/// External completion entry point for bidirectional requests.
///
/// Returned alongside the event stream; safe to clone into UI or
/// protocol-adapter code.
#[derive(Debug, Clone)]
pub struct FilterResponder {
    table: Arc<WaiterTable>,
}

impl FilterResponder {
    pub(crate) fn new(table: Arc<WaiterTable>) -> Self {
        Self { table }
    }

    /// Complete the waiter registered under `request_id`.
    ///
    /// Returns `true` if a pending request was completed. Unmatched ids
    /// are ignored, which also makes duplicate delivery a no-op.
    pub fn send(&self, request_id: &str, response: FilterResponse) -> bool {
        self.table.complete(request_id, response)
    }
}
