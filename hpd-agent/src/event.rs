//! The outbound event stream.
//!
//! Every run produces a totally-ordered sequence of [`Event`]s carrying a
//! monotonically increasing sequence number and the owning run id. The
//! channel has a single writer side (the driver and its spawned tool
//! tasks, all behind [`EventSink`]) and a single reader (the
//! [`EventStream`] returned from `run`). The wire representation is the
//! concern of protocol adapters; the taxonomy here is versioned and
//! semantic only.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::message::{Role, ToolOutput};
use crate::waiter::FilterResponder;

/// Why a run finished without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model produced a message with no tool calls.
    NaturalStop,
    /// A filter or the unknown-function policy terminated the run.
    Terminated,
}

/// A tagged record in the core's outbound stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonically increasing sequence number within the run.
    pub seq: u64,
    /// The owning run id.
    pub run_id: Uuid,
    /// The event payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

/// The event taxonomy. New tags may be added in a minor revision;
/// existing tags do not change semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum EventKind {
    /// The run began. Always the first event.
    RunStarted,
    /// The run finished normally. Terminal.
    RunFinished {
        /// Why the run finished.
        reason: FinishReason,
    },
    /// The run failed. Terminal.
    RunFailed {
        /// Abstract failure classification.
        kind: ErrorKind,
        /// Human-readable message.
        message: String,
    },
    /// An iteration began.
    IterationStarted {
        /// 0-based iteration number.
        iteration: u32,
    },
    /// An iteration completed.
    IterationFinished {
        /// 0-based iteration number.
        iteration: u32,
    },
    /// An assistant message began streaming.
    MessageStarted {
        /// Message id.
        message_id: String,
        /// Author role.
        role: Role,
    },
    /// Incremental assistant text.
    TextDelta {
        /// Message id the delta belongs to.
        message_id: String,
        /// Text fragment.
        text: String,
    },
    /// Incremental reasoning text.
    ReasoningDelta {
        /// Message id the delta belongs to.
        message_id: String,
        /// Reasoning fragment.
        text: String,
    },
    /// An assistant message was completed and appended to the thread.
    MessageFinished {
        /// Message id.
        message_id: String,
    },
    /// A tool call entered dispatch.
    ToolCallStarted {
        /// Call id.
        call_id: String,
        /// Function name.
        name: String,
        /// Argument map.
        arguments: Value,
    },
    /// A tool call produced its result. Last event for that call.
    ToolCallFinished {
        /// Call id.
        call_id: String,
        /// The materialized output (carries the error flag).
        output: ToolOutput,
    },
    /// A permission decision is needed.
    PermissionRequested {
        /// Request id to answer via the responder.
        request_id: String,
        /// Function awaiting permission.
        function: String,
        /// Argument map of the pending call.
        arguments: Value,
    },
    /// A permission request was answered or timed out.
    PermissionResolved {
        /// The request id.
        request_id: String,
        /// Whether the call was approved.
        approved: bool,
        /// Optional reason supplied by the responder.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// The model asked the user a direct question.
    ClarificationRequested {
        /// Request id to answer via the responder.
        request_id: String,
        /// The question posed to the user.
        prompt: String,
    },
    /// A clarification request was answered.
    ClarificationResolved {
        /// The request id.
        request_id: String,
        /// The user's reply.
        reply: String,
    },
    /// The iteration cap was reached; approval to continue is needed.
    ContinuationRequested {
        /// Request id to answer via the responder.
        request_id: String,
        /// Current iteration number.
        iteration: u32,
        /// The cap in force.
        cap: u32,
    },
    /// A continuation request was answered or timed out.
    ContinuationResolved {
        /// The request id.
        request_id: String,
        /// Whether the run may continue.
        approved: bool,
        /// Iterations granted, when approved.
        #[serde(skip_serializing_if = "Option::is_none")]
        extension: Option<u32>,
    },
    /// Escape hatch for user-defined filters.
    FilterEvent {
        /// Name of the emitting filter.
        filter: String,
        /// Filter-defined event kind.
        kind: String,
        /// Filter-defined payload.
        payload: Value,
    },
    /// A checkpoint was persisted.
    CheckpointSaved {
        /// Iteration the checkpoint reflects.
        iteration: u32,
        /// Store-assigned checkpoint id.
        checkpoint_id: String,
    },
    /// The working history was reduced.
    HistoryReduced {
        /// Message count before reduction.
        from: usize,
        /// Message count after reduction.
        to: usize,
        /// Strategy that ran.
        strategy: String,
    },
}

impl EventKind {
    /// Returns `true` for the two terminal variants.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::RunFinished { .. } | Self::RunFailed { .. })
    }
}

/// Write side of the event channel.
///
/// Cloned into tool tasks and filters; sequence numbers are assigned at
/// emission so the merged stream stays totally ordered.
#[derive(Debug, Clone)]
pub struct EventSink {
    run_id: Uuid,
    seq: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    pub(crate) fn new(run_id: Uuid, tx: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            run_id,
            seq: Arc::new(AtomicU64::new(0)),
            tx,
        }
    }

    /// The owning run id.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Emit one event. Silently dropped if the consumer is gone; the
    /// driver notices consumer departure through its cancellation token.
    pub fn emit(&self, kind: EventKind) {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            run_id: self.run_id,
            kind,
        };
        let _ = self.tx.send(event);
    }
}

/// The lazy, finite event sequence returned by `run`.
///
/// Consumed by at most one reader. Dropping the stream cancels the run
/// cooperatively; [`cancel`](Self::cancel) does the same while letting
/// the caller keep reading until the terminal `RunFailed(cancelled)`.
#[derive(Debug)]
pub struct EventStream {
    run_id: Uuid,
    rx: UnboundedReceiverStream<Event>,
    cancel: CancellationToken,
    responder: FilterResponder,
}

impl EventStream {
    pub(crate) fn new(
        run_id: Uuid,
        rx: mpsc::UnboundedReceiver<Event>,
        cancel: CancellationToken,
        responder: FilterResponder,
    ) -> Self {
        Self {
            run_id,
            rx: UnboundedReceiverStream::new(rx),
            cancel,
            responder,
        }
    }

    /// The run id of the producing run.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Handle for completing bidirectional requests raised by this run.
    #[must_use]
    pub fn responder(&self) -> FilterResponder {
        self.responder.clone()
    }

    /// Request cooperative cancellation of the run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn sink_assigns_monotonic_sequence() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(Uuid::new_v4(), tx);
        sink.emit(EventKind::RunStarted);
        sink.emit(EventKind::IterationStarted { iteration: 0 });
        let clone = sink.clone();
        clone.emit(EventKind::IterationFinished { iteration: 0 });

        let seqs: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn emit_after_receiver_drop_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(Uuid::new_v4(), tx);
        drop(rx);
        sink.emit(EventKind::RunStarted);
    }

    #[test]
    fn terminal_detection() {
        assert!(
            EventKind::RunFinished {
                reason: FinishReason::NaturalStop
            }
            .is_terminal()
        );
        assert!(
            EventKind::RunFailed {
                kind: ErrorKind::Cancelled,
                message: String::new()
            }
            .is_terminal()
        );
        assert!(!EventKind::RunStarted.is_terminal());
    }

    #[test]
    fn event_serde_is_tagged() {
        let event = Event {
            seq: 3,
            run_id: Uuid::new_v4(),
            kind: EventKind::HistoryReduced {
                from: 12,
                to: 5,
                strategy: "message_count".into(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "history_reduced");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["from"], 12);
    }
}
