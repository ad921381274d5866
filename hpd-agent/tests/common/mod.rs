//! Shared fixtures for the integration suite: a scripted model client
//! and canned tools.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use hpd_agent::prelude::*;

static TRACING: Once = Once::new();

/// Install a test subscriber once per binary so `RUST_LOG` surfaces the
/// core's structured logs during test runs.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One scripted model response.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Plain assistant text.
    Text(String),
    /// Assistant message carrying tool calls.
    ToolCalls(Vec<ToolCall>),
    /// A transient provider failure.
    Transient(String),
    /// Never resolves; lets a test cancel at a deterministic point.
    Hang,
}

/// A [`ChatClient`] that replays a fixed script of responses.
#[derive(Debug)]
pub struct ScriptedClient {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    calls: AtomicU32,
}

impl ScriptedClient {
    pub fn new(turns: Vec<ScriptedTurn>) -> Arc<Self> {
        init_tracing();
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            calls: AtomicU32::new(0),
        })
    }

    /// Append another turn (used when one client serves several runs).
    pub fn push(&self, turn: ScriptedTurn) {
        self.turns.lock().unwrap().push_back(turn);
    }

    /// Number of completed model calls.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatClient for ScriptedClient {
    async fn complete(&self, _request: ChatRequest) -> std::result::Result<ChatResponse, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let turn = self.turns.lock().unwrap().pop_front();
        match turn {
            Some(ScriptedTurn::Text(text)) => Ok(ChatResponse::new(Message::assistant(text))),
            Some(ScriptedTurn::ToolCalls(calls)) => {
                let parts = calls
                    .into_iter()
                    .map(|call| ContentPart::ToolRequest { call })
                    .collect();
                Ok(ChatResponse::new(Message::assistant_parts(parts)))
            }
            Some(ScriptedTurn::Transient(message)) => Err(ClientError::Transient(message)),
            Some(ScriptedTurn::Hang) => futures::future::pending().await,
            None => Err(ClientError::Permanent("script exhausted".into())),
        }
    }
}

/// Registry with an `add(a, b)` tool.
pub fn add_registry() -> StaticRegistry {
    StaticRegistry::new().with_handler(
        ToolDescriptor::new(
            "add",
            "Add two integers",
            json!({
                "type": "object",
                "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}}
            }),
        ),
        Arc::new(FunctionTool::new(|args: Value| async move {
            let a = args["a"].as_i64().unwrap_or_default();
            let b = args["b"].as_i64().unwrap_or_default();
            Ok::<_, ToolError>(json!(a + b))
        })),
    )
}

/// A tool that always fails.
pub fn failing_handler() -> Arc<dyn ToolHandler> {
    Arc::new(FunctionTool::new(|_| async {
        Err::<Value, ToolError>(ToolError::execution("it broke"))
    }))
}

/// A tool that sleeps before answering.
pub fn slow_handler(delay: Duration) -> Arc<dyn ToolHandler> {
    Arc::new(FunctionTool::new(move |_| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, ToolError>(json!("slept"))
    }))
}

/// A tool that counts invocations and returns a fixed value.
pub fn counting_handler(counter: Arc<AtomicU32>, value: Value) -> Arc<dyn ToolHandler> {
    Arc::new(FunctionTool::new(move |_| {
        let counter = Arc::clone(&counter);
        let value = value.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ToolError>(value)
        }
    }))
}

/// Consume a run to completion, collecting every event.
pub async fn collect(events: EventStream) -> Vec<Event> {
    events.collect().await
}

/// Consume a run, letting `respond` answer bidirectional requests.
pub async fn collect_responding(
    mut events: EventStream,
    mut respond: impl FnMut(&Event, &FilterResponder),
) -> Vec<Event> {
    let responder = events.responder();
    let mut collected = Vec::new();
    while let Some(event) = events.next().await {
        respond(&event, &responder);
        collected.push(event);
    }
    collected
}

/// Assert the universal event-sequence invariants and return the
/// terminal event kind.
pub fn assert_well_formed(events: &[Event]) -> &EventKind {
    assert!(
        matches!(events.first().map(|e| &e.kind), Some(EventKind::RunStarted)),
        "first event must be RunStarted, got {:?}",
        events.first()
    );
    let terminal = &events.last().expect("no events").kind;
    assert!(
        terminal.is_terminal(),
        "last event must be terminal, got {terminal:?}"
    );
    for pair in events.windows(2) {
        assert!(pair[0].seq < pair[1].seq, "sequence numbers must increase");
    }
    let run_id = events[0].run_id;
    assert!(events.iter().all(|e| e.run_id == run_id));
    // Exactly one terminal event, at the end.
    assert_eq!(
        events.iter().filter(|e| e.kind.is_terminal()).count(),
        1,
        "exactly one terminal event expected"
    );
    terminal
}

/// Every `ToolCallStarted` has exactly one matching `ToolCallFinished`.
pub fn assert_tool_events_paired(events: &[Event]) {
    let started: Vec<&String> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ToolCallStarted { call_id, .. } => Some(call_id),
            _ => None,
        })
        .collect();
    for call_id in &started {
        let finishes = events
            .iter()
            .filter(|e| {
                matches!(&e.kind, EventKind::ToolCallFinished { call_id: c, .. } if c == *call_id)
            })
            .count();
        assert_eq!(finishes, 1, "call {call_id} must finish exactly once");
    }
}

/// Texts of the thread's messages, in order.
pub fn thread_texts(thread: &SharedThread) -> Vec<String> {
    thread
        .snapshot()
        .messages
        .iter()
        .filter_map(Message::text_content)
        .collect()
}
