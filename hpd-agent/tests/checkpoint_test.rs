//! Checkpointing, resume, and snapshot round-trips.

mod common;

use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use common::{
    ScriptedClient, ScriptedTurn, add_registry, assert_well_formed, collect, counting_handler,
};
use hpd_agent::prelude::*;

#[tokio::test]
async fn scenario_f_checkpoint_and_resume() {
    let client = ScriptedClient::new(vec![
        ScriptedTurn::ToolCalls(vec![ToolCall::new("c1", "add", json!({"a": 1, "b": 2}))]),
        // Iteration 1's model call never answers; run A is cancelled here.
        ScriptedTurn::Hang,
    ]);
    let store = Arc::new(InMemoryThreadStore::new());
    let agent = AgenticLoop::new(
        Capabilities::new(
            Arc::clone(&client) as Arc<dyn ChatClient>,
            Arc::new(add_registry()),
        )
        .with_thread_store(Arc::clone(&store) as Arc<dyn ThreadStore>),
    );
    let thread = SharedThread::new(ConversationThread::new());
    let options = RunOptions::new().with_checkpoint_frequency(CheckpointFrequency::PerIteration);

    // Run A: complete iteration 0, cancel during iteration 1's model call.
    let mut events = agent.run(thread.clone(), vec![Message::user("add 1 and 2")], options.clone());
    let mut saw_checkpoint = false;
    let mut run_a_events = Vec::new();
    while let Some(event) = events.next().await {
        match &event.kind {
            EventKind::CheckpointSaved { .. } => saw_checkpoint = true,
            EventKind::IterationStarted { iteration: 1 } => events.cancel(),
            _ => {}
        }
        let done = event.kind.is_terminal();
        run_a_events.push(event);
        if done {
            break;
        }
    }
    assert!(saw_checkpoint, "run A should have checkpointed");
    assert!(matches!(
        run_a_events.last().map(|e| &e.kind),
        Some(EventKind::RunFailed {
            kind: ErrorKind::Cancelled,
            ..
        })
    ));

    // The thread is suspended at iteration 1.
    let state = thread.loop_state().expect("thread should hold loop state");
    assert_eq!(state.iteration, 1);

    // Run B: same thread, empty input. No input append, resume at 1.
    let before = thread.message_count();
    client.push(ScriptedTurn::Text("3".into()));
    let run_b_events = collect(agent.run(thread.clone(), Vec::new(), options)).await;

    let terminal = assert_well_formed(&run_b_events);
    assert!(matches!(
        terminal,
        EventKind::RunFinished {
            reason: FinishReason::NaturalStop
        }
    ));
    assert!(matches!(
        &run_b_events[1].kind,
        EventKind::IterationStarted { iteration: 1 }
    ));

    let snapshot = thread.snapshot();
    assert_eq!(snapshot.messages.len(), before + 1);
    assert_eq!(
        snapshot.messages.last().unwrap().text_content().unwrap(),
        "3"
    );
    assert!(thread.loop_state().is_none());
}

#[tokio::test]
async fn pending_writes_are_replayed_without_reexecution() {
    // A thread suspended mid-iteration: the assistant requested a call,
    // its result is in the pending-writes buffer, nothing is appended.
    let counter = Arc::new(AtomicU32::new(0));
    let registry = StaticRegistry::new().with_handler(
        ToolDescriptor::new("add", "", json!({})),
        counting_handler(Arc::clone(&counter), json!(5)),
    );

    let mut seed = ConversationThread::new();
    seed.add_message(Message::user("add 2 and 3"));
    seed.add_message(Message::assistant_parts(vec![ContentPart::ToolRequest {
        call: ToolCall::new("c1", "add", json!({"a": 2, "b": 3})),
    }]));
    let mut snapshot = seed.snapshot();
    snapshot.loop_state = Some({
        let mut state = LoopState::new(10);
        state.working_len = 2;
        state
            .pending_writes
            .insert("c1".into(), ToolOutput::ok(json!(42)));
        state
    });
    let thread = SharedThread::new(ConversationThread::restore(snapshot));

    let client = ScriptedClient::new(vec![ScriptedTurn::Text("42".into())]);
    let agent = AgenticLoop::new(Capabilities::new(client, Arc::new(registry)));

    let events = collect(agent.run(thread.clone(), Vec::new(), RunOptions::new())).await;

    assert!(matches!(
        assert_well_formed(&events),
        EventKind::RunFinished { .. }
    ));
    // The restored result was reused; the tool never executed.
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::ToolCallFinished { call_id, output }
            if call_id == "c1" && output.value == json!(42)
    )));
    let thread_snapshot = thread.snapshot();
    assert_eq!(
        thread_snapshot
            .messages
            .iter()
            .find_map(|m| m.tool_result_for("c1"))
            .unwrap()
            .value,
        json!(42)
    );
}

#[tokio::test]
async fn corrupt_loop_state_fails_run() {
    let mut seed = ConversationThread::new();
    seed.add_message(Message::user("hello"));
    let mut snapshot = seed.snapshot();
    snapshot.loop_state = Some({
        let mut state = LoopState::new(10);
        state.working_len = 1;
        // References a call id with no matching request in the thread.
        state
            .pending_writes
            .insert("ghost".into(), ToolOutput::ok(json!(1)));
        state
    });
    let thread = SharedThread::new(ConversationThread::restore(snapshot));

    let client = ScriptedClient::new(vec![ScriptedTurn::Text("never".into())]);
    let agent = AgenticLoop::new(Capabilities::new(client, Arc::new(StaticRegistry::new())));

    let events = collect(agent.run(thread, Vec::new(), RunOptions::new())).await;

    assert!(matches!(
        assert_well_formed(&events),
        EventKind::RunFailed {
            kind: ErrorKind::CorruptCheckpoint,
            ..
        }
    ));
}

#[tokio::test]
async fn run_checkpointed_creates_saves_and_reloads() {
    let client = ScriptedClient::new(vec![ScriptedTurn::Text("first answer".into())]);
    let store = Arc::new(InMemoryThreadStore::new());
    let agent = AgenticLoop::new(
        Capabilities::new(
            Arc::clone(&client) as Arc<dyn ChatClient>,
            Arc::new(StaticRegistry::new()),
        )
        .with_thread_store(Arc::clone(&store) as Arc<dyn ThreadStore>),
    );
    let thread_id = uuid::Uuid::new_v4();

    let (_thread, events) = agent
        .run_checkpointed(thread_id, vec![Message::user("question one")], RunOptions::new())
        .await
        .unwrap();
    let events = collect(events).await;
    assert!(matches!(
        assert_well_formed(&events),
        EventKind::RunFinished { .. }
    ));
    assert!(events.iter().any(|e| matches!(&e.kind, EventKind::CheckpointSaved { .. })));

    // A second checkpointed run on the same id resumes the stored history.
    client.push(ScriptedTurn::Text("second answer".into()));
    let (thread, events) = agent
        .run_checkpointed(thread_id, vec![Message::user("question two")], RunOptions::new())
        .await
        .unwrap();
    let events = collect(events).await;
    assert!(matches!(
        assert_well_formed(&events),
        EventKind::RunFinished { .. }
    ));

    let texts: Vec<String> = thread
        .snapshot()
        .messages
        .iter()
        .filter_map(Message::text_content)
        .collect();
    assert_eq!(
        texts,
        vec!["question one", "first answer", "question two", "second answer"]
    );
}

#[tokio::test]
async fn full_history_mode_retains_every_checkpoint() {
    let client = ScriptedClient::new(vec![
        ScriptedTurn::ToolCalls(vec![ToolCall::new("c1", "add", json!({"a": 1, "b": 1}))]),
        ScriptedTurn::ToolCalls(vec![ToolCall::new("c2", "add", json!({"a": 2, "b": 2}))]),
        ScriptedTurn::Text("done".into()),
    ]);
    let store = Arc::new(InMemoryThreadStore::new());
    let agent = AgenticLoop::new(
        Capabilities::new(client, Arc::new(add_registry()))
            .with_thread_store(Arc::clone(&store) as Arc<dyn ThreadStore>),
    );
    let thread = SharedThread::new(ConversationThread::new());
    let thread_id = thread.id();
    let options = RunOptions::new().with_checkpoint_frequency(CheckpointFrequency::FullHistory);

    let events = collect(agent.run(thread, vec![Message::user("go")], options)).await;
    assert_well_formed(&events);

    let emitted = events
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::CheckpointSaved { .. }))
        .count();
    let retained = store.list_checkpoints(thread_id).await.unwrap().len();
    assert_eq!(emitted, retained);
    assert!(retained >= 3);
}

#[tokio::test]
async fn snapshot_restore_roundtrip_through_store() {
    let store = InMemoryThreadStore::new();
    let mut thread = ConversationThread::new().with_name("roundtrip");
    thread.add_message(Message::system("sys"));
    thread.add_message(Message::user("hi"));
    let snapshot = thread.snapshot();

    store.save_snapshot(snapshot.clone(), false).await.unwrap();
    let loaded = store.load_snapshot(thread.id()).await.unwrap().unwrap();
    assert_eq!(loaded, snapshot);

    let restored = ConversationThread::restore(loaded);
    assert_eq!(restored.snapshot(), snapshot);
}
