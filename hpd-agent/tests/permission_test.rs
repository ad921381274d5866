//! Permission gating and clarification flows.

mod common;

use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use common::{
    ScriptedClient, ScriptedTurn, assert_tool_events_paired, assert_well_formed, collect_responding,
    counting_handler,
};
use hpd_agent::prelude::*;

fn guarded_registry(counter: Arc<AtomicU32>) -> StaticRegistry {
    StaticRegistry::new().with_handler(
        ToolDescriptor::new("delete_file", "Delete a file", json!({})).with_permission_required(),
        counting_handler(counter, json!("deleted")),
    )
}

#[tokio::test]
async fn scenario_c_permission_denied() {
    let counter = Arc::new(AtomicU32::new(0));
    let client = ScriptedClient::new(vec![
        ScriptedTurn::ToolCalls(vec![ToolCall::new("c1", "delete_file", json!({"path": "x"}))]),
        ScriptedTurn::Text("I was not allowed to delete it".into()),
    ]);
    let agent = AgenticLoop::new(Capabilities::new(
        client,
        Arc::new(guarded_registry(Arc::clone(&counter))),
    ));
    let thread = SharedThread::new(ConversationThread::new());

    let events = collect_responding(
        agent.run(thread.clone(), vec![Message::user("delete x")], RunOptions::new()),
        |event, responder| {
            if let EventKind::PermissionRequested {
                request_id,
                function,
                ..
            } = &event.kind
            {
                assert_eq!(function, "delete_file");
                responder.send(
                    request_id,
                    FilterResponse::Permission {
                        approved: false,
                        reason: Some("unsafe".into()),
                        choice: PermissionChoice::DenyOnce,
                    },
                );
            }
        },
    )
    .await;

    let terminal = assert_well_formed(&events);
    assert!(matches!(
        terminal,
        EventKind::RunFinished {
            reason: FinishReason::NaturalStop
        }
    ));
    assert_tool_events_paired(&events);
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::PermissionResolved { approved: false, reason: Some(r), .. } if r == "unsafe"
    )));
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::ToolCallFinished { call_id, output }
            if call_id == "c1"
                && output.is_error
                && output.value == json!("Permission denied by user.")
    )));

    // The tool never executed; the loop continued to the explanation.
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    let snapshot = thread.snapshot();
    assert_eq!(
        snapshot.messages.last().unwrap().text_content().unwrap(),
        "I was not allowed to delete it"
    );
}

#[tokio::test]
async fn permission_approval_executes_tool() {
    let counter = Arc::new(AtomicU32::new(0));
    let client = ScriptedClient::new(vec![
        ScriptedTurn::ToolCalls(vec![ToolCall::new("c1", "delete_file", json!({"path": "x"}))]),
        ScriptedTurn::Text("done".into()),
    ]);
    let agent = AgenticLoop::new(Capabilities::new(
        client,
        Arc::new(guarded_registry(Arc::clone(&counter))),
    ));
    let thread = SharedThread::new(ConversationThread::new());

    let events = collect_responding(
        agent.run(thread, vec![Message::user("delete x")], RunOptions::new()),
        |event, responder| {
            if let EventKind::PermissionRequested { request_id, .. } = &event.kind {
                responder.send(
                    request_id,
                    FilterResponse::Permission {
                        approved: true,
                        reason: None,
                        choice: PermissionChoice::AllowOnce,
                    },
                );
            }
        },
    )
    .await;

    assert!(matches!(
        assert_well_formed(&events),
        EventKind::RunFinished { .. }
    ));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::ToolCallFinished { output, .. } if output.value == json!("deleted")
    )));
}

#[tokio::test]
async fn always_allow_skips_future_prompts() {
    let counter = Arc::new(AtomicU32::new(0));
    let client = ScriptedClient::new(vec![
        ScriptedTurn::ToolCalls(vec![ToolCall::new("c1", "delete_file", json!({"path": "x"}))]),
        ScriptedTurn::Text("first done".into()),
    ]);
    let store = Arc::new(InMemoryPermissionStore::new());
    let agent = AgenticLoop::new(
        Capabilities::new(
            Arc::clone(&client) as Arc<dyn ChatClient>,
            Arc::new(guarded_registry(Arc::clone(&counter))),
        )
        .with_permission_store(store),
    );
    let options = RunOptions::new().with_session_id("sess-1");

    let thread = SharedThread::new(ConversationThread::new());
    let events = collect_responding(
        agent.run(thread, vec![Message::user("delete x")], options.clone()),
        |event, responder| {
            if let EventKind::PermissionRequested { request_id, .. } = &event.kind {
                responder.send(
                    request_id,
                    FilterResponse::Permission {
                        approved: true,
                        reason: None,
                        choice: PermissionChoice::AlwaysAllow,
                    },
                );
            }
        },
    )
    .await;
    assert!(matches!(
        assert_well_formed(&events),
        EventKind::RunFinished { .. }
    ));

    // Second run: the stored choice covers the scope; no prompt.
    client.push(ScriptedTurn::ToolCalls(vec![ToolCall::new(
        "c2",
        "delete_file",
        json!({"path": "y"}),
    )]));
    client.push(ScriptedTurn::Text("second done".into()));
    let thread = SharedThread::new(ConversationThread::new());
    let events = collect_responding(
        agent.run(thread, vec![Message::user("delete y")], options),
        |event, _| {
            assert!(
                !matches!(&event.kind, EventKind::PermissionRequested { .. }),
                "no prompt expected on the second run"
            );
        },
    )
    .await;
    assert!(matches!(
        assert_well_formed(&events),
        EventKind::RunFinished { .. }
    ));
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn clarification_roundtrip() {
    let client = ScriptedClient::new(vec![
        ScriptedTurn::ToolCalls(vec![ToolCall::new(
            "c1",
            "ask_user",
            json!({"prompt": "Which file do you mean?"}),
        )]),
        ScriptedTurn::Text("thanks".into()),
    ]);
    let agent = AgenticLoop::new(Capabilities::new(client, Arc::new(StaticRegistry::new())));
    let thread = SharedThread::new(ConversationThread::new());

    let events = collect_responding(
        agent.run(thread.clone(), vec![Message::user("open the file")], RunOptions::new()),
        |event, responder| {
            if let EventKind::ClarificationRequested { request_id, prompt } = &event.kind {
                assert_eq!(prompt, "Which file do you mean?");
                responder.send(
                    request_id,
                    FilterResponse::Clarification {
                        reply: "the report".into(),
                    },
                );
            }
        },
    )
    .await;

    assert!(matches!(
        assert_well_formed(&events),
        EventKind::RunFinished { .. }
    ));
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::ClarificationResolved { reply, .. } if reply == "the report"
    )));
    // The user's reply became the tool result.
    let snapshot = thread.snapshot();
    let reply = snapshot
        .messages
        .iter()
        .find_map(|m| m.tool_result_for("c1"))
        .unwrap();
    assert!(!reply.is_error);
    assert_eq!(reply.value, json!("the report"));
}
