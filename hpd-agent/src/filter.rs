//! Composable interceptors around tool dispatch, the prompt, and the
//! completed turn.
//!
//! For tool filters `[F1, F2, F3]` and terminal `T`, the effective call
//! is `F1(F2(F3(T)))`: the first registered filter runs outermost.
//! Built-in filters (permission, clarification) run before user
//! filters. A filter may call [`Next::run`] zero or more times, mutate
//! the result slot, mark the context terminated, emit events, or block
//! on a typed response waiter.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::agent::context::RunContext;
use crate::error::Result;
use crate::event::{EventKind, EventSink};
use crate::message::{Message, ToolCall, ToolOutput};
use crate::tool::ToolDescriptor;
use crate::waiter::WaiterHandle;

/// Per-call context threaded through the tool filter pipeline.
#[derive(Debug)]
pub struct FilterContext {
    /// The tool call under dispatch.
    pub call: ToolCall,
    /// Resolved function descriptor, if the name resolved.
    pub descriptor: Option<ToolDescriptor>,
    /// Mutable result slot. If no filter and not the terminal sets it,
    /// the dispatcher materializes a short-circuit error.
    pub result: Option<ToolOutput>,
    /// Set to stop further dispatch in this iteration and terminate the
    /// run after results are appended.
    pub terminated: bool,
    /// Free-form metadata shared along the pipeline.
    pub metadata: HashMap<String, Value>,
    events: EventSink,
    waiters: WaiterHandle,
    run: Arc<RunContext>,
}

impl FilterContext {
    pub(crate) fn new(
        call: ToolCall,
        descriptor: Option<ToolDescriptor>,
        events: EventSink,
        waiters: WaiterHandle,
        run: Arc<RunContext>,
    ) -> Self {
        Self {
            call,
            descriptor,
            result: None,
            terminated: false,
            metadata: HashMap::new(),
            events,
            waiters,
            run,
        }
    }

    /// The typed run context (run/thread/conversation references and
    /// user data).
    #[must_use]
    pub fn run(&self) -> &RunContext {
        &self.run
    }

    /// The outbound event writer.
    #[must_use]
    pub const fn events(&self) -> &EventSink {
        &self.events
    }

    /// The response-waiter handle for bidirectional requests.
    #[must_use]
    pub const fn waiters(&self) -> &WaiterHandle {
        &self.waiters
    }

    /// Emit a user-defined filter event.
    pub fn emit_filter_event(&self, filter: &str, kind: &str, payload: Value) {
        self.events.emit(EventKind::FilterEvent {
            filter: filter.to_owned(),
            kind: kind.to_owned(),
            payload,
        });
    }

    /// Set the result slot.
    pub fn set_result(&mut self, output: ToolOutput) {
        self.result = Some(output);
    }

    /// Mark the context terminated.
    pub const fn terminate(&mut self) {
        self.terminated = true;
    }
}

/// A tool-dispatch interceptor.
#[async_trait]
pub trait ToolFilter: Send + Sync {
    /// Stable name, used in `FilterEvent`s and logs.
    fn name(&self) -> &str;

    /// Run around the rest of the pipeline.
    ///
    /// # Errors
    ///
    /// Errors abort the whole run (cancellation is the usual case);
    /// per-call failures belong in the result slot instead.
    async fn invoke(&self, ctx: &mut FilterContext, next: Next<'_>) -> Result<()>;
}

/// The terminal step a tool pipeline bottoms out in.
pub(crate) trait Terminal: Send + Sync {
    fn invoke<'a>(&'a self, ctx: &'a mut FilterContext) -> BoxFuture<'a, Result<()>>;
}

/// Continuation handed to each tool filter.
///
/// `Copy`, so a filter may invoke the remainder of the pipeline more
/// than once (e.g. retries) or not at all (short-circuit).
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn ToolFilter>],
    terminal: &'a dyn Terminal,
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.chain.len())
            .finish()
    }
}

impl<'a> Next<'a> {
    pub(crate) const fn new(chain: &'a [Arc<dyn ToolFilter>], terminal: &'a dyn Terminal) -> Self {
        Self { chain, terminal }
    }

    /// Invoke the remainder of the pipeline.
    ///
    /// # Errors
    ///
    /// Propagates run-aborting errors from downstream filters or the
    /// terminal.
    pub async fn run(self, ctx: &mut FilterContext) -> Result<()> {
        match self.chain.split_first() {
            Some((first, rest)) => {
                first
                    .invoke(ctx, Self::new(rest, self.terminal))
                    .await
            }
            None => self.terminal.invoke(ctx).await,
        }
    }
}

/// A prompt interceptor: may inject or rewrite messages before the model
/// call.
#[async_trait]
pub trait PromptFilter: Send + Sync {
    /// Stable name.
    fn name(&self) -> &str;

    /// Transform the outgoing messages, delegating to `next`.
    ///
    /// # Errors
    ///
    /// Errors abort the run.
    async fn invoke(&self, messages: Vec<Message>, next: PromptNext<'_>) -> Result<Vec<Message>>;
}

/// Continuation for the prompt pipeline; the terminal returns the
/// messages unchanged.
#[derive(Clone, Copy)]
pub struct PromptNext<'a> {
    chain: &'a [Arc<dyn PromptFilter>],
}

impl std::fmt::Debug for PromptNext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptNext")
            .field("remaining", &self.chain.len())
            .finish()
    }
}

impl<'a> PromptNext<'a> {
    pub(crate) const fn new(chain: &'a [Arc<dyn PromptFilter>]) -> Self {
        Self { chain }
    }

    /// Invoke the remainder of the prompt pipeline.
    ///
    /// # Errors
    ///
    /// Propagates errors from downstream filters.
    pub fn run(
        self,
        messages: Vec<Message>,
    ) -> BoxFuture<'a, Result<Vec<Message>>> {
        Box::pin(async move {
            match self.chain.split_first() {
                Some((first, rest)) => first.invoke(messages, PromptNext::new(rest)).await,
                None => Ok(messages),
            }
        })
    }
}

/// Observer of a completed model turn (request + response), for memory
/// extraction and observability.
#[async_trait]
pub trait PostInvokeFilter: Send + Sync {
    /// Called after each model invocation completes or fails.
    async fn after(
        &self,
        request: &[Message],
        response: Option<&Message>,
        error: Option<&crate::error::AgentError>,
    );
}

/// Observer of the outbound message turn, for telemetry.
#[async_trait]
pub trait TurnFilter: Send + Sync {
    /// Called with the messages appended during one iteration.
    async fn on_turn(&self, turn: &[Message]);
}

/// The registered filters of an agent, in registration order.
#[derive(Clone, Default)]
pub struct FilterSet {
    pub(crate) tool: Vec<Arc<dyn ToolFilter>>,
    pub(crate) prompt: Vec<Arc<dyn PromptFilter>>,
    pub(crate) post_invoke: Vec<Arc<dyn PostInvokeFilter>>,
    pub(crate) turn: Vec<Arc<dyn TurnFilter>>,
}

impl std::fmt::Debug for FilterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterSet")
            .field("tool", &self.tool.len())
            .field("prompt", &self.prompt.len())
            .field("post_invoke", &self.post_invoke.len())
            .field("turn", &self.turn.len())
            .finish()
    }
}

impl FilterSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool filter. First registered runs outermost.
    #[must_use]
    pub fn with_tool_filter(mut self, filter: Arc<dyn ToolFilter>) -> Self {
        self.tool.push(filter);
        self
    }

    /// Register a prompt filter.
    #[must_use]
    pub fn with_prompt_filter(mut self, filter: Arc<dyn PromptFilter>) -> Self {
        self.prompt.push(filter);
        self
    }

    /// Register a post-invoke filter.
    #[must_use]
    pub fn with_post_invoke_filter(mut self, filter: Arc<dyn PostInvokeFilter>) -> Self {
        self.post_invoke.push(filter);
        self
    }

    /// Register a message-turn filter.
    #[must_use]
    pub fn with_turn_filter(mut self, filter: Arc<dyn TurnFilter>) -> Self {
        self.turn.push(filter);
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::waiter::WaiterTable;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn context() -> FilterContext {
        let (tx, _rx) = mpsc::unbounded_channel();
        // Emission to a closed channel is silent, which is all these
        // tests need.
        let sink = EventSink::new(Uuid::new_v4(), tx);
        let waiters = WaiterHandle::new(
            WaiterTable::new(),
            CancellationToken::new(),
            Duration::from_secs(1),
        );
        let run = Arc::new(RunContext::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            None,
            HashMap::new(),
        ));
        FilterContext::new(
            ToolCall::new("c1", "add", json!({"a": 1})),
            None,
            sink,
            waiters,
            run,
        )
    }

    struct RecordingTerminal {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Terminal for RecordingTerminal {
        fn invoke<'a>(&'a self, ctx: &'a mut FilterContext) -> BoxFuture<'a, Result<()>> {
            let log = Arc::clone(&self.log);
            Box::pin(async move {
                log.lock().unwrap().push("terminal");
                ctx.set_result(ToolOutput::ok(json!("done")));
                Ok(())
            })
        }
    }

    struct NamedFilter {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ToolFilter for NamedFilter {
        fn name(&self) -> &str {
            self.name
        }

        async fn invoke(&self, ctx: &mut FilterContext, next: Next<'_>) -> Result<()> {
            self.log.lock().unwrap().push(self.name);
            next.run(ctx).await
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl ToolFilter for ShortCircuit {
        fn name(&self) -> &str {
            "short_circuit"
        }

        async fn invoke(&self, _ctx: &mut FilterContext, _next: Next<'_>) -> Result<()> {
            Ok(())
        }
    }

    struct DoubleInvoke;

    #[async_trait]
    impl ToolFilter for DoubleInvoke {
        fn name(&self) -> &str {
            "double"
        }

        async fn invoke(&self, ctx: &mut FilterContext, next: Next<'_>) -> Result<()> {
            next.run(ctx).await?;
            next.run(ctx).await
        }
    }

    #[tokio::test]
    async fn first_registered_runs_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn ToolFilter>> = vec![
            Arc::new(NamedFilter {
                name: "f1",
                log: Arc::clone(&log),
            }),
            Arc::new(NamedFilter {
                name: "f2",
                log: Arc::clone(&log),
            }),
        ];
        let terminal = RecordingTerminal {
            log: Arc::clone(&log),
        };
        let mut ctx = context();
        Next::new(&chain, &terminal).run(&mut ctx).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["f1", "f2", "terminal"]);
        assert!(ctx.result.is_some());
    }

    #[tokio::test]
    async fn short_circuit_skips_terminal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn ToolFilter>> = vec![Arc::new(ShortCircuit)];
        let terminal = RecordingTerminal {
            log: Arc::clone(&log),
        };
        let mut ctx = context();
        Next::new(&chain, &terminal).run(&mut ctx).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
        assert!(ctx.result.is_none());
    }

    #[tokio::test]
    async fn next_may_run_more_than_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn ToolFilter>> = vec![Arc::new(DoubleInvoke)];
        let terminal = RecordingTerminal {
            log: Arc::clone(&log),
        };
        let mut ctx = context();
        Next::new(&chain, &terminal).run(&mut ctx).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["terminal", "terminal"]);
    }

    #[tokio::test]
    async fn prompt_pipeline_threads_messages() {
        struct Prepend(&'static str);

        #[async_trait]
        impl PromptFilter for Prepend {
            fn name(&self) -> &str {
                "prepend"
            }

            async fn invoke(
                &self,
                mut messages: Vec<Message>,
                next: PromptNext<'_>,
            ) -> Result<Vec<Message>> {
                messages.insert(0, Message::system(self.0));
                next.run(messages).await
            }
        }

        let chain: Vec<Arc<dyn PromptFilter>> =
            vec![Arc::new(Prepend("outer")), Arc::new(Prepend("inner"))];
        let out = PromptNext::new(&chain)
            .run(vec![Message::user("hi")])
            .await
            .unwrap();
        let texts: Vec<String> = out.iter().filter_map(Message::text_content).collect();
        assert_eq!(texts, vec!["inner", "outer", "hi"]);
    }
}
