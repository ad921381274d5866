//! Per-call tool dispatch: filter pipeline assembly, the terminal
//! invocation with timeout and retry, and unknown-function policy.
//!
//! Fan-out across the calls of one iteration is orchestrated by the
//! loop driver; this module executes exactly one call under the
//! composed policy: permission gate first, then registered filters in
//! order, then the terminal.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span, warn};

use crate::agent::context::RunContext;
use crate::agent::options::AgentMessages;
use crate::error::{AgentError, Result};
use crate::filter::{FilterContext, Next, Terminal, ToolFilter};
use crate::message::{ToolCall, ToolOutput};
use crate::tool::{RegisteredTool, ToolRegistry};
use crate::waiter::WaiterHandle;
use futures::future::BoxFuture;

use crate::event::EventSink;

/// Exponential backoff policy shared by tool and model retries.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Backoff delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Result of dispatching one call.
#[derive(Debug, Clone)]
pub(crate) struct DispatchOutcome {
    pub call: ToolCall,
    pub output: ToolOutput,
    pub terminated: bool,
    pub expands_scope: Option<String>,
}

pub(crate) struct ToolDispatcher {
    chain: Vec<Arc<dyn ToolFilter>>,
    registry: Arc<dyn ToolRegistry>,
    retry: RetryPolicy,
    per_call_timeout: Duration,
    terminate_on_unknown: bool,
    messages: AgentMessages,
    cancel: CancellationToken,
    run: Arc<RunContext>,
}

impl ToolDispatcher {
    /// Assemble the dispatcher. `chain` must already hold the built-in
    /// filters (permission outermost) ahead of user filters.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        chain: Vec<Arc<dyn ToolFilter>>,
        registry: Arc<dyn ToolRegistry>,
        retry: RetryPolicy,
        per_call_timeout: Duration,
        terminate_on_unknown: bool,
        messages: AgentMessages,
        cancel: CancellationToken,
        run: Arc<RunContext>,
    ) -> Self {
        Self {
            chain,
            registry,
            retry,
            per_call_timeout,
            terminate_on_unknown,
            messages,
            cancel,
            run,
        }
    }

    /// Dispatch one call through the filter pipeline.
    ///
    /// A `cached` output (a pending write restored from a checkpoint)
    /// short-circuits execution entirely and the result is reused.
    pub(crate) async fn dispatch(
        &self,
        call: ToolCall,
        cached: Option<ToolOutput>,
        sink: &EventSink,
        waiters: &WaiterHandle,
    ) -> Result<DispatchOutcome> {
        if let Some(output) = cached {
            return Ok(DispatchOutcome {
                call,
                output,
                terminated: false,
                expands_scope: None,
            });
        }

        let resolved = self.registry.resolve(&call.name);
        let descriptor = resolved.as_ref().map(|t| t.descriptor.clone());
        let span = info_span!(
            "tool",
            tool.name = %call.name,
            tool.id = %call.id,
            tool.success = tracing::field::Empty,
        );

        async {
            let mut ctx = FilterContext::new(
                call,
                descriptor,
                sink.clone(),
                waiters.clone(),
                Arc::clone(&self.run),
            );
            let terminal = InvokeTerminal {
                tool: resolved,
                retry: self.retry,
                timeout: self.per_call_timeout,
                cancel: &self.cancel,
                terminate_on_unknown: self.terminate_on_unknown,
                messages: &self.messages,
            };
            Next::new(&self.chain, &terminal).run(&mut ctx).await?;

            let output = ctx.result.take().unwrap_or_else(|| {
                ToolOutput::error(self.messages.filter_short_circuit.clone())
            });
            tracing::Span::current().record("tool.success", !output.is_error);

            let expands_scope = (!output.is_error)
                .then(|| {
                    ctx.descriptor
                        .as_ref()
                        .and_then(|d| d.expands_scope.clone())
                })
                .flatten();

            Ok(DispatchOutcome {
                call: ctx.call,
                output,
                terminated: ctx.terminated,
                expands_scope,
            })
        }
        .instrument(span)
        .await
    }
}

struct InvokeTerminal<'a> {
    tool: Option<RegisteredTool>,
    retry: RetryPolicy,
    timeout: Duration,
    cancel: &'a CancellationToken,
    terminate_on_unknown: bool,
    messages: &'a AgentMessages,
}

impl Terminal for InvokeTerminal<'_> {
    fn invoke<'a>(&'a self, ctx: &'a mut FilterContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            // A filter may have satisfied the call already.
            if ctx.result.is_some() {
                return Ok(());
            }

            let Some(tool) = &self.tool else {
                warn!(tool = %ctx.call.name, "Function not found");
                ctx.set_result(ToolOutput::error(
                    self.messages.unknown_function_for(&ctx.call.name),
                ));
                if self.terminate_on_unknown {
                    ctx.terminate();
                }
                return Ok(());
            };

            let mut attempt = 0;
            loop {
                if self.cancel.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }
                let invocation = tool.handler.invoke(ctx.call.arguments.clone(), self.cancel);
                let result = tokio::select! {
                    () = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                    result = tokio::time::timeout(self.timeout, invocation) => result,
                };

                match result {
                    Ok(Ok(value)) => {
                        ctx.set_result(ToolOutput::ok(value));
                        return Ok(());
                    }
                    Ok(Err(err)) if err.is_transient() && attempt < self.retry.max_retries => {
                        warn!(tool = %ctx.call.name, attempt, error = %err, "Retrying tool call");
                    }
                    Ok(Err(err)) => {
                        warn!(tool = %ctx.call.name, error = %err, "Tool execution failed");
                        ctx.set_result(ToolOutput::error(err.to_string()));
                        return Ok(());
                    }
                    Err(_elapsed) if attempt < self.retry.max_retries => {
                        warn!(tool = %ctx.call.name, attempt, "Tool call timed out; retrying");
                    }
                    Err(_elapsed) => {
                        warn!(tool = %ctx.call.name, "Tool call timed out");
                        ctx.set_result(ToolOutput::error(self.messages.tool_timeout.clone()));
                        return Ok(());
                    }
                }

                tokio::time::sleep(self.retry.delay(attempt)).await;
                attempt += 1;
            }
        })
    }
}
