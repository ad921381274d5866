//! The agentic loop driver.
//!
//! Alternates model calls and tool dispatch over a bounded number of
//! iterations until a terminal condition holds, emitting the run's event
//! stream along the way. Single-threaded cooperative per run: the driver
//! advances one iteration at a time and suspends on model chunks, tool
//! invocations, response waiters, and checkpoint persists. Tool dispatch
//! within an iteration fans out up to the configured cap.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::Capabilities;
use crate::agent::context::RunContext;
use crate::agent::options::{CheckpointFrequency, RunOptions};
use crate::breaker::{BreakerVerdict, CircuitBreaker};
use crate::chat::{ChatRequest, ClientError};
use crate::dispatch::{DispatchOutcome, RetryPolicy, ToolDispatcher};
use crate::error::{AgentError, Result};
use crate::event::{EventKind, EventSink, FinishReason};
use crate::filter::{FilterSet, PromptNext, ToolFilter};
use crate::message::{Message, Role, ToolCall, ToolOutput};
use crate::permission::{ClarificationFilter, PermissionFilter, clarification_descriptor};
use crate::reduction::Reducer;
use crate::state::{LoopState, TerminationReason};
use crate::store::StoreError;
use crate::stream::{ChunkAggregator, ModelChunk};
use crate::thread::SharedThread;
use crate::tool::ToolDescriptor;
use crate::waiter::{FilterResponse, WaitError, WaiterHandle};

/// Outcome of one iteration body.
enum IterationOutcome {
    /// The run reached a non-error terminal state.
    Finished(FinishReason),
    /// Continue with the next iteration.
    Continue,
}

pub(crate) struct Driver {
    pub caps: Capabilities,
    pub filters: FilterSet,
    pub options: RunOptions,
    pub thread: SharedThread,
    pub new_messages: Vec<Message>,
    pub sink: EventSink,
    pub waiters: WaiterHandle,
    pub cancel: CancellationToken,
    pub run: Arc<RunContext>,
}

impl Driver {
    /// Drive the run to completion, emitting the terminal event last.
    pub(crate) async fn drive(mut self) {
        self.sink.emit(EventKind::RunStarted);
        match self.main().await {
            Ok(reason) => {
                info!(run_id = %self.run.run_id(), reason = ?reason, "Run finished");
                self.sink.emit(EventKind::RunFinished { reason });
            }
            Err(err) => {
                warn!(run_id = %self.run.run_id(), error = %err, "Run failed");
                self.sink.emit(EventKind::RunFailed {
                    kind: err.kind(),
                    message: err.to_string(),
                });
            }
        }
    }

    async fn main(&mut self) -> Result<FinishReason> {
        let mut state = self.init_state()?;
        let mut breaker = CircuitBreaker::from_counts(
            self.options.circuit_breaker_threshold,
            state.breaker_counts.clone(),
        );
        let dispatcher = self.build_dispatcher();
        let summarizer = self
            .caps
            .summarizer
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.caps.chat));
        let reducer = Reducer::new(self.options.reduction.clone(), Some(summarizer));

        let result = self
            .run_loop(&mut state, &mut breaker, &dispatcher, &reducer)
            .await;

        match result {
            Ok(reason) => {
                self.thread.write(|t| t.clear_loop_state());
                if self.options.checkpoint_frequency.is_enabled() {
                    self.save_checkpoint(state.iteration, None).await?;
                }
                Ok(reason)
            }
            Err(err) => {
                // Leave the thread resumable: sync the final state, and
                // persist it (best effort) so the reason is durable.
                self.sync_state(&state);
                if self.options.checkpoint_frequency.is_enabled()
                    && !matches!(err, AgentError::Cancelled)
                {
                    if let Err(save_err) =
                        self.save_checkpoint(state.iteration, Some(&state)).await
                    {
                        warn!(error = %save_err, "Final checkpoint failed");
                    }
                }
                Err(err)
            }
        }
    }

    async fn run_loop(
        &self,
        state: &mut LoopState,
        breaker: &mut CircuitBreaker,
        dispatcher: &ToolDispatcher,
        reducer: &Reducer,
    ) -> Result<FinishReason> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            self.maybe_reduce(state, reducer).await?;

            self.sink.emit(EventKind::IterationStarted {
                iteration: state.iteration,
            });
            debug!(iteration = state.iteration, "Starting iteration");

            let outcome = match self.options.iteration_timeout {
                Some(limit) => {
                    let result =
                        tokio::time::timeout(limit, self.run_iteration(state, breaker, dispatcher))
                            .await;
                    match result {
                        Ok(outcome) => outcome?,
                        Err(_) => {
                            return Err(AgentError::IterationTimeout {
                                iteration: state.iteration,
                            });
                        }
                    }
                }
                None => self.run_iteration(state, breaker, dispatcher).await?,
            };

            match outcome {
                IterationOutcome::Finished(reason) => return Ok(reason),
                IterationOutcome::Continue => {}
            }
        }
    }

    /// One iteration: prompt filters, model call, tool dispatch, safety
    /// accounting, continuation, checkpoint.
    ///
    /// When the thread's last message is an assistant message whose tool
    /// calls have no results yet (a mid-iteration resume), the model
    /// call is skipped and those calls go straight to dispatch, where
    /// pending writes satisfy the already-completed ones.
    async fn run_iteration(
        &self,
        state: &mut LoopState,
        breaker: &mut CircuitBreaker,
        dispatcher: &ToolDispatcher,
    ) -> Result<IterationOutcome> {
        let mut turn: Vec<Message> = Vec::new();
        let calls: Vec<ToolCall>;

        if let Some(open) = self.open_tool_calls() {
            // Breaker counters already cover these calls; they were
            // recorded before the interrupted dispatch.
            debug!(count = open.len(), "Resuming iteration with open tool calls");
            calls = open;
        } else {
            let working = self.thread.read(|t| t.messages().to_vec());
            let working = PromptNext::new(&self.filters.prompt).run(working).await?;

            let assistant = match self.call_model(&working, &state.expanded_scopes).await {
                Ok(message) => message,
                Err(err) => {
                    self.post_invoke(&working, None, Some(&err)).await;
                    return Err(err);
                }
            };
            let message_id = assistant.id.clone().unwrap_or_default();
            self.thread.write(|t| t.add_message(assistant.clone()));
            self.sink.emit(EventKind::MessageFinished { message_id });
            self.post_invoke(&working, Some(&assistant), None).await;

            let requested: Vec<ToolCall> =
                assistant.tool_calls().into_iter().cloned().collect();
            turn.push(assistant);

            if requested.is_empty() {
                state.termination = Some(TerminationReason::NaturalStop);
                self.sink.emit(EventKind::IterationFinished {
                    iteration: state.iteration,
                });
                self.on_turn(&turn).await;
                return Ok(IterationOutcome::Finished(FinishReason::NaturalStop));
            }

            // Circuit breaker: account for every call of the iteration
            // before any of them executes.
            let mut tripped: Option<usize> = None;
            for (index, call) in requested.iter().enumerate() {
                if breaker.record(&call.name, &call.arguments) == BreakerVerdict::Tripped {
                    tripped = Some(index);
                    break;
                }
            }
            state.breaker_counts = breaker.counts().clone();
            if let Some(index) = tripped {
                let results: Vec<Message> = requested
                    .iter()
                    .enumerate()
                    .map(|(i, call)| {
                        let output = if i == index {
                            ToolOutput::error(self.options.messages.circuit_breaker.clone())
                        } else {
                            ToolOutput::error(self.options.messages.skipped_call.clone())
                        };
                        Message::tool_result(call.id.clone(), output)
                    })
                    .collect();
                self.thread.write(|t| t.add_messages(results));
                state.termination = Some(TerminationReason::CircuitBreaker);
                return Err(AgentError::CircuitBreaker {
                    function: requested[index].name.clone(),
                });
            }
            calls = requested;
        }

        let outcomes = self.dispatch_all(state, dispatcher, &calls).await?;

        // Append result messages in call order and fold in side effects.
        let mut terminated = false;
        let mut any_success = false;
        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in &outcomes {
            if outcome.terminated {
                terminated = true;
            }
            if !outcome.output.is_error {
                any_success = true;
            }
            if let Some(scope) = &outcome.expands_scope {
                state.expanded_scopes.insert(scope.clone());
            }
            results.push(Message::tool_result(
                outcome.call.id.clone(),
                outcome.output.clone(),
            ));
        }
        turn.extend(results.iter().cloned());
        self.thread.write(|t| t.add_messages(results));
        state.pending_writes.clear();
        self.on_turn(&turn).await;

        if terminated {
            state.termination = Some(TerminationReason::FilterTerminated);
            self.sink.emit(EventKind::IterationFinished {
                iteration: state.iteration,
            });
            return Ok(IterationOutcome::Finished(FinishReason::Terminated));
        }

        // Consecutive-error accounting: an iteration counts when every
        // tool call errored; any success resets.
        if any_success {
            state.consecutive_errors = 0;
        } else {
            state.consecutive_errors += 1;
        }
        if self.options.max_consecutive_errors > 0
            && state.consecutive_errors >= self.options.max_consecutive_errors
        {
            state.termination = Some(TerminationReason::MaxConsecutiveErrors);
            self.thread.write(|t| {
                t.add_message(Message::system(
                    self.options.messages.max_consecutive_errors.clone(),
                ));
            });
            return Err(AgentError::MaxConsecutiveErrors {
                count: state.consecutive_errors,
            });
        }

        self.sink.emit(EventKind::IterationFinished {
            iteration: state.iteration,
        });

        state.iteration += 1;
        if state.iteration >= state.iteration_cap && !self.request_continuation(state).await? {
            state.termination = Some(TerminationReason::MaxIterations);
            self.thread.write(|t| {
                t.add_message(Message::system(self.options.messages.max_iterations.clone()));
            });
            return Err(AgentError::MaxIterations {
                cap: state.iteration_cap,
            });
        }

        state.working_len = self.thread.message_count();
        self.sync_state(state);
        if self.options.checkpoint_frequency.is_enabled() {
            self.save_checkpoint(state.iteration, Some(state)).await?;
        }

        Ok(IterationOutcome::Continue)
    }

    /// Dispatch the iteration's calls with bounded fan-out.
    ///
    /// Request events go out in call order; finish events follow
    /// completion order; the returned outcomes are in call order. Calls
    /// with a pending-write entry reuse the restored result instead of
    /// executing. When a completion carries the terminated flag,
    /// remaining calls are skipped and get synthesized error results so
    /// every started call still finishes.
    async fn dispatch_all(
        &self,
        state: &mut LoopState,
        dispatcher: &ToolDispatcher,
        calls: &[ToolCall],
    ) -> Result<Vec<DispatchOutcome>> {
        for call in calls {
            self.sink.emit(EventKind::ToolCallStarted {
                call_id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            });
        }

        let cached: Vec<Option<ToolOutput>> = calls
            .iter()
            .map(|call| state.pending_writes.get(&call.id).cloned())
            .collect();
        let cap = self.options.parallel_tool_cap.max(1);
        let mut in_flight = futures::stream::iter(
            calls
                .iter()
                .cloned()
                .zip(cached)
                .enumerate()
                .map(|(index, (call, cached))| async move {
                    (
                        index,
                        dispatcher
                            .dispatch(call, cached, &self.sink, &self.waiters)
                            .await,
                    )
                }),
        )
        .buffer_unordered(cap);

        let mut slots: Vec<Option<DispatchOutcome>> = vec![None; calls.len()];
        let mut terminated = false;
        while let Some((index, outcome)) = in_flight.next().await {
            let outcome = outcome?;
            self.sink.emit(EventKind::ToolCallFinished {
                call_id: outcome.call.id.clone(),
                output: outcome.output.clone(),
            });
            state
                .pending_writes
                .insert(outcome.call.id.clone(), outcome.output.clone());
            let stop = outcome.terminated;
            slots[index] = Some(outcome);

            if matches!(
                self.options.checkpoint_frequency,
                CheckpointFrequency::OnToolCompletion
            ) {
                self.sync_state(state);
                self.save_checkpoint(state.iteration, Some(state)).await?;
            }
            if stop {
                terminated = true;
                break;
            }
        }
        drop(in_flight);

        if terminated {
            for (index, slot) in slots.iter_mut().enumerate() {
                if slot.is_none() {
                    let call = calls[index].clone();
                    let output = ToolOutput::error(self.options.messages.skipped_call.clone());
                    self.sink.emit(EventKind::ToolCallFinished {
                        call_id: call.id.clone(),
                        output: output.clone(),
                    });
                    state.pending_writes.insert(call.id.clone(), output.clone());
                    *slot = Some(DispatchOutcome {
                        call,
                        output,
                        terminated: false,
                        expands_scope: None,
                    });
                }
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }

    /// Invoke the model with retry on transient failures, translating
    /// chunks to delta events, and return the aggregated message.
    async fn call_model(
        &self,
        working: &[Message],
        scopes: &BTreeSet<String>,
    ) -> Result<Message> {
        let request = ChatRequest {
            messages: working.to_vec(),
            tools: self.catalog(scopes),
            selection: self.options.tool_selection.clone(),
        };

        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let opened = tokio::select! {
                () = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                opened = self.caps.chat.stream(request.clone()) => opened,
            };
            let err = match opened {
                Ok(stream) => match self.consume_stream(stream).await {
                    Ok(message) => return Ok(message),
                    Err(err) => err,
                },
                Err(ClientError::Transient(message)) => AgentError::provider_transient(message),
                Err(ClientError::Permanent(message)) => {
                    return Err(AgentError::provider_permanent(message));
                }
            };
            let transient = matches!(&err, AgentError::Provider { transient: true, .. });
            if !transient || attempt >= self.options.max_retries {
                return Err(err);
            }
            let retry = RetryPolicy {
                max_retries: self.options.max_retries,
                base_delay: self.options.retry_base_delay,
            };
            warn!(attempt, error = %err, "Model call failed; retrying");
            tokio::time::sleep(retry.delay(attempt)).await;
            attempt += 1;
        }
    }

    async fn consume_stream(
        &self,
        mut stream: crate::stream::ModelStream,
    ) -> Result<Message> {
        let message_id = Uuid::new_v4().to_string();
        self.sink.emit(EventKind::MessageStarted {
            message_id: message_id.clone(),
            role: Role::Assistant,
        });
        let mut aggregator = ChunkAggregator::new();
        loop {
            let chunk = tokio::select! {
                () = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(chunk)) => {
                    match &chunk {
                        ModelChunk::TextDelta { text } => {
                            self.sink.emit(EventKind::TextDelta {
                                message_id: message_id.clone(),
                                text: text.clone(),
                            });
                        }
                        ModelChunk::ReasoningDelta { text } => {
                            self.sink.emit(EventKind::ReasoningDelta {
                                message_id: message_id.clone(),
                                text: text.clone(),
                            });
                        }
                        _ => {}
                    }
                    let done = matches!(chunk, ModelChunk::Done);
                    aggregator.apply(&chunk);
                    if done {
                        break;
                    }
                }
                Some(Err(ClientError::Transient(message))) => {
                    return Err(AgentError::provider_transient(message));
                }
                Some(Err(ClientError::Permanent(message))) => {
                    return Err(AgentError::provider_permanent(message));
                }
                None => break,
            }
        }
        Ok(aggregator.finish(message_id))
    }

    /// The tool catalog visible to the model: unscoped descriptors,
    /// descriptors of expanded scopes, and the built-in clarification
    /// function.
    fn catalog(&self, scopes: &BTreeSet<String>) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .caps
            .registry
            .descriptors()
            .into_iter()
            .filter(|d| d.scope.as_ref().is_none_or(|s| scopes.contains(s)))
            .collect();
        if self.options.enable_clarification {
            tools.push(clarification_descriptor());
        }
        tools
    }

    /// Ask for approval to extend the iteration cap. Denial and timeout
    /// both mean "do not continue".
    async fn request_continuation(&self, state: &mut LoopState) -> Result<bool> {
        let request_id = WaiterHandle::new_request_id();
        let pending = self.waiters.register(&request_id);
        self.sink.emit(EventKind::ContinuationRequested {
            request_id: request_id.clone(),
            iteration: state.iteration,
            cap: state.iteration_cap,
        });

        match pending.wait().await {
            Ok(FilterResponse::Continuation { approved: true, extension }) => {
                let granted = extension.unwrap_or(self.options.extension_amount);
                self.sink.emit(EventKind::ContinuationResolved {
                    request_id,
                    approved: true,
                    extension: Some(granted),
                });
                state.iteration_cap += granted;
                Ok(true)
            }
            Ok(_) => {
                self.sink.emit(EventKind::ContinuationResolved {
                    request_id,
                    approved: false,
                    extension: None,
                });
                Ok(false)
            }
            Err(WaitError::TimedOut) => {
                self.sink.emit(EventKind::ContinuationResolved {
                    request_id,
                    approved: false,
                    extension: None,
                });
                Ok(false)
            }
            Err(WaitError::Cancelled) => Err(AgentError::Cancelled),
        }
    }

    /// Run the reducer between iterations and persist the shrunk thread.
    async fn maybe_reduce(&self, state: &mut LoopState, reducer: &Reducer) -> Result<()> {
        let (messages, estimate) =
            self.thread.read(|t| (t.messages().to_vec(), t.token_estimate()));
        state.reduction_in_progress = true;
        let outcome = reducer.maybe_reduce(&messages, estimate).await;
        state.reduction_in_progress = false;
        let Some(outcome) = outcome else {
            return Ok(());
        };

        self.thread.write(|t| t.replace_messages(outcome.messages));
        state.working_len = outcome.to;
        self.sink.emit(EventKind::HistoryReduced {
            from: outcome.from,
            to: outcome.to,
            strategy: outcome.strategy.to_owned(),
        });
        self.sync_state(state);
        if self.options.checkpoint_frequency.is_enabled() {
            self.save_checkpoint(state.iteration, Some(state)).await?;
        }
        Ok(())
    }

    /// Tool calls of the thread's trailing assistant message when their
    /// results have not been appended yet.
    fn open_tool_calls(&self) -> Option<Vec<ToolCall>> {
        self.thread.read(|t| {
            let last = t.messages().last()?;
            if last.role == Role::Assistant && last.has_tool_calls() {
                Some(last.tool_calls().into_iter().cloned().collect())
            } else {
                None
            }
        })
    }

    /// Resume from the thread's loop state, or append the input messages
    /// and start fresh.
    fn init_state(&self) -> Result<LoopState> {
        self.thread.write(|t| {
            if let Some(existing) = t.loop_state().cloned() {
                existing
                    .validate(t.messages())
                    .map_err(AgentError::corrupt_checkpoint)?;
                let mut state = existing;
                state.termination = None;
                debug!(iteration = state.iteration, "Resuming from loop state");
                Ok(state)
            } else {
                t.add_messages(self.new_messages.clone());
                let mut state = LoopState::new(self.options.iteration_cap);
                state.working_len = t.message_count();
                t.set_loop_state(state.clone());
                Ok(state)
            }
        })
    }

    fn build_dispatcher(&self) -> ToolDispatcher {
        let mut chain: Vec<Arc<dyn ToolFilter>> = Vec::with_capacity(self.filters.tool.len() + 2);
        chain.push(Arc::new(PermissionFilter::new(
            self.caps.permission_store.clone(),
            self.options.session_id.clone().unwrap_or_default(),
            self.options.conversation_id.clone().unwrap_or_default(),
            self.options.messages.permission_denied.clone(),
        )));
        chain.push(Arc::new(ClarificationFilter::new(
            self.options.messages.clarification_timeout.clone(),
        )));
        chain.extend(self.filters.tool.iter().cloned());

        ToolDispatcher::new(
            chain,
            Arc::clone(&self.caps.registry),
            RetryPolicy {
                max_retries: self.options.max_retries,
                base_delay: self.options.retry_base_delay,
            },
            self.options.per_call_timeout,
            self.options.terminate_on_unknown_call,
            self.options.messages.clone(),
            self.cancel.clone(),
            Arc::clone(&self.run),
        )
    }

    fn sync_state(&self, state: &LoopState) {
        self.thread.write(|t| t.set_loop_state(state.clone()));
    }

    /// Persist a snapshot and emit `CheckpointSaved` once it is durable.
    /// Transient store failures are logged and skipped.
    async fn save_checkpoint(&self, iteration: u32, state: Option<&LoopState>) -> Result<()> {
        let Some(store) = &self.caps.thread_store else {
            return Ok(());
        };
        if let Some(state) = state {
            self.sync_state(state);
        }
        let mut snapshot = self.thread.snapshot();
        snapshot.conversation_id = self.options.conversation_id.clone();

        match store
            .save_snapshot(snapshot, self.options.checkpoint_frequency.retains_history())
            .await
        {
            Ok(checkpoint_id) => {
                self.sink.emit(EventKind::CheckpointSaved {
                    iteration,
                    checkpoint_id,
                });
                Ok(())
            }
            Err(StoreError::Transient(message)) => {
                warn!(message, "Transient checkpoint failure; continuing");
                Ok(())
            }
            Err(StoreError::Durable(message)) => Err(AgentError::CheckpointFailure { message }),
        }
    }

    async fn post_invoke(
        &self,
        request: &[Message],
        response: Option<&Message>,
        error: Option<&AgentError>,
    ) {
        for filter in &self.filters.post_invoke {
            filter.after(request, response, error).await;
        }
    }

    async fn on_turn(&self, turn: &[Message]) {
        for filter in &self.filters.turn {
            filter.on_turn(turn).await;
        }
    }
}
