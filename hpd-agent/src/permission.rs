//! Interactive middleware: permission checks and user clarification.
//!
//! Both are bidirectional tool filters: they emit a request event,
//! block on the response waiter, and resume when the external responder
//! answers (or the wait times out, which counts as denial).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{AgentError, Result};
use crate::event::EventKind;
use crate::filter::{FilterContext, Next, ToolFilter};
use crate::message::ToolOutput;
use crate::store::PermissionStore;
use crate::tool::ToolDescriptor;
use crate::waiter::{FilterResponse, WaitError, WaiterHandle};

/// Name of the built-in clarification function the model may call.
pub const CLARIFICATION_FUNCTION: &str = "ask_user";

/// Responder decision for one permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionChoice {
    /// Approve this call only.
    AllowOnce,
    /// Deny this call only.
    DenyOnce,
    /// Approve and remember for the scope.
    AlwaysAllow,
    /// Deny and remember for the scope.
    AlwaysDeny,
}

impl PermissionChoice {
    /// Returns `true` for the approving choices.
    #[must_use]
    pub const fn approves(&self) -> bool {
        matches!(self, Self::AllowOnce | Self::AlwaysAllow)
    }

    /// Returns `true` for the persistent choices.
    #[must_use]
    pub const fn is_persistent(&self) -> bool {
        matches!(self, Self::AlwaysAllow | Self::AlwaysDeny)
    }
}

/// Scope a persisted permission decision covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionScope {
    /// This call only; never persisted.
    Once,
    /// The owning conversation.
    Conversation,
    /// The whole session.
    Session,
}

/// Built-in outermost filter gating permission-requiring functions.
pub(crate) struct PermissionFilter {
    store: Option<Arc<dyn PermissionStore>>,
    session_id: String,
    conversation_id: String,
    denial_message: String,
    // Run-local fallback so Always* choices stick even without a store.
    run_cache: Mutex<HashMap<String, PermissionChoice>>,
}

impl PermissionFilter {
    pub(crate) fn new(
        store: Option<Arc<dyn PermissionStore>>,
        session_id: impl Into<String>,
        conversation_id: impl Into<String>,
        denial_message: impl Into<String>,
    ) -> Self {
        Self {
            store,
            session_id: session_id.into(),
            conversation_id: conversation_id.into(),
            denial_message: denial_message.into(),
            run_cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, function: &str) -> Option<PermissionChoice> {
        match self.run_cache.lock() {
            Ok(cache) => cache.get(function).copied(),
            Err(poisoned) => poisoned.into_inner().get(function).copied(),
        }
    }

    fn cache(&self, function: &str, choice: PermissionChoice) {
        match self.run_cache.lock() {
            Ok(mut cache) => {
                cache.insert(function.to_owned(), choice);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(function.to_owned(), choice);
            }
        }
    }

    async fn stored_choice(&self, function: &str) -> Option<PermissionChoice> {
        if let Some(choice) = self.cached(function) {
            return Some(choice);
        }
        let store = self.store.as_ref()?;
        for (scope, scope_id) in [
            (PermissionScope::Session, self.session_id.as_str()),
            (PermissionScope::Conversation, self.conversation_id.as_str()),
        ] {
            match store.lookup(function, scope, scope_id).await {
                Ok(Some(choice)) => return Some(choice),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(function, error = %err, "Permission store lookup failed");
                }
            }
        }
        None
    }

    async fn persist(&self, function: &str, choice: PermissionChoice) {
        self.cache(function, choice);
        if let Some(store) = &self.store {
            if let Err(err) = store
                .record(function, PermissionScope::Session, &self.session_id, choice)
                .await
            {
                tracing::warn!(function, error = %err, "Permission store record failed");
            }
        }
    }

    fn deny(&self, ctx: &mut FilterContext) {
        ctx.set_result(ToolOutput::error(self.denial_message.clone()));
    }
}

#[async_trait]
impl ToolFilter for PermissionFilter {
    fn name(&self) -> &str {
        "permission"
    }

    async fn invoke(&self, ctx: &mut FilterContext, next: Next<'_>) -> Result<()> {
        let requires = ctx
            .descriptor
            .as_ref()
            .is_some_and(|d| d.requires_permission);
        if !requires {
            return next.run(ctx).await;
        }

        let function = ctx.call.name.clone();
        if let Some(choice) = self.stored_choice(&function).await {
            if choice.approves() {
                return next.run(ctx).await;
            }
            self.deny(ctx);
            return Ok(());
        }

        let request_id = WaiterHandle::new_request_id();
        let pending = ctx.waiters().register(&request_id);
        ctx.events().emit(EventKind::PermissionRequested {
            request_id: request_id.clone(),
            function: function.clone(),
            arguments: ctx.call.arguments.clone(),
        });

        match pending.wait().await {
            Ok(FilterResponse::Permission {
                approved,
                reason,
                choice,
            }) => {
                ctx.events().emit(EventKind::PermissionResolved {
                    request_id,
                    approved,
                    reason,
                });
                if choice.is_persistent() {
                    self.persist(&function, choice).await;
                }
                if approved && choice.approves() {
                    next.run(ctx).await
                } else {
                    self.deny(ctx);
                    Ok(())
                }
            }
            Ok(other) => {
                tracing::warn!(function, response = ?other, "Mistyped permission response; denying");
                ctx.events().emit(EventKind::PermissionResolved {
                    request_id,
                    approved: false,
                    reason: Some("mistyped response".to_owned()),
                });
                self.deny(ctx);
                Ok(())
            }
            Err(WaitError::TimedOut) => {
                ctx.events().emit(EventKind::PermissionResolved {
                    request_id,
                    approved: false,
                    reason: Some("request timed out".to_owned()),
                });
                self.deny(ctx);
                Ok(())
            }
            Err(WaitError::Cancelled) => Err(AgentError::Cancelled),
        }
    }
}

/// Descriptor of the built-in clarification function, appended to the
/// model's tool catalog by the driver.
#[must_use]
pub fn clarification_descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        CLARIFICATION_FUNCTION,
        "Ask the user a direct question and wait for their reply.",
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The question to ask the user."
                }
            },
            "required": ["prompt"]
        }),
    )
}

/// Built-in filter serving [`CLARIFICATION_FUNCTION`] calls.
pub(crate) struct ClarificationFilter {
    timeout_message: String,
}

impl ClarificationFilter {
    pub(crate) fn new(timeout_message: impl Into<String>) -> Self {
        Self {
            timeout_message: timeout_message.into(),
        }
    }
}

#[async_trait]
impl ToolFilter for ClarificationFilter {
    fn name(&self) -> &str {
        "clarification"
    }

    async fn invoke(&self, ctx: &mut FilterContext, next: Next<'_>) -> Result<()> {
        if ctx.call.name != CLARIFICATION_FUNCTION {
            return next.run(ctx).await;
        }

        let prompt = ctx
            .call
            .arguments
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        let request_id = WaiterHandle::new_request_id();
        let pending = ctx.waiters().register(&request_id);
        ctx.events().emit(EventKind::ClarificationRequested {
            request_id: request_id.clone(),
            prompt,
        });

        match pending.wait().await {
            Ok(FilterResponse::Clarification { reply }) => {
                ctx.events().emit(EventKind::ClarificationResolved {
                    request_id,
                    reply: reply.clone(),
                });
                ctx.set_result(ToolOutput::ok(Value::String(reply)));
                Ok(())
            }
            Ok(other) => {
                tracing::warn!(response = ?other, "Mistyped clarification response");
                ctx.set_result(ToolOutput::error(self.timeout_message.clone()));
                Ok(())
            }
            Err(WaitError::TimedOut) => {
                ctx.set_result(ToolOutput::error(self.timeout_message.clone()));
                Ok(())
            }
            Err(WaitError::Cancelled) => Err(AgentError::Cancelled),
        }
    }
}
