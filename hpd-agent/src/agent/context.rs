//! Typed per-run context.
//!
//! Replaces implicit ambient state: tools and filters that need to know
//! which run, thread, conversation, or project they serve receive this
//! value explicitly through their [`FilterContext`](crate::filter::FilterContext).

use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// References and user data for one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: Uuid,
    thread_id: Uuid,
    conversation_id: Option<String>,
    project: Option<String>,
    data: HashMap<String, Value>,
}

impl RunContext {
    pub(crate) fn new(
        run_id: Uuid,
        thread_id: Uuid,
        conversation_id: Option<String>,
        project: Option<String>,
        data: HashMap<String, Value>,
    ) -> Self {
        Self {
            run_id,
            thread_id,
            conversation_id,
            project,
            data,
        }
    }

    /// The run id.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The thread being driven.
    #[must_use]
    pub const fn thread_id(&self) -> Uuid {
        self.thread_id
    }

    /// The owning conversation, when known.
    #[must_use]
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// The owning project, when known.
    #[must_use]
    pub fn project(&self) -> Option<&str> {
        self.project.as_deref()
    }

    /// User-supplied run data.
    #[must_use]
    pub fn data(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accessors_reflect_construction() {
        let run_id = Uuid::new_v4();
        let thread_id = Uuid::new_v4();
        let ctx = RunContext::new(
            run_id,
            thread_id,
            Some("conv-1".into()),
            None,
            HashMap::from([("tenant".to_owned(), json!("acme"))]),
        );
        assert_eq!(ctx.run_id(), run_id);
        assert_eq!(ctx.thread_id(), thread_id);
        assert_eq!(ctx.conversation_id(), Some("conv-1"));
        assert!(ctx.project().is_none());
        assert_eq!(ctx.data("tenant"), Some(&json!("acme")));
    }
}
