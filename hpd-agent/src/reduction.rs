//! History reduction: keep the working messages within a budget without
//! losing semantic context.
//!
//! Reduction runs between iterations, never mid-iteration. The first
//! system message is preserved across every reduction. Trigger
//! precedence for token budgets: context-window percentage, then
//! absolute token budget; message-count policies trigger on count.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::chat::{ChatClient, ChatRequest};
use crate::message::{ContentPart, Message, Role};

/// Marker key set on synthetic summary messages.
pub const SUMMARY_METADATA_KEY: &str = "summary";

const SUMMARIZER_INSTRUCTIONS: &str = "You condense conversation history. Produce a compact \
summary of the following conversation that preserves facts, decisions, tool results, and open \
questions. Reply with the summary only.";

/// Which reduction policy is in force.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryReductionPolicy {
    /// Never reduce.
    #[default]
    Off,
    /// Trigger on message count; keep the first system message plus the
    /// most recent messages.
    MessageCount,
    /// Trigger on message count; condense the oldest non-system prefix
    /// into one synthetic summary message.
    Summarizing,
    /// Trigger on estimated tokens; summarize when a summarizer client
    /// is available, trim otherwise.
    TokenBudget,
}

/// Reduction configuration carried in the run options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReductionConfig {
    /// The policy in force.
    pub policy: HistoryReductionPolicy,
    /// Target message count (count policies) or token count
    /// (`TokenBudget`) after reduction.
    pub target: usize,
    /// Extra count allowed beyond the target before triggering.
    pub threshold: usize,
    /// Context window size in tokens, enabling the percentage trigger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
    /// Fraction of the context window that triggers reduction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_fraction: Option<f32>,
    /// Layered summaries: keep earlier summary messages instead of
    /// folding them into each new summary.
    pub layered: bool,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            policy: HistoryReductionPolicy::Off,
            target: 40,
            threshold: 10,
            context_window: None,
            context_fraction: None,
            layered: false,
        }
    }
}

impl ReductionConfig {
    /// A disabled configuration.
    #[must_use]
    pub fn off() -> Self {
        Self::default()
    }

    /// Message-count trimming.
    #[must_use]
    pub fn message_count(target: usize, threshold: usize) -> Self {
        Self {
            policy: HistoryReductionPolicy::MessageCount,
            target,
            threshold,
            ..Self::default()
        }
    }

    /// Summarizing reduction on message count.
    #[must_use]
    pub fn summarizing(target: usize, threshold: usize) -> Self {
        Self {
            policy: HistoryReductionPolicy::Summarizing,
            target,
            threshold,
            ..Self::default()
        }
    }

    /// Token-budget-triggered reduction.
    #[must_use]
    pub fn token_budget(target_tokens: usize, threshold_tokens: usize) -> Self {
        Self {
            policy: HistoryReductionPolicy::TokenBudget,
            target: target_tokens,
            threshold: threshold_tokens,
            ..Self::default()
        }
    }
}

/// Result of one reduction pass.
#[derive(Debug, Clone)]
pub(crate) struct ReductionOutcome {
    pub from: usize,
    pub to: usize,
    pub strategy: &'static str,
    pub messages: Vec<Message>,
}

/// Returns `true` if the message carries the summary marker.
#[must_use]
pub fn is_summary(message: &Message) -> bool {
    message
        .metadata
        .get(SUMMARY_METADATA_KEY)
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

pub(crate) struct Reducer {
    config: ReductionConfig,
    summarizer: Option<Arc<dyn ChatClient>>,
}

impl Reducer {
    pub(crate) fn new(config: ReductionConfig, summarizer: Option<Arc<dyn ChatClient>>) -> Self {
        Self { config, summarizer }
    }

    /// Run a reduction if the policy triggers, returning the replacement
    /// message list.
    pub(crate) async fn maybe_reduce(
        &self,
        messages: &[Message],
        token_estimate: u64,
    ) -> Option<ReductionOutcome> {
        match self.config.policy {
            HistoryReductionPolicy::Off => None,
            HistoryReductionPolicy::MessageCount => {
                if messages.len() <= self.config.target + self.config.threshold {
                    return None;
                }
                Some(self.trim_by_count(messages))
            }
            HistoryReductionPolicy::Summarizing => {
                if messages.len() <= self.config.target + self.config.threshold {
                    return None;
                }
                match self.summarize(messages).await {
                    Some(outcome) => Some(outcome),
                    None => Some(self.trim_by_count(messages)),
                }
            }
            HistoryReductionPolicy::TokenBudget => {
                if token_estimate <= self.token_trigger() {
                    return None;
                }
                if self.summarizer.is_some() {
                    if let Some(outcome) = self.summarize(messages).await {
                        return Some(outcome);
                    }
                }
                Some(self.trim_by_tokens(messages))
            }
        }
    }

    /// The token level that triggers reduction: percentage of the
    /// context window when configured, else the absolute budget plus
    /// threshold.
    fn token_trigger(&self) -> u64 {
        if let (Some(window), Some(fraction)) =
            (self.config.context_window, self.config.context_fraction)
        {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            return (window as f64 * f64::from(fraction)) as u64;
        }
        (self.config.target + self.config.threshold) as u64
    }

    fn trim_by_count(&self, messages: &[Message]) -> ReductionOutcome {
        let from = messages.len();
        let system = first_system(messages);
        let keep = self.config.target.saturating_sub(usize::from(system.is_some()));
        let tail_start = messages.len().saturating_sub(keep);
        let mut kept: Vec<Message> = Vec::with_capacity(self.config.target);
        if let Some((index, message)) = system {
            if index >= tail_start {
                // The system message already sits inside the retained tail.
                kept.extend(messages[tail_start..].iter().cloned());
                return ReductionOutcome {
                    from,
                    to: kept.len(),
                    strategy: "message_count",
                    messages: kept,
                };
            }
            kept.push(message.clone());
        }
        kept.extend(messages[tail_start..].iter().cloned());
        ReductionOutcome {
            from,
            to: kept.len(),
            strategy: "message_count",
            messages: kept,
        }
    }

    fn trim_by_tokens(&self, messages: &[Message]) -> ReductionOutcome {
        let from = messages.len();
        let target = self.config.target as u64;
        let system_index = first_system(messages).map(|(i, _)| i);

        let mut kept: Vec<Message> = Vec::new();
        let mut rest: std::collections::VecDeque<Message> = Vec::new().into();
        for (index, message) in messages.iter().enumerate() {
            if Some(index) == system_index {
                kept.push(message.clone());
            } else {
                rest.push_back(message.clone());
            }
        }

        // Drop the oldest non-system messages until the estimate fits.
        while rest.len() > 1
            && total_estimate(&kept) + rest.iter().map(Message::estimated_tokens).sum::<u64>()
                > target
        {
            rest.pop_front();
        }
        kept.extend(rest);
        ReductionOutcome {
            from,
            to: kept.len(),
            strategy: "token_budget",
            messages: kept,
        }
    }

    async fn summarize(&self, messages: &[Message]) -> Option<ReductionOutcome> {
        let summarizer = self.summarizer.as_ref()?;
        let from = messages.len();
        let system = first_system(messages);
        let system_index = system.map(|(i, _)| i);

        let keep = match self.config.policy {
            HistoryReductionPolicy::TokenBudget => {
                // Retain the most recent messages fitting half the budget.
                suffix_within_tokens(messages, (self.config.target / 2) as u64)
            }
            _ => self.config.target.saturating_sub(2),
        };
        let tail_start = messages.len().saturating_sub(keep.max(1));

        let mut retained_summaries: Vec<Message> = Vec::new();
        let mut to_condense: Vec<&Message> = Vec::new();
        for (index, message) in messages[..tail_start].iter().enumerate() {
            if Some(index) == system_index {
                continue;
            }
            if self.config.layered && is_summary(message) {
                retained_summaries.push(message.clone());
            } else {
                to_condense.push(message);
            }
        }
        if to_condense.is_empty() {
            return None;
        }

        let request = ChatRequest::new(vec![
            Message::system(SUMMARIZER_INSTRUCTIONS),
            Message::user(render_for_summary(&to_condense)),
        ]);
        let summary_text = match summarizer.complete(request).await {
            Ok(response) => response.message.text_content().unwrap_or_default(),
            Err(err) => {
                tracing::warn!(error = %err, "Summarizer call failed; skipping reduction");
                return None;
            }
        };
        if summary_text.is_empty() {
            return None;
        }

        let summary =
            Message::system(summary_text).with_metadata(SUMMARY_METADATA_KEY, json!(true));

        let mut kept: Vec<Message> = Vec::new();
        if let Some((index, message)) = system
            && index < tail_start
        {
            kept.push(message.clone());
        }
        kept.extend(retained_summaries);
        kept.push(summary);
        kept.extend(messages[tail_start..].iter().cloned());

        Some(ReductionOutcome {
            from,
            to: kept.len(),
            strategy: "summarizing",
            messages: kept,
        })
    }
}

fn first_system(messages: &[Message]) -> Option<(usize, &Message)> {
    messages
        .iter()
        .enumerate()
        .find(|(_, m)| m.role == Role::System)
}

fn total_estimate(messages: &[Message]) -> u64 {
    messages.iter().map(Message::estimated_tokens).sum()
}

/// Number of trailing messages whose combined estimate fits the budget.
fn suffix_within_tokens(messages: &[Message], budget: u64) -> usize {
    let mut total = 0;
    let mut count = 0;
    for message in messages.iter().rev() {
        total += message.estimated_tokens();
        if total > budget {
            break;
        }
        count += 1;
    }
    count.max(1)
}

fn render_for_summary(messages: &[&Message]) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str(message.role.as_str());
        out.push_str(": ");
        if let Some(text) = message.text_content() {
            out.push_str(&text);
        }
        for part in &message.parts {
            match part {
                ContentPart::ToolRequest { call } => {
                    out.push_str(&format!("[called {}({})]", call.name, call.arguments));
                }
                ContentPart::ToolResult { call_id, output } => {
                    out.push_str(&format!("[result for {call_id}: {}]", output.value));
                }
                _ => {}
            }
        }
        out.push('\n');
    }
    out
}
