//! Token usage accounting.

use serde::{Deserialize, Serialize};

/// Provider-reported token usage for a single model response, and the
/// unit of accumulation for whole-run totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u64,
    /// Tokens produced by the completion.
    pub completion_tokens: u64,
    /// Total tokens (prompt + completion).
    pub total_tokens: u64,
}

impl Usage {
    /// Create a usage record; the total is derived.
    #[must_use]
    pub const fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// An all-zero usage record.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        }
    }

    /// Returns `true` if no tokens have been recorded.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total_tokens == 0
    }
}

impl std::ops::Add for Usage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_derives_total() {
        let usage = Usage::new(100, 50);
        assert_eq!(usage.total_tokens, 150);
    }

    #[test]
    fn add_assign_accumulates() {
        let mut total = Usage::zero();
        total += Usage::new(10, 5);
        total += Usage::new(20, 15);
        assert_eq!(total.prompt_tokens, 30);
        assert_eq!(total.completion_tokens, 20);
        assert_eq!(total.total_tokens, 50);
    }

    #[test]
    fn zero_is_empty() {
        assert!(Usage::zero().is_empty());
        assert!(!Usage::new(1, 0).is_empty());
    }
}
