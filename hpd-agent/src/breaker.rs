//! Same-call repetition detector.
//!
//! Counts invocations per (function, canonical argument fingerprint)
//! across iterations of one run. The fingerprint normalizes argument
//! ordering so `{"a":1,"b":2}` and `{"b":2,"a":1}` collide.

use serde_json::Value;
use std::collections::BTreeMap;

/// Outcome of recording one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerVerdict {
    /// Below the threshold; the call may proceed.
    Allowed,
    /// The threshold was reached; the run must terminate.
    Tripped,
}

/// Per-run repetition counters.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    counts: BTreeMap<String, u32>,
}

impl CircuitBreaker {
    /// Create a breaker with the given threshold. A threshold of zero
    /// disables the breaker.
    #[must_use]
    pub const fn new(threshold: u32) -> Self {
        Self {
            threshold,
            counts: BTreeMap::new(),
        }
    }

    /// Rebuild a breaker from checkpointed counters.
    #[must_use]
    pub const fn from_counts(threshold: u32, counts: BTreeMap<String, u32>) -> Self {
        Self { threshold, counts }
    }

    /// The current counters, for checkpointing.
    #[must_use]
    pub const fn counts(&self) -> &BTreeMap<String, u32> {
        &self.counts
    }

    /// Record one invocation and report whether it tripped the breaker.
    pub fn record(&mut self, function: &str, arguments: &Value) -> BreakerVerdict {
        if self.threshold == 0 {
            return BreakerVerdict::Allowed;
        }
        let key = fingerprint(function, arguments);
        let count = self.counts.entry(key).or_insert(0);
        *count += 1;
        if *count >= self.threshold {
            BreakerVerdict::Tripped
        } else {
            BreakerVerdict::Allowed
        }
    }
}

/// Canonical fingerprint of a call: function name plus the arguments
/// rendered with recursively sorted object keys.
#[must_use]
pub fn fingerprint(function: &str, arguments: &Value) -> String {
    let mut out = String::with_capacity(function.len() + 16);
    out.push_str(function);
    out.push(':');
    write_canonical(arguments, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by_key(|(k, _)| k.as_str());
            out.push('{');
            for (i, (key, val)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
