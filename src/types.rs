//! Shared data types for the subscription engines
//!
//! Small plain-data types that flow between the polling engines and the
//! presentation layer: time-series samples, cached evaluation outcomes, and
//! the refresh events consumers drain at their own cadence.

use serde::{Deserialize, Serialize};

/// A single time-series sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Timestamp in milliseconds on the manager's clock
    pub at_ms: u64,
    /// Sampled numeric value (always finite; non-finite results are discarded
    /// before a sample is recorded)
    pub value: f64,
}

impl Sample {
    /// Create a new sample
    pub fn new(at_ms: u64, value: f64) -> Self {
        Self { at_ms, value }
    }
}

/// Latest outcome of evaluating a subscribed expression
///
/// A failed evaluation replaces the previous value; partial failure of one
/// expression never affects the others in the same poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvalOutcome {
    /// The expression evaluated to this textual value
    Value(String),
    /// The evaluation failed with this error message
    Error(String),
}

impl EvalOutcome {
    /// The value text, if the last evaluation succeeded
    pub fn value(&self) -> Option<&str> {
        match self {
            EvalOutcome::Value(v) => Some(v),
            EvalOutcome::Error(_) => None,
        }
    }

    /// The error text, if the last evaluation failed
    pub fn error(&self) -> Option<&str> {
        match self {
            EvalOutcome::Value(_) => None,
            EvalOutcome::Error(e) => Some(e),
        }
    }
}

/// Notification that a subscription engine has new data to display
///
/// Pushed into a crossbeam channel exactly once per effective poll or
/// disconnect-triggered clear, regardless of how many entries changed.
/// Consumers drain the channel and query the snapshot methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshEvent {
    /// The expression monitor's cached results changed
    Watches,
    /// The plot/scope manager's series changed
    Scope,
}
