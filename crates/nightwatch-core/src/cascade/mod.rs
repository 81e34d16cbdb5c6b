//! Agent fallback and escalation.
//!
//! - `limits`: per-executor rate-limit state and executor selection
//! - `escalation`: multi-attempt model escalation over one story
//!
//! The core never spawns processes itself. Everything that touches an agent
//! goes through the [`Executor`] trait, implemented by the CLI on top of
//! `agent-harness` and by scripted mocks in tests.

pub mod escalation;
pub mod limits;

pub use escalation::{
    run_cascade, CascadeOutcome, CascadeReport, EscalationPolicy, ExecutorSpec, ModelTarget,
};
pub use limits::{select_executor, AgentLimitState, Availability, RateLimits};

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    Success,
    Failure,
    RateLimited,
}

impl std::fmt::Display for AttemptResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AttemptResult::Success => "success",
            AttemptResult::Failure => "failure",
            AttemptResult::RateLimited => "rate_limited",
        };
        f.write_str(s)
    }
}

/// One executor invocation within a cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationAttempt {
    /// 1-based.
    pub attempt: u32,
    pub executor_name: String,
    pub model: String,
    pub result: AttemptResult,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Executor contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub executor: String,
    pub model: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub output: String,
    pub exit_code: i32,
    pub is_complete_signal: bool,
    pub duration_ms: u64,
    pub rate_limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<DateTime<Utc>>,
    /// 0.0 when the executor cannot report cost.
    #[serde(default)]
    pub cost_usd: f64,
}

impl ExecutionResult {
    pub fn classify(&self) -> AttemptResult {
        if self.rate_limited {
            AttemptResult::RateLimited
        } else if self.exit_code == 0 {
            AttemptResult::Success
        } else {
            AttemptResult::Failure
        }
    }
}

/// Runs one attempt against a named executor. Errors are recorded by the
/// cascade as failed attempts; they do not abort the cascade.
pub trait Executor {
    fn execute(&mut self, request: &ExecutionRequest) -> Result<ExecutionResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_prefers_rate_limit() {
        let mut r = ExecutionResult {
            exit_code: 0,
            rate_limited: true,
            ..Default::default()
        };
        assert_eq!(r.classify(), AttemptResult::RateLimited);
        r.rate_limited = false;
        assert_eq!(r.classify(), AttemptResult::Success);
        r.exit_code = 2;
        assert_eq!(r.classify(), AttemptResult::Failure);
    }

    #[test]
    fn attempt_serializes_camel_case() {
        let attempt = EscalationAttempt {
            attempt: 1,
            executor_name: "claude".into(),
            model: "sonnet".into(),
            result: AttemptResult::RateLimited,
            cost: 0.25,
            duration_ms: 1200,
        };
        let json = serde_json::to_string(&attempt).unwrap();
        assert!(json.contains("\"executorName\":\"claude\""));
        assert!(json.contains("\"result\":\"rate_limited\""));
        assert!(json.contains("\"durationMs\":1200"));
    }
}
