//! Model escalation for a single story.
//!
//! A cascade keeps invoking executors until one attempt succeeds, every
//! executor is rate limited, or `max_attempts` invocations have been made.
//! Every invocation counts as an attempt, including rate-limited ones.

use super::limits::{select_executor, Availability, RateLimits};
use super::{AttemptResult, EscalationAttempt, ExecutionRequest, Executor};
use crate::clock::Clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Targets and policy
// ---------------------------------------------------------------------------

/// A named executor with the model it runs when nothing else is asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSpec {
    pub name: String,
    pub default_model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTarget {
    pub executor: String,
    pub model: String,
}

impl ModelTarget {
    pub fn new(executor: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            executor: executor.into(),
            model: model.into(),
        }
    }

    /// The default target of `executor` within `roster`.
    pub fn default_for(executor: &str, roster: &[ExecutorSpec]) -> Option<Self> {
        roster
            .iter()
            .find(|spec| spec.name == executor)
            .map(|spec| Self::new(&spec.name, &spec.default_model))
    }

    fn qualified(&self) -> String {
        format!("{}:{}", self.executor, self.model)
    }
}

impl std::fmt::Display for ModelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.executor, self.model)
    }
}

/// `path` maps a model to the model tried after it fails. Keys and values
/// are either a bare model (`sonnet`) or `executor:model`. A value without an
/// executor keeps the current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub path: BTreeMap<String, String>,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            path: BTreeMap::new(),
        }
    }
}

impl EscalationPolicy {
    /// Where to go after `current` fails. `None` when the path ends.
    pub fn next_target(&self, current: &ModelTarget, roster: &[ExecutorSpec]) -> Option<ModelTarget> {
        let value = self
            .path
            .get(&current.qualified())
            .or_else(|| self.path.get(&current.model))?;

        // Only split on a known executor name so model ids containing ':'
        // still work.
        if let Some((exec, model)) = value.split_once(':') {
            if roster.iter().any(|spec| spec.name == exec) {
                return Some(ModelTarget::new(exec, model));
            }
        }
        Some(ModelTarget::new(&current.executor, value))
    }
}

// ---------------------------------------------------------------------------
// Cascade
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CascadeOutcome {
    Succeeded {
        target: ModelTarget,
        is_complete_signal: bool,
    },
    /// `max_attempts` invocations without success.
    Exhausted,
    /// Every executor is limited; retry after `earliest_reset`.
    RateLimited {
        earliest_reset: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CascadeReport {
    pub outcome: CascadeOutcome,
    pub attempts: Vec<EscalationAttempt>,
    pub total_cost: f64,
}

impl CascadeReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, CascadeOutcome::Succeeded { .. })
    }

    pub fn completed_story(&self) -> bool {
        matches!(
            self.outcome,
            CascadeOutcome::Succeeded {
                is_complete_signal: true,
                ..
            }
        )
    }
}

enum NextStep {
    Escalate(ModelTarget),
    /// No path entry after the current target; retry it.
    PathEnd,
    /// Every remaining path entry is on a rate-limited executor.
    Limited,
}

/// Walk the path from `from`, skipping entries whose executor is limited.
fn next_step(
    policy: &EscalationPolicy,
    from: &ModelTarget,
    roster: &[ExecutorSpec],
    limits: &RateLimits,
    now: DateTime<Utc>,
) -> NextStep {
    let Some(mut candidate) = policy.next_target(from, roster) else {
        return NextStep::PathEnd;
    };
    // A path may loop back on itself; one lap is enough.
    for _ in 0..=policy.path.len() {
        if !limits.is_limited(&candidate.executor, now) {
            return NextStep::Escalate(candidate);
        }
        tracing::info!(skipped = %candidate, "escalation target is rate limited");
        match policy.next_target(&candidate, roster) {
            Some(next) => candidate = next,
            None => break,
        }
    }
    NextStep::Limited
}

/// Run one story through the cascade starting at `initial`.
///
/// `roster` is the executor priority list used when a rate limit forces a
/// switch. `limits` is updated in place.
#[allow(clippy::too_many_arguments)]
pub fn run_cascade(
    executor: &mut dyn Executor,
    policy: &EscalationPolicy,
    roster: &[ExecutorSpec],
    initial: ModelTarget,
    prompt: &str,
    limits: &mut RateLimits,
    clock: &dyn Clock,
) -> CascadeReport {
    let names: Vec<&str> = roster.iter().map(|s| s.name.as_str()).collect();
    let mut target = initial;
    let mut attempts: Vec<EscalationAttempt> = Vec::new();

    let outcome = loop {
        if attempts.len() as u32 >= policy.max_attempts {
            tracing::warn!(attempts = attempts.len(), "escalation exhausted");
            break CascadeOutcome::Exhausted;
        }

        let attempt_no = attempts.len() as u32 + 1;
        let request = ExecutionRequest {
            executor: target.executor.clone(),
            model: target.model.clone(),
            prompt: prompt.to_string(),
        };
        tracing::info!(attempt = attempt_no, target = %target, "invoking executor");

        let started = clock.now();
        let (result, cost, duration_ms, reset_time, complete) = match executor.execute(&request) {
            Ok(res) => (
                res.classify(),
                res.cost_usd,
                res.duration_ms,
                res.reset_time,
                res.is_complete_signal,
            ),
            Err(e) => {
                tracing::warn!(target = %target, error = %e, "executor error");
                let elapsed = (clock.now() - started).num_milliseconds().max(0) as u64;
                (AttemptResult::Failure, 0.0, elapsed, None, false)
            }
        };

        attempts.push(EscalationAttempt {
            attempt: attempt_no,
            executor_name: target.executor.clone(),
            model: target.model.clone(),
            result,
            cost,
            duration_ms,
        });

        match result {
            AttemptResult::Success => {
                break CascadeOutcome::Succeeded {
                    target,
                    is_complete_signal: complete,
                };
            }
            AttemptResult::Failure => match next_step(policy, &target, roster, limits, clock.now()) {
                NextStep::Escalate(next) => {
                    tracing::info!(from = %target, to = %next, "escalating model");
                    target = next;
                }
                NextStep::PathEnd => {}
                NextStep::Limited => match select_executor(&names, None, limits, clock.now()) {
                    Availability::Available { executor: name } => {
                        target = ModelTarget::default_for(&name, roster)
                            .unwrap_or_else(|| ModelTarget::new(&name, &target.model));
                        tracing::info!(to = %target, "escalation path is rate limited, falling back");
                    }
                    Availability::Blocked { earliest_reset } => {
                        break CascadeOutcome::RateLimited { earliest_reset };
                    }
                },
            },
            AttemptResult::RateLimited => {
                limits.record(&target.executor, reset_time, clock.now());
                match select_executor(&names, None, limits, clock.now()) {
                    Availability::Available { executor: name } => {
                        target = ModelTarget::default_for(&name, roster)
                            .unwrap_or_else(|| ModelTarget::new(&name, &target.model));
                        tracing::info!(to = %target, "switching executor after rate limit");
                    }
                    Availability::Blocked { earliest_reset } => {
                        break CascadeOutcome::RateLimited { earliest_reset };
                    }
                }
            }
        }
    };

    let total_cost = attempts.iter().map(|a| a.cost).sum();
    CascadeReport {
        outcome,
        attempts,
        total_cost,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
