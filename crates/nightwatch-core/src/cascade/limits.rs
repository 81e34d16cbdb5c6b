//! Rate-limit bookkeeping for one orchestrator run.
//!
//! The map is a plain value owned by the caller and threaded through every
//! selection, so two runs never share limit state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How long a limit lasts when the executor did not say when it resets.
pub fn default_limit_window() -> Duration {
    Duration::hours(1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentLimitState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<DateTime<Utc>>,
    pub detected_at: DateTime<Utc>,
}

impl AgentLimitState {
    pub fn effective_reset(&self) -> DateTime<Utc> {
        self.reset_time
            .unwrap_or(self.detected_at + default_limit_window())
    }

    pub fn is_resolved(&self, now: DateTime<Utc>) -> bool {
        now >= self.effective_reset()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RateLimits {
    states: HashMap<String, AgentLimitState>,
}

impl RateLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or refresh) a limit for `executor`.
    pub fn record(
        &mut self,
        executor: &str,
        reset_time: Option<DateTime<Utc>>,
        detected_at: DateTime<Utc>,
    ) {
        tracing::info!(
            executor,
            reset = ?reset_time,
            "executor rate limited"
        );
        self.states.insert(
            executor.to_string(),
            AgentLimitState {
                reset_time,
                detected_at,
            },
        );
    }

    pub fn get(&self, executor: &str) -> Option<&AgentLimitState> {
        self.states.get(executor)
    }

    pub fn is_limited(&self, executor: &str, now: DateTime<Utc>) -> bool {
        self.states
            .get(executor)
            .is_some_and(|s| !s.is_resolved(now))
    }

    pub fn clear(&mut self, executor: &str) -> Option<AgentLimitState> {
        self.states.remove(executor)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Usable now: unlisted, or listed with a resolved limit (which is cleared).
    fn take_if_available(&mut self, executor: &str, now: DateTime<Utc>) -> bool {
        match self.states.get(executor) {
            None => true,
            Some(state) if state.is_resolved(now) => {
                tracing::debug!(executor, "rate limit resolved");
                self.states.remove(executor);
                true
            }
            Some(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Availability {
    Available { executor: String },
    /// Every candidate is limited. `earliest_reset` is `None` only when there
    /// were no candidates at all.
    Blocked {
        earliest_reset: Option<DateTime<Utc>>,
    },
}

/// First usable executor in `priority` order. An eligible `preferred`
/// executor wins over the list order.
pub fn select_executor<S: AsRef<str>>(
    priority: &[S],
    preferred: Option<&str>,
    limits: &mut RateLimits,
    now: DateTime<Utc>,
) -> Availability {
    if let Some(name) = preferred {
        if limits.take_if_available(name, now) {
            return Availability::Available {
                executor: name.to_string(),
            };
        }
    }

    for name in priority.iter().map(|s| s.as_ref()) {
        if limits.take_if_available(name, now) {
            return Availability::Available {
                executor: name.to_string(),
            };
        }
    }

    let earliest_reset = priority
        .iter()
        .map(|s| s.as_ref())
        .chain(preferred)
        .filter_map(|name| limits.get(name))
        .map(AgentLimitState::effective_reset)
        .min();
    Availability::Blocked { earliest_reset }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn first_unlisted_executor_wins() {
        let mut limits = RateLimits::new();
        limits.record("claude", None, t0());
        let got = select_executor(&["claude", "codex", "gemini"], None, &mut limits, t0());
        assert_eq!(
            got,
            Availability::Available {
                executor: "codex".into()
            }
        );
    }

    #[test]
    fn preferred_eligible_executor_wins() {
        let mut limits = RateLimits::new();
        let got = select_executor(&["claude", "codex"], Some("codex"), &mut limits, t0());
        assert_eq!(
            got,
            Availability::Available {
                executor: "codex".into()
            }
        );

        limits.record("codex", None, t0());
        let got = select_executor(&["claude", "codex"], Some("codex"), &mut limits, t0());
        assert_eq!(
            got,
            Availability::Available {
                executor: "claude".into()
            }
        );
    }

    #[test]
    fn limit_without_reset_resolves_after_one_hour() {
        let mut limits = RateLimits::new();
        limits.record("claude", None, t0());

        let just_before = t0() + Duration::minutes(59);
        assert!(limits.is_limited("claude", just_before));
        assert_eq!(
            select_executor(&["claude"], None, &mut limits, just_before),
            Availability::Blocked {
                earliest_reset: Some(t0() + Duration::hours(1))
            }
        );

        let after = t0() + Duration::minutes(61);
        assert_eq!(
            select_executor(&["claude"], None, &mut limits, after),
            Availability::Available {
                executor: "claude".into()
            }
        );
        assert!(limits.get("claude").is_none(), "resolved entry is cleared");
    }

    #[test]
    fn explicit_reset_time_is_honored() {
        let mut limits = RateLimits::new();
        let reset = t0() + Duration::minutes(5);
        limits.record("claude", Some(reset), t0());
        assert!(limits.is_limited("claude", t0() + Duration::minutes(4)));
        assert!(!limits.is_limited("claude", reset));
    }

    #[test]
    fn blocked_reports_earliest_reset() {
        let mut limits = RateLimits::new();
        limits.record("a", Some(t0() + Duration::minutes(30)), t0());
        limits.record("b", Some(t0() + Duration::minutes(10)), t0());
        limits.record("c", None, t0());
        assert_eq!(
            select_executor(&["a", "b", "c"], None, &mut limits, t0()),
            Availability::Blocked {
                earliest_reset: Some(t0() + Duration::minutes(10))
            }
        );
        assert_eq!(limits.len(), 3);
    }

    #[test]
    fn empty_priority_is_blocked_without_reset() {
        let mut limits = RateLimits::new();
        let empty: [&str; 0] = [];
        assert_eq!(
            select_executor(&empty, None, &mut limits, t0()),
            Availability::Blocked {
                earliest_reset: None
            }
        );
    }
}
