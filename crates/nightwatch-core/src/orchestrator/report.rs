use crate::backlog::BacklogSummary;
use crate::cascade::EscalationAttempt;
use crate::progress::RunStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a loop run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    /// Every story passes.
    Complete,
    /// Stopped by `[ABORT]` or by answering abort at a pause.
    Aborted,
    /// Nothing eligible: the rest is skipped or waiting on skipped work.
    Idle,
    /// A cascade exhausted its attempts, or every executor is rate limited.
    Blocked,
    /// `max_iterations` reached.
    Exhausted,
}

impl LoopStatus {
    /// Complete, aborted and idle are clean stops; the rest need attention.
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            LoopStatus::Complete | LoopStatus::Aborted | LoopStatus::Idle
        )
    }
}

impl From<LoopStatus> for RunStatus {
    fn from(status: LoopStatus) -> Self {
        match status {
            LoopStatus::Complete => RunStatus::Complete,
            LoopStatus::Aborted => RunStatus::Aborted,
            LoopStatus::Idle => RunStatus::Idle,
            LoopStatus::Blocked => RunStatus::Blocked,
            LoopStatus::Exhausted => RunStatus::Exhausted,
        }
    }
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", RunStatus::from(*self))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BlockedReason {
    /// The story's cascade used every attempt without success.
    Exhausted {
        story_id: String,
        attempts: Vec<EscalationAttempt>,
    },
    /// Every executor is limited and waiting was not allowed or too long.
    RateLimited {
        earliest_reset: Option<DateTime<Utc>>,
    },
}

impl std::fmt::Display for BlockedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockedReason::Exhausted { story_id, attempts } => write!(
                f,
                "story '{story_id}' failed after {} attempt(s)",
                attempts.len()
            ),
            BlockedReason::RateLimited {
                earliest_reset: Some(at),
            } => write!(f, "all executors rate limited until {}", at.to_rfc3339()),
            BlockedReason::RateLimited {
                earliest_reset: None,
            } => f.write_str("no executor available"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopReport {
    pub status: LoopStatus,
    pub iterations: u32,
    pub total_cost: f64,
    pub summary: BacklogSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked: Option<BlockedReason>,
    /// Queue warnings and rejected commands seen during the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notices: Vec<String>,
    /// Guidance drained but never sent to an agent, put back on the queue.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requeued_guidance: Vec<String>,
}
