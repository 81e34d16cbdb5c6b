use crate::error::Result;
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

const HISTORY_LIMIT: usize = 200;

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Complete,
    Aborted,
    Blocked,
    Exhausted,
    Idle,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Complete => "complete",
            RunStatus::Aborted => "aborted",
            RunStatus::Blocked => "blocked",
            RunStatus::Exhausted => "exhausted",
            RunStatus::Idle => "idle",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub story_id: String,
    pub executor: String,
    pub model: String,
    pub outcome: String,
    #[serde(default)]
    pub cost_usd: f64,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// RunProgress
// ---------------------------------------------------------------------------

/// Progress of the current (or last) orchestrator run, persisted to
/// `.nightwatch/progress.yaml` after every iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_story: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub history: Vec<IterationRecord>,
}

impl RunProgress {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: now,
            last_updated: now,
            iteration: 0,
            current_story: None,
            status: RunStatus::Running,
            total_cost_usd: 0.0,
            reason: None,
            history: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// `None` if no run has been recorded yet.
    pub fn load(root: &Path) -> Result<Option<Self>> {
        let path = paths::progress_path(root);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(Some(serde_yaml::from_str(&data)?))
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::progress_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub fn begin_iteration(&mut self, story_id: &str, now: DateTime<Utc>) {
        self.iteration += 1;
        self.current_story = Some(story_id.to_string());
        self.status = RunStatus::Running;
        self.last_updated = now;
    }

    pub fn record(&mut self, record: IterationRecord) {
        self.total_cost_usd += record.cost_usd;
        self.last_updated = record.timestamp;
        self.history.push(record);
        if self.history.len() > HISTORY_LIMIT {
            self.history.drain(..self.history.len() - HISTORY_LIMIT);
        }
    }

    pub fn set_status(&mut self, status: RunStatus, reason: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.reason = reason;
        if status != RunStatus::Running && status != RunStatus::Paused {
            self.current_story = None;
        }
        self.last_updated = now;
    }

    pub fn last_record(&self) -> Option<&IterationRecord> {
        self.history.last()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
