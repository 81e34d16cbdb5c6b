//! Backlog document (`prd.json`) and its persistence.
//!
//! The document is produced by external tooling, so unknown fields are kept
//! verbatim and written back untouched. The orchestrator never saves a whole
//! stale copy: [`Backlog::write_story_fields`] reloads the file and applies a
//! [`StoryPatch`] holding only the fields the loop changed, so edits made
//! while an agent was running survive.

pub mod graph;

pub use graph::{BacklogSummary, CommandOutcome, StoryGraph, COMPLETION_NOTE};

use crate::cascade::EscalationAttempt;
use crate::error::{NightwatchError, Result};
use crate::io;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStory {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// 0 is the highest priority.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
    #[serde(default)]
    pub notes: String,
    /// Execution history, written once a cascade is terminal.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<EscalationAttempt>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserStory {
    pub fn new(id: impl Into<String>, title: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            priority,
            passes: false,
            skipped: false,
            dependencies: None,
            notes: String::new(),
            attempts: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = Some(deps.into_iter().map(Into::into).collect());
        self
    }

    pub fn deps(&self) -> &[String] {
        self.dependencies.as_deref().unwrap_or(&[])
    }

    /// Append a timestamped audit line to `notes`.
    pub fn append_note(&mut self, note: &str) {
        if !self.notes.is_empty() && !self.notes.ends_with('\n') {
            self.notes.push('\n');
        }
        let ts = crate::queue::store::format_timestamp(chrono::Utc::now());
        self.notes.push_str(&format!("[{ts}] {note}"));
    }
}

/// Loop-made changes to one story. Unset fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoryPatch {
    pub priority: Option<u32>,
    pub passes: Option<bool>,
    pub skipped: Option<bool>,
    /// Appended to the stored notes as a timestamped line.
    pub note: Option<String>,
    /// Appended to the stored attempt history.
    pub attempts: Vec<EscalationAttempt>,
}

impl StoryPatch {
    pub fn skipped(note: impl Into<String>) -> Self {
        Self {
            skipped: Some(true),
            note: Some(note.into()),
            ..Self::default()
        }
    }

    pub fn prioritized(priority: u32, note: impl Into<String>) -> Self {
        Self {
            priority: Some(priority),
            note: Some(note.into()),
            ..Self::default()
        }
    }

    pub fn apply(&self, story: &mut UserStory) {
        if let Some(priority) = self.priority {
            story.priority = priority;
        }
        if let Some(passes) = self.passes {
            story.passes = passes;
        }
        if let Some(skipped) = self.skipped {
            story.skipped = skipped;
        }
        if let Some(note) = &self.note {
            story.append_note(note);
        }
        story.attempts.extend_from_slice(&self.attempts);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backlog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub user_stories: Vec<UserStory>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Backlog {
    pub fn new(name: impl Into<String>, stories: Vec<UserStory>) -> Self {
        Self {
            name: Some(name.into()),
            description: None,
            branch_name: None,
            user_stories: stories,
            extra: Map::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(NightwatchError::BacklogNotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut data = serde_json::to_string_pretty(self)?;
        data.push('\n');
        io::atomic_write(path, data.as_bytes())
    }

    /// Reload the document at `path` and apply `patch` to the story `id`.
    pub fn write_story_fields(path: &Path, id: &str, patch: &StoryPatch) -> Result<()> {
        let mut on_disk = Self::load(path)?;
        let target = on_disk
            .user_stories
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| NightwatchError::StoryNotFound(id.to_string()))?;
        patch.apply(target);
        on_disk.save(path)
    }

    pub fn story(&self, id: &str) -> Option<&UserStory> {
        self.user_stories.iter().find(|s| s.id == id)
    }

    pub fn into_graph(self) -> StoryGraph {
        StoryGraph::new(self.user_stories)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PRD: &str = r#"{
  "name": "checkout",
  "branchName": "feat/checkout",
  "userStories": [
    {
      "id": "US-001",
      "title": "Cart model",
      "description": "Persist carts",
      "acceptanceCriteria": ["carts survive restart"],
      "priority": 1,
      "passes": false,
      "notes": "",
      "estimate": "S"
    },
    {
      "id": "US-002",
      "title": "Checkout API",
      "priority": 2,
      "dependencies": ["US-001"]
    }
  ],
  "generator": "prd-writer"
}"#;

    #[test]
    fn load_keeps_unknown_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prd.json");
        std::fs::write(&path, PRD).unwrap();

        let backlog = Backlog::load(&path).unwrap();
        assert_eq!(backlog.branch_name.as_deref(), Some("feat/checkout"));
        assert_eq!(backlog.user_stories.len(), 2);
        assert_eq!(backlog.user_stories[0].extra["estimate"], "S");
        assert_eq!(backlog.extra["generator"], "prd-writer");
        assert!(backlog.user_stories[0].dependencies.is_none());
        assert_eq!(backlog.user_stories[1].deps(), ["US-001".to_string()]);

        backlog.save(&path).unwrap();
        let reloaded = Backlog::load(&path).unwrap();
        assert_eq!(reloaded, backlog);
    }

    #[test]
    fn missing_backlog_is_reported_with_path() {
        let dir = TempDir::new().unwrap();
        let err = Backlog::load(&dir.path().join("prd.json")).unwrap_err();
        assert!(matches!(err, NightwatchError::BacklogNotFound(p) if p.ends_with("prd.json")));
    }

    #[test]
    fn write_story_fields_preserves_external_edits() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prd.json");
        std::fs::write(&path, PRD).unwrap();

        // Someone edits the story while the loop is busy with it.
        let mut external = Backlog::load(&path).unwrap();
        external.user_stories[0].title = "Cart model v2".into();
        external.user_stories[0].priority = 7;
        external.user_stories[0].notes = "check with design".into();
        external.save(&path).unwrap();

        let patch = StoryPatch {
            passes: Some(true),
            note: Some("completed".into()),
            ..StoryPatch::default()
        };
        Backlog::write_story_fields(&path, "US-001", &patch).unwrap();

        let merged = &Backlog::load(&path).unwrap().user_stories[0];
        assert_eq!(merged.title, "Cart model v2");
        assert_eq!(merged.priority, 7);
        assert!(merged.passes);
        assert!(!merged.skipped);
        assert!(merged.notes.starts_with("check with design\n["));
        assert!(merged.notes.ends_with("completed"));
    }

    #[test]
    fn patch_touches_only_set_fields() {
        let mut story = UserStory::new("US-1", "t", 3);
        story.passes = true;
        StoryPatch::skipped("Skipped via queue command").apply(&mut story);
        assert!(story.skipped);
        assert!(story.passes);
        assert_eq!(story.priority, 3);

        StoryPatch::prioritized(0, "promoted").apply(&mut story);
        assert_eq!(story.priority, 0);
        assert_eq!(story.notes.lines().count(), 2);
    }

    #[test]
    fn write_story_fields_unknown_story() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prd.json");
        std::fs::write(&path, PRD).unwrap();
        let err = Backlog::write_story_fields(&path, "US-404", &StoryPatch::default()).unwrap_err();
        assert!(matches!(err, NightwatchError::StoryNotFound(_)));
    }

    #[test]
    fn append_note_separates_lines() {
        let mut story = UserStory::new("US-1", "t", 0);
        story.append_note("first");
        story.append_note("second");
        assert_eq!(story.notes.lines().count(), 2);
        assert!(story.notes.lines().nth(1).unwrap().ends_with("second"));
    }
}
