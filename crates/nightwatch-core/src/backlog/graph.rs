//! Dependency-aware story scheduling.
//!
//! A `StoryGraph` is an in-memory snapshot of the backlog. Every scheduling
//! decision validates the graph first: unknown dependencies and cycles are
//! fatal and are never repaired.

use super::UserStory;
use crate::cascade::EscalationAttempt;
use crate::error::{NightwatchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Audit line appended to a story when an agent completes it.
pub const COMPLETION_NOTE: &str = "Completed by agent";

/// Result of applying a SKIP or PRIORITY command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Applied { note: String },
    /// Already in the requested state; treated as success.
    Unchanged { reason: String },
    Rejected { reason: String },
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, CommandOutcome::Rejected { .. })
    }

    pub fn changed(&self) -> bool {
        matches!(self, CommandOutcome::Applied { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogSummary {
    pub total: usize,
    pub passed: usize,
    pub skipped: usize,
    /// Not done, not skipped, waiting on an unfinished dependency.
    pub blocked: usize,
    pub eligible: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct StoryGraph {
    stories: Vec<UserStory>,
    active: Option<String>,
    /// Set by `prioritize`; wins the next selection if eligible.
    preferred: Option<String>,
}

impl StoryGraph {
    pub fn new(stories: Vec<UserStory>) -> Self {
        Self {
            stories,
            active: None,
            preferred: None,
        }
    }

    pub fn stories(&self) -> &[UserStory] {
        &self.stories
    }

    pub fn story(&self, id: &str) -> Option<&UserStory> {
        self.stories.iter().find(|s| s.id == id)
    }

    fn story_mut(&mut self, id: &str) -> Option<&mut UserStory> {
        self.stories.iter_mut().find(|s| s.id == id)
    }

    /// Mark the story currently being executed; it cannot be skipped.
    pub fn set_active(&mut self, id: Option<String>) {
        self.active = id;
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for story in &self.stories {
            if !seen.insert(story.id.as_str()) {
                return Err(NightwatchError::DuplicateStory(story.id.clone()));
            }
        }
        for story in &self.stories {
            if let Some(missing) = story.deps().iter().find(|d| !seen.contains(d.as_str())) {
                return Err(NightwatchError::UnknownDependency {
                    story: story.id.clone(),
                    dependency: missing.clone(),
                });
            }
        }
        if let Some(path) = self.find_cycle() {
            return Err(NightwatchError::CircularDependency { path });
        }
        Ok(())
    }

    /// Depth-first search with explicit frames. Returns the cycle as a path
    /// that starts and ends with the same id, e.g. `[A, B, A]`.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let index: HashMap<&str, usize> = self
            .stories
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();
        let mut marks = vec![Mark::Unvisited; self.stories.len()];

        for start in 0..self.stories.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            // (story index, next dependency to visit)
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            marks[start] = Mark::OnStack;

            while let Some(&(node, next)) = stack.last() {
                let deps = self.stories[node].deps();
                if next >= deps.len() {
                    marks[node] = Mark::Done;
                    stack.pop();
                    continue;
                }
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let Some(&dep) = index.get(deps[next].as_str()) else {
                    continue;
                };
                match marks[dep] {
                    Mark::Unvisited => {
                        marks[dep] = Mark::OnStack;
                        stack.push((dep, 0));
                    }
                    Mark::OnStack => {
                        let from = stack.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                        let mut path: Vec<String> = stack[from..]
                            .iter()
                            .map(|&(n, _)| self.stories[n].id.clone())
                            .collect();
                        path.push(self.stories[dep].id.clone());
                        return Some(path);
                    }
                    Mark::Done => {}
                }
            }
        }
        None
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    fn is_eligible(&self, story: &UserStory) -> bool {
        !story.passes
            && !story.skipped
            && story
                .deps()
                .iter()
                .all(|d| self.story(d).is_some_and(|dep| dep.passes))
    }

    /// The next story to work on: smallest priority among eligible stories,
    /// ties broken by backlog order. Validates the graph first.
    pub fn next(&self) -> Result<Option<&UserStory>> {
        self.validate()?;

        if let Some(preferred) = self.preferred.as_deref().and_then(|id| self.story(id)) {
            if self.is_eligible(preferred) {
                return Ok(Some(preferred));
            }
        }

        Ok(self
            .stories
            .iter()
            .enumerate()
            .filter(|(_, s)| self.is_eligible(s))
            .min_by_key(|(idx, s)| (s.priority, *idx))
            .map(|(_, s)| s))
    }

    /// True iff every story passes. Skipped stories do not count as done.
    pub fn is_complete(&self) -> bool {
        self.stories.iter().all(|s| s.passes)
    }

    pub fn summary(&self) -> BacklogSummary {
        let mut summary = BacklogSummary {
            total: self.stories.len(),
            ..Default::default()
        };
        for story in &self.stories {
            if story.passes {
                summary.passed += 1;
            } else if story.skipped {
                summary.skipped += 1;
            } else if self.is_eligible(story) {
                summary.eligible += 1;
            } else {
                summary.blocked += 1;
            }
        }
        summary
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    pub fn skip(&mut self, id: &str) -> CommandOutcome {
        if self.active.as_deref() == Some(id) {
            return CommandOutcome::Rejected {
                reason: format!("story '{id}' is currently executing"),
            };
        }
        let Some(story) = self.story_mut(id) else {
            return CommandOutcome::Rejected {
                reason: format!("story '{id}' not found"),
            };
        };
        if story.passes {
            return CommandOutcome::Rejected {
                reason: format!("story '{id}' already passes"),
            };
        }
        if story.skipped {
            return CommandOutcome::Unchanged {
                reason: format!("story '{id}' is already skipped"),
            };
        }
        story.skipped = true;
        let note = "Skipped via queue command".to_string();
        story.append_note(&note);
        CommandOutcome::Applied { note }
    }

    pub fn prioritize(&mut self, id: &str) -> CommandOutcome {
        let Some(story) = self.story_mut(id) else {
            return CommandOutcome::Rejected {
                reason: format!("story '{id}' not found"),
            };
        };
        if story.passes {
            return CommandOutcome::Rejected {
                reason: format!("story '{id}' already passes"),
            };
        }
        if story.skipped {
            return CommandOutcome::Rejected {
                reason: format!("story '{id}' is skipped"),
            };
        }
        let previous = story.priority;
        story.priority = 0;
        let note = format!("Prioritized via queue command (previous priority {previous})");
        story.append_note(&note);
        self.preferred = Some(id.to_string());
        CommandOutcome::Applied { note }
    }

    pub fn mark_passed(&mut self, id: &str) -> Result<&UserStory> {
        let story = self
            .story_mut(id)
            .ok_or_else(|| NightwatchError::StoryNotFound(id.to_string()))?;
        story.passes = true;
        story.append_note(COMPLETION_NOTE);
        Ok(story)
    }

    pub fn record_attempts(&mut self, id: &str, attempts: &[EscalationAttempt]) -> Result<&UserStory> {
        let story = self
            .story_mut(id)
            .ok_or_else(|| NightwatchError::StoryNotFound(id.to_string()))?;
        story.attempts.extend_from_slice(attempts);
        Ok(story)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn story(id: &str, priority: u32) -> UserStory {
        UserStory::new(id, format!("story {id}"), priority)
    }

    fn next_id(graph: &StoryGraph) -> Option<String> {
        graph.next().unwrap().map(|s| s.id.clone())
    }

    #[test]
    fn picks_smallest_priority_then_next() {
        let mut graph = StoryGraph::new(vec![story("A", 3), story("B", 1), story("C", 2)]);
        assert_eq!(next_id(&graph).as_deref(), Some("B"));
        graph.mark_passed("B").unwrap();
        assert_eq!(next_id(&graph).as_deref(), Some("C"));
        graph.mark_passed("C").unwrap();
        assert_eq!(next_id(&graph).as_deref(), Some("A"));
        graph.mark_passed("A").unwrap();
        assert_eq!(next_id(&graph), None);
        assert!(graph.is_complete());
    }

    #[test]
    fn ties_break_by_backlog_order() {
        let graph = StoryGraph::new(vec![story("X", 2), story("Y", 1), story("Z", 1)]);
        for _ in 0..5 {
            assert_eq!(next_id(&graph).as_deref(), Some("Y"));
        }
    }

    #[test]
    fn dependency_chain_scenario() {
        let mut done = story("US-001", 1);
        done.passes = true;
        let mut graph = StoryGraph::new(vec![
            done,
            story("US-002", 2).with_dependencies(["US-001"]),
            story("US-003", 1).with_dependencies(["US-002"]),
        ]);

        assert_eq!(next_id(&graph).as_deref(), Some("US-002"));
        graph.mark_passed("US-002").unwrap();
        assert_eq!(next_id(&graph).as_deref(), Some("US-003"));
        assert!(!graph.is_complete());
        graph.mark_passed("US-003").unwrap();
        assert!(graph.is_complete());
    }

    #[test]
    fn unknown_dependency_is_fatal() {
        let graph = StoryGraph::new(vec![story("A", 1).with_dependencies(["GHOST"])]);
        match graph.next().unwrap_err() {
            NightwatchError::UnknownDependency { story, dependency } => {
                assert_eq!(story, "A");
                assert_eq!(dependency, "GHOST");
            }
            other => panic!("expected UnknownDependency, got {other:?}"),
        }
    }

    #[test]
    fn two_cycle_reports_full_path() {
        let graph = StoryGraph::new(vec![
            story("A", 1).with_dependencies(["B"]),
            story("B", 1).with_dependencies(["A"]),
        ]);
        match graph.validate().unwrap_err() {
            NightwatchError::CircularDependency { path } => {
                assert_eq!(path, vec!["A", "B", "A"]);
            }
            other => panic!("expected CircularDependency, got {other:?}"),
        }
        let msg = graph.validate().unwrap_err().to_string();
        assert!(msg.contains("A -> B -> A"), "{msg}");
    }

    #[test]
    fn longer_cycles_are_detected() {
        for len in 2..=6 {
            let ids: Vec<String> = (0..len).map(|i| format!("S{i}")).collect();
            let stories: Vec<UserStory> = ids
                .iter()
                .enumerate()
                .map(|(i, id)| story(id, 1).with_dependencies([ids[(i + 1) % len].clone()]))
                .collect();
            let graph = StoryGraph::new(stories);
            match graph.validate().unwrap_err() {
                NightwatchError::CircularDependency { path } => {
                    assert_eq!(path.len(), len + 1, "len {len}: {path:?}");
                    assert_eq!(path.first(), path.last());
                }
                other => panic!("expected cycle for len {len}, got {other:?}"),
            }
        }
    }

    #[test]
    fn cycle_behind_acyclic_prefix() {
        let graph = StoryGraph::new(vec![
            story("root", 1).with_dependencies(["mid"]),
            story("mid", 1).with_dependencies(["x"]),
            story("x", 1).with_dependencies(["y"]),
            story("y", 1).with_dependencies(["x"]),
        ]);
        match graph.validate().unwrap_err() {
            NightwatchError::CircularDependency { path } => assert_eq!(path, vec!["x", "y", "x"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let graph = StoryGraph::new(vec![
            story("top", 1).with_dependencies(["left", "right"]),
            story("left", 1).with_dependencies(["base"]),
            story("right", 1).with_dependencies(["base"]),
            story("base", 1),
        ]);
        graph.validate().unwrap();
        assert_eq!(next_id(&graph).as_deref(), Some("base"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let graph = StoryGraph::new(vec![story("A", 1), story("A", 2)]);
        assert!(matches!(
            graph.validate().unwrap_err(),
            NightwatchError::DuplicateStory(id) if id == "A"
        ));
    }

    #[test]
    fn skip_is_idempotent() {
        let mut graph = StoryGraph::new(vec![story("A", 1), story("B", 2)]);
        assert!(graph.skip("A").changed());
        assert!(graph.story("A").unwrap().skipped);
        let again = graph.skip("A");
        assert!(again.is_success());
        assert!(!again.changed());
        assert!(graph.story("A").unwrap().skipped);
        assert_eq!(graph.story("A").unwrap().notes.lines().count(), 1);
        assert_eq!(next_id(&graph).as_deref(), Some("B"));
    }

    #[test]
    fn skip_rejected_for_active_or_passed() {
        let mut graph = StoryGraph::new(vec![story("A", 1), story("B", 2)]);
        graph.set_active(Some("A".into()));
        assert!(matches!(graph.skip("A"), CommandOutcome::Rejected { reason } if reason.contains("executing")));
        graph.mark_passed("B").unwrap();
        assert!(!graph.skip("B").is_success());
        assert!(!graph.skip("nope").is_success());
        assert!(!graph.story("A").unwrap().skipped);
    }

    #[test]
    fn skipped_stories_keep_backlog_incomplete() {
        let mut graph = StoryGraph::new(vec![story("A", 1), story("B", 2)]);
        graph.mark_passed("A").unwrap();
        graph.skip("B");
        assert_eq!(next_id(&graph), None);
        assert!(!graph.is_complete());
    }

    #[test]
    fn prioritize_jumps_the_queue() {
        let mut graph = StoryGraph::new(vec![story("A", 0), story("B", 5), story("C", 1)]);
        let outcome = graph.prioritize("B");
        match outcome {
            CommandOutcome::Applied { note } => assert!(note.contains("previous priority 5")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(graph.story("B").unwrap().priority, 0);
        assert!(graph.story("B").unwrap().notes.contains("previous priority 5"));
        assert_eq!(next_id(&graph).as_deref(), Some("B"));
    }

    #[test]
    fn prioritize_rejected_for_passed_or_skipped() {
        let mut graph = StoryGraph::new(vec![story("A", 3), story("B", 4)]);
        graph.mark_passed("A").unwrap();
        graph.skip("B");
        assert!(!graph.prioritize("A").is_success());
        assert!(!graph.prioritize("B").is_success());
        assert_eq!(graph.story("B").unwrap().priority, 4);
    }

    #[test]
    fn blocked_prioritized_story_does_not_jump_dependencies() {
        let mut graph = StoryGraph::new(vec![
            story("base", 3),
            story("leaf", 9).with_dependencies(["base"]),
        ]);
        graph.prioritize("leaf");
        assert_eq!(next_id(&graph).as_deref(), Some("base"));
    }

    #[test]
    fn summary_counts() {
        let mut graph = StoryGraph::new(vec![
            story("A", 1),
            story("B", 1).with_dependencies(["A"]),
            story("C", 1),
            story("D", 1),
        ]);
        graph.mark_passed("C").unwrap();
        graph.skip("D");
        assert_eq!(
            graph.summary(),
            BacklogSummary {
                total: 4,
                passed: 1,
                skipped: 1,
                blocked: 1,
                eligible: 1,
            }
        );
    }
}
