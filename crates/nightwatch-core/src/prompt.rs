//! Prompt assembly for one iteration.

use crate::backlog::UserStory;

/// Marker an agent prints when it believes the story is done.
pub const COMPLETION_SIGNAL: &str = "<promise>COMPLETE</promise>";

/// Build the prompt for `story`, appending operator guidance drained from
/// the queue in log order.
pub fn build_prompt(project: &str, story: &UserStory, guidance: &[String]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "You are working on project '{project}'.\n\n## Story {}: {}\n",
        story.id, story.title
    ));

    if !story.description.trim().is_empty() {
        out.push('\n');
        out.push_str(story.description.trim());
        out.push('\n');
    }

    if !story.acceptance_criteria.is_empty() {
        out.push_str("\n## Acceptance criteria\n");
        for criterion in &story.acceptance_criteria {
            out.push_str(&format!("- {criterion}\n"));
        }
    }

    if !story.notes.trim().is_empty() {
        out.push_str("\n## Notes from earlier iterations\n");
        out.push_str(story.notes.trim());
        out.push('\n');
    }

    if !guidance.is_empty() {
        out.push_str("\n## Operator guidance\n");
        for line in guidance {
            out.push_str(&format!("- {line}\n"));
        }
    }

    out.push_str(&format!(
        "\nWhen every acceptance criterion is met and verified, print {COMPLETION_SIGNAL} on its own line.\n"
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_contains_story_and_guidance_in_order() {
        let mut story = UserStory::new("US-007", "Login form", 1);
        story.description = "Email + password.".into();
        story.acceptance_criteria = vec!["rejects empty email".into()];
        let guidance = vec!["use the existing Button".to_string(), "no new deps".to_string()];

        let prompt = build_prompt("shop", &story, &guidance);
        assert!(prompt.contains("Story US-007: Login form"));
        assert!(prompt.contains("- rejects empty email"));
        let first = prompt.find("use the existing Button").unwrap();
        let second = prompt.find("no new deps").unwrap();
        assert!(first < second);
        assert!(prompt.trim_end().ends_with("on its own line."));
        assert!(prompt.contains(COMPLETION_SIGNAL));
    }

    #[test]
    fn empty_sections_are_omitted() {
        let story = UserStory::new("US-1", "Bare", 0);
        let prompt = build_prompt("p", &story, &[]);
        assert!(!prompt.contains("Acceptance criteria"));
        assert!(!prompt.contains("Operator guidance"));
        assert!(!prompt.contains("Notes from"));
    }
}
