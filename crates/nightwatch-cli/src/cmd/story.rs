use crate::output::{print_json, print_table, truncate};
use anyhow::Context;
use clap::Subcommand;
use nightwatch_core::backlog::{Backlog, StoryGraph, UserStory};
use nightwatch_core::config::Config;
use std::path::Path;

#[derive(Subcommand)]
pub enum StorySubcommand {
    /// List every story with its scheduling state
    List,

    /// Show the story the loop would pick next
    Next,

    /// Check dependencies for unknown ids and cycles
    Validate,
}

pub fn run(root: &Path, subcmd: StorySubcommand, json: bool) -> anyhow::Result<()> {
    let graph = load_graph(root)?;
    match subcmd {
        StorySubcommand::List => list(&graph, json),
        StorySubcommand::Next => next(&graph, json),
        StorySubcommand::Validate => validate(&graph, json),
    }
}

fn load_graph(root: &Path) -> anyhow::Result<StoryGraph> {
    let config = Config::load(root).context("failed to load config")?;
    let path = config.backlog_path(root);
    let backlog =
        Backlog::load(&path).with_context(|| format!("failed to load {}", path.display()))?;
    Ok(backlog.into_graph())
}

/// `passed`, `skipped`, `waiting` (on an unfinished dependency) or `ready`.
fn state_label(graph: &StoryGraph, story: &UserStory) -> &'static str {
    if story.passes {
        "passed"
    } else if story.skipped {
        "skipped"
    } else if story
        .deps()
        .iter()
        .any(|dep| !graph.story(dep).is_some_and(|d| d.passes))
    {
        "waiting"
    } else {
        "ready"
    }
}

fn list(graph: &StoryGraph, json: bool) -> anyhow::Result<()> {
    if json {
        let stories: Vec<_> = graph
            .stories()
            .iter()
            .map(|s| {
                serde_json::json!({
                    "id": s.id,
                    "title": s.title,
                    "priority": s.priority,
                    "state": state_label(graph, s),
                    "dependencies": s.deps(),
                })
            })
            .collect();
        return print_json(&serde_json::json!({
            "stories": stories,
            "summary": graph.summary(),
        }));
    }

    if graph.stories().is_empty() {
        println!("No stories in the backlog.");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = graph
        .stories()
        .iter()
        .map(|s| {
            vec![
                s.id.clone(),
                s.priority.to_string(),
                state_label(graph, s).to_string(),
                if s.deps().is_empty() {
                    "-".to_string()
                } else {
                    s.deps().join(",")
                },
                truncate(&s.title, 60),
            ]
        })
        .collect();
    print_table(&["ID", "PRI", "STATE", "DEPENDS ON", "TITLE"], &rows);

    let summary = graph.summary();
    println!(
        "\n{} stories: {} passed, {} skipped, {} waiting, {} ready",
        summary.total, summary.passed, summary.skipped, summary.blocked, summary.eligible
    );
    Ok(())
}

fn next(graph: &StoryGraph, json: bool) -> anyhow::Result<()> {
    let next = graph.next().context("backlog is invalid")?;
    if json {
        return print_json(&serde_json::json!({ "next": next }));
    }
    match next {
        Some(story) => println!("{}: {}", story.id, story.title),
        None if graph.is_complete() => println!("Backlog complete."),
        None => println!("No eligible story."),
    }
    Ok(())
}

fn validate(graph: &StoryGraph, json: bool) -> anyhow::Result<()> {
    graph.validate().context("backlog is invalid")?;
    if json {
        print_json(&serde_json::json!({ "valid": true, "summary": graph.summary() }))
    } else {
        println!("Backlog is valid: {} stories.", graph.stories().len());
        Ok(())
    }
}
