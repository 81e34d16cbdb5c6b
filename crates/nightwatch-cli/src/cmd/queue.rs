use crate::output::{print_json, print_table, truncate};
use anyhow::Context;
use clap::Subcommand;
use nightwatch_core::config::Config;
use nightwatch_core::queue::{Queue, QueueCommand, QueueItem};
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum QueueSubcommand {
    /// Queue free-text guidance for the next iteration
    Add {
        /// Guidance text (words are joined with spaces)
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },

    /// Pause the loop before its next iteration
    Pause,

    /// Stop the loop before its next iteration
    Abort,

    /// Skip a story
    Skip {
        /// Story id
        id: String,
    },

    /// Move a story to the front of the backlog
    Priority {
        /// Story id
        id: String,
    },

    /// List queued items
    List {
        /// Show the processed archive instead of pending items
        #[arg(long)]
        processed: bool,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: QueueSubcommand, json: bool) -> anyhow::Result<()> {
    let queue = open(root)?;
    match subcmd {
        QueueSubcommand::Add { text } => {
            let item = queue.add(&text.join(" ")).context("failed to queue guidance")?;
            report_added(&item, json)
        }
        QueueSubcommand::Pause => command(&queue, QueueCommand::Pause, json),
        QueueSubcommand::Abort => command(&queue, QueueCommand::Abort, json),
        QueueSubcommand::Skip { id } => command(&queue, QueueCommand::Skip { story_id: id }, json),
        QueueSubcommand::Priority { id } => {
            command(&queue, QueueCommand::Priority { story_id: id }, json)
        }
        QueueSubcommand::List { processed } => list(&queue, processed, json),
    }
}

fn open(root: &Path) -> anyhow::Result<Queue> {
    let config = Config::load(root).context("failed to load config")?;
    let mut queue = Queue::for_root(root);
    queue.set_lock_timeout(config.lock_timeout());
    queue.set_lock_wait(config.lock_wait());
    Ok(queue)
}

fn command(queue: &Queue, command: QueueCommand, json: bool) -> anyhow::Result<()> {
    let item = queue
        .add_command(&command)
        .with_context(|| format!("failed to queue {command}"))?;
    report_added(&item, json)
}

fn report_added(item: &QueueItem, json: bool) -> anyhow::Result<()> {
    if json {
        print_json(item)
    } else {
        println!("queued {}: {}", item.id, item.content);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

fn list(queue: &Queue, processed: bool, json: bool) -> anyhow::Result<()> {
    let state = queue.load().context("failed to read queue")?;
    for warning in &state.warnings {
        eprintln!("warning: {warning}");
    }

    let items = if processed {
        &state.processed
    } else {
        &state.pending
    };

    if json {
        return print_json(&serde_json::json!({
            "items": items,
            "warnings": state.warnings,
        }));
    }

    if items.is_empty() {
        println!(
            "No {} items.",
            if processed { "processed" } else { "pending" }
        );
        return Ok(());
    }

    let rows: Vec<Vec<String>> = items
        .iter()
        .map(|item| {
            let mut row = vec![
                item.id.clone(),
                item.added_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ];
            if processed {
                row.push(
                    item.processed_at
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
            row.push(truncate(&item.content, 72));
            row
        })
        .collect();

    if processed {
        print_table(&["ID", "ADDED", "PROCESSED", "CONTENT"], &rows);
    } else {
        print_table(&["ID", "ADDED", "CONTENT"], &rows);
    }
    Ok(())
}
