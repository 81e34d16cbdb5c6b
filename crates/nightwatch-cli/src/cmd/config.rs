use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use nightwatch_core::config::{Config, WarnLevel};
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show executors in priority order and the escalation path
    Show,

    /// Validate the config for common mistakes
    Validate,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    match subcmd {
        ConfigSubcommand::Show => show(&config, json),
        ConfigSubcommand::Validate => validate(&config, json),
    }
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(config: &Config, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(config);
    }

    println!("Project: {}", config.project.name);
    println!("Backlog: {}\n", config.backlog.display());

    let rows: Vec<Vec<String>> = config
        .executors
        .iter()
        .map(|e| {
            vec![
                e.name.clone(),
                e.kind.to_string(),
                e.default_model.clone(),
                e.command.clone().unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    print_table(&["EXECUTOR", "KIND", "MODEL", "COMMAND"], &rows);

    println!("\nEscalation (max {} attempts):", config.escalation.max_attempts);
    if config.escalation.path.is_empty() {
        println!("  (none)");
    }
    for (from, to) in &config.escalation.path {
        println!("  {from} -> {to}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(config: &Config, json: bool) -> anyhow::Result<()> {
    let warnings = config.validate();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
