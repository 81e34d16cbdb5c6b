mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, queue::QueueSubcommand, story::StorySubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "nightwatch",
    about = "Run coding agents unattended against a user-story backlog",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .nightwatch/ or .git/)
    #[arg(long, global = true, env = "NIGHTWATCH_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize nightwatch in the current project
    Init {
        /// Project name (default: directory name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Run the agent loop until the backlog is done or the loop stops
    Run {
        /// Override loop.max_iterations from config
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Try this executor first whenever it is not rate limited
        #[arg(long)]
        executor: Option<String>,
    },

    /// Inject guidance or control commands into a running loop
    Queue {
        #[command(subcommand)]
        subcommand: QueueSubcommand,
    },

    /// Inspect the backlog
    Story {
        #[command(subcommand)]
        subcommand: StorySubcommand,
    },

    /// Inspect and validate the project configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Exit code for a loop that stopped needing attention.
const EXIT_NEEDS_ATTENTION: i32 = 2;

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init { name } => cmd::init::run(&root, name.as_deref()),
        Commands::Run {
            max_iterations,
            executor,
        } => match cmd::run::run(&root, max_iterations, executor, cli.json) {
            Ok(status) if !status.is_clean() => std::process::exit(EXIT_NEEDS_ATTENTION),
            other => other.map(|_| ()),
        },
        Commands::Queue { subcommand } => cmd::queue::run(&root, subcommand, cli.json),
        Commands::Story { subcommand } => cmd::story::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
