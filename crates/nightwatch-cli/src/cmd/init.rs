use anyhow::Context;
use nightwatch_core::{backlog::Backlog, config::Config, io, paths, paths::QueuePaths};
use std::path::Path;

pub fn run(root: &Path, name: Option<&str>) -> anyhow::Result<()> {
    let project_name = name.map(str::to_string).unwrap_or_else(|| {
        root.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    });

    println!("Initializing nightwatch in: {}", root.display());

    // 1. Directory tree
    for dir in [paths::NIGHTWATCH_DIR, paths::QUEUE_DIR] {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    // 2. config.yaml
    let config = if paths::config_path(root).exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
        Config::load(root).context("failed to load existing config.yaml")?
    } else {
        let cfg = Config::new(&project_name);
        cfg.save(root).context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
        cfg
    };

    // 3. Empty queue logs
    let queue = QueuePaths::for_root(root);
    for log in [&queue.pending, &queue.processed] {
        io::write_if_missing(log, b"")
            .with_context(|| format!("failed to create {}", log.display()))?;
    }

    // 4. Backlog skeleton, never overwritten
    let backlog_path = config.backlog_path(root);
    if backlog_path.exists() {
        println!("  exists:  {}", config.backlog.display());
    } else {
        Backlog::new(&config.project.name, Vec::new())
            .save(&backlog_path)
            .context("failed to write backlog")?;
        println!("  created: {}", config.backlog.display());
    }

    println!("\nnightwatch initialized.");
    println!("Next: add stories to {} and run `nightwatch run`", config.backlog.display());
    Ok(())
}
