use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const NIGHTWATCH_DIR: &str = ".nightwatch";
pub const QUEUE_DIR: &str = ".nightwatch/queue";

pub const CONFIG_FILE: &str = ".nightwatch/config.yaml";
pub const PROGRESS_FILE: &str = ".nightwatch/progress.yaml";

pub const PENDING_LOG: &str = "pending.log";
pub const PROCESSED_LOG: &str = "processed.log";
pub const INFLIGHT_LOG: &str = "inflight.log";
pub const LOCK_FILE: &str = "queue.lock";

pub const DEFAULT_BACKLOG: &str = "prd.json";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn nightwatch_dir(root: &Path) -> PathBuf {
    root.join(NIGHTWATCH_DIR)
}

pub fn queue_dir(root: &Path) -> PathBuf {
    root.join(QUEUE_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn progress_path(root: &Path) -> PathBuf {
    root.join(PROGRESS_FILE)
}

/// Resolve a backlog path from config: relative paths are taken from `root`.
pub fn backlog_path(root: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        root.join(configured)
    }
}

/// The set of files backing one queue directory.
#[derive(Debug, Clone)]
pub struct QueuePaths {
    pub pending: PathBuf,
    pub processed: PathBuf,
    pub inflight: PathBuf,
    pub lock: PathBuf,
}

impl QueuePaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            pending: dir.join(PENDING_LOG),
            processed: dir.join(PROCESSED_LOG),
            inflight: dir.join(INFLIGHT_LOG),
            lock: dir.join(LOCK_FILE),
        }
    }

    pub fn for_root(root: &Path) -> Self {
        Self::in_dir(&queue_dir(root))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
