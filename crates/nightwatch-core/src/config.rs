use crate::cascade::{EscalationPolicy, ExecutorSpec};
use crate::error::{NightwatchError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutorConfig
// ---------------------------------------------------------------------------

/// Which agent CLI an executor drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Claude,
    Codex,
    Opencode,
    Gemini,
    /// Explicit `command` + `args`.
    Custom,
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutorKind::Claude => "claude",
            ExecutorKind::Codex => "codex",
            ExecutorKind::Opencode => "opencode",
            ExecutorKind::Gemini => "gemini",
            ExecutorKind::Custom => "custom",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub name: String,
    pub kind: ExecutorKind,
    pub default_model: String,
    /// Overrides the binary for built-in kinds; required for `custom`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ExecutorConfig {
    pub fn new(name: impl Into<String>, kind: ExecutorKind, default_model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            default_model: default_model.into(),
            command: None,
            args: Vec::new(),
            timeout_secs: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

fn default_executors() -> Vec<ExecutorConfig> {
    vec![
        ExecutorConfig::new("claude", ExecutorKind::Claude, "sonnet"),
        ExecutorConfig::new("codex", ExecutorKind::Codex, "gpt-5-codex"),
    ]
}

fn default_escalation() -> EscalationPolicy {
    let mut path = BTreeMap::new();
    path.insert("sonnet".to_string(), "opus".to_string());
    EscalationPolicy {
        max_attempts: 3,
        path,
    }
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Lock markers older than this are abandoned.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// How long `add`/`process` wait on a live holder before `LockBusy`.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_lock_wait_ms() -> u64 {
    10_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_wait_ms: default_lock_wait_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// LoopConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Sleep until the earliest reset instead of stopping when every
    /// executor is limited.
    #[serde(default)]
    pub wait_on_rate_limit: bool,
    #[serde(default = "default_max_rate_limit_wait_secs")]
    pub max_rate_limit_wait_secs: u64,
}

fn default_max_iterations() -> u32 {
    50
}

fn default_max_rate_limit_wait_secs() -> u64 {
    3_600
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            wait_on_rate_limit: false,
            max_rate_limit_wait_secs: default_max_rate_limit_wait_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    pub project: ProjectConfig,
    /// Relative paths resolve against the project root.
    #[serde(default = "default_backlog")]
    pub backlog: PathBuf,
    /// In priority order.
    #[serde(default = "default_executors")]
    pub executors: Vec<ExecutorConfig>,
    #[serde(default = "default_escalation")]
    pub escalation: EscalationPolicy,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default, rename = "loop")]
    pub run_loop: LoopConfig,
}

fn default_version() -> u32 {
    1
}

fn default_backlog() -> PathBuf {
    PathBuf::from(paths::DEFAULT_BACKLOG)
}

impl Config {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            version: 1,
            project: ProjectConfig {
                name: project_name.into(),
                description: None,
            },
            backlog: default_backlog(),
            executors: default_executors(),
            escalation: default_escalation(),
            queue: QueueConfig::default(),
            run_loop: LoopConfig::default(),
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(NightwatchError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn backlog_path(&self, root: &Path) -> PathBuf {
        paths::backlog_path(root, &self.backlog)
    }

    pub fn executor(&self, name: &str) -> Option<&ExecutorConfig> {
        self.executors.iter().find(|e| e.name == name)
    }

    /// Executor names with their default models, in priority order.
    pub fn roster(&self) -> Vec<ExecutorSpec> {
        self.executors
            .iter()
            .map(|e| ExecutorSpec {
                name: e.name.clone(),
                default_model: e.default_model.clone(),
            })
            .collect()
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.queue.lock_timeout_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.queue.lock_wait_ms)
    }

    pub fn max_rate_limit_wait(&self) -> Duration {
        Duration::from_secs(self.run_loop.max_rate_limit_wait_secs)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.executors.is_empty() {
            warnings.push(ConfigWarning::error("no executors configured"));
        }

        let mut seen = HashSet::new();
        for exec in &self.executors {
            if !seen.insert(exec.name.as_str()) {
                warnings.push(ConfigWarning::error(format!(
                    "duplicate executor name '{}'",
                    exec.name
                )));
            }
            if exec.name.contains(':') {
                warnings.push(ConfigWarning::error(format!(
                    "executor name '{}' must not contain ':'",
                    exec.name
                )));
            }
            if exec.kind == ExecutorKind::Custom
                && exec.command.as_deref().map_or(true, |c| c.trim().is_empty())
            {
                warnings.push(ConfigWarning::error(format!(
                    "executor '{}' has kind custom but no command",
                    exec.name
                )));
            }
            if exec.default_model.trim().is_empty() {
                warnings.push(ConfigWarning::warning(format!(
                    "executor '{}' has an empty default_model",
                    exec.name
                )));
            }
            if exec.timeout_secs == Some(0) {
                warnings.push(ConfigWarning::warning(format!(
                    "executor '{}' has timeout_secs=0; every run will time out",
                    exec.name
                )));
            }
        }

        if self.escalation.max_attempts == 0 {
            warnings.push(ConfigWarning::error(
                "escalation.max_attempts must be at least 1",
            ));
        } else if self.escalation.max_attempts > 10 {
            warnings.push(ConfigWarning::warning(format!(
                "escalation.max_attempts={} (>10 is unusual)",
                self.escalation.max_attempts
            )));
        }

        for (from, to) in &self.escalation.path {
            if from == to {
                warnings.push(ConfigWarning::warning(format!(
                    "escalation path maps '{from}' to itself"
                )));
            }
        }

        if self.run_loop.max_iterations == 0 {
            warnings.push(ConfigWarning::warning(
                "loop.max_iterations=0; 'run' will stop before doing any work",
            ));
        }

        if self.queue.lock_timeout_ms == 0 {
            warnings.push(ConfigWarning::warning(
                "queue.lock_timeout_ms=0; every lock is immediately stale",
            ));
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
