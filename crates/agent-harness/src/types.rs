use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ─── HarnessKind ──────────────────────────────────────────────────────────

/// The agent CLI family. Each kind knows its binary and flags; the prompt
/// always goes to stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarnessKind {
    Claude,
    Codex,
    Opencode,
    Gemini,
    Custom,
}

impl HarnessKind {
    pub fn default_binary(&self) -> Option<&'static str> {
        match self {
            HarnessKind::Claude => Some("claude"),
            HarnessKind::Codex => Some("codex"),
            HarnessKind::Opencode => Some("opencode"),
            HarnessKind::Gemini => Some("gemini"),
            HarnessKind::Custom => None,
        }
    }

    /// Built-in flags for a non-interactive run on `model`.
    fn builtin_args(&self, model: &str) -> Vec<String> {
        let args: Vec<&str> = match self {
            HarnessKind::Claude => vec![
                "--print",
                "--output-format",
                "stream-json",
                "--verbose",
                "--dangerously-skip-permissions",
                "--model",
                model,
            ],
            HarnessKind::Codex => vec!["exec", "--full-auto", "--model", model, "-"],
            HarnessKind::Opencode => vec!["run", "--model", model],
            HarnessKind::Gemini => vec!["--yolo", "--model", model],
            HarnessKind::Custom => vec![],
        };
        args.into_iter().map(str::to_string).collect()
    }
}

impl std::fmt::Display for HarnessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HarnessKind::Claude => "claude",
            HarnessKind::Codex => "codex",
            HarnessKind::Opencode => "opencode",
            HarnessKind::Gemini => "gemini",
            HarnessKind::Custom => "custom",
        };
        f.write_str(s)
    }
}

// ─── HarnessRequest ───────────────────────────────────────────────────────

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct HarnessRequest {
    pub kind: HarnessKind,
    /// Overrides the kind's binary. Required for [`HarnessKind::Custom`].
    pub command: Option<String>,
    /// Appended after the kind's own flags. `{model}` is replaced with `model`.
    pub args: Vec<String>,
    pub model: String,
    pub prompt: String,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl HarnessRequest {
    pub fn new(kind: HarnessKind, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            command: None,
            args: Vec::new(),
            model: model.into(),
            prompt: prompt.into(),
            cwd: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    /// The binary to spawn, or `None` for a custom kind with no command.
    pub fn program(&self) -> Option<&str> {
        self.command
            .as_deref()
            .or_else(|| self.kind.default_binary())
    }

    /// Full argument list, without the program.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.kind.builtin_args(&self.model);
        argv.extend(self.args.iter().map(|a| a.replace("{model}", &self.model)));
        argv
    }
}

// ─── HarnessOutcome ───────────────────────────────────────────────────────

/// What one finished invocation produced, with signals already extracted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarnessOutcome {
    pub stdout: String,
    pub stderr: String,
    /// -1 when the process was terminated by a signal.
    pub exit_code: i32,
    pub duration_ms: u64,
    pub rate_limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<DateTime<Utc>>,
    pub is_complete_signal: bool,
    /// 0.0 when the agent does not report cost.
    pub cost_usd: f64,
}

impl HarnessOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, the text signals are scanned in.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}
