//! `agent-harness`: runs coding-agent CLIs as subprocesses.
//!
//! Every supported agent (Claude, Codex, OpenCode, Gemini, or any custom
//! command) is driven the same way: spawn the binary with non-interactive
//! flags, write the prompt to stdin, capture stdout and stderr, and scan the
//! output for the signals the orchestrator cares about.
//!
//! # Architecture
//!
//! ```text
//! HarnessRequest
//!     │
//!     ▼
//! AgentProcess    ← spawns the agent, pipes the prompt, drains output
//!     │              killed when the timeout elapses
//!     ▼
//! signals::scan   ← rate limit + reset time, completion marker, cost
//!     │
//!     ▼
//! HarnessOutcome
//! ```

pub mod error;
pub mod runner;
pub mod signals;
pub mod types;

pub(crate) mod process;


pub use error::HarnessError;
pub use runner::run;
pub use signals::{Signals, COMPLETION_MARKER};
pub use types::{HarnessKind, HarnessOutcome, HarnessRequest};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, HarnessError>;
