use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::process::{AgentProcess, Finished};
use crate::signals;
use crate::types::{HarnessOutcome, HarnessRequest};
use crate::{HarnessError, Result};

// ─── Public API ───────────────────────────────────────────────────────────

/// Run one agent invocation to completion.
///
/// Resolves the binary on `PATH`, pipes the prompt to stdin, waits for exit
/// (bounded by `request.timeout`) and returns the captured output with
/// rate-limit, completion and cost signals extracted.
///
/// A non-zero exit is not an error here: it comes back as an outcome so the
/// caller can tell a rate limit from an ordinary failure. `Err` means the
/// agent could not be run at all, or was killed on timeout.
///
/// # Example
///
/// ```rust,ignore
/// use agent_harness::{run, HarnessKind, HarnessRequest};
///
/// let outcome = run(HarnessRequest::new(HarnessKind::Claude, "sonnet", prompt)).await?;
/// if outcome.rate_limited {
///     println!("limited until {:?}", outcome.reset_time);
/// }
/// ```
pub async fn run(request: HarnessRequest) -> Result<HarnessOutcome> {
    let program = resolve(&request)?;
    tracing::debug!(
        kind = %request.kind,
        model = %request.model,
        program = %program.display(),
        "spawning agent"
    );

    let started = Instant::now();
    let process = AgentProcess::spawn(&program, &request)?;
    let finished = process.finish(&request.prompt, request.timeout).await?;
    let duration_ms = started.elapsed().as_millis() as u64;

    let outcome = outcome(finished, duration_ms, Utc::now());
    tracing::debug!(
        exit_code = outcome.exit_code,
        duration_ms,
        rate_limited = outcome.rate_limited,
        complete = outcome.is_complete_signal,
        "agent finished"
    );
    Ok(outcome)
}

// ─── Internal ─────────────────────────────────────────────────────────────

fn resolve(request: &HarnessRequest) -> Result<PathBuf> {
    let program = request.program().ok_or_else(|| {
        HarnessError::Process(format!("no command configured for {} agent", request.kind))
    })?;
    which::which(program).map_err(|_| HarnessError::NotFound(program.to_string()))
}

/// Turn captured process output into an outcome.
pub(crate) fn outcome(finished: Finished, duration_ms: u64, now: DateTime<Utc>) -> HarnessOutcome {
    let mut outcome = HarnessOutcome {
        stdout: finished.stdout,
        stderr: finished.stderr,
        exit_code: finished.code.unwrap_or(-1),
        duration_ms,
        ..Default::default()
    };
    let found = signals::scan(&outcome.combined_output(), outcome.exit_code, now);
    outcome.rate_limited = found.rate_limited;
    outcome.reset_time = found.reset_time;
    outcome.is_complete_signal = found.is_complete_signal;
    outcome.cost_usd = found.cost_usd.unwrap_or(0.0);
    outcome
}

// ─── Tests ────────────────────────────────────────────────────────────────
