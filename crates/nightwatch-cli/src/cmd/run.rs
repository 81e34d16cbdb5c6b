use crate::output::print_json;
use agent_harness::{HarnessKind, HarnessRequest};
use anyhow::Context;
use nightwatch_core::cascade::{ExecutionRequest, ExecutionResult, Executor};
use nightwatch_core::clock::SystemClock;
use nightwatch_core::config::{Config, ExecutorConfig, ExecutorKind, WarnLevel};
use nightwatch_core::orchestrator::{LoopReport, LoopStatus, Orchestrator, PauseDecision, PauseGate};
use nightwatch_core::NightwatchError;
use std::future::Future;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

pub fn run(
    root: &Path,
    max_iterations: Option<u32>,
    executor: Option<String>,
    json: bool,
) -> anyhow::Result<LoopStatus> {
    let config = Config::load(root).context("failed to load config")?;

    let warnings = config.validate();
    for w in &warnings {
        match w.level {
            WarnLevel::Warning => tracing::warn!("config: {}", w.message),
            WarnLevel::Error => tracing::error!("config: {}", w.message),
        }
    }
    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config has errors; see `nightwatch config validate`");
    }

    let mut harness = HarnessExecutor::new(root, config.executors.clone())?;
    let mut gate = StdinGate;
    let clock = SystemClock;

    let mut orchestrator = Orchestrator::new(root, config, &mut harness, &mut gate, &clock)
        .with_preferred_executor(executor);
    if let Some(max) = max_iterations {
        orchestrator = orchestrator.with_max_iterations(max);
    }

    let report = orchestrator.run().context("run failed")?;
    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(report.status)
}

fn print_report(report: &LoopReport) {
    println!("\nRun {}", report.status);
    println!("  iterations: {}", report.iterations);
    println!("  cost:       ${:.4}", report.total_cost);
    println!(
        "  stories:    {} passed, {} skipped, {} remaining of {}",
        report.summary.passed,
        report.summary.skipped,
        report
            .summary
            .total
            .saturating_sub(report.summary.passed + report.summary.skipped),
        report.summary.total
    );
    if let Some(blocked) = &report.blocked {
        println!("  blocked:    {blocked}");
    }
    for notice in &report.notices {
        println!("  note:       {notice}");
    }
    for text in &report.requeued_guidance {
        println!("  requeued:   {text}");
    }
}

// ---------------------------------------------------------------------------
// HarnessExecutor
// ---------------------------------------------------------------------------

/// Runs each attempt as an agent subprocess in the project root.
struct HarnessExecutor {
    executors: Vec<ExecutorConfig>,
    cwd: PathBuf,
    /// `None` when already inside a runtime (e.g. integration tests).
    runtime: Option<tokio::runtime::Runtime>,
}

impl HarnessExecutor {
    fn new(root: &Path, executors: Vec<ExecutorConfig>) -> anyhow::Result<Self> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(_) => None,
            Err(_) => Some(tokio::runtime::Runtime::new().context("failed to start tokio runtime")?),
        };
        Ok(Self {
            executors,
            cwd: root.to_path_buf(),
            runtime,
        })
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        match &self.runtime {
            Some(rt) => rt.block_on(fut),
            None => tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(fut)),
        }
    }
}

fn harness_kind(kind: ExecutorKind) -> HarnessKind {
    match kind {
        ExecutorKind::Claude => HarnessKind::Claude,
        ExecutorKind::Codex => HarnessKind::Codex,
        ExecutorKind::Opencode => HarnessKind::Opencode,
        ExecutorKind::Gemini => HarnessKind::Gemini,
        ExecutorKind::Custom => HarnessKind::Custom,
    }
}

impl Executor for HarnessExecutor {
    fn execute(&mut self, request: &ExecutionRequest) -> nightwatch_core::Result<ExecutionResult> {
        let config = self
            .executors
            .iter()
            .find(|e| e.name == request.executor)
            .ok_or_else(|| NightwatchError::Executor {
                executor: request.executor.clone(),
                message: "not configured".to_string(),
            })?;

        let mut harness = HarnessRequest::new(
            harness_kind(config.kind),
            request.model.clone(),
            request.prompt.clone(),
        );
        harness.command = config.command.clone();
        harness.args = config.args.clone();
        harness.cwd = Some(self.cwd.clone());
        harness.timeout = config.timeout();

        let outcome = self
            .block_on(agent_harness::run(harness))
            .map_err(|e| NightwatchError::Executor {
                executor: request.executor.clone(),
                message: e.to_string(),
            })?;

        Ok(ExecutionResult {
            output: outcome.combined_output(),
            exit_code: outcome.exit_code,
            is_complete_signal: outcome.is_complete_signal,
            duration_ms: outcome.duration_ms,
            rate_limited: outcome.rate_limited,
            reset_time: outcome.reset_time,
            cost_usd: outcome.cost_usd,
        })
    }
}

// ---------------------------------------------------------------------------
// StdinGate
// ---------------------------------------------------------------------------

/// Blocks on stdin after `[PAUSE]`. Enter resumes, `abort` stops, and a
/// closed stdin stops too since nobody can resume.
struct StdinGate;

impl PauseGate for StdinGate {
    fn wait_for_resume(&mut self) -> nightwatch_core::Result<PauseDecision> {
        eprint!("Paused. Press Enter to resume or type 'abort' to stop: ");
        std::io::stderr().flush()?;

        let mut line = String::new();
        let read = std::io::stdin().lock().read_line(&mut line)?;
        Ok(parse_answer(read, &line))
    }
}

fn parse_answer(bytes_read: usize, line: &str) -> PauseDecision {
    if bytes_read == 0 {
        tracing::warn!("stdin closed while paused, aborting");
        return PauseDecision::Abort;
    }
    match line.trim().to_ascii_lowercase().as_str() {
        "abort" | "a" | "q" | "quit" => PauseDecision::Abort,
        _ => PauseDecision::Resume,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_answers() {
        assert_eq!(parse_answer(1, "\n"), PauseDecision::Resume);
        assert_eq!(parse_answer(6, "ABORT\n"), PauseDecision::Abort);
        assert_eq!(parse_answer(0, ""), PauseDecision::Abort);
    }

    #[test]
    fn every_kind_maps_to_a_harness() {
        assert_eq!(harness_kind(ExecutorKind::Codex), HarnessKind::Codex);
        assert_eq!(harness_kind(ExecutorKind::Custom), HarnessKind::Custom);
    }
}
