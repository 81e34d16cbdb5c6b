//! The orchestrator loop.
//!
//! One iteration reloads the backlog, drains the queue, picks a story and an
//! executor, runs the escalation cascade and persists the outcome. The loop
//! owns the rate-limit map for the whole run and talks to the outside world
//! only through [`Executor`], [`PauseGate`] and [`Clock`].

mod report;

pub use report::{BlockedReason, LoopReport, LoopStatus};

use crate::backlog::{Backlog, CommandOutcome, StoryGraph, StoryPatch, UserStory, COMPLETION_NOTE};
use crate::cascade::{
    run_cascade, select_executor, Availability, CascadeOutcome, CascadeReport, Executor,
    ExecutorSpec, ModelTarget, RateLimits,
};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{NightwatchError, Result};
use crate::progress::{IterationRecord, RunProgress, RunStatus};
use crate::prompt::build_prompt;
use crate::queue::{Queue, QueueCommand};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseDecision {
    Resume,
    Abort,
}

/// Blocks the loop after a `[PAUSE]` until someone resumes it.
pub trait PauseGate {
    fn wait_for_resume(&mut self) -> Result<PauseDecision>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Continue,
    Abort,
}

pub struct Orchestrator<'a> {
    root: PathBuf,
    backlog_path: PathBuf,
    roster: Vec<ExecutorSpec>,
    queue: Queue,
    executor: &'a mut dyn Executor,
    gate: &'a mut dyn PauseGate,
    clock: &'a dyn Clock,
    limits: RateLimits,
    preferred: Option<String>,
    max_iterations: u32,
    progress: RunProgress,
    /// Story whose last iteration made progress without completing it.
    active: Option<String>,
    guidance: Vec<String>,
    notices: Vec<String>,
    iterations: u32,
    total_cost: f64,
    config: Config,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        root: &Path,
        config: Config,
        executor: &'a mut dyn Executor,
        gate: &'a mut dyn PauseGate,
        clock: &'a dyn Clock,
    ) -> Self {
        let mut queue = Queue::for_root(root);
        queue.set_lock_timeout(config.lock_timeout());
        queue.set_lock_wait(config.lock_wait());
        Self {
            root: root.to_path_buf(),
            backlog_path: config.backlog_path(root),
            roster: config.roster(),
            queue,
            executor,
            gate,
            clock,
            limits: RateLimits::new(),
            preferred: None,
            max_iterations: config.run_loop.max_iterations,
            progress: RunProgress::new(clock.now()),
            active: None,
            guidance: Vec::new(),
            notices: Vec::new(),
            iterations: 0,
            total_cost: 0.0,
            config,
        }
    }

    /// Try this executor first whenever it is not rate limited.
    pub fn with_preferred_executor(mut self, name: Option<String>) -> Self {
        self.preferred = name;
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn limits(&self) -> &RateLimits {
        &self.limits
    }

    pub fn progress(&self) -> &RunProgress {
        &self.progress
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    pub fn run(&mut self) -> Result<LoopReport> {
        if let Some(name) = &self.preferred {
            if !self.roster.iter().any(|spec| &spec.name == name) {
                return Err(NightwatchError::InvalidConfig(format!(
                    "unknown executor '{name}'"
                )));
            }
        }

        self.progress = RunProgress::new(self.clock.now());
        self.progress.save(&self.root)?;
        tracing::info!(
            run_id = %self.progress.run_id,
            backlog = %self.backlog_path.display(),
            max_iterations = self.max_iterations,
            "starting run"
        );

        loop {
            let mut graph = self.load_graph()?;
            if graph.is_complete() {
                return self.finish(LoopStatus::Complete, &graph, None);
            }
            if self.iterations >= self.max_iterations {
                return self.finish(LoopStatus::Exhausted, &graph, None);
            }
            if graph.next()?.is_none() {
                return self.finish(LoopStatus::Idle, &graph, None);
            }

            if let Control::Abort = self.drain(&mut graph)? {
                return self.finish(LoopStatus::Aborted, &graph, None);
            }

            // Commands may have skipped or promoted stories.
            let Some(story) = graph.next()?.cloned() else {
                return self.finish(LoopStatus::Idle, &graph, None);
            };

            let names: Vec<&str> = self.roster.iter().map(|s| s.name.as_str()).collect();
            let availability = select_executor(
                &names,
                self.preferred.as_deref(),
                &mut self.limits,
                self.clock.now(),
            );
            let initial = match availability {
                Availability::Available { executor } => self.target_for(&executor)?,
                Availability::Blocked { earliest_reset } => {
                    if self.wait_for_reset(earliest_reset)? {
                        continue;
                    }
                    let reason = BlockedReason::RateLimited { earliest_reset };
                    return self.finish(LoopStatus::Blocked, &graph, Some(reason));
                }
            };

            self.iterations += 1;
            self.progress.begin_iteration(&story.id, self.clock.now());
            self.progress.save(&self.root)?;
            graph.set_active(Some(story.id.clone()));

            let guidance = std::mem::take(&mut self.guidance);
            let prompt = build_prompt(&self.config.project.name, &story, &guidance);
            tracing::info!(
                iteration = self.iterations,
                story = %story.id,
                target = %initial,
                guidance = guidance.len(),
                "starting iteration"
            );

            let report = run_cascade(
                &mut *self.executor,
                &self.config.escalation,
                &self.roster,
                initial.clone(),
                &prompt,
                &mut self.limits,
                self.clock,
            );
            self.total_cost += report.total_cost;
            self.persist(&mut graph, &story.id, &report)?;
            self.record_iteration(&story.id, &initial, &report);
            self.progress.save(&self.root)?;

            match report.outcome {
                CascadeOutcome::Succeeded { .. } => {}
                CascadeOutcome::Exhausted => {
                    let reason = BlockedReason::Exhausted {
                        story_id: story.id,
                        attempts: report.attempts,
                    };
                    return self.finish(LoopStatus::Blocked, &graph, Some(reason));
                }
                CascadeOutcome::RateLimited { earliest_reset } => {
                    if self.wait_for_reset(earliest_reset)? {
                        continue;
                    }
                    let reason = BlockedReason::RateLimited { earliest_reset };
                    return self.finish(LoopStatus::Blocked, &graph, Some(reason));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    fn load_graph(&self) -> Result<StoryGraph> {
        let mut graph = Backlog::load(&self.backlog_path)?.into_graph();
        graph.validate()?;
        graph.set_active(self.active.clone());
        Ok(graph)
    }

    /// Drain the queue and apply the whole batch in log order.
    ///
    /// An `[ABORT]` (or an abort answer at a pause) takes effect once the
    /// batch is done, so SKIP and PRIORITY items claimed alongside it are
    /// still applied.
    fn drain(&mut self, graph: &mut StoryGraph) -> Result<Control> {
        let batch = self.queue.process()?;
        self.notices.extend(batch.warnings);
        self.guidance.extend(batch.prompts);

        let mut control = Control::Continue;
        for command in batch.commands {
            let token = command.token();
            match command {
                QueueCommand::Pause if control == Control::Abort => {
                    tracing::info!("ignoring pause queued after abort");
                }
                QueueCommand::Pause => {
                    tracing::info!("paused by queue command");
                    self.progress.set_status(
                        RunStatus::Paused,
                        Some("paused via queue".to_string()),
                        self.clock.now(),
                    );
                    self.progress.save(&self.root)?;
                    if self.gate.wait_for_resume()? == PauseDecision::Abort {
                        tracing::info!("aborted while paused");
                        control = Control::Abort;
                        continue;
                    }
                    tracing::info!("resumed");
                    self.progress
                        .set_status(RunStatus::Running, None, self.clock.now());
                    self.progress.save(&self.root)?;
                }
                QueueCommand::Abort => {
                    tracing::info!("aborted by queue command");
                    control = Control::Abort;
                }
                QueueCommand::Skip { story_id } => {
                    let outcome = graph.skip(&story_id);
                    self.apply_outcome(graph, &token, &story_id, outcome, |_, note| {
                        StoryPatch::skipped(note)
                    })?;
                }
                QueueCommand::Priority { story_id } => {
                    let outcome = graph.prioritize(&story_id);
                    self.apply_outcome(graph, &token, &story_id, outcome, |story, note| {
                        StoryPatch::prioritized(story.priority, note)
                    })?;
                }
            }
        }
        Ok(control)
    }

    fn apply_outcome(
        &mut self,
        graph: &StoryGraph,
        token: &str,
        story_id: &str,
        outcome: CommandOutcome,
        patch: impl FnOnce(&UserStory, String) -> StoryPatch,
    ) -> Result<()> {
        match outcome {
            CommandOutcome::Applied { note } => {
                tracing::info!(command = token, note = %note, "applied queue command");
                if let Some(story) = graph.story(story_id) {
                    Backlog::write_story_fields(&self.backlog_path, story_id, &patch(story, note))?;
                }
            }
            CommandOutcome::Unchanged { reason } => {
                tracing::info!(command = token, reason = %reason, "queue command had no effect");
            }
            CommandOutcome::Rejected { reason } => {
                tracing::warn!(command = token, reason = %reason, "queue command rejected");
                self.notices.push(format!("{token} rejected: {reason}"));
            }
        }
        Ok(())
    }

    fn target_for(&self, executor: &str) -> Result<ModelTarget> {
        ModelTarget::default_for(executor, &self.roster)
            .ok_or_else(|| NightwatchError::InvalidConfig(format!("unknown executor '{executor}'")))
    }

    /// Sleep until `earliest_reset` if waiting is enabled and short enough.
    /// Returns whether the loop should retry.
    fn wait_for_reset(&mut self, earliest_reset: Option<DateTime<Utc>>) -> Result<bool> {
        if !self.config.run_loop.wait_on_rate_limit {
            return Ok(false);
        }
        let Some(reset) = earliest_reset else {
            return Ok(false);
        };
        let now = self.clock.now();
        let wait = (reset - now).to_std().unwrap_or(Duration::ZERO);
        if wait > self.config.max_rate_limit_wait() {
            tracing::warn!(
                until = %reset.to_rfc3339(),
                wait_secs = wait.as_secs(),
                "rate limit reset is too far away to wait for"
            );
            return Ok(false);
        }

        tracing::info!(until = %reset.to_rfc3339(), "all executors rate limited, waiting");
        self.progress.set_status(
            RunStatus::Running,
            Some(format!("waiting for rate limit reset at {}", reset.to_rfc3339())),
            now,
        );
        self.progress.save(&self.root)?;
        self.clock.sleep(wait);
        Ok(true)
    }

    /// Write the new attempts (and `passes` on completion) back to the
    /// backlog. Fields the loop did not change keep their on-disk value.
    fn persist(
        &mut self,
        graph: &mut StoryGraph,
        story_id: &str,
        report: &CascadeReport,
    ) -> Result<()> {
        graph.record_attempts(story_id, &report.attempts)?;
        self.active = None;
        if report.completed_story() {
            graph.mark_passed(story_id)?;
            tracing::info!(story = story_id, "story passed");
        } else if report.succeeded() {
            tracing::info!(story = story_id, "agent exited cleanly without completion signal");
            self.active = Some(story_id.to_string());
        }
        graph.set_active(self.active.clone());

        let mut patch = StoryPatch {
            attempts: report.attempts.clone(),
            ..StoryPatch::default()
        };
        if report.completed_story() {
            patch.passes = Some(true);
            patch.note = Some(COMPLETION_NOTE.to_string());
        }
        if patch == StoryPatch::default() {
            return Ok(());
        }
        Backlog::write_story_fields(&self.backlog_path, story_id, &patch)
    }

    fn record_iteration(&mut self, story_id: &str, initial: &ModelTarget, report: &CascadeReport) {
        let (executor, model) = report
            .attempts
            .last()
            .map(|a| (a.executor_name.clone(), a.model.clone()))
            .unwrap_or_else(|| (initial.executor.clone(), initial.model.clone()));
        let outcome = match &report.outcome {
            CascadeOutcome::Succeeded {
                is_complete_signal: true,
                ..
            } => "completed",
            CascadeOutcome::Succeeded { .. } => "progressed",
            CascadeOutcome::Exhausted => "exhausted",
            CascadeOutcome::RateLimited { .. } => "rate_limited",
        };
        self.progress.record(IterationRecord {
            iteration: self.iterations,
            story_id: story_id.to_string(),
            executor,
            model,
            outcome: outcome.to_string(),
            cost_usd: report.total_cost,
            timestamp: self.clock.now(),
        });
    }

    fn finish(
        &mut self,
        status: LoopStatus,
        graph: &StoryGraph,
        blocked: Option<BlockedReason>,
    ) -> Result<LoopReport> {
        let requeued_guidance = self.requeue_guidance();
        let reason = blocked.as_ref().map(ToString::to_string);
        self.progress
            .set_status(status.into(), reason, self.clock.now());
        self.progress.save(&self.root)?;

        let summary = graph.summary();
        tracing::info!(
            status = %status,
            iterations = self.iterations,
            cost_usd = self.total_cost,
            passed = summary.passed,
            total = summary.total,
            "run finished"
        );
        Ok(LoopReport {
            status,
            iterations: self.iterations,
            total_cost: self.total_cost,
            summary,
            blocked,
            notices: std::mem::take(&mut self.notices),
            requeued_guidance,
        })
    }

    /// Put guidance drained but never sent to an agent back on the queue so
    /// the next run delivers it.
    fn requeue_guidance(&mut self) -> Vec<String> {
        let mut requeued = Vec::new();
        for text in std::mem::take(&mut self.guidance) {
            match self.queue.add(&text) {
                Ok(_) => requeued.push(text),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to requeue guidance");
                    self.notices.push(format!("undelivered guidance: {text}"));
                }
            }
        }
        if !requeued.is_empty() {
            tracing::info!(count = requeued.len(), "requeued undelivered guidance");
        }
        requeued
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
