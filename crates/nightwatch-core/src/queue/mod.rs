//! Durable, crash-safe command queue.
//!
//! Layout (under `.nightwatch/queue/`):
//!   pending.log    items waiting for the next drain, append-only
//!   processed.log  archive, each line suffixed with `processedAt`
//!   inflight.log   journal of a drain in progress (normally absent)
//!   queue.lock     sentinel for cross-process mutual exclusion
//!
//! Every mutation runs under [`QueueLock`]. A drain journals the claimed
//! batch before truncating `pending.log`, so a crash at any point leaves
//! each item in exactly one place once the next locked operation recovers.

pub mod lock;
pub mod store;

pub use lock::{LockGuard, LockToken, QueueLock, DEFAULT_LOCK_TIMEOUT};
pub use store::{ItemKind, LogKind, QueueCommand, QueueItem};

use crate::error::{NightwatchError, Result};
use crate::io;
use crate::paths::QueuePaths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use store::{parse_log, serialize_item, serialize_log, IdSequencer, ParsedLog};

pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Snapshots and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueState {
    pub pending: Vec<QueueItem>,
    pub processed: Vec<QueueItem>,
    pub warnings: Vec<String>,
}

/// Everything one `process()` call moved to the archive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessedBatch {
    pub items: Vec<QueueItem>,
    /// Free-text prompts, in log order.
    pub prompts: Vec<String>,
    /// Recognized commands, in log order.
    pub commands: Vec<QueueCommand>,
    /// Malformed pending lines dropped by this drain.
    pub warnings: Vec<String>,
}

impl ProcessedBatch {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.warnings.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Queue {
    paths: QueuePaths,
    lock: QueueLock,
    lock_wait: Duration,
}

impl Queue {
    /// Open the queue stored in `dir`. Files are created lazily.
    pub fn open(dir: &Path) -> Self {
        let paths = QueuePaths::in_dir(dir);
        let lock = QueueLock::new(paths.lock.clone());
        Self {
            paths,
            lock,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    /// Open the queue of a project root (`<root>/.nightwatch/queue`).
    pub fn for_root(root: &Path) -> Self {
        Self::open(&crate::paths::queue_dir(root))
    }

    pub fn paths(&self) -> &QueuePaths {
        &self.paths
    }

    pub fn lock(&self) -> &QueueLock {
        &self.lock
    }

    pub fn set_lock_timeout(&mut self, timeout: Duration) {
        self.lock.set_timeout(timeout);
    }

    /// How long `add`/`load`/`process` wait for a live holder before giving up.
    pub fn set_lock_wait(&mut self, wait: Duration) {
        self.lock_wait = wait;
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Append one entry to the pending log.
    ///
    /// Embedded newlines are folded to spaces so the entry stays on one line.
    pub fn add(&self, content: &str) -> Result<QueueItem> {
        let content = content.replace(['\r', '\n'], " ");
        if let store::Content::InvalidCommand(token) = store::classify_content(&content) {
            return Err(NightwatchError::InvalidCommand(token));
        }

        let _guard = self.guard()?;
        self.recover()?;

        let added_at = crate::clock::now_millis();
        let mut ids = self.archived_ids_since(added_at)?;
        self.read_log(LogKind::Pending, &mut ids)?;

        let item = store::new_item(ids.next_id(added_at), &content, added_at);
        let mut line = serialize_item(&item);
        line.push('\n');
        io::append_text(&self.paths.pending, &line)?;

        tracing::debug!(id = %item.id, kind = ?item.kind, "queued item");
        Ok(item)
    }

    pub fn add_command(&self, command: &QueueCommand) -> Result<QueueItem> {
        self.add(&command.token())
    }

    /// Snapshot both logs. Missing files are empty logs.
    pub fn load(&self) -> Result<QueueState> {
        let _guard = self.guard()?;
        self.recover()?;

        let mut ids = IdSequencer::new();
        let processed = self.read_log(LogKind::Processed, &mut ids)?;
        let pending = self.read_log(LogKind::Pending, &mut ids)?;

        let mut warnings = processed.warnings;
        warnings.extend(pending.warnings);
        Ok(QueueState {
            pending: pending.items,
            processed: processed.items,
            warnings,
        })
    }

    /// Move every pending item to the processed log and return what moved.
    ///
    /// Racing callers are serialized by the lock, so each item lands in
    /// exactly one returned batch.
    pub fn process(&self) -> Result<ProcessedBatch> {
        let _guard = self.guard()?;
        self.recover()?;

        let pending_text = io::read_or_empty(&self.paths.pending)?;
        if pending_text.trim().is_empty() {
            return Ok(ProcessedBatch::default());
        }

        let oldest = parse_log(&pending_text, LogKind::Pending, &mut IdSequencer::new())
            .items
            .iter()
            .map(|item| item.added_at)
            .min();
        let mut ids = match oldest {
            Some(since) => self.archived_ids_since(since)?,
            None => IdSequencer::new(),
        };
        let pending = parse_log(&pending_text, LogKind::Pending, &mut ids);

        let processed_at = crate::clock::now_millis();
        let items: Vec<QueueItem> = pending
            .items
            .into_iter()
            .map(|mut item| {
                item.processed_at = Some(processed_at);
                item
            })
            .collect();
        let batch_text = serialize_log(&items);

        io::atomic_write(&self.paths.inflight, batch_text.as_bytes())?;
        io::atomic_write(&self.paths.pending, b"")?;
        io::append_text(&self.paths.processed, &batch_text)?;
        std::fs::remove_file(&self.paths.inflight)?;

        for warning in &pending.warnings {
            tracing::warn!(warning = %warning, "dropped malformed queue line");
        }

        let mut batch = ProcessedBatch {
            warnings: pending.warnings,
            ..Default::default()
        };
        for item in items {
            match &item.command {
                Some(cmd) => batch.commands.push(cmd.clone()),
                None => batch.prompts.push(item.content.clone()),
            }
            batch.items.push(item);
        }

        tracing::info!(
            prompts = batch.prompts.len(),
            commands = batch.commands.len(),
            "drained queue"
        );
        Ok(batch)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn guard(&self) -> Result<LockGuard<'_>> {
        LockGuard::acquire(&self.lock, self.lock_wait)?
            .ok_or_else(|| NightwatchError::LockBusy(self.lock.path().display().to_string()))
    }

    fn read_log(&self, kind: LogKind, ids: &mut IdSequencer) -> Result<ParsedLog> {
        let path = match kind {
            LogKind::Pending => &self.paths.pending,
            LogKind::Processed => &self.paths.processed,
        };
        Ok(parse_log(&io::read_or_empty(path)?, kind, ids))
    }

    /// Seed a sequencer with the archived entries added at or after `since`.
    ///
    /// The archive is appended in drain order, which is add order, so the
    /// walk from the end stops at the first entry older than `since` instead
    /// of parsing the whole history.
    fn archived_ids_since(&self, since: DateTime<Utc>) -> Result<IdSequencer> {
        let since = since.timestamp_millis();
        let mut ids = IdSequencer::new();
        io::for_each_line_rev(&self.paths.processed, |line| {
            let parsed = parse_log(line, LogKind::Processed, &mut IdSequencer::new());
            let Some(item) = parsed.items.first() else {
                return true;
            };
            if item.added_at.timestamp_millis() < since {
                return false;
            }
            ids.observe(item.added_at);
            true
        })?;
        Ok(ids)
    }

    /// Finish or discard a drain interrupted by a crash. Caller holds the lock.
    fn recover(&self) -> Result<()> {
        let journal = match std::fs::read_to_string(&self.paths.inflight) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let batch = parse_log(&journal, LogKind::Processed, &mut IdSequencer::new());
        let pending_text = io::read_or_empty(&self.paths.pending)?;
        let pending = parse_log(&pending_text, LogKind::Pending, &mut IdSequencer::new());

        let still_pending = !batch.items.is_empty()
            && pending.items.len() >= batch.items.len()
            && batch
                .items
                .iter()
                .zip(&pending.items)
                .all(|(b, p)| b.added_at == p.added_at && b.content == p.content);

        if still_pending {
            tracing::warn!("discarding drain journal; pending log was never truncated");
        } else {
            let processed_text = io::read_or_empty(&self.paths.processed)?;
            if !processed_text.ends_with(&journal) {
                tracing::warn!(
                    items = batch.items.len(),
                    "completing interrupted queue drain"
                );
                io::append_text(&self.paths.processed, &journal)?;
            }
        }
        std::fs::remove_file(&self.paths.inflight)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn queue(dir: &TempDir) -> Queue {
        Queue::open(dir.path())
    }

    #[test]
    fn missing_files_load_as_empty() {
        let dir = TempDir::new().unwrap();
        let state = queue(&dir).load().unwrap();
        assert!(state.pending.is_empty());
        assert!(state.processed.is_empty());
        assert!(state.warnings.is_empty());
    }

    #[test]
    fn add_then_load_returns_pending_items() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        let a = q.add("check the migration").unwrap();
        let b = q.add_command(&QueueCommand::Pause).unwrap();

        let state = q.load().unwrap();
        assert_eq!(state.pending.len(), 2);
        assert_eq!(state.pending[0].id, a.id);
        assert_eq!(state.pending[1].id, b.id);
        assert_eq!(state.pending[1].command, Some(QueueCommand::Pause));
        assert!(!q.lock().path().exists(), "lock released after add");
    }

    #[test]
    fn add_rejects_command_missing_story_id() {
        let dir = TempDir::new().unwrap();
        let err = queue(&dir).add("[SKIP]").unwrap_err();
        assert!(matches!(err, NightwatchError::InvalidCommand(_)));
    }

    #[test]
    fn add_folds_newlines() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        q.add("line one\nline two").unwrap();
        let state = q.load().unwrap();
        assert_eq!(state.pending.len(), 1);
        assert_eq!(state.pending[0].content, "line one line two");
    }

    #[test]
    fn load_counts_malformed_lines_as_warnings() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        std::fs::write(
            &q.paths().pending,
            "2026-01-01T00:00:00.000Z | hello\nnot a line\n2026-01-01T00:00:01.000Z | [SKIP US-003]\n",
        )
        .unwrap();

        let state = q.load().unwrap();
        assert_eq!(state.pending.len(), 2);
        assert_eq!(state.pending[0].kind, ItemKind::Prompt);
        assert_eq!(state.pending[1].kind, ItemKind::Command);
        assert_eq!(state.warnings.len(), 1);
        assert!(state.warnings[0].contains("not a line"));
    }

    #[test]
    fn process_moves_items_and_preserves_order() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        let first = q.add("first").unwrap();
        q.add_command(&QueueCommand::Skip {
            story_id: "US-003".into(),
        })
        .unwrap();
        q.add("second").unwrap();

        let batch = q.process().unwrap();
        assert_eq!(batch.prompts, vec!["first", "second"]);
        assert_eq!(
            batch.commands,
            vec![QueueCommand::Skip {
                story_id: "US-003".into()
            }]
        );
        assert!(batch.items.iter().all(|i| i.processed_at.is_some()));

        let state = q.load().unwrap();
        assert!(state.pending.is_empty());
        assert_eq!(state.processed.len(), 3);
        assert_eq!(state.processed[0].id, first.id, "id stable across the move");
        assert!(state.processed.iter().all(|i| i.processed_at.is_some()));

        let again = q.process().unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn process_drops_malformed_lines_with_warning() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        std::fs::write(
            &q.paths().pending,
            "junk\n2026-01-01T00:00:00.000Z | keep me\n",
        )
        .unwrap();

        let batch = q.process().unwrap();
        assert_eq!(batch.prompts, vec!["keep me"]);
        assert_eq!(batch.warnings.len(), 1);
        assert_eq!(std::fs::read_to_string(&q.paths().pending).unwrap(), "");
    }

    #[test]
    fn twenty_concurrent_adds_are_all_kept() {
        let dir = TempDir::new().unwrap();
        let root = Arc::new(dir.path().to_path_buf());

        let handles: Vec<_> = (0..20)
            .map(|n| {
                let root = Arc::clone(&root);
                std::thread::spawn(move || {
                    Queue::open(&root).add(&format!("message {n}")).unwrap()
                })
            })
            .collect();
        let added: Vec<QueueItem> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let state = Queue::open(&root).load().unwrap();
        assert_eq!(state.pending.len(), 20);
        assert!(state.warnings.is_empty());

        let contents: HashSet<_> = state.pending.iter().map(|i| i.content.clone()).collect();
        let expected: HashSet<_> = (0..20).map(|n| format!("message {n}")).collect();
        assert_eq!(contents, expected);

        let ids: HashSet<_> = state.pending.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids.len(), 20, "ids are distinct");
        let returned: HashSet<_> = added.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, returned);
    }

    #[test]
    fn racing_process_calls_partition_items() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        for n in 0..30 {
            q.add(&format!("prompt {n}")).unwrap();
        }

        let root = Arc::new(dir.path().to_path_buf());
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let root = Arc::clone(&root);
                std::thread::spawn(move || Queue::open(&root).process().unwrap())
            })
            .collect();
        let batches: Vec<ProcessedBatch> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let all: Vec<String> = batches.iter().flat_map(|b| b.prompts.clone()).collect();
        assert_eq!(all.len(), 30);
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), 30);

        let state = q.load().unwrap();
        assert!(state.pending.is_empty());
        assert_eq!(state.processed.len(), 30);
    }

    #[test]
    fn adds_after_process_land_in_next_batch() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        q.add("one").unwrap();
        assert_eq!(q.process().unwrap().prompts, vec!["one"]);
        q.add("two").unwrap();
        assert_eq!(q.process().unwrap().prompts, vec!["two"]);
        assert_eq!(q.load().unwrap().processed.len(), 2);
    }

    #[test]
    fn drained_ids_continue_the_archived_millisecond() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        let mut archive = String::new();
        for n in 0..500 {
            archive.push_str(&format!(
                "2026-01-01T00:00:00.{:03}Z | old {n} | processedAt:2026-01-01T00:00:01.000Z\n",
                n % 1000
            ));
        }
        archive.push_str("2026-01-02T00:00:00.000Z | a | processedAt:2026-01-02T00:00:01.000Z\n");
        archive.push_str("2026-01-02T00:00:00.000Z | b | processedAt:2026-01-02T00:00:01.000Z\n");
        std::fs::write(&q.paths().processed, archive).unwrap();
        std::fs::write(
            &q.paths().pending,
            "2026-01-02T00:00:00.000Z | c\n2026-01-02T00:00:00.001Z | d\n",
        )
        .unwrap();

        let listed: Vec<String> = q.load().unwrap().pending.into_iter().map(|i| i.id).collect();
        let millis = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap().timestamp_millis();
        assert_eq!(
            listed,
            vec![format!("q-{millis}-2"), format!("q-{}-0", millis + 1)]
        );

        let drained: Vec<String> = q.process().unwrap().items.into_iter().map(|i| i.id).collect();
        assert_eq!(drained, listed);

        let added = q.add("e").unwrap();
        assert!(added.id.starts_with("q-"));
        let state = q.load().unwrap();
        assert_eq!(state.pending[0].id, added.id);
    }

    #[test]
    fn recovers_drain_interrupted_after_truncation() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        let journal = "2026-01-01T00:00:00.000Z | orphan | processedAt:2026-01-01T00:00:05.000Z\n";
        std::fs::write(&q.paths().inflight, journal).unwrap();
        std::fs::write(&q.paths().pending, "").unwrap();

        let state = q.load().unwrap();
        assert_eq!(state.processed.len(), 1);
        assert_eq!(state.processed[0].content, "orphan");
        assert!(!q.paths().inflight.exists());

        // Recovery is idempotent: a second pass does not duplicate.
        std::fs::write(&q.paths().inflight, journal).unwrap();
        let state = q.load().unwrap();
        assert_eq!(state.processed.len(), 1);
    }

    #[test]
    fn discards_journal_when_pending_was_never_truncated() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        std::fs::write(
            &q.paths().inflight,
            "2026-01-01T00:00:00.000Z | still here | processedAt:2026-01-01T00:00:05.000Z\n",
        )
        .unwrap();
        std::fs::write(
            &q.paths().pending,
            "2026-01-01T00:00:00.000Z | still here\n2026-01-01T00:00:06.000Z | newer\n",
        )
        .unwrap();

        let state = q.load().unwrap();
        assert_eq!(state.pending.len(), 2);
        assert!(state.processed.is_empty());
        assert!(!q.paths().inflight.exists());
    }

    #[test]
    fn stale_lock_does_not_block_add() {
        let dir = TempDir::new().unwrap();
        let mut q = queue(&dir);
        q.set_lock_timeout(Duration::from_millis(50));
        assert!(q.lock().acquire().unwrap().is_some());
        std::thread::sleep(Duration::from_millis(100));
        q.add("after crash").unwrap();
        assert_eq!(q.load().unwrap().pending.len(), 1);
    }

    #[test]
    fn live_lock_makes_add_report_busy() {
        let dir = TempDir::new().unwrap();
        let mut q = queue(&dir);
        q.set_lock_wait(Duration::from_millis(30));
        assert!(q.lock().acquire().unwrap().is_some());
        let err = q.add("blocked").unwrap_err();
        assert!(matches!(err, NightwatchError::LockBusy(_)));
    }
}
