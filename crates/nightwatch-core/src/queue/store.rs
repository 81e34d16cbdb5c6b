//! Text <-> struct mapping for the queue logs.
//!
//! One entry per line:
//!
//! ```text
//! 2026-01-01T00:00:00.000Z | free text prompt
//! 2026-01-01T00:00:01.000Z | [SKIP US-003]
//! 2026-01-01T00:00:01.000Z | [PAUSE] | processedAt:2026-01-01T00:00:05.000Z
//! ```
//!
//! The `processedAt` suffix only appears in the processed log. Nothing here
//! touches the filesystem.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const SEPARATOR: char = '|';
const PROCESSED_MARKER: &str = " | processedAt:";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Prompt,
    Command,
}

/// A recognized control command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueCommand {
    Pause,
    Abort,
    Skip { story_id: String },
    Priority { story_id: String },
}

impl QueueCommand {
    /// The canonical bracketed token, e.g. `[SKIP US-003]`.
    pub fn token(&self) -> String {
        match self {
            QueueCommand::Pause => "[PAUSE]".to_string(),
            QueueCommand::Abort => "[ABORT]".to_string(),
            QueueCommand::Skip { story_id } => format!("[SKIP {story_id}]"),
            QueueCommand::Priority { story_id } => format!("[PRIORITY {story_id}]"),
        }
    }

    pub fn target_story_id(&self) -> Option<&str> {
        match self {
            QueueCommand::Skip { story_id } | QueueCommand::Priority { story_id } => {
                Some(story_id)
            }
            QueueCommand::Pause | QueueCommand::Abort => None,
        }
    }
}

impl std::fmt::Display for QueueCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.token())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    /// Raw content exactly as it appears after the separator.
    pub content: String,
    pub kind: ItemKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<QueueCommand>,
    pub added_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    pub fn target_story_id(&self) -> Option<&str> {
        self.command.as_ref().and_then(QueueCommand::target_story_id)
    }
}

/// Which log a text blob was read from. Only the processed log may carry the
/// `processedAt` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Pending,
    Processed,
}

impl LogKind {
    fn label(self) -> &'static str {
        match self {
            LogKind::Pending => "pending",
            LogKind::Processed => "processed",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedLog {
    pub items: Vec<QueueItem>,
    pub warnings: Vec<String>,
}

/// What the content of a well-formed line turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Prompt,
    Command(QueueCommand),
    /// A `SKIP`/`PRIORITY` token without a story id.
    InvalidCommand(String),
}

// ---------------------------------------------------------------------------
// Id sequencing
// ---------------------------------------------------------------------------

/// Assigns `q-<millis>-<seq>` ids, counting repeats of the same millisecond.
///
/// Feed the processed log first and the pending log second so ids stay
/// stable when items move to the end of the processed log.
#[derive(Debug, Default, Clone)]
pub struct IdSequencer {
    seen: HashMap<i64, u32>,
}

impl IdSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self, added_at: DateTime<Utc>) -> String {
        let millis = added_at.timestamp_millis();
        let seq = self.seen.entry(millis).or_insert(0);
        let id = format!("q-{millis}-{seq}");
        *seq += 1;
        id
    }

    /// Count an entry that already holds the next id of its millisecond.
    pub fn observe(&mut self, added_at: DateTime<Utc>) {
        *self.seen.entry(added_at.timestamp_millis()).or_insert(0) += 1;
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Classify the content portion of a line.
pub fn classify_content(content: &str) -> Content {
    let trimmed = content.trim();
    let Some(inner) = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
    else {
        return Content::Prompt;
    };

    let mut words = inner.split_whitespace();
    let Some(keyword) = words.next() else {
        return Content::Prompt;
    };
    let args: Vec<&str> = words.collect();

    match keyword.to_ascii_uppercase().as_str() {
        "PAUSE" if args.is_empty() => Content::Command(QueueCommand::Pause),
        "ABORT" if args.is_empty() => Content::Command(QueueCommand::Abort),
        "SKIP" | "PRIORITY" if args.is_empty() => Content::InvalidCommand(trimmed.to_string()),
        "SKIP" => Content::Command(QueueCommand::Skip {
            story_id: args.join(" "),
        }),
        "PRIORITY" => Content::Command(QueueCommand::Priority {
            story_id: args.join(" "),
        }),
        _ => Content::Prompt,
    }
}

/// Split one raw line into `(added_at, content, processed_at)`.
///
/// Returns `None` for a malformed line (no separator, or unparseable leading
/// timestamp).
fn split_line(
    line: &str,
    kind: LogKind,
) -> Option<(DateTime<Utc>, String, Option<DateTime<Utc>>)> {
    let (ts, rest) = line.split_once(SEPARATOR)?;
    let added_at = parse_timestamp(ts)?;
    let mut content = rest.strip_prefix(' ').unwrap_or(rest);

    let mut processed_at = None;
    if kind == LogKind::Processed {
        if let Some((head, tail)) = content.rsplit_once(PROCESSED_MARKER) {
            if let Some(at) = parse_timestamp(tail) {
                processed_at = Some(at);
                content = head;
            }
        }
    }
    Some((added_at, content.to_string(), processed_at))
}

/// Parse a whole log. Never fails: malformed lines become warnings and
/// parsing continues with the next line.
pub fn parse_log(text: &str, kind: LogKind, ids: &mut IdSequencer) -> ParsedLog {
    let mut parsed = ParsedLog::default();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.trim().is_empty() {
            continue;
        }

        let Some((added_at, content, processed_at)) = split_line(line, kind) else {
            parsed.warnings.push(format!(
                "{} log line {line_no}: malformed entry \"{line}\"",
                kind.label()
            ));
            continue;
        };

        let (item_kind, command) = match classify_content(&content) {
            Content::Prompt => (ItemKind::Prompt, None),
            Content::Command(cmd) => (ItemKind::Command, Some(cmd)),
            Content::InvalidCommand(token) => {
                parsed.warnings.push(format!(
                    "{} log line {line_no}: invalid command \"{token}\": missing story id",
                    kind.label()
                ));
                continue;
            }
        };

        parsed.items.push(QueueItem {
            id: ids.next_id(added_at),
            content,
            kind: item_kind,
            command,
            added_at,
            processed_at,
        });
    }

    parsed
}

/// Serialize one item to a line (without trailing newline).
///
/// Exact inverse of [`parse_log`] for well-formed items.
pub fn serialize_item(item: &QueueItem) -> String {
    let mut line = format!("{} | {}", format_timestamp(item.added_at), item.content);
    if let Some(at) = item.processed_at {
        line.push_str(PROCESSED_MARKER);
        line.push_str(&format_timestamp(at));
    }
    line
}

/// Serialize a batch of items, one line each, newline-terminated.
pub fn serialize_log(items: &[QueueItem]) -> String {
    let mut out = String::new();
    for item in items {
        out.push_str(&serialize_item(item));
        out.push('\n');
    }
    out
}

/// Build a new pending item for `content` appended at `added_at`.
pub fn new_item(id: String, content: &str, added_at: DateTime<Utc>) -> QueueItem {
    let (kind, command) = match classify_content(content) {
        Content::Command(cmd) => (ItemKind::Command, Some(cmd)),
        Content::Prompt | Content::InvalidCommand(_) => (ItemKind::Prompt, None),
    };
    QueueItem {
        id,
        content: content.to_string(),
        kind,
        command,
        added_at,
        processed_at: None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        parse_timestamp(s).unwrap()
    }

    fn parse_pending(text: &str) -> ParsedLog {
        parse_log(text, LogKind::Pending, &mut IdSequencer::new())
    }

    #[test]
    fn mixed_file_loads_items_and_one_warning() {
        let text = "2026-01-01T00:00:00.000Z | hello\nnot a line\n2026-01-01T00:00:01.000Z | [SKIP US-003]\n";
        let parsed = parse_pending(text);

        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.items[0].kind, ItemKind::Prompt);
        assert_eq!(parsed.items[0].content, "hello");
        assert_eq!(parsed.items[1].kind, ItemKind::Command);
        assert_eq!(
            parsed.items[1].command,
            Some(QueueCommand::Skip {
                story_id: "US-003".into()
            })
        );
        assert_eq!(parsed.warnings.len(), 1);
        assert!(parsed.warnings[0].contains("not a line"));
    }

    #[test]
    fn malformed_lines_never_halt_parsing() {
        let text = "garbage\n\
                    2026-01-01T00:00:00.000Z | one\n\
                    yesterday | two\n\
                    2026-01-01T00:00:02.000Z | three\n\
                    | four\n";
        let parsed = parse_pending(text);
        let contents: Vec<_> = parsed.items.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "three"]);
        assert_eq!(parsed.warnings.len(), 3);
        assert!(parsed.warnings[0].contains("garbage"));
        assert!(parsed.warnings[1].contains("yesterday | two"));
        assert!(parsed.warnings[2].contains("| four"));
    }

    #[test]
    fn only_first_separator_splits() {
        let parsed = parse_pending("2026-01-01T00:00:00.000Z | a | b | c\n");
        assert_eq!(parsed.items[0].content, "a | b | c");
    }

    #[test]
    fn blank_lines_are_ignored() {
        let parsed = parse_pending("\n   \n2026-01-01T00:00:00.000Z | x\n\n");
        assert_eq!(parsed.items.len(), 1);
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn command_keyword_case_insensitive_id_case_preserved() {
        let cases = [
            ("[pause]", QueueCommand::Pause),
            ("[Abort]", QueueCommand::Abort),
            (
                "[skip   Us-007 ]",
                QueueCommand::Skip {
                    story_id: "Us-007".into(),
                },
            ),
            (
                "[  PRIORITY\tUS-010]",
                QueueCommand::Priority {
                    story_id: "US-010".into(),
                },
            ),
        ];
        for (content, expected) in cases {
            assert_eq!(
                classify_content(content),
                Content::Command(expected),
                "content: {content}"
            );
        }
    }

    #[test]
    fn skip_without_id_is_invalid_command_warning() {
        let text = "2026-01-01T00:00:00.000Z | [SKIP]\n2026-01-01T00:00:01.000Z | [priority  ]\n";
        let parsed = parse_pending(text);
        assert!(parsed.items.is_empty());
        assert_eq!(parsed.warnings.len(), 2);
        assert!(parsed.warnings[0].contains("invalid command"));
        assert!(parsed.warnings[1].contains("missing story id"));
    }

    #[test]
    fn unknown_bracket_token_is_a_prompt() {
        assert_eq!(classify_content("[RESUME]"), Content::Prompt);
        assert_eq!(classify_content("[PAUSE now]"), Content::Prompt);
        assert_eq!(classify_content("[]"), Content::Prompt);
    }

    #[test]
    fn ids_count_repeats_of_same_millisecond() {
        let text = "2026-01-01T00:00:00.000Z | a\n2026-01-01T00:00:00.000Z | b\n2026-01-01T00:00:00.001Z | c\n";
        let parsed = parse_pending(text);
        let base = ts("2026-01-01T00:00:00.000Z").timestamp_millis();
        assert_eq!(parsed.items[0].id, format!("q-{base}-0"));
        assert_eq!(parsed.items[1].id, format!("q-{base}-1"));
        assert_eq!(parsed.items[2].id, format!("q-{}-0", base + 1));
    }

    #[test]
    fn pending_items_round_trip() {
        let mut ids = IdSequencer::new();
        let at = ts("2026-03-04T05:06:07.089Z");
        let items = vec![
            new_item(ids.next_id(at), "look at the failing test first", at),
            new_item(ids.next_id(at), "[SKIP US-003]", at),
            new_item(ids.next_id(at), "  spaced | piped  ", at),
        ];
        let text = serialize_log(&items);
        let parsed = parse_log(&text, LogKind::Pending, &mut IdSequencer::new());
        assert!(parsed.warnings.is_empty());
        assert_eq!(parsed.items, items);
    }

    #[test]
    fn processed_items_round_trip() {
        let at = ts("2026-01-01T00:00:00.000Z");
        let mut item = new_item("q-1767225600000-0".into(), "[PAUSE]", at);
        item.processed_at = Some(ts("2026-01-01T00:00:09.500Z"));

        let line = serialize_item(&item);
        assert_eq!(
            line,
            "2026-01-01T00:00:00.000Z | [PAUSE] | processedAt:2026-01-01T00:00:09.500Z"
        );
        let parsed = parse_log(&line, LogKind::Processed, &mut IdSequencer::new());
        assert_eq!(parsed.items, vec![item]);
    }

    #[test]
    fn processed_marker_ignored_in_pending_log() {
        let line = "2026-01-01T00:00:00.000Z | note | processedAt:2026-01-01T00:00:09.500Z";
        let parsed = parse_pending(line);
        assert_eq!(
            parsed.items[0].content,
            "note | processedAt:2026-01-01T00:00:09.500Z"
        );
        assert!(parsed.items[0].processed_at.is_none());
    }

    #[test]
    fn command_token_matches_serialized_form() {
        let cmd = QueueCommand::Priority {
            story_id: "US-2".into(),
        };
        assert_eq!(cmd.token(), "[PRIORITY US-2]");
        assert_eq!(classify_content(&cmd.token()), Content::Command(cmd));
    }
}
