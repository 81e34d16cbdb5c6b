//! Signal detection in raw agent output.
//!
//! Agents report rate limits and completion as text, not as structured
//! data. Everything here is a pure function of the captured output so the
//! rules can be tested without spawning anything.

use chrono::{DateTime, Duration, TimeZone, Utc};
use regex::Regex;
use std::sync::OnceLock;

pub const COMPLETION_MARKER: &str = "<promise>COMPLETE</promise>";

static RATE_LIMIT_RE: OnceLock<Regex> = OnceLock::new();
static RESET_AT_RE: OnceLock<Regex> = OnceLock::new();
static RETRY_IN_RE: OnceLock<Regex> = OnceLock::new();
static RESET_EPOCH_RE: OnceLock<Regex> = OnceLock::new();

fn rate_limit_re() -> &'static Regex {
    RATE_LIMIT_RE.get_or_init(|| {
        Regex::new(r"(?i)\b429\b|rate[ -]?limit|quota exceeded|too many requests|usage limit")
            .unwrap()
    })
}

fn reset_at_re() -> &'static Regex {
    RESET_AT_RE.get_or_init(|| {
        Regex::new(r"(?i)resets?\s+at\s+(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2}))")
            .unwrap()
    })
}

fn retry_in_re() -> &'static Regex {
    RETRY_IN_RE.get_or_init(|| {
        Regex::new(r"(?i)try again in\s+(\d+)\s*(seconds?|secs?|minutes?|mins?|hours?|hrs?)\b")
            .unwrap()
    })
}

fn reset_epoch_re() -> &'static Regex {
    RESET_EPOCH_RE.get_or_init(|| Regex::new(r"(?i)limit reached\|(\d{9,11})").unwrap())
}

/// Signals extracted from one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signals {
    pub rate_limited: bool,
    pub reset_time: Option<DateTime<Utc>>,
    pub is_complete_signal: bool,
    pub cost_usd: Option<f64>,
}

/// Scan `output` from a run that exited with `exit_code`.
///
/// Rate-limit phrases only count on a non-zero exit: an agent that finishes
/// cleanly may well have been writing rate-limiting code.
pub fn scan(output: &str, exit_code: i32, now: DateTime<Utc>) -> Signals {
    let rate_limited = exit_code != 0 && is_rate_limited(output);
    Signals {
        rate_limited,
        reset_time: if rate_limited {
            parse_reset_time(output, now)
        } else {
            None
        },
        is_complete_signal: has_completion_signal(output),
        cost_usd: extract_cost(output),
    }
}

pub fn is_rate_limited(output: &str) -> bool {
    rate_limit_re().is_match(output)
}

/// When the limit lifts, if the output says so.
pub fn parse_reset_time(output: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(caps) = reset_at_re().captures(output) {
        if let Ok(ts) = DateTime::parse_from_rfc3339(&caps[1]) {
            return Some(ts.with_timezone(&Utc));
        }
    }

    if let Some(caps) = retry_in_re().captures(output) {
        let n: i64 = caps[1].parse().ok()?;
        let unit = caps[2].to_ascii_lowercase();
        let delta = if unit.starts_with('h') {
            Duration::hours(n)
        } else if unit.starts_with('m') {
            Duration::minutes(n)
        } else {
            Duration::seconds(n)
        };
        return Some(now + delta);
    }

    if let Some(caps) = reset_epoch_re().captures(output) {
        let secs: i64 = caps[1].parse().ok()?;
        return Utc.timestamp_opt(secs, 0).single();
    }

    None
}

pub fn has_completion_signal(output: &str) -> bool {
    output.contains(COMPLETION_MARKER)
}

/// `total_cost_usd` from the last JSON line that carries it.
pub fn extract_cost(output: &str) -> Option<f64> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{') && line.contains("total_cost_usd"))
        .find_map(|line| {
            serde_json::from_str::<serde_json::Value>(line)
                .ok()?
                .get("total_cost_usd")?
                .as_f64()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn rate_limit_phrases() {
        for text in [
            "HTTP 429 returned",
            "You have hit the Rate Limit",
            "request was rate-limited",
            "Quota exceeded for model",
            "Too Many Requests",
            "Claude AI usage limit reached|1767225600",
        ] {
            assert!(is_rate_limited(text), "{text}");
        }
        assert!(!is_rate_limited("all tests passed in 4290ms"));
        assert!(!is_rate_limited("implemented the feature"));
    }

    #[test]
    fn clean_exit_ignores_rate_limit_words() {
        let signals = scan("added a rate limiter middleware", 0, now());
        assert!(!signals.rate_limited);
        let signals = scan("error: rate limit exceeded", 1, now());
        assert!(signals.rate_limited);
    }

    #[test]
    fn reset_at_rfc3339() {
        let reset = parse_reset_time("limit hit; resets at 2026-02-01T11:30:00Z", now());
        assert_eq!(reset, Some(Utc.with_ymd_and_hms(2026, 2, 1, 11, 30, 0).unwrap()));

        let offset = parse_reset_time("Reset at 2026-02-01T13:00:00+02:00", now());
        assert_eq!(offset, Some(Utc.with_ymd_and_hms(2026, 2, 1, 11, 0, 0).unwrap()));
    }

    #[test]
    fn try_again_in_relative() {
        assert_eq!(
            parse_reset_time("429: try again in 30 seconds", now()),
            Some(now() + Duration::seconds(30))
        );
        assert_eq!(
            parse_reset_time("Try again in 5 min", now()),
            Some(now() + Duration::minutes(5))
        );
        assert_eq!(
            parse_reset_time("try again in 2 hours", now()),
            Some(now() + Duration::hours(2))
        );
    }

    #[test]
    fn reset_from_epoch_suffix() {
        assert_eq!(
            parse_reset_time("Claude AI usage limit reached|1767225600", now()),
            Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn no_reset_hint() {
        assert_eq!(parse_reset_time("rate limit", now()), None);
    }

    #[test]
    fn completion_marker() {
        assert!(has_completion_signal("done\n<promise>COMPLETE</promise>\n"));
        assert!(!has_completion_signal("<promise>INCOMPLETE</promise>"));
    }

    #[test]
    fn cost_from_last_result_line() {
        let out = r#"{"type":"system","subtype":"init"}
{"type":"assistant","message":{}}
{"type":"result","subtype":"success","total_cost_usd":0.0421}
"#;
        assert_eq!(extract_cost(out), Some(0.0421));
        assert_eq!(extract_cost("plain text output"), None);
        assert_eq!(extract_cost("{not json total_cost_usd}"), None);
    }
}
