//! Loop & error detectors.
//!
//! Pure functions over two sliding windows the supervisor maintains per
//! dispatch: the last 10 `(tool, target)` calls and the last 20
//! `(tool, target, first-error-line)` failures. No hidden state —
//! detection is deterministic, order-dependent, and monotonic in window
//! length; idempotence of the resulting warnings/kills is the supervisor's
//! responsibility.

use once_cell::sync::Lazy;
use regex::Regex;

/// Tool-call window length.
pub const TOOL_WINDOW: usize = 10;
/// Error window length.
pub const ERROR_WINDOW: usize = 20;
/// Error first-lines are clipped to this length before comparison.
pub const ERROR_LINE_MAX: usize = 200;

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// One observed tool invocation, identified by tool name plus the salient
/// target lifted from its input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub tool: String,
    pub target: Option<String>,
}

impl CallKey {
    pub fn new(tool: impl Into<String>, target: Option<String>) -> Self {
        Self {
            tool: tool.into(),
            target,
        }
    }
}

/// One observed tool failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorKey {
    pub tool: String,
    pub target: Option<String>,
    pub first_line: String,
}

/// Highest occurrence count of any single call in the window.
pub fn max_repeat_count(window: &[CallKey]) -> usize {
    let mut best = 0;
    for (i, key) in window.iter().enumerate() {
        // Count each distinct key once, starting at its first occurrence.
        if window[..i].contains(key) {
            continue;
        }
        let count = window.iter().filter(|k| *k == key).count();
        best = best.max(count);
    }
    best
}

/// Number of alternations in the strictly-alternating a/b suffix of the
/// window, where `a` and `b` are the two most recent distinct calls.
///
/// Returns 0 unless the tail genuinely alternates: a straight `a,a,a` run
/// is the repeat detector's business, not this one's.
pub fn pingpong_count(window: &[CallKey]) -> usize {
    let Some(a) = window.last() else { return 0 };
    let Some(b) = window.iter().rev().find(|k| *k != a) else {
        return 0;
    };

    // Walk back while elements strictly alternate between a and b.
    let mut alternations = 0;
    let mut expected = [a, b].into_iter().cycle();
    let mut prev: Option<&CallKey> = None;
    for key in window.iter().rev() {
        let want = expected.next().unwrap_or(a);
        if key != want {
            break;
        }
        if prev.is_some() {
            alternations += 1;
        }
        prev = Some(key);
    }
    alternations
}

/// Whether any failure appears twice in the window — the mark of an error
/// the agent keeps re-hitting verbatim.
pub fn find_non_retryable(window: &[ErrorKey]) -> Option<&ErrorKey> {
    window
        .iter()
        .enumerate()
        .find(|(i, key)| window[..*i].contains(key))
        .map(|(_, key)| key)
}

/// Normalize an error message for window comparison: first line only,
/// whitespace collapsed, clipped to [`ERROR_LINE_MAX`] chars.
pub fn normalize_error_line(message: &str) -> String {
    let first = message.lines().next().unwrap_or("");
    let collapsed = WHITESPACE_RE.replace_all(first.trim(), " ");
    collapsed.chars().take(ERROR_LINE_MAX).collect()
}

/// Push onto a bounded window, evicting from the front.
pub fn push_bounded<T>(window: &mut Vec<T>, item: T, cap: usize) {
    window.push(item);
    if window.len() > cap {
        window.remove(0);
    }
}
