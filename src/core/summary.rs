//! Run summary extraction from the log buffer.
//!
//! The summary is a best-effort digest of the most recent assistant output,
//! shown next to a finished run. Only the length budget is a hard guarantee.

use crate::core::state::LogEntry;

/// Maximum number of characters kept in a summary, excluding the ellipsis.
pub const SUMMARY_BUDGET: usize = 160;

/// Summary used when no output qualifies.
pub const NO_SUMMARY: &str = "No summary available";

const ELLIPSIS: char = '…';

/// Builds a summary from the tail of a run's log.
///
/// Scans from the newest entry backwards, skipping stderr lines, the
/// completion signal itself and raw JSON payloads, until the budget is filled.
/// Fragments are joined oldest-first.
#[must_use]
pub fn summarize<'a, I>(entries: I, completion_signal: &str) -> String
where
    I: IntoIterator<Item = &'a LogEntry>,
    I::IntoIter: DoubleEndedIterator,
{
    let signal = completion_signal.trim();
    let mut fragments: Vec<&str> = Vec::new();
    let mut collected = 0usize;

    for entry in entries.into_iter().rev() {
        if collected >= SUMMARY_BUDGET {
            break;
        }
        if entry.is_stderr {
            continue;
        }
        let text = entry.content.trim();
        if text.is_empty() || (!signal.is_empty() && text == signal) || looks_like_json(text) {
            continue;
        }
        collected += text.chars().count();
        fragments.push(text);
    }

    if fragments.is_empty() {
        return NO_SUMMARY.to_string();
    }

    fragments.reverse();
    let collapsed = fragments
        .iter()
        .flat_map(|fragment| fragment.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ");

    truncate_with_ellipsis(&collapsed, SUMMARY_BUDGET)
}

/// Returns true if `text` is bracketed like a single JSON object or array.
fn looks_like_json(text: &str) -> bool {
    (text.starts_with('{') && text.ends_with('}')) || (text.starts_with('[') && text.ends_with(']'))
}

/// Truncates to `max_chars` characters, appending an ellipsis when shortened.
#[must_use]
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.truncate(truncated.trim_end().len());
    truncated.push(ELLIPSIS);
    truncated
}
