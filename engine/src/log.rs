//! The merge log: every decision a merge made, in order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Text rendered for a log with no entries.
pub const EMPTY_LOG_TEXT: &str = "No changes.";

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    /// Both sides changed the same record; resolved deterministically
    Conflict,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Conflict => "CONFLICT",
        })
    }
}

/// One entry of a [`MergeLog`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogItem {
    pub level: LogLevel,
    /// Whether the entry concerns the local copy (`false`: the remote one)
    pub local: bool,
    pub path: String,
    pub text: String,
}

impl LogItem {
    pub fn new(level: LogLevel, local: bool, path: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            level,
            local,
            path: path.into(),
            text: text.into(),
        }
    }
}

impl fmt::Display for LogItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {} - {}", self.level, self.path, self.text)
    }
}

/// Ordered, append-only record of a merge.
///
/// Not synchronized: one merge owns one log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeLog {
    items: Vec<LogItem>,
    remote_out_of_date: bool,
    #[serde(default)]
    local_changed: bool,
}

impl MergeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, item: LogItem) {
        self.items.push(item);
    }

    pub fn info(&mut self, local: bool, path: impl Into<String>, text: impl Into<String>) {
        self.add(LogItem::new(LogLevel::Info, local, path, text));
    }

    pub fn warn(&mut self, local: bool, path: impl Into<String>, text: impl Into<String>) {
        self.add(LogItem::new(LogLevel::Warn, local, path, text));
    }

    pub fn error(&mut self, local: bool, path: impl Into<String>, text: impl Into<String>) {
        self.add(LogItem::new(LogLevel::Error, local, path, text));
    }

    pub fn conflict(&mut self, local: bool, path: impl Into<String>, text: impl Into<String>) {
        self.add(LogItem::new(LogLevel::Conflict, local, path, text));
    }

    pub fn items(&self) -> &[LogItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the remote copy should be re-saved after this merge.
    pub fn remote_out_of_date(&self) -> bool {
        self.remote_out_of_date
    }

    pub(crate) fn mark_remote_out_of_date(&mut self) {
        self.remote_out_of_date = true;
    }

    /// Whether the merge modified the local tree at all. A log of only
    /// "unchanged" entries can still be `true` when a timestamp moved.
    pub fn local_changed(&self) -> bool {
        self.local_changed
    }

    pub(crate) fn mark_local_changed(&mut self) {
        self.local_changed = true;
    }

    /// Number of entries at each level.
    pub fn counts(&self) -> BTreeMap<LogLevel, usize> {
        let mut counts = BTreeMap::new();
        for item in &self.items {
            *counts.entry(item.level).or_insert(0) += 1;
        }
        counts
    }

    pub fn has_conflicts(&self) -> bool {
        self.items.iter().any(|i| i.level == LogLevel::Conflict)
    }

    /// One `LEVEL - path - text` line per entry.
    pub fn as_text(&self) -> String {
        if self.items.is_empty() {
            return EMPTY_LOG_TEXT.to_string();
        }
        self.items
            .iter()
            .map(LogItem::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for MergeLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}
