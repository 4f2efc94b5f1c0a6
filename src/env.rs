//! Environment scanning.
//!
//! Captures the process environment once, in OS order, as an immutable
//! snapshot. Every later stage reads from the snapshot; nothing mutates it.

use std::fmt;

use tracing::debug;

/// One `name=value` pair captured at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentEntry {
    name: String,
    value: String,
}

impl EnvironmentEntry {
    /// Create an entry from an already split name and value.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Split a raw `name=value` line on its first `=`.
    ///
    /// Returns `None` when the line has no `=` or the name is blank.
    pub fn parse(raw: &str) -> Option<Self> {
        let (name, value) = raw.split_once('=')?;
        if name.trim().is_empty() {
            return None;
        }
        Some(Self::new(name, value))
    }

    /// Variable name exactly as it appeared in the environment.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Variable value exactly as it appeared in the environment.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns `true` when the trimmed name equals `other` ignoring ASCII case.
    pub fn name_matches(&self, other: &str) -> bool {
        self.name.trim().eq_ignore_ascii_case(other.trim())
    }
}

impl fmt::Display for EnvironmentEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Ordered, immutable view of the environment block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    entries: Vec<EnvironmentEntry>,
}

impl EnvSnapshot {
    /// Capture the current process environment.
    ///
    /// Entries that are not valid UTF-8 cannot hold a placeholder. They are
    /// left out of the snapshot; the child still inherits them untouched.
    pub fn capture() -> Self {
        let mut entries = Vec::new();
        for (name, value) in std::env::vars_os() {
            match (name.into_string(), value.into_string()) {
                (Ok(name), Ok(value)) => entries.push(EnvironmentEntry::new(name, value)),
                (name, _) => debug!(
                    name = %name.unwrap_or_else(|n| n.to_string_lossy().into_owned()),
                    "skipping non UTF-8 environment entry"
                ),
            }
        }
        Self { entries }
    }

    /// Build a snapshot from explicit pairs, preserving their order.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(name, value)| EnvironmentEntry::new(name, value))
                .collect(),
        }
    }

    /// Build a snapshot from raw `name=value` lines.
    ///
    /// Lines without `=` or with a blank name are skipped.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries = Vec::new();
        for line in lines {
            let line = line.as_ref();
            match EnvironmentEntry::parse(line) {
                Some(entry) => entries.push(entry),
                None => debug!(line_len = line.len(), "skipping malformed environment line"),
            }
        }
        Self { entries }
    }

    /// Entries in scan order.
    pub fn entries(&self) -> &[EnvironmentEntry] {
        &self.entries
    }

    /// Iterate entries in scan order.
    pub fn iter(&self) -> impl Iterator<Item = &EnvironmentEntry> {
        self.entries.iter()
    }

    /// Number of captured entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value of the last entry whose name matches case-insensitively.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.name_matches(name))
            .map(EnvironmentEntry::value)
    }

    /// Environment-style lookup closure for configuration overrides.
    pub fn resolver(&self) -> impl Fn(&str) -> Option<String> + '_ {
        move |key| self.lookup(key).map(str::to_owned)
    }
}
