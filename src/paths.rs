//! Path pattern lists for protected, never-auto-approve and allowed paths.
//!
//! Patterns are repository-relative globs: `*` matches within one path
//! segment, `**` matches across segments, `?` matches one character, and a
//! trailing `/` matches everything under a directory.

use anyhow::Context;
use glob::{MatchOptions, Pattern};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
pub struct PathSet {
    patterns: Vec<(String, Pattern)>,
}

impl PathSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> anyhow::Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let p = p.as_ref();
                let compiled = Pattern::new(&expand_directory(p))
                    .with_context(|| format!("invalid path pattern {p:?}"))?;
                Ok((p.to_string(), compiled))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    /// The first pattern matching `path`, if any.
    pub fn matching(&self, path: &str) -> Option<&str> {
        let path = normalize(path);
        self.patterns
            .iter()
            .find(|(_, pattern)| pattern.matches_with(path, MATCH_OPTIONS))
            .map(|(p, _)| p.as_str())
    }

    pub fn matches(&self, path: &str) -> bool {
        self.matching(path).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches("./")
}

/// `dir/` means everything under `dir`.
fn expand_directory(pattern: &str) -> String {
    let pattern = normalize(pattern);
    if pattern.ends_with('/') {
        format!("{pattern}**")
    } else {
        pattern.to_string()
    }
}
