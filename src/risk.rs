//! Change-risk scoring.
//!
//! Uses the two-tier notify/block net-deletion scheme: the work context picks
//! one (notify, block) pair, crossing `block` adds 40 points and floors the
//! score at the critical band, crossing only `notify` adds 20 points.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::RiskConfig;
use crate::paths::PathSet;

pub const DELETION_THRESHOLD_EXCEEDED: &str = "deletion_threshold_exceeded";
pub const DELETION_NOTIFY: &str = "deletion_notify";
pub const MANY_FILES_TOUCHED: &str = "many_files_touched";
pub const PROTECTED_PATH_TOUCHED: &str = "protected_path_touched";
pub const LARGE_FILE_DELETION: &str = "large_single_file_deletion";

const BLOCK_POINTS: u32 = 40;
const NOTIFY_POINTS: u32 = 20;
const PROTECTED_POINTS: u32 = 25;
const LARGE_FILE_DELETION_POINTS: u32 = 15;
/// A single file losing more lines than this counts as a large deletion.
pub const LARGE_FILE_DELETION_LINES: u32 = 50;
const CRITICAL_FLOOR: u8 = 75;

/// Size statistics of a candidate change, as reported by the patch producer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStats {
    pub files_changed: Vec<String>,
    pub lines_added: u32,
    pub lines_removed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_content: Option<String>,
}

impl ChangeStats {
    /// `lines_removed - lines_added`; negative when the change grows the code.
    pub fn net_deletion(&self) -> i64 {
        i64::from(self.lines_removed) - i64::from(self.lines_added)
    }

    /// Total lines touched in either direction.
    pub fn churn(&self) -> u64 {
        u64::from(self.lines_added) + u64::from(self.lines_removed)
    }

    /// Identity of the change for approval reuse: the same files, counts and
    /// patch always hash alike, in any file order.
    pub fn digest(&self) -> String {
        let mut files: Vec<&str> = self.files_changed.iter().map(String::as_str).collect();
        files.sort_unstable();
        let mut hasher = Sha256::new();
        for file in files {
            hasher.update(file.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(format!("+{} -{}\n", self.lines_added, self.lines_removed).as_bytes());
        if let Some(ref patch) = self.patch_content {
            hasher.update(patch.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Removed-line counts per file, parsed from the unified diff.
    ///
    /// Returns an empty map when no patch content is available.
    pub fn per_file_deletions(&self) -> BTreeMap<String, u32> {
        let mut out = BTreeMap::new();
        let Some(ref patch) = self.patch_content else {
            return out;
        };

        let mut current: Option<String> = None;
        let mut minus_path: Option<String> = None;
        // Old and new lines still owed by the open hunk.
        let mut remaining: (u32, u32) = (0, 0);

        for line in patch.lines() {
            if remaining != (0, 0) {
                match line.as_bytes().first() {
                    Some(b'-') => {
                        remaining.0 = remaining.0.saturating_sub(1);
                        if let Some(ref file) = current {
                            *out.entry(file.clone()).or_insert(0) += 1;
                        }
                    }
                    Some(b'+') => remaining.1 = remaining.1.saturating_sub(1),
                    Some(b'\\') => {}
                    _ => {
                        remaining.0 = remaining.0.saturating_sub(1);
                        remaining.1 = remaining.1.saturating_sub(1);
                    }
                }
                continue;
            }
            if let Some(rest) = line.strip_prefix("diff --git ") {
                current = rest.rsplit_once(" b/").map(|(_, p)| p.to_string());
            } else if let Some(p) = line.strip_prefix("--- ") {
                minus_path = Some(strip_diff_prefix(p, "a/").to_string());
            } else if let Some(p) = line.strip_prefix("+++ ") {
                let p = strip_diff_prefix(p, "b/");
                current = if p == "/dev/null" {
                    minus_path.clone()
                } else {
                    Some(p.to_string())
                };
            } else if line.starts_with("@@") {
                remaining = hunk_lengths(line);
            }
        }
        out
    }

    /// Build stats from `git diff --numstat` output.
    ///
    /// Binary files (`-\t-\tpath`) count as touched with no line changes.
    pub fn from_numstat(numstat: &str, patch_content: Option<String>) -> anyhow::Result<Self> {
        let mut stats = ChangeStats {
            patch_content,
            ..Default::default()
        };
        for line in numstat.lines().filter(|l| !l.trim().is_empty()) {
            let mut parts = line.splitn(3, '\t');
            let (Some(added), Some(removed), Some(path)) = (parts.next(), parts.next(), parts.next())
            else {
                anyhow::bail!("malformed numstat line: {line:?}");
            };
            let parse = |v: &str| -> anyhow::Result<u32> {
                if v == "-" {
                    Ok(0)
                } else {
                    v.parse()
                        .map_err(|_| anyhow::anyhow!("malformed numstat count {v:?} in {line:?}"))
                }
            };
            stats.lines_added = stats.lines_added.saturating_add(parse(added)?);
            stats.lines_removed = stats.lines_removed.saturating_add(parse(removed)?);
            stats.files_changed.push(path.to_string());
        }
        Ok(stats)
    }
}

/// Old and new line counts from a `@@ -a,b +c,d @@` header. An omitted
/// count is 1.
fn hunk_lengths(header: &str) -> (u32, u32) {
    let mut ranges = header.split_whitespace().skip(1);
    let mut length = |sign: char| {
        ranges
            .next()
            .and_then(|r| r.strip_prefix(sign))
            .map_or(0, |r| match r.split_once(',') {
                Some((_, n)) => n.parse::<u32>().unwrap_or(0),
                None => 1,
            })
    };
    let old = length('-');
    let new = length('+');
    (old, new)
}

fn strip_diff_prefix<'a>(path: &'a str, prefix: &str) -> &'a str {
    let path = path.split('\t').next().unwrap_or(path);
    path.strip_prefix(prefix).unwrap_or(path)
}

/// What kind of work produced the change. Troubleshooting is the strictest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkContext {
    Troubleshooting,
    #[default]
    Feature,
    Refactor,
}

impl fmt::Display for WorkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkContext::Troubleshooting => "troubleshooting",
            WorkContext::Feature => "feature",
            WorkContext::Refactor => "refactor",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Fixed banding: <30 low, 30-49 medium, 50-74 high, >=75 critical.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..30 => RiskLevel::Low,
            30..50 => RiskLevel::Medium,
            50..75 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named boolean check with the reason it fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskCheck {
    pub triggered: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub context: WorkContext,
    pub net_deletion: i64,
    pub risk_score: u8,
    pub risk_level: RiskLevel,
    pub checks: BTreeMap<String, RiskCheck>,
    /// Lines added plus lines removed.
    pub lines_changed: u64,
    pub largest_file_deletion: u32,
    pub touched_paths: Vec<String>,
}

impl RiskAssessment {
    pub fn check(&self, name: &str) -> bool {
        self.checks.get(name).is_some_and(|c| c.triggered)
    }

    pub fn deletion_threshold_exceeded(&self) -> bool {
        self.check(DELETION_THRESHOLD_EXCEEDED)
    }

    /// Reasons of all triggered checks, in check-name order.
    pub fn reasons(&self) -> Vec<String> {
        self.checks
            .values()
            .filter(|c| c.triggered)
            .map(|c| c.reason.clone())
            .collect()
    }
}

/// Pure risk scorer over explicit inputs and an immutable config.
#[derive(Debug, Clone)]
pub struct RiskScorer {
    config: RiskConfig,
    protected: PathSet,
    never_auto_approve: PathSet,
}

impl RiskScorer {
    pub fn new(config: RiskConfig, never_auto_approve: &[String]) -> anyhow::Result<Self> {
        let protected = PathSet::new(&config.protected_paths)?;
        Ok(Self {
            config,
            protected,
            never_auto_approve: PathSet::new(never_auto_approve)?,
        })
    }

    pub fn score(&self, stats: &ChangeStats, context: WorkContext) -> RiskAssessment {
        let thresholds = self.config.thresholds(context);
        let net_deletion = stats.net_deletion();
        let mut points: u32 = 0;
        let mut checks = BTreeMap::new();

        let block_exceeded = net_deletion > i64::from(thresholds.block);
        let notify_exceeded = !block_exceeded && net_deletion > i64::from(thresholds.notify);
        if block_exceeded {
            points += BLOCK_POINTS;
        } else if notify_exceeded {
            points += NOTIFY_POINTS;
        }
        checks.insert(
            DELETION_THRESHOLD_EXCEEDED.to_string(),
            RiskCheck {
                triggered: block_exceeded,
                reason: format!(
                    "CRITICAL DELETION: net deletion of {net_deletion} lines exceeds the {context} blocking threshold of {}",
                    thresholds.block
                ),
            },
        );
        checks.insert(
            DELETION_NOTIFY.to_string(),
            RiskCheck {
                triggered: notify_exceeded,
                reason: format!(
                    "net deletion of {net_deletion} lines exceeds the {context} notify threshold of {}",
                    thresholds.notify
                ),
            },
        );

        let file_count = stats.files_changed.len();
        let file_points = match file_count {
            0..=5 => 0,
            6..=10 => 5,
            11..=20 => 10,
            _ => 20,
        };
        points += file_points;
        checks.insert(
            MANY_FILES_TOUCHED.to_string(),
            RiskCheck {
                triggered: file_points > 0,
                reason: format!("{file_count} files touched"),
            },
        );

        let protected: Vec<&str> = stats
            .files_changed
            .iter()
            .map(String::as_str)
            .filter(|p| self.protected.matches(p) || self.never_auto_approve.matches(p))
            .collect();
        if !protected.is_empty() {
            points += PROTECTED_POINTS;
        }
        checks.insert(
            PROTECTED_PATH_TOUCHED.to_string(),
            RiskCheck {
                triggered: !protected.is_empty(),
                reason: format!("protected paths touched: {}", protected.join(", ")),
            },
        );

        let per_file = stats.per_file_deletions();
        let (largest_path, largest_file_deletion) = per_file
            .iter()
            .max_by_key(|(_, n)| **n)
            .map_or(("", 0), |(p, n)| (p.as_str(), *n));
        let large_deletion = largest_file_deletion > LARGE_FILE_DELETION_LINES;
        if large_deletion {
            points += LARGE_FILE_DELETION_POINTS;
        }
        checks.insert(
            LARGE_FILE_DELETION.to_string(),
            RiskCheck {
                triggered: large_deletion,
                reason: format!("{largest_file_deletion} lines removed from {largest_path}"),
            },
        );

        let mut risk_score = u8::try_from(points.min(100)).unwrap_or(100);
        if block_exceeded {
            risk_score = risk_score.max(CRITICAL_FLOOR);
        }

        RiskAssessment {
            context,
            net_deletion,
            risk_score,
            risk_level: RiskLevel::from_score(risk_score),
            checks,
            lines_changed: stats.churn(),
            largest_file_deletion,
            touched_paths: stats.files_changed.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> RiskScorer {
        RiskScorer::new(RiskConfig::default(), &["**/migrations/**".to_string()]).unwrap()
    }

    fn stats(added: u32, removed: u32, files: &[&str]) -> ChangeStats {
        ChangeStats {
            files_changed: files.iter().map(|s| (*s).to_string()).collect(),
            lines_added: added,
            lines_removed: removed,
            patch_content: None,
        }
    }

    #[test]
    fn net_deletion_is_removed_minus_added() {
        assert_eq!(stats(12, 426, &[]).net_deletion(), 414);
        assert_eq!(stats(100, 3, &[]).net_deletion(), -97);
    }

    #[test]
    fn band_edges_are_fixed() {
        assert_eq!(RiskLevel::from_score(0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(29), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(30), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(49), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(50), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(74), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(75), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(100), RiskLevel::Critical);
    }

    #[test]
    fn large_troubleshooting_deletion_is_critical() {
        let a = scorer().score(&stats(12, 426, &["src/lib.rs"]), WorkContext::Troubleshooting);
        assert_eq!(a.net_deletion, 414);
        assert!(a.deletion_threshold_exceeded());
        assert!(!a.check(DELETION_NOTIFY));
        assert_eq!(a.risk_level, RiskLevel::Critical);
        assert!(a.risk_score >= 75);
        assert!(a.reasons().iter().any(|r| r.starts_with("CRITICAL DELETION")));
    }

    #[test]
    fn notify_band_adds_medium_contribution_only() {
        let a = scorer().score(&stats(0, 150, &["src/a.rs"]), WorkContext::Troubleshooting);
        assert!(!a.deletion_threshold_exceeded());
        assert!(a.check(DELETION_NOTIFY));
        assert_eq!(a.risk_score, 20);
        assert_eq!(a.risk_level, RiskLevel::Low);
    }

    #[test]
    fn context_selects_threshold_pair() {
        let s = stats(0, 250, &["src/a.rs"]);
        assert!(scorer().score(&s, WorkContext::Troubleshooting).deletion_threshold_exceeded());
        assert!(!scorer().score(&s, WorkContext::Feature).deletion_threshold_exceeded());
        assert!(scorer().score(&s, WorkContext::Feature).check(DELETION_NOTIFY));
        let refactor = scorer().score(&s, WorkContext::Refactor);
        assert!(!refactor.deletion_threshold_exceeded());
        assert!(refactor.check(DELETION_NOTIFY));
        assert_eq!(refactor.risk_score, 20);
        let small = scorer().score(&stats(0, 150, &["src/a.rs"]), WorkContext::Refactor);
        assert!(!small.check(DELETION_NOTIFY));
        assert_eq!(small.risk_score, 0);
    }

    #[test]
    fn growth_never_counts_as_deletion() {
        let a = scorer().score(&stats(900, 10, &["src/a.rs"]), WorkContext::Troubleshooting);
        assert!(!a.deletion_threshold_exceeded());
        assert_eq!(a.risk_score, 0);
    }

    #[test]
    fn other_signals_accumulate_and_cap() {
        let files: Vec<String> = (0..25).map(|i| format!("src/f{i}.rs")).collect();
        let mut s = stats(0, 500, &[]);
        s.files_changed = files;
        s.files_changed.push("db/migrations/001.sql".into());
        s.patch_content = Some(
            "diff --git a/src/f0.rs b/src/f0.rs\n--- a/src/f0.rs\n+++ b/src/f0.rs\n@@ -1,60 +0,0 @@\n"
                .to_string()
                + &"-gone\n".repeat(60),
        );
        let a = scorer().score(&s, WorkContext::Troubleshooting);
        // 40 + 20 + 25 + 15 = 100
        assert_eq!(a.risk_score, 100);
        assert!(a.check(PROTECTED_PATH_TOUCHED));
        assert!(a.check(LARGE_FILE_DELETION));
        assert_eq!(a.largest_file_deletion, 60);
    }

    #[test]
    fn scoring_is_deterministic() {
        let s = stats(12, 426, &["src/lib.rs", "Cargo.toml"]);
        let a = scorer().score(&s, WorkContext::Troubleshooting);
        let b = scorer().score(&s, WorkContext::Troubleshooting);
        assert_eq!(a, b);
    }

    #[test]
    fn per_file_deletions_from_git_patch() {
        let patch = "\
diff --git a/src/a.rs b/src/a.rs
index 1..2 100644
--- a/src/a.rs
+++ b/src/a.rs
@@ -1,3 +1,1 @@
-one
-two
 three
diff --git a/src/gone.rs b/src/gone.rs
deleted file mode 100644
--- a/src/gone.rs
+++ /dev/null
@@ -1,2 +0,0 @@
--- a removed sql comment
-x
";
        let s = ChangeStats {
            patch_content: Some(patch.into()),
            ..Default::default()
        };
        let d = s.per_file_deletions();
        assert_eq!(d.get("src/a.rs"), Some(&2));
        assert_eq!(d.get("src/gone.rs"), Some(&2));
    }

    #[test]
    fn hunk_lines_that_look_like_headers_are_content() {
        let patch = "\
diff --git a/db/seed.sql b/db/seed.sql
--- a/db/seed.sql
+++ b/db/seed.sql
@@ -1,3 +1,2 @@
--- legacy seed comment
+++ counter
-drop table t;
 select 1;
diff --git a/src/b.rs b/src/b.rs
--- a/src/b.rs
+++ b/src/b.rs
@@ -4 +4 @@
-old
+new
";
        let s = ChangeStats {
            patch_content: Some(patch.into()),
            ..Default::default()
        };
        let d = s.per_file_deletions();
        assert_eq!(d.get("db/seed.sql"), Some(&2));
        assert_eq!(d.get("src/b.rs"), Some(&1));
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn hunk_header_lengths() {
        assert_eq!(hunk_lengths("@@ -1,3 +1,2 @@ fn main()"), (3, 2));
        assert_eq!(hunk_lengths("@@ -4 +4 @@"), (1, 1));
        assert_eq!(hunk_lengths("@@ -0,0 +1,5 @@"), (0, 5));
    }

    #[test]
    fn digest_ignores_file_order_only() {
        let a = stats(3, 1, &["src/a.rs", "src/b.rs"]);
        let b = stats(3, 1, &["src/b.rs", "src/a.rs"]);
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), stats(3, 2, &["src/a.rs", "src/b.rs"]).digest());
        let patched = ChangeStats {
            patch_content: Some("-x\n".into()),
            ..a.clone()
        };
        assert_ne!(a.digest(), patched.digest());
    }

    #[test]
    fn numstat_parsing() {
        let s = ChangeStats::from_numstat("3\t10\tsrc/a.rs\n-\t-\tlogo.png\n0\t5\tREADME.md\n", None)
            .unwrap();
        assert_eq!(s.lines_added, 3);
        assert_eq!(s.lines_removed, 15);
        assert_eq!(s.files_changed, vec!["src/a.rs", "logo.png", "README.md"]);
        assert!(ChangeStats::from_numstat("garbage", None).is_err());
    }
}
