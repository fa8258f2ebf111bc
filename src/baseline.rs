//! Regression baseline capture and delta computation.
//!
//! A baseline is captured once per (run, commit) by running the full suite.
//! Later CI runs are compared against it: only tests that were not already
//! failing at capture time can count as regressions.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::GateError;
use crate::phase::RunId;
use crate::store::RunStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Pass,
    Fail,
    Error,
}

/// Structured output of one CI run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiResult {
    pub outcomes: BTreeMap<String, TestOutcome>,
    /// Raw failure text, kept for reasons and logs.
    #[serde(default)]
    pub failure_detail: String,
}

impl CiResult {
    pub fn from_outcomes<S: Into<String>>(
        outcomes: impl IntoIterator<Item = (S, TestOutcome)>,
    ) -> Self {
        Self {
            outcomes: outcomes.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            failure_detail: String::new(),
        }
    }

    fn ids_with(&self, outcome: TestOutcome) -> BTreeSet<String> {
        self.outcomes
            .iter()
            .filter(|(_, o)| **o == outcome)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Known test outcomes at the start of a run. Read-only after capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub run: RunId,
    pub commit: String,
    pub passed: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub errored: BTreeSet<String>,
    pub captured_at: DateTime<Utc>,
    /// sha256 over the commit and the outcome sets.
    pub digest: String,
}

impl Baseline {
    pub fn from_ci(run: RunId, commit: &str, ci: &CiResult) -> Self {
        let passed = ci.ids_with(TestOutcome::Pass);
        let failed = ci.ids_with(TestOutcome::Fail);
        let errored = ci.ids_with(TestOutcome::Error);
        let digest = content_digest(commit, &passed, &failed, &errored);
        Self {
            run,
            commit: commit.to_string(),
            passed,
            failed,
            errored,
            captured_at: Utc::now(),
            digest,
        }
    }

    pub fn outcome_of(&self, test: &str) -> Option<TestOutcome> {
        if self.failed.contains(test) {
            Some(TestOutcome::Fail)
        } else if self.errored.contains(test) {
            Some(TestOutcome::Error)
        } else if self.passed.contains(test) {
            Some(TestOutcome::Pass)
        } else {
            None
        }
    }

    pub fn test_count(&self) -> usize {
        self.passed.len() + self.failed.len() + self.errored.len()
    }
}

fn content_digest(
    commit: &str,
    passed: &BTreeSet<String>,
    failed: &BTreeSet<String>,
    errored: &BTreeSet<String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(commit.as_bytes());
    for (tag, set) in [("pass", passed), ("fail", failed), ("error", errored)] {
        for id in set {
            hasher.update(b"\n");
            hasher.update(tag.as_bytes());
            hasher.update(b":");
            hasher.update(id.as_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Runs the project's test suite.
pub trait CiRunner: Send + Sync {
    /// Run the suite, or only `filter` when given, bounded by `timeout`.
    fn run(&self, filter: Option<&[String]>, timeout: Duration) -> Result<CiResult, GateError>;
}

/// Captures and caches baselines.
pub struct BaselineTracker {
    runner: Arc<dyn CiRunner>,
    store: Option<RunStore>,
    cache: Mutex<HashMap<(RunId, String), Arc<Baseline>>>,
}

impl BaselineTracker {
    pub fn new(runner: Arc<dyn CiRunner>, store: Option<RunStore>) -> Self {
        Self {
            runner,
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Capture the baseline for `commit`, or return the one already captured.
    ///
    /// A timeout or tool failure is fatal: the run must not start against an
    /// unknown baseline.
    pub fn capture(
        &self,
        run: &RunId,
        commit: &str,
        timeout: Duration,
    ) -> Result<Arc<Baseline>, GateError> {
        let key = (run.clone(), commit.to_string());
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| GateError::Store("baseline cache poisoned".into()))?;
        if let Some(existing) = cache.get(&key) {
            tracing::debug!(run = %run, commit, "baseline cache hit");
            return Ok(Arc::clone(existing));
        }

        if let Some(ref store) = self.store
            && let Some(persisted) = store.load_baseline(run, commit)?
        {
            tracing::info!(run = %run, commit, tests = persisted.test_count(), "loaded persisted baseline");
            let persisted = Arc::new(persisted);
            cache.insert(key, Arc::clone(&persisted));
            return Ok(persisted);
        }

        tracing::info!(run = %run, commit, timeout_secs = timeout.as_secs(), "capturing baseline");
        let ci = self
            .runner
            .run(None, timeout)
            .map_err(|e| GateError::BaselineCapture {
                commit: commit.to_string(),
                message: e.to_string(),
            })?;
        let baseline = Baseline::from_ci(run.clone(), commit, &ci);
        tracing::info!(
            run = %run,
            commit,
            passed = baseline.passed.len(),
            failed = baseline.failed.len(),
            errored = baseline.errored.len(),
            "baseline captured"
        );
        if let Some(ref store) = self.store {
            store.save_baseline(&baseline)?;
        }
        let baseline = Arc::new(baseline);
        cache.insert(key, Arc::clone(&baseline));
        Ok(baseline)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn is_blocking(self) -> bool {
        self >= Severity::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Difference between the baseline and the candidate's CI observations.
/// Transient; never persisted on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub newly_failing: BTreeSet<String>,
    pub newly_erroring: BTreeSet<String>,
    pub flaky: BTreeSet<String>,
}

impl Delta {
    /// Severity of the delta. `high_threshold` is the largest new-failure
    /// count that is still medium.
    pub fn severity(&self, high_threshold: usize) -> Severity {
        if !self.newly_erroring.is_empty() {
            return Severity::Critical;
        }
        match self.newly_failing.len() {
            0 => Severity::None,
            1 => Severity::Low,
            n if n > high_threshold => Severity::High,
            _ => Severity::Medium,
        }
    }

    /// All newly failing or erroring tests.
    pub fn regressions(&self) -> BTreeSet<String> {
        self.newly_failing
            .union(&self.newly_erroring)
            .cloned()
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.newly_failing.is_empty() && self.newly_erroring.is_empty()
    }
}

/// Compare one CI observation against the baseline.
pub fn compute_delta(baseline: &Baseline, current: &CiResult) -> Delta {
    compute_delta_over(baseline, std::slice::from_ref(current))
}

/// Compare consecutive observations of the same candidate against the
/// baseline.
///
/// A test is flaky when its outcome differs between two consecutive
/// observations that both include it. The latest observation that includes a
/// test decides its current outcome, so a subset re-run only overrides the
/// tests it ran.
pub fn compute_delta_over(baseline: &Baseline, observations: &[CiResult]) -> Delta {
    let mut current: BTreeMap<&str, TestOutcome> = BTreeMap::new();
    let mut flaky = BTreeSet::new();

    for window in observations.windows(2) {
        let (prev, next) = (&window[0], &window[1]);
        for (id, outcome) in &next.outcomes {
            if prev.outcomes.get(id).is_some_and(|p| p != outcome) {
                flaky.insert(id.clone());
            }
        }
    }
    for obs in observations {
        for (id, outcome) in &obs.outcomes {
            current.insert(id.as_str(), *outcome);
        }
    }

    let mut delta = Delta {
        flaky,
        ..Delta::default()
    };
    for (id, outcome) in current {
        // Broken at the baseline, in either way, is not new.
        if delta.flaky.contains(id) || baseline.failed.contains(id) || baseline.errored.contains(id)
        {
            continue;
        }
        match outcome {
            TestOutcome::Fail => {
                delta.newly_failing.insert(id.to_string());
            }
            TestOutcome::Error => {
                delta.newly_erroring.insert(id.to_string());
            }
            TestOutcome::Pass => {}
        }
    }
    delta
}
