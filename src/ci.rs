//! Runs the configured test command and turns its output into a `CiResult`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::baseline::{CiResult, CiRunner, TestOutcome};
use crate::error::{ExitError, GateError};
use crate::subprocess::Tool;

fn re_cargo_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^test (\S+) \.\.\. (ok|FAILED|ignored)\s*$").expect("valid cargo pattern")
    })
}

fn re_pytest_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\S+::\S+)\s+(PASSED|FAILED|ERROR|SKIPPED|XFAIL|XPASS)\b")
            .expect("valid pytest pattern")
    })
}

fn re_pytest_summary() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(FAILED|ERROR) (\S+::\S+)").expect("valid pytest pattern"))
}

/// Runs `test_command` through the shell in `workspace`.
pub struct CommandCiRunner {
    command: String,
    workspace: PathBuf,
}

impl CommandCiRunner {
    pub fn new(command: impl Into<String>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            workspace: workspace.into(),
        }
    }
}

impl CiRunner for CommandCiRunner {
    fn run(&self, filter: Option<&[String]>, timeout: Duration) -> Result<CiResult, GateError> {
        let mut tool = Tool::shell(&self.command)
            .current_dir(&self.workspace)
            .timeout(timeout);
        if let Some(tests) = filter {
            tool = tool.args(tests);
        }
        tracing::debug!(command = %self.command, subset = filter.map_or(0, <[String]>::len), "running CI");

        let output = tool.run().map_err(|e| match e.downcast_ref::<ExitError>() {
            Some(exit) => GateError::CiRun(exit.to_string()),
            None => GateError::CiRun(format!("{e:#}")),
        })?;

        let combined = format!("{}\n{}", output.stdout, output.stderr);
        let mut result = parse_output(&combined)?;
        if result.outcomes.is_empty() && !output.success() {
            return Err(GateError::UnreadableCiOutput(format!(
                "`{}` exited {} with no recognizable test results: {}",
                self.command,
                output.exit_code,
                tail(&combined, 400)
            )));
        }
        if !output.success() {
            result.failure_detail = tail(&combined, 4000).to_string();
        }
        Ok(result)
    }
}

/// Parse test-runner output in any recognized format.
///
/// JSON (`{"tests": {"id": "pass|fail|error"}}`) wins when the output starts
/// with a JSON object; otherwise cargo-test and pytest lines are collected.
pub fn parse_output(output: &str) -> Result<CiResult, GateError> {
    let trimmed = output.trim();
    if trimmed.starts_with('{') {
        return parse_json(trimmed);
    }

    let cargo = re_cargo_line();
    let pytest = re_pytest_line();
    let pytest_summary = re_pytest_summary();

    let mut outcomes = BTreeMap::new();
    for line in output.lines() {
        let line = line.trim_end();
        if let Some(caps) = cargo.captures(line) {
            let outcome = match &caps[2] {
                "ok" => TestOutcome::Pass,
                "FAILED" => TestOutcome::Fail,
                _ => continue,
            };
            outcomes.insert(caps[1].to_string(), outcome);
        } else if let Some(caps) = pytest.captures(line) {
            let outcome = match &caps[2] {
                "PASSED" | "XFAIL" => TestOutcome::Pass,
                "FAILED" | "XPASS" => TestOutcome::Fail,
                "ERROR" => TestOutcome::Error,
                _ => continue,
            };
            outcomes.insert(caps[1].to_string(), outcome);
        } else if let Some(caps) = pytest_summary.captures(line) {
            // short test summary: only fills in tests not already seen
            let outcome = if &caps[1] == "ERROR" {
                TestOutcome::Error
            } else {
                TestOutcome::Fail
            };
            outcomes.entry(caps[2].to_string()).or_insert(outcome);
        }
    }
    Ok(CiResult {
        outcomes,
        failure_detail: String::new(),
    })
}

fn parse_json(raw: &str) -> Result<CiResult, GateError> {
    #[derive(serde::Deserialize)]
    struct Report {
        tests: BTreeMap<String, String>,
        #[serde(default)]
        failure_detail: String,
    }
    // Only the first JSON value counts; stderr noise may follow it.
    let report: Report = serde_json::Deserializer::from_str(raw)
        .into_iter()
        .next()
        .ok_or_else(|| GateError::UnreadableCiOutput("empty JSON test report".into()))?
        .map_err(|e| GateError::UnreadableCiOutput(format!("invalid JSON test report: {e}")))?;
    let outcomes = report
        .tests
        .into_iter()
        .map(|(id, outcome)| {
            let outcome = match outcome.to_ascii_lowercase().as_str() {
                "pass" | "passed" | "ok" => TestOutcome::Pass,
                "fail" | "failed" => TestOutcome::Fail,
                "error" | "errored" => TestOutcome::Error,
                other => {
                    return Err(GateError::UnreadableCiOutput(format!(
                        "unknown outcome {other:?} for test {id}"
                    )));
                }
            };
            Ok((id, outcome))
        })
        .collect::<Result<_, _>>()?;
    Ok(CiResult {
        outcomes,
        failure_detail: report.failure_detail,
    })
}

fn tail(s: &str, max: usize) -> &str {
    let s = s.trim();
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
