use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;

use super::{ChangeArgs, OutputFormat, Project, print_markdown};
use crate::baseline::{CiResult, CiRunner};
use crate::ci::{self, CommandCiRunner};
use crate::deliverables::FileDeliverablesValidator;
use crate::error::{ExitError, GateError};
use crate::finalizer::{Candidate, FinalizationDecision, FinalizerSettings, PhaseFinalizer};
use crate::orchestrator::{ChangeSource, GitChanges};
use crate::phase::{Phase, PhaseId, RunId};
use crate::risk::{RiskScorer, WorkContext};

#[derive(Debug, Args)]
pub struct AssessArgs {
    /// Run identifier the baseline was captured under
    pub run: String,
    /// Phase being finalized
    pub phase: String,
    /// Commit the baseline was captured at (defaults to HEAD)
    #[arg(long)]
    pub commit: Option<String>,
    /// Declared deliverable (repeatable)
    #[arg(long = "deliverable", value_name = "PATH")]
    pub deliverables: Vec<String>,
    /// Recorded test output to judge instead of running the suite
    #[arg(long, value_name = "FILE")]
    pub ci_output: Option<PathBuf>,
    /// Kind of work that produced the change
    #[arg(long, value_enum, default_value_t = WorkContext::Feature)]
    pub context: WorkContext,
    /// Open an approval request when the change needs one
    #[arg(long)]
    pub govern: bool,
    #[command(flatten)]
    pub change: ChangeArgs,
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

/// Replays one recorded CI result for every run, so a regression in the
/// recording is always reproduced.
struct RecordedCi(CiResult);

impl CiRunner for RecordedCi {
    fn run(&self, _: Option<&[String]>, _: Duration) -> Result<CiResult, GateError> {
        Ok(self.0.clone())
    }
}

impl AssessArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = Project::load(self.project_root.as_deref())?;
        let workspace = project.workspace();
        let run = RunId::new(&self.run)?;
        let phase_id = PhaseId::new(&self.phase)?;
        let commit = match self.commit {
            Some(ref c) => c.clone(),
            None => GitChanges::new(&workspace).head_commit().context("reading HEAD")?,
        };
        let baseline = project
            .store
            .load_baseline(&run, &commit)
            .map_err(ExitError::from)?
            .ok_or_else(|| {
                ExitError::Config(format!(
                    "no baseline for run {run} at {commit}; run `phasegate baseline capture {run}` first"
                ))
            })?;

        let mut settings = FinalizerSettings::from_config(&project.config);
        settings.wait_for_approval = false;

        let (runner, ci_result): (Arc<dyn CiRunner>, Result<CiResult, GateError>) =
            match self.ci_output {
                Some(ref path) => {
                    let text = std::fs::read_to_string(path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    let parsed = ci::parse_output(&text);
                    let replay = match parsed {
                        Ok(ref result) => result.clone(),
                        Err(_) => CiResult::default(),
                    };
                    (Arc::new(RecordedCi(replay)) as Arc<dyn CiRunner>, parsed)
                }
                None => {
                    let test_command = project
                        .config
                        .project
                        .test_command
                        .as_deref()
                        .ok_or_else(|| {
                            ExitError::Config(
                                "project.test_command is not set; pass --ci-output".into(),
                            )
                        })?;
                    let runner = Arc::new(CommandCiRunner::new(test_command, &workspace));
                    let result = runner.run(None, settings.ci_timeout);
                    (runner as Arc<dyn CiRunner>, result)
                }
            };

        let stats = self.change.stats(&workspace)?;
        let scorer = RiskScorer::new(
            project.config.risk.clone(),
            &project.config.governance.never_auto_approve,
        )?;
        let finalizer = PhaseFinalizer::new(
            Arc::new(baseline),
            runner,
            Arc::new(FileDeliverablesValidator::new(&workspace)),
            scorer,
            project.governance_engine()?,
            settings,
        );

        let mut phase = Phase::new(phase_id, &self.phase, self.deliverables.clone());
        let candidate = Candidate {
            stats: &stats,
            context: self.context,
            ci: ci_result,
        };
        let decision = if self.govern {
            finalizer.with_store(project.store.clone()).finalize(&mut phase, candidate)
        } else {
            finalizer.assess(&phase, candidate)
        };

        print_decision(&decision, self.format)?;
        if decision.is_complete() {
            Ok(())
        } else {
            Err(ExitError::PhaseFailed {
                phase: decision.phase().to_string(),
                reason: decision.reasons().join("; "),
            }
            .into())
        }
    }
}

fn print_decision(
    decision: &FinalizationDecision,
    format: Option<OutputFormat>,
) -> anyhow::Result<()> {
    match OutputFormat::resolve(format) {
        OutputFormat::Pretty => print_markdown(&decision_markdown(decision)),
        OutputFormat::Text => print_decision_text(decision),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(decision)?),
    }
    Ok(())
}

pub(super) fn decision_markdown(decision: &FinalizationDecision) -> String {
    let headline = match decision.block_kind() {
        Some(kind) => format!("{} ({kind})", decision.status()),
        None => decision.status().to_string(),
    };
    let mut md = format!(
        "## `{}` attempt {}: **{headline}**\n\n| gate | result |\n|-|-|\n",
        decision.phase(),
        decision.attempt()
    );
    for gate in decision.gates() {
        let result = if gate.skipped {
            "skipped"
        } else if gate.passed {
            "passed"
        } else {
            "blocked"
        };
        md.push_str(&format!("| {} | {result} |\n", gate.gate));
    }
    md.push_str(&format!(
        "\nrisk **{}** ({}/100)",
        decision.risk().risk_level,
        decision.risk().risk_score
    ));
    if let Some(tier) = decision.approval_tier() {
        md.push_str(&format!(", tier **{tier}**"));
    }
    md.push('\n');
    if !decision.reasons().is_empty() {
        md.push('\n');
        for reason in decision.reasons() {
            md.push_str(&format!("* {reason}\n"));
        }
    }
    md
}

fn print_decision_text(decision: &FinalizationDecision) {
    match decision.block_kind() {
        Some(kind) => println!(
            "{} attempt {}: {} ({kind})",
            decision.phase(),
            decision.attempt(),
            decision.status()
        ),
        None => println!(
            "{} attempt {}: {}",
            decision.phase(),
            decision.attempt(),
            decision.status()
        ),
    }
    for gate in decision.gates() {
        let result = if gate.skipped {
            "skipped"
        } else if gate.passed {
            "passed"
        } else {
            "blocked"
        };
        println!("  gate {}: {result}", gate.gate);
    }
    if let Some(summary) = decision.governance() {
        println!("  approval {}: {}", summary.request_id, summary.status);
    }
    for reason in decision.reasons() {
        println!("  - {reason}");
    }
}
