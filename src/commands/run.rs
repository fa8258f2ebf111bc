use std::path::PathBuf;

use clap::Args;

use super::assess::decision_markdown;
use super::{OutputFormat, Project, print_markdown};
use crate::error::ExitError;
use crate::orchestrator::{Collaborators, Orchestrator, RunOutcome, RunPlan, RunReport};
use crate::server;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Run plan (TOML) listing the phases in order
    pub plan: PathBuf,
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Serve the approval API while the run executes (also `server.enabled`)
    #[arg(long)]
    pub serve: bool,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl RunArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = Project::load(self.project_root.as_deref())?;
        let plan = RunPlan::load(&self.plan)?;
        let workspace = project.workspace();
        let parts = Collaborators::from_config(&project.config, &workspace)?;
        let engine = project.governance_engine()?;

        let _server = if self.serve || project.config.server.enabled {
            Some(server::spawn(&project.config.server.bind, engine.clone())?)
        } else {
            None
        };

        tracing::info!(run = %plan.run, phases = plan.phases.len(), "starting run");
        let orchestrator = Orchestrator::new(
            project.config.clone(),
            project.store.clone(),
            engine,
            parts,
        );
        let report = orchestrator.execute(&plan)?;
        print_report(&report, self.format)?;

        match report.outcome {
            RunOutcome::Complete => Ok(()),
            RunOutcome::Failed { phase, reason } => Err(ExitError::PhaseFailed {
                phase: phase.to_string(),
                reason,
            }
            .into()),
            RunOutcome::AwaitingApproval { phase, request_id } => Err(ExitError::PhaseFailed {
                phase: phase.to_string(),
                reason: format!("waiting on approval request {request_id}"),
            }
            .into()),
        }
    }
}

fn print_report(report: &RunReport, format: Option<OutputFormat>) -> anyhow::Result<()> {
    match OutputFormat::resolve(format) {
        OutputFormat::Pretty => {
            let mut md = format!(
                "# Run `{}` at `{}`\n\n{}\n\n",
                report.run,
                report.baseline_commit,
                outcome_line(&report.outcome)
            );
            for phase in &report.phases {
                md.push_str(&format!(
                    "# {} `{}` ({}, tier {})\n\n",
                    phase.phase.title, phase.phase.id, phase.phase.state.as_str(), phase.phase.tier
                ));
                for decision in &phase.decisions {
                    md.push_str(&decision_markdown(decision));
                    md.push('\n');
                }
            }
            print_markdown(&md);
        }
        OutputFormat::Text => {
            println!("run {} @ {}: {}", report.run, report.baseline_commit, outcome_line(&report.outcome));
            for phase in &report.phases {
                println!(
                    "  {} [{}] tier={} attempts={}",
                    phase.phase.id,
                    phase.phase.state.as_str(),
                    phase.phase.tier,
                    phase.phase.attempt_count()
                );
                for decision in &phase.decisions {
                    let kind = decision
                        .block_kind()
                        .map(|k| format!(" ({k})"))
                        .unwrap_or_default();
                    println!("    attempt {}: {}{kind}", decision.attempt(), decision.status());
                    for reason in decision.reasons() {
                        println!("      - {reason}");
                    }
                }
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

fn outcome_line(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Complete => "complete".to_string(),
        RunOutcome::Failed { phase, reason } => format!("failed at {phase}: {reason}"),
        RunOutcome::AwaitingApproval { phase, request_id } => {
            format!("{phase} awaiting approval {request_id}")
        }
    }
}
