use std::path::PathBuf;

use clap::Args;
use serde::Serialize;

use super::{ChangeArgs, OutputFormat, Project, print_markdown};
use crate::governance::Classification;
use crate::risk::{RiskAssessment, RiskScorer, WorkContext};

#[derive(Debug, Args)]
pub struct ScoreArgs {
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Kind of work that produced the change
    #[arg(long, value_enum, default_value_t = WorkContext::Feature)]
    pub context: WorkContext,
    #[command(flatten)]
    pub change: ChangeArgs,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl ScoreArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = Project::load(self.project_root.as_deref())?;
        let stats = self.change.stats(&project.workspace())?;
        let scorer = RiskScorer::new(
            project.config.risk.clone(),
            &project.config.governance.never_auto_approve,
        )?;
        let assessment = scorer.score(&stats, self.context);

        match OutputFormat::resolve(self.format) {
            OutputFormat::Pretty => print_markdown(&assessment_markdown(&assessment)),
            OutputFormat::Text => print_assessment_text(&assessment),
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&assessment)?),
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct ClassifyArgs {
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Kind of work that produced the change
    #[arg(long, value_enum, default_value_t = WorkContext::Feature)]
    pub context: WorkContext,
    #[command(flatten)]
    pub change: ChangeArgs,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
struct ClassifyReport<'a> {
    #[serde(flatten)]
    classification: &'a Classification,
    risk_score: u8,
    lines_changed: u64,
}

impl ClassifyArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = Project::load(self.project_root.as_deref())?;
        let stats = self.change.stats(&project.workspace())?;
        let scorer = RiskScorer::new(
            project.config.risk.clone(),
            &project.config.governance.never_auto_approve,
        )?;
        let assessment = scorer.score(&stats, self.context);
        let engine = project.governance_engine()?;
        let classification = engine.classify(&assessment.touched_paths, &assessment);

        match OutputFormat::resolve(self.format) {
            OutputFormat::Pretty => {
                let mut md = format!(
                    "# Approval tier: **{}**\n\n{}\n",
                    classification.tier, classification.reason
                );
                for path in &classification.paths {
                    md.push_str(&format!("* `{path}`\n"));
                }
                print_markdown(&md);
            }
            OutputFormat::Text => {
                println!("tier: {}", classification.tier);
                println!("reason: {}", classification.reason);
                for path in &classification.paths {
                    println!("  path: {path}");
                }
            }
            OutputFormat::Json => {
                let report = ClassifyReport {
                    classification: &classification,
                    risk_score: assessment.risk_score,
                    lines_changed: assessment.lines_changed,
                };
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
        Ok(())
    }
}

fn assessment_markdown(assessment: &RiskAssessment) -> String {
    let mut md = format!(
        "# Risk: **{}** ({}/100)\n\n| | |\n|-|-|\n| context | {} |\n| lines changed | {} |\n| net deletion | {} |\n| largest file deletion | {} |\n",
        assessment.risk_level,
        assessment.risk_score,
        assessment.context,
        assessment.lines_changed,
        assessment.net_deletion,
        assessment.largest_file_deletion,
    );
    let reasons = assessment.reasons();
    if !reasons.is_empty() {
        md.push_str("\n## Triggered checks\n\n");
        for reason in reasons {
            md.push_str(&format!("* {reason}\n"));
        }
    }
    md
}

fn print_assessment_text(assessment: &RiskAssessment) {
    println!(
        "risk: {} ({}/100) context={} lines_changed={} net_deletion={}",
        assessment.risk_level,
        assessment.risk_score,
        assessment.context,
        assessment.lines_changed,
        assessment.net_deletion
    );
    for (name, check) in &assessment.checks {
        if check.triggered {
            println!("  {name}: {}", check.reason);
        }
    }
}
