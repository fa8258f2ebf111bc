use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Subcommand};

use super::{OutputFormat, Project, print_markdown};
use crate::baseline::{Baseline, BaselineTracker};
use crate::ci::CommandCiRunner;
use crate::error::ExitError;
use crate::orchestrator::{ChangeSource, GitChanges};
use crate::phase::RunId;

#[derive(Debug, Args)]
pub struct BaselineArgs {
    #[command(subcommand)]
    pub command: BaselineCommand,
}

#[derive(Debug, Subcommand)]
pub enum BaselineCommand {
    /// Run the test suite at a commit and record the result for a run
    Capture(CaptureArgs),
    /// Print a recorded baseline
    Show(ShowArgs),
}

#[derive(Debug, Args)]
pub struct CaptureArgs {
    /// Run identifier
    pub run: String,
    /// Commit the working tree is at (defaults to HEAD)
    #[arg(long)]
    pub commit: Option<String>,
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Run identifier
    pub run: String,
    /// Commit of the baseline (defaults to HEAD)
    #[arg(long)]
    pub commit: Option<String>,
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl BaselineArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        match &self.command {
            BaselineCommand::Capture(args) => args.execute(),
            BaselineCommand::Show(args) => args.execute(),
        }
    }
}

fn resolve_commit(project: &Project, explicit: Option<&str>) -> anyhow::Result<String> {
    match explicit {
        Some(commit) => Ok(commit.to_string()),
        None => GitChanges::new(project.workspace())
            .head_commit()
            .context("reading HEAD"),
    }
}

impl CaptureArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = Project::load(self.project_root.as_deref())?;
        let run = RunId::new(&self.run)?;
        let commit = resolve_commit(&project, self.commit.as_deref())?;
        let test_command = project
            .config
            .project
            .test_command
            .as_deref()
            .ok_or_else(|| ExitError::Config("project.test_command is not set".into()))?;

        let runner = Arc::new(CommandCiRunner::new(test_command, project.workspace()));
        let tracker = BaselineTracker::new(runner, Some(project.store.clone()));
        let baseline = tracker
            .capture(
                &run,
                &commit,
                Duration::from_secs(project.config.baseline.capture_timeout_secs),
            )
            .map_err(ExitError::from)?;
        print_baseline(&baseline, self.format)
    }
}

impl ShowArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = Project::load(self.project_root.as_deref())?;
        let run = RunId::new(&self.run)?;
        let commit = resolve_commit(&project, self.commit.as_deref())?;
        let baseline = project
            .store
            .load_baseline(&run, &commit)
            .map_err(ExitError::from)?
            .ok_or_else(|| ExitError::Other(format!("no baseline for run {run} at {commit}")))?;
        print_baseline(&baseline, self.format)
    }
}

fn print_baseline(baseline: &Baseline, format: Option<OutputFormat>) -> anyhow::Result<()> {
    match OutputFormat::resolve(format) {
        OutputFormat::Pretty => {
            let mut md = format!(
                "# Baseline `{}` @ `{}`\n\n{} passed, {} failed, {} errored\n",
                baseline.run,
                baseline.commit,
                baseline.passed.len(),
                baseline.failed.len(),
                baseline.errored.len()
            );
            for test in baseline.failed.iter().chain(&baseline.errored) {
                md.push_str(&format!("* `{test}`\n"));
            }
            print_markdown(&md);
        }
        OutputFormat::Text => {
            println!(
                "baseline {} @ {}: passed={} failed={} errored={} digest={}",
                baseline.run,
                baseline.commit,
                baseline.passed.len(),
                baseline.failed.len(),
                baseline.errored.len(),
                baseline.digest
            );
            for test in &baseline.failed {
                println!("  failed: {test}");
            }
            for test in &baseline.errored {
                println!("  errored: {test}");
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(baseline)?),
    }
    Ok(())
}
