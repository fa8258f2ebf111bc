//! Sequential run driver.
//!
//! One run: take the lock, capture the baseline at HEAD, then for each phase
//! loop agent → change stats → CI → finalize → escalate until the phase
//! completes, fails, or waits on governance.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::baseline::{BaselineTracker, CiRunner};
use crate::ci::CommandCiRunner;
use crate::config::Config;
use crate::deliverables::{DeliverablesValidator, FileDeliverablesValidator};
use crate::error::{ExitError, GateError};
use crate::escalation::{
    CommandDiagnosisAdvisor, DiagnosisAdvisor, DiagnosisHint, EscalationPolicy, PhaseTransition,
};
use crate::finalizer::{Candidate, FinalizationDecision, FinalizerSettings, PhaseFinalizer};
use crate::governance::GovernanceEngine;
use crate::lock::ExecutionLock;
use crate::phase::{Phase, PhaseId, RunId};
use crate::risk::{ChangeStats, RiskScorer, WorkContext};
use crate::store::RunStore;
use crate::subprocess::{Tool, run_command};
use crate::template::{PhasePromptContext, render_phase_prompt};

const AGENT_TIMEOUT: Duration = Duration::from_secs(900);

/// A run plan, loaded from TOML.
///
/// ```toml
/// run = "parser-rewrite"
/// context = "refactor"
///
/// [[phases]]
/// id = "lexer"
/// title = "Lexer"
/// prompt = "Split tokenization out of parser.rs."
/// deliverables = ["src/lexer.rs"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPlan {
    pub run: RunId,
    #[serde(default)]
    pub context: WorkContext,
    pub phases: Vec<PhasePlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasePlan {
    pub id: PhaseId,
    pub title: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub deliverables: Vec<String>,
}

impl RunPlan {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading run plan {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing run plan {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let plan: Self = toml::from_str(text)?;
        if plan.phases.is_empty() {
            anyhow::bail!("run plan has no phases");
        }
        let mut seen = std::collections::BTreeSet::new();
        for phase in &plan.phases {
            if !seen.insert(phase.id.as_str()) {
                anyhow::bail!("duplicate phase id {}", phase.id);
            }
        }
        Ok(plan)
    }
}

/// Produces a candidate change in the workspace.
pub trait Agent: Send + Sync {
    /// Run once with `model`. Returns the agent's stdout.
    fn produce(&self, phase: &Phase, prompt: &str, model: &str) -> anyhow::Result<String>;
}

/// Runs `project.agent_command` with the prompt on stdin and the model in
/// `PHASEGATE_MODEL`.
pub struct CommandAgent {
    command: String,
    workspace: PathBuf,
}

impl CommandAgent {
    pub fn new(command: &str, workspace: impl Into<PathBuf>) -> Self {
        Self {
            command: command.to_string(),
            workspace: workspace.into(),
        }
    }
}

impl Agent for CommandAgent {
    fn produce(&self, phase: &Phase, prompt: &str, model: &str) -> anyhow::Result<String> {
        let output = Tool::shell(&self.command)
            .current_dir(&self.workspace)
            .stdin(prompt)
            .env("PHASEGATE_MODEL", model)
            .env("PHASEGATE_PHASE", phase.id.as_str())
            .env("PHASEGATE_TIER", phase.tier.as_str())
            .timeout(AGENT_TIMEOUT)
            .run()?;
        if output.success() {
            Ok(output.stdout)
        } else {
            let tail: String = output.stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
            anyhow::bail!("agent exited with code {}: {tail}", output.exit_code)
        }
    }
}

/// Where the candidate's change statistics come from.
pub trait ChangeSource: Send + Sync {
    fn head_commit(&self) -> anyhow::Result<String>;
    fn collect(&self) -> anyhow::Result<ChangeStats>;
}

/// Reads the working-tree diff against HEAD with git.
pub struct GitChanges {
    workspace: PathBuf,
}

impl GitChanges {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }
}

impl ChangeSource for GitChanges {
    fn head_commit(&self) -> anyhow::Result<String> {
        let out = run_command("git", &["rev-parse", "HEAD"], Some(&self.workspace))?;
        Ok(out.trim().to_string())
    }

    fn collect(&self) -> anyhow::Result<ChangeStats> {
        // Untracked files only show in the diff once git knows about them.
        run_command("git", &["add", "--all", "--intent-to-add"], Some(&self.workspace))?;
        let numstat = run_command("git", &["diff", "--numstat", "HEAD"], Some(&self.workspace))?;
        let patch = run_command("git", &["diff", "HEAD"], Some(&self.workspace))?;
        ChangeStats::from_numstat(&numstat, Some(patch))
    }
}

/// Swappable collaborators of a run.
pub struct Collaborators {
    pub ci: Arc<dyn CiRunner>,
    pub agent: Box<dyn Agent>,
    pub changes: Box<dyn ChangeSource>,
    pub validator: Arc<dyn DeliverablesValidator>,
    pub advisor: Option<Box<dyn DiagnosisAdvisor>>,
}

impl Collaborators {
    /// Command-backed collaborators from the project config.
    pub fn from_config(config: &Config, workspace: &Path) -> anyhow::Result<Self> {
        let test_command = config
            .project
            .test_command
            .as_deref()
            .ok_or_else(|| ExitError::Config("project.test_command is not set".into()))?;
        let agent_command = config
            .project
            .agent_command
            .as_deref()
            .ok_or_else(|| ExitError::Config("project.agent_command is not set".into()))?;
        Ok(Self {
            ci: Arc::new(CommandCiRunner::new(test_command, workspace)),
            agent: Box::new(CommandAgent::new(agent_command, workspace)),
            changes: Box::new(GitChanges::new(workspace)),
            validator: Arc::new(FileDeliverablesValidator::new(workspace)),
            advisor: config
                .escalation
                .diagnosis_command
                .as_deref()
                .map(|cmd| Box::new(CommandDiagnosisAdvisor::new(cmd, workspace)) as Box<dyn DiagnosisAdvisor>),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Complete,
    Failed { phase: PhaseId, reason: String },
    AwaitingApproval { phase: PhaseId, request_id: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub decisions: Vec<FinalizationDecision>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: RunId,
    pub baseline_commit: String,
    pub outcome: RunOutcome,
    pub phases: Vec<PhaseReport>,
}

pub struct Orchestrator {
    config: Config,
    store: RunStore,
    governance: Arc<GovernanceEngine>,
    parts: Collaborators,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        store: RunStore,
        governance: Arc<GovernanceEngine>,
        parts: Collaborators,
    ) -> Self {
        Self {
            config,
            store,
            governance,
            parts,
        }
    }

    /// Execute every phase of `plan` in order. A failed phase halts the run.
    pub fn execute(&self, plan: &RunPlan) -> anyhow::Result<RunReport> {
        let run_dir = self.store.run_dir(&plan.run);
        let _lock = ExecutionLock::acquire(&run_dir, &plan.run)?;
        register_interrupt_handler(plan.run.clone());

        let commit = self.parts.changes.head_commit().context("reading HEAD")?;
        let tracker = BaselineTracker::new(Arc::clone(&self.parts.ci), Some(self.store.clone()));
        let baseline = tracker
            .capture(
                &plan.run,
                &commit,
                Duration::from_secs(self.config.baseline.capture_timeout_secs),
            )
            .map_err(ExitError::from)?;

        let scorer = RiskScorer::new(
            self.config.risk.clone(),
            &self.config.governance.never_auto_approve,
        )?;
        let finalizer = PhaseFinalizer::new(
            baseline,
            Arc::clone(&self.parts.ci),
            Arc::clone(&self.parts.validator),
            scorer,
            Arc::clone(&self.governance),
            FinalizerSettings::from_config(&self.config),
        )
        .with_store(self.store.clone());
        let policy = EscalationPolicy::new(self.config.escalation.clone());

        let mut report = RunReport {
            run: plan.run.clone(),
            baseline_commit: commit,
            outcome: RunOutcome::Complete,
            phases: Vec::new(),
        };
        for phase_plan in &plan.phases {
            let span = tracing::info_span!("phase", run = %plan.run, phase = %phase_plan.id);
            let _enter = span.enter();
            let (phase_report, outcome) =
                self.run_phase(phase_plan, plan.context, &finalizer, &policy)?;
            report.phases.push(phase_report);
            if let Some(outcome) = outcome {
                report.outcome = outcome;
                break;
            }
        }
        tracing::info!(run = %plan.run, outcome = ?report.outcome, "run finished");
        Ok(report)
    }

    /// Returns the phase report and, when the run must stop, why.
    fn run_phase(
        &self,
        plan: &PhasePlan,
        context: WorkContext,
        finalizer: &PhaseFinalizer,
        policy: &EscalationPolicy,
    ) -> anyhow::Result<(PhaseReport, Option<RunOutcome>)> {
        let mut phase = Phase::new(plan.id.clone(), plan.title.clone(), plan.deliverables.clone());
        let mut decisions: Vec<FinalizationDecision> = Vec::new();
        let mut feedback: Vec<String> = Vec::new();

        loop {
            policy.begin_attempt(&mut phase);
            let prompt = render_phase_prompt(&PhasePromptContext {
                phase_id: phase.id.as_str(),
                title: &phase.title,
                prompt: &plan.prompt,
                deliverables: &phase.deliverables,
                attempt: phase.current_attempt(),
                previous_reasons: &feedback,
            })?;

            let ci = match self.produce_with_fallback(&phase, &prompt) {
                Ok(_) => self
                    .parts
                    .ci
                    .run(None, Duration::from_secs(self.config.baseline.ci_timeout_secs)),
                Err(e) => Err(GateError::Agent(format!("{e:#}"))),
            };
            let stats = self.parts.changes.collect().context("collecting change stats")?;

            let decision = finalizer.finalize(
                &mut phase,
                Candidate {
                    stats: &stats,
                    context,
                    ci,
                },
            );
            let step = policy.apply(&mut phase, &decision);
            feedback = decision.reasons().to_vec();

            let outcome = match step.transition {
                PhaseTransition::Advance => {
                    decisions.push(decision);
                    return Ok((PhaseReport { phase, decisions }, None));
                }
                PhaseTransition::Fail { reason } => Some(RunOutcome::Failed {
                    phase: phase.id.clone(),
                    reason,
                }),
                PhaseTransition::AwaitGovernance => Some(RunOutcome::AwaitingApproval {
                    phase: phase.id.clone(),
                    request_id: decision
                        .governance()
                        .map(|g| g.request_id.clone())
                        .unwrap_or_default(),
                }),
                PhaseTransition::RetrySameTier
                | PhaseTransition::RetryEscalatedTier { .. }
                | PhaseTransition::RequestExternalDiagnosis => None,
            };
            if step.diagnose
                && outcome.is_none()
                && let Some(hint) = self.diagnose(&phase, &decision)
            {
                feedback.push(hint);
            }
            decisions.push(decision);
            if let Some(outcome) = outcome {
                return Ok((PhaseReport { phase, decisions }, Some(outcome)));
            }
        }
    }

    /// Hints are advisory; a failing advisor never stops the run.
    fn diagnose(&self, phase: &Phase, decision: &FinalizationDecision) -> Option<String> {
        let advisor = self.parts.advisor.as_ref()?;
        match advisor.diagnose(phase, decision) {
            Ok(Some(DiagnosisHint::SuggestFix { summary })) => {
                tracing::info!(phase = %phase.id, "diagnosis suggests a fix");
                Some(format!("diagnosis hint: {summary}"))
            }
            Ok(Some(DiagnosisHint::SuggestSkip { reason })) => {
                tracing::warn!(phase = %phase.id, %reason, "diagnosis suggests skipping; retrying anyway");
                Some(format!("diagnosis suggested skipping this phase: {reason}"))
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(phase = %phase.id, error = %format!("{e:#}"), "diagnosis failed");
                None
            }
        }
    }

    /// Try each model in the tier's pool, moving on after rate limits.
    fn produce_with_fallback(&self, phase: &Phase, prompt: &str) -> anyhow::Result<String> {
        let pool = self.config.resolve_model_pool(phase.tier);
        if pool.is_empty() {
            return self.parts.agent.produce(phase, prompt, "");
        }
        for (i, model) in pool.iter().enumerate() {
            let last = i + 1 == pool.len();
            tracing::info!(phase = %phase.id, tier = %phase.tier, model, "running agent");
            match self.parts.agent.produce(phase, prompt, model) {
                Ok(output) if is_rate_limit_output(&output) && !last => {
                    tracing::warn!(model, "rate limited (detected in output), trying next model");
                }
                Ok(output) => return Ok(output),
                Err(e) => {
                    let err = format!("{e:#}");
                    if is_rate_limit_error(&err) && !last {
                        tracing::warn!(model, error = %err, "rate limited, trying next model");
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        anyhow::bail!("all {} models in the {} pool are rate limited", pool.len(), phase.tier)
    }
}

fn is_rate_limit_output(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("429")
        && (lower.contains("rate limit")
            || lower.contains("rate_limit")
            || lower.contains("quota")
            || lower.contains("resource_exhausted"))
}

fn is_rate_limit_error(err: &str) -> bool {
    let lower = err.to_lowercase();
    lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("quota")
        || lower.contains("resource_exhausted")
}

/// Exit 130 on SIGINT/SIGTERM. The kernel drops the run lock with the process.
fn register_interrupt_handler(run: RunId) {
    let result = ctrlc::set_handler(move || {
        eprintln!("Received interrupt signal, stopping run {run}...");
        std::process::exit(130);
    });
    if let Err(e) = result {
        tracing::debug!(error = %e, "interrupt handler already installed");
    }
}
