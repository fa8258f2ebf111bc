//! Retry and escalation decisions after each finalization attempt.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::EscalationConfig;
use crate::finalizer::{BlockKind, FinalizationDecision, FinalizationStatus};
use crate::phase::{AttemptRecord, CapabilityTier, Phase, PhaseState};
use crate::subprocess::Tool;

/// Attempts (including the current one) after which retries escalate.
pub const ESCALATE_AFTER_ATTEMPTS: u32 = 2;

const DIAGNOSIS_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum PhaseTransition {
    /// The phase is complete; move on.
    Advance,
    /// A governance request is still open.
    AwaitGovernance,
    RetrySameTier,
    RetryEscalatedTier {
        from: CapabilityTier,
        to: CapabilityTier,
    },
    /// Already at the strongest tier; retry with outside diagnosis.
    RequestExternalDiagnosis,
    Fail {
        reason: String,
    },
}

impl PhaseTransition {
    pub fn is_retry(&self) -> bool {
        matches!(
            self,
            PhaseTransition::RetrySameTier
                | PhaseTransition::RetryEscalatedTier { .. }
                | PhaseTransition::RequestExternalDiagnosis
        )
    }
}

impl fmt::Display for PhaseTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseTransition::Advance => f.write_str("advance"),
            PhaseTransition::AwaitGovernance => f.write_str("await governance"),
            PhaseTransition::RetrySameTier => f.write_str("retry (same tier)"),
            PhaseTransition::RetryEscalatedTier { from, to } => {
                write!(f, "retry (escalate {from} -> {to})")
            }
            PhaseTransition::RequestExternalDiagnosis => f.write_str("request external diagnosis"),
            PhaseTransition::Fail { reason } => write!(f, "fail: {reason}"),
        }
    }
}

/// What `apply` did to the phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub transition: PhaseTransition,
    /// Ask the diagnosis side channel for a hint before the retry.
    pub diagnose: bool,
}

pub struct EscalationPolicy {
    config: EscalationConfig,
}

impl EscalationPolicy {
    pub fn new(config: EscalationConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Pure. `phase` carries the history before `decision` is recorded.
    pub fn next(&self, phase: &Phase, decision: &FinalizationDecision) -> PhaseTransition {
        let attempts = phase.attempt_count() + 1;
        let max = self.max_attempts();

        match decision.status() {
            FinalizationStatus::Complete => return PhaseTransition::Advance,
            FinalizationStatus::Failed => {
                return PhaseTransition::Fail {
                    reason: summary(decision).unwrap_or_else(|| "phase failed".into()),
                };
            }
            FinalizationStatus::Blocked => {}
        }

        let kind = decision.block_kind();
        if kind == Some(BlockKind::GovernancePending) {
            return PhaseTransition::AwaitGovernance;
        }
        if attempts >= max {
            return PhaseTransition::Fail {
                reason: format!(
                    "exhausted {max} attempts; last: {}",
                    summary(decision).unwrap_or_else(|| "blocked".into())
                ),
            };
        }

        match kind {
            Some(BlockKind::GovernanceRejected) => {
                let rejected_before = phase
                    .attempts()
                    .iter()
                    .any(|a| a.block_kind == Some(BlockKind::GovernanceRejected));
                if rejected_before {
                    PhaseTransition::Fail {
                        reason: format!(
                            "approval refused twice; last: {}",
                            summary(decision).unwrap_or_else(|| "rejected".into())
                        ),
                    }
                } else {
                    PhaseTransition::RetrySameTier
                }
            }
            Some(BlockKind::Infrastructure | BlockKind::GovernancePending) => {
                PhaseTransition::RetrySameTier
            }
            Some(BlockKind::Regression | BlockKind::Deliverables | BlockKind::ChangeRisk)
            | None => {
                if attempts < ESCALATE_AFTER_ATTEMPTS {
                    PhaseTransition::RetrySameTier
                } else {
                    match phase.tier.next() {
                        Some(to) => PhaseTransition::RetryEscalatedTier {
                            from: phase.tier,
                            to,
                        },
                        None => PhaseTransition::RequestExternalDiagnosis,
                    }
                }
            }
        }
    }

    /// Record the attempt, move the tier and set the phase state.
    pub fn apply(&self, phase: &mut Phase, decision: &FinalizationDecision) -> Step {
        let transition = self.next(phase, decision);
        let attempts = phase.attempt_count() + 1;

        if transition != PhaseTransition::AwaitGovernance {
            phase.record_attempt(AttemptRecord {
                attempt: decision.attempt(),
                outcome: decision.status(),
                block_kind: decision.block_kind(),
                error_summary: summary(decision),
                tier: phase.tier,
                recorded_at: Utc::now(),
            });
        }

        phase.state = match &transition {
            PhaseTransition::Advance => PhaseState::Complete,
            PhaseTransition::AwaitGovernance => PhaseState::PendingApproval,
            PhaseTransition::Fail { .. } => PhaseState::Failed,
            PhaseTransition::RetryEscalatedTier { to, .. } => {
                phase.escalate_to(*to);
                PhaseState::Blocked
            }
            PhaseTransition::RetrySameTier | PhaseTransition::RequestExternalDiagnosis => {
                PhaseState::Blocked
            }
        };

        let diagnose = transition.is_retry() && attempts >= ESCALATE_AFTER_ATTEMPTS;
        tracing::info!(
            phase = %phase.id,
            attempt = decision.attempt(),
            tier = %phase.tier,
            %transition,
            diagnose,
            "escalation step"
        );
        Step {
            transition,
            diagnose,
        }
    }

    /// Move a queued or blocked phase back to executing for its next attempt.
    pub fn begin_attempt(&self, phase: &mut Phase) {
        if !phase.state.is_terminal() {
            phase.state = PhaseState::Executing;
        }
    }
}

fn summary(decision: &FinalizationDecision) -> Option<String> {
    decision.reasons().first().cloned()
}

/// Non-authoritative advice from the diagnosis side channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DiagnosisHint {
    SuggestFix { summary: String },
    SuggestSkip { reason: String },
}

pub trait DiagnosisAdvisor: Send + Sync {
    fn diagnose(
        &self,
        phase: &Phase,
        decision: &FinalizationDecision,
    ) -> anyhow::Result<Option<DiagnosisHint>>;
}

/// Runs `escalation.diagnosis_command` with the blocked decision as JSON on
/// stdin. Empty stdout means no hint.
pub struct CommandDiagnosisAdvisor {
    command: String,
    workspace: PathBuf,
}

impl CommandDiagnosisAdvisor {
    pub fn new(command: &str, workspace: impl Into<PathBuf>) -> Self {
        Self {
            command: command.to_string(),
            workspace: workspace.into(),
        }
    }
}

impl DiagnosisAdvisor for CommandDiagnosisAdvisor {
    fn diagnose(
        &self,
        phase: &Phase,
        decision: &FinalizationDecision,
    ) -> anyhow::Result<Option<DiagnosisHint>> {
        let input = json!({
            "phase": phase.id,
            "title": phase.title,
            "tier": phase.tier,
            "attempts": phase.attempts(),
            "decision": decision,
        });
        let output = Tool::shell(&self.command)
            .current_dir(&self.workspace)
            .stdin(serde_json::to_string(&input)?)
            .timeout(DIAGNOSIS_TIMEOUT)
            .run_ok()?;
        if output.stdout.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(output.parse_json()?))
    }
}
