//! Phase, run and capability-tier types shared by every gate.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::finalizer::{BlockKind, FinalizationStatus};

/// Validate an identifier used in file names, URLs and lock paths.
fn validate_id(kind: &str, value: &str) -> anyhow::Result<()> {
    if value.is_empty()
        || value.len() > 64
        || value.starts_with('-')
        || value.contains("..")
        || !value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
    {
        anyhow::bail!("invalid {kind} {value:?}: must match [A-Za-z0-9._-]{{1,64}}");
    }
    Ok(())
}

macro_rules! string_id {
    ($name:ident, $kind:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> anyhow::Result<Self> {
                let value = value.into();
                validate_id($kind, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = anyhow::Error;

            fn try_from(value: String) -> anyhow::Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(RunId, "run id");
string_id!(PhaseId, "phase id");

/// Lifecycle of a phase.
///
/// `Complete` and `Failed` are terminal. `Blocked` halts the phase until a
/// governance decision or a retry moves it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Queued,
    Executing,
    PendingReview,
    PendingApproval,
    Complete,
    Blocked,
    Failed,
}

impl PhaseState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PhaseState::Complete | PhaseState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PhaseState::Queued => "queued",
            PhaseState::Executing => "executing",
            PhaseState::PendingReview => "pending_review",
            PhaseState::PendingApproval => "pending_approval",
            PhaseState::Complete => "complete",
            PhaseState::Blocked => "blocked",
            PhaseState::Failed => "failed",
        }
    }
}

/// Strength of the agent configuration used for an attempt.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityTier {
    #[default]
    Low,
    Medium,
    High,
}

impl CapabilityTier {
    /// The next stronger tier, or `None` at the top.
    pub fn next(self) -> Option<Self> {
        match self {
            CapabilityTier::Low => Some(CapabilityTier::Medium),
            CapabilityTier::Medium => Some(CapabilityTier::High),
            CapabilityTier::High => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CapabilityTier::Low => "low",
            CapabilityTier::Medium => "medium",
            CapabilityTier::High => "high",
        }
    }
}

impl fmt::Display for CapabilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One finalization attempt as recorded in the phase history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    pub outcome: FinalizationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_kind: Option<BlockKind>,
    /// First reason of the decision, if any.
    pub error_summary: Option<String>,
    pub tier: CapabilityTier,
    pub recorded_at: DateTime<Utc>,
}

/// One unit of work in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub id: PhaseId,
    pub title: String,
    pub state: PhaseState,
    /// Declared deliverables: paths relative to the workspace.
    #[serde(default)]
    pub deliverables: Vec<String>,
    pub tier: CapabilityTier,
    attempts: Vec<AttemptRecord>,
}

impl Phase {
    pub fn new(id: PhaseId, title: impl Into<String>, deliverables: Vec<String>) -> Self {
        Self {
            id,
            title: title.into(),
            state: PhaseState::Queued,
            deliverables,
            tier: CapabilityTier::Low,
            attempts: Vec::new(),
        }
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn attempt_count(&self) -> u32 {
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX)
    }

    /// Number of the attempt currently in flight (1-based).
    pub fn current_attempt(&self) -> u32 {
        self.attempt_count().saturating_add(1)
    }

    /// Append an attempt. Only the escalation policy records attempts.
    pub(crate) fn record_attempt(&mut self, record: AttemptRecord) {
        self.attempts.push(record);
    }

    /// Raise the capability tier. Only the escalation policy escalates.
    pub(crate) fn escalate_to(&mut self, tier: CapabilityTier) {
        if tier > self.tier {
            self.tier = tier;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_reject_path_components() {
        assert!(PhaseId::new("phase-1").is_ok());
        assert!(PhaseId::new("p_2.b").is_ok());
        assert!(PhaseId::new("").is_err());
        assert!(PhaseId::new("../etc").is_err());
        assert!(PhaseId::new("a/b").is_err());
        assert!(RunId::new("-flag").is_err());
        assert!(RunId::new("x".repeat(65)).is_err());
    }

    #[test]
    fn ids_roundtrip_through_serde() {
        let id = RunId::new("run-7").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"run-7\"");
        let back: RunId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<RunId>("\"bad/id\"").is_err());
    }

    #[test]
    fn tiers_are_ordered_and_saturate() {
        assert!(CapabilityTier::Low < CapabilityTier::Medium);
        assert!(CapabilityTier::Medium < CapabilityTier::High);
        assert_eq!(CapabilityTier::Low.next(), Some(CapabilityTier::Medium));
        assert_eq!(CapabilityTier::High.next(), None);
    }

    #[test]
    fn escalate_never_lowers_tier() {
        let mut phase = Phase::new(PhaseId::new("p1").unwrap(), "t", vec![]);
        phase.escalate_to(CapabilityTier::High);
        phase.escalate_to(CapabilityTier::Medium);
        assert_eq!(phase.tier, CapabilityTier::High);
    }

    #[test]
    fn terminal_states() {
        assert!(PhaseState::Complete.is_terminal());
        assert!(PhaseState::Failed.is_terminal());
        assert!(!PhaseState::Blocked.is_terminal());
        assert!(!PhaseState::PendingApproval.is_terminal());
    }
}
