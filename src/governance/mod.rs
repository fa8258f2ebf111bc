//! Approval tiering and the human-approval workflow.
//!
//! `classify` is default-deny: anything touching a never-auto-approve path is
//! always-block, and a change only skips the human when it is small, low
//! risk, and entirely inside the allowed paths.

mod notify;
mod request;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use notify::{LogNotifier, Notice, Notifier, WebhookNotifier};
pub use request::{
    ApprovalBoard, AuditEntry, Decision, GovernanceRequest, NewRequest, RequestStatus,
    ResolveError, TIMEOUT_ACTOR,
};

use crate::config::GovernanceConfig;
use crate::error::GateError;
use crate::paths::PathSet;
use crate::phase::{PhaseId, RunId};
use crate::risk::{LARGE_FILE_DELETION_LINES, PROTECTED_PATH_TOUCHED, RiskAssessment, RiskLevel};

/// Largest churn that can be auto-approved.
pub const AUTO_APPROVE_MAX_LINES: u64 = 100;
/// Largest churn that can proceed with only a notification.
pub const NOTIFY_MAX_LINES: u64 = 200;
/// Auto-approval requires a score below this.
pub const AUTO_APPROVE_MAX_SCORE: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalTier {
    AutoApprove,
    NotifyAndProceed,
    RequireApproval,
    AlwaysBlock,
}

impl ApprovalTier {
    /// Tiers that need an explicit human approval before the phase proceeds.
    pub fn needs_human(self) -> bool {
        matches!(self, ApprovalTier::RequireApproval | ApprovalTier::AlwaysBlock)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalTier::AutoApprove => "auto_approve",
            ApprovalTier::NotifyAndProceed => "notify_and_proceed",
            ApprovalTier::RequireApproval => "require_approval",
            ApprovalTier::AlwaysBlock => "always_block",
        }
    }
}

impl fmt::Display for ApprovalTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tier with the reason and the paths that decided it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub tier: ApprovalTier,
    pub reason: String,
    /// Paths that triggered the tier; empty when the tier was size or risk driven.
    pub paths: Vec<String>,
}

/// Path lists used by `classify`. Built once from config.
#[derive(Debug, Clone)]
pub struct GovernancePolicy {
    never_auto_approve: PathSet,
    allowed: PathSet,
    protected: PathSet,
}

impl GovernancePolicy {
    pub fn new(config: &GovernanceConfig, protected_paths: &[String]) -> anyhow::Result<Self> {
        Ok(Self {
            never_auto_approve: PathSet::new(&config.never_auto_approve)?,
            allowed: PathSet::new(&config.allowed_paths)?,
            protected: PathSet::new(protected_paths)?,
        })
    }

    pub fn classify(&self, touched: &[String], assessment: &RiskAssessment) -> ApprovalTier {
        self.explain(touched, assessment).tier
    }

    /// Pure and total: every input maps to exactly one tier.
    pub fn explain(&self, touched: &[String], assessment: &RiskAssessment) -> Classification {
        let never: Vec<String> = touched
            .iter()
            .filter(|p| self.never_auto_approve.matches(p))
            .cloned()
            .collect();
        if !never.is_empty() {
            return Classification {
                tier: ApprovalTier::AlwaysBlock,
                reason: format!("touches never-auto-approve paths: {}", never.join(", ")),
                paths: never,
            };
        }

        let protected: Vec<String> = touched
            .iter()
            .filter(|p| self.protected.matches(p))
            .cloned()
            .collect();
        if matches!(assessment.risk_level, RiskLevel::High | RiskLevel::Critical) {
            return Classification {
                tier: ApprovalTier::RequireApproval,
                reason: format!(
                    "{} change risk (score {})",
                    assessment.risk_level, assessment.risk_score
                ),
                paths: protected,
            };
        }
        if !protected.is_empty() || assessment.check(PROTECTED_PATH_TOUCHED) {
            return Classification {
                tier: ApprovalTier::RequireApproval,
                reason: format!("touches protected paths: {}", protected.join(", ")),
                paths: protected,
            };
        }

        let outside: Vec<String> = touched
            .iter()
            .filter(|p| !self.allowed.matches(p))
            .cloned()
            .collect();
        let churn = assessment.lines_changed;
        if outside.is_empty()
            && churn <= AUTO_APPROVE_MAX_LINES
            && assessment.largest_file_deletion <= LARGE_FILE_DELETION_LINES
            && assessment.risk_score < AUTO_APPROVE_MAX_SCORE
        {
            return Classification {
                tier: ApprovalTier::AutoApprove,
                reason: format!("{churn} lines within allowed paths"),
                paths: Vec::new(),
            };
        }
        if outside.is_empty() && churn <= NOTIFY_MAX_LINES {
            return Classification {
                tier: ApprovalTier::NotifyAndProceed,
                reason: format!("{churn} lines within allowed paths"),
                paths: Vec::new(),
            };
        }
        let reason = if outside.is_empty() {
            format!("{churn} lines changed exceeds the {NOTIFY_MAX_LINES}-line notify limit")
        } else {
            format!("touches paths outside the allowed set: {}", outside.join(", "))
        };
        Classification {
            tier: ApprovalTier::RequireApproval,
            reason,
            paths: outside,
        }
    }
}

/// Result of a blocking approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    pub request: GovernanceRequest,
    pub approved: bool,
}

/// What a governance request is about.
#[derive(Debug, Clone)]
pub struct ApprovalAsk<'a> {
    pub run: &'a RunId,
    pub phase: &'a PhaseId,
    pub assessment: &'a RiskAssessment,
    pub classification: &'a Classification,
    pub justification: String,
    /// See [`NewRequest::change_digest`].
    pub change_digest: String,
}

pub struct GovernanceEngine {
    policy: GovernancePolicy,
    config: GovernanceConfig,
    board: Arc<ApprovalBoard>,
    notifier: Arc<dyn Notifier>,
}

impl GovernanceEngine {
    pub fn new(
        config: GovernanceConfig,
        protected_paths: &[String],
        board: Arc<ApprovalBoard>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            policy: GovernancePolicy::new(&config, protected_paths)?,
            config,
            board,
            notifier,
        })
    }

    pub fn policy(&self) -> &GovernancePolicy {
        &self.policy
    }

    pub fn board(&self) -> &Arc<ApprovalBoard> {
        &self.board
    }

    pub fn default_timeout(&self) -> Duration {
        self.config.approval_timeout()
    }

    pub fn classify(&self, touched: &[String], assessment: &RiskAssessment) -> Classification {
        self.policy.explain(touched, assessment)
    }

    /// Open (or reuse) the pending request and notify on creation.
    pub fn open_request(&self, new: NewRequest) -> Result<(GovernanceRequest, bool), GateError> {
        let (request, created) = self.board.open(new)?;
        if created {
            self.send(Notice::ApprovalRequested(&request));
        }
        Ok((request, created))
    }

    /// Open a request, notify, and block until it is resolved or expires.
    /// Expiry counts as rejection.
    pub fn request_approval(
        &self,
        ask: ApprovalAsk<'_>,
        timeout: Duration,
    ) -> Result<ApprovalOutcome, GateError> {
        let touched = if ask.classification.paths.is_empty() {
            ask.assessment.touched_paths.clone()
        } else {
            ask.classification.paths.clone()
        };
        let (request, _) = self.open_request(NewRequest {
            run: ask.run.clone(),
            phase: ask.phase.clone(),
            tier: ask.classification.tier.max(ApprovalTier::RequireApproval),
            touched_paths: touched,
            justification: ask.justification,
            risk_level: ask.assessment.risk_level,
            risk_score: ask.assessment.risk_score,
            change_digest: ask.change_digest,
            timeout,
        })?;

        tracing::info!(request_id = %request.id, phase = %ask.phase, "waiting for approval");
        let request = self
            .board
            .wait(&request.id, self.config.poll_interval())
            .map_err(|e| match e {
                ResolveError::Store(g) => g,
                other => GateError::Store(other.to_string()),
            })?;
        let approved = request.is_approved();
        Ok(ApprovalOutcome { request, approved })
    }

    /// Tell the humans a notify-and-proceed change went through.
    pub fn notify_proceeding(&self, run: &RunId, phase: &PhaseId, summary: &str) {
        self.send(Notice::Proceeding {
            run,
            phase,
            summary,
        });
    }

    fn send(&self, notice: Notice<'_>) {
        if let Err(e) = self.notifier.notify(notice) {
            tracing::error!(error = %format!("{e:#}"), "notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::risk::{ChangeStats, RiskScorer, WorkContext};
    use std::sync::Mutex;

    fn policy() -> GovernancePolicy {
        GovernancePolicy::new(&GovernanceConfig::default(), &RiskConfig::default().protected_paths)
            .unwrap()
    }

    fn assess(files: &[&str], added: u32, removed: u32) -> (Vec<String>, RiskAssessment) {
        let stats = ChangeStats {
            files_changed: files.iter().map(|s| (*s).to_string()).collect(),
            lines_added: added,
            lines_removed: removed,
            patch_content: None,
        };
        let config = GovernanceConfig::default();
        let a = RiskScorer::new(RiskConfig::default(), &config.never_auto_approve)
            .unwrap()
            .score(&stats, WorkContext::Feature);
        (stats.files_changed, a)
    }

    #[test]
    fn never_auto_approve_always_blocks_regardless_of_size() {
        for path in [
            ".git/config",
            "db/migrations/0001.sql",
            "schema.sql",
            ".env.production",
            "deploy/server.pem",
            ".github/workflows/ci.yml",
        ] {
            let (touched, a) = assess(&[path], 1, 0);
            let c = policy().explain(&touched, &a);
            assert_eq!(c.tier, ApprovalTier::AlwaysBlock, "{path}");
            assert_eq!(c.paths, vec![path.to_string()]);
        }
    }

    #[test]
    fn small_allowed_change_auto_approves() {
        let (touched, a) = assess(&["src/lib.rs", "tests/it.rs"], 40, 10);
        assert_eq!(policy().classify(&touched, &a), ApprovalTier::AutoApprove);
    }

    #[test]
    fn medium_allowed_change_notifies() {
        let (touched, a) = assess(&["src/lib.rs"], 120, 30);
        assert_eq!(policy().classify(&touched, &a), ApprovalTier::NotifyAndProceed);
    }

    #[test]
    fn large_or_outside_change_requires_approval() {
        let (touched, a) = assess(&["src/lib.rs"], 250, 10);
        assert_eq!(policy().classify(&touched, &a), ApprovalTier::RequireApproval);

        let (touched, a) = assess(&["scripts/deploy.sh"], 5, 0);
        let c = policy().explain(&touched, &a);
        assert_eq!(c.tier, ApprovalTier::RequireApproval);
        assert!(c.reason.contains("outside the allowed set"));
    }

    #[test]
    fn protected_touch_requires_approval() {
        let (touched, a) = assess(&["Cargo.toml"], 1, 1);
        assert_eq!(policy().classify(&touched, &a), ApprovalTier::RequireApproval);
    }

    #[test]
    fn critical_deletion_requires_approval() {
        let stats = ChangeStats {
            files_changed: vec!["src/lib.rs".into()],
            lines_added: 12,
            lines_removed: 426,
            patch_content: None,
        };
        let a = RiskScorer::new(RiskConfig::default(), &[])
            .unwrap()
            .score(&stats, WorkContext::Troubleshooting);
        assert_eq!(
            policy().classify(&stats.files_changed, &a),
            ApprovalTier::RequireApproval
        );
    }

    #[test]
    fn loosened_limits_never_unlock_always_block() {
        let mut config = GovernanceConfig::default();
        config.allowed_paths = vec!["**".into()];
        let policy = GovernancePolicy::new(&config, &[]).unwrap();
        let (touched, a) = assess(&["migrations/001.sql"], 1, 0);
        assert_eq!(policy.classify(&touched, &a), ApprovalTier::AlwaysBlock);
    }

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, notice: Notice<'_>) -> anyhow::Result<()> {
            let label = match notice {
                Notice::ApprovalRequested(r) => format!("request:{}", r.id),
                Notice::Proceeding { phase, .. } => format!("proceed:{phase}"),
            };
            self.seen.lock().unwrap().push(label);
            if self.fail {
                anyhow::bail!("webhook down");
            }
            Ok(())
        }
    }

    fn engine(notifier: Arc<RecordingNotifier>) -> GovernanceEngine {
        let mut config = GovernanceConfig::default();
        config.poll_interval_secs = 1;
        GovernanceEngine::new(config, &[], Arc::new(ApprovalBoard::new()), notifier).unwrap()
    }

    #[test]
    fn request_approval_returns_resolution() {
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = Arc::new(engine(notifier.clone()));
        let (touched, a) = assess(&["src/lib.rs"], 12, 426);
        let c = engine.classify(&touched, &a);
        let run = RunId::new("run-1").unwrap();
        let phase = PhaseId::new("p1").unwrap();

        let resolver = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    if let Some(r) = engine.board().list().unwrap().into_iter().next() {
                        return engine
                            .board()
                            .resolve(&r.id, Decision::Approve, "alice", None)
                            .map(|_| ());
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(ResolveError::NotFound("none opened".into()))
            })
        };
        let outcome = engine
            .request_approval(
                ApprovalAsk {
                    run: &run,
                    phase: &phase,
                    assessment: &a,
                    classification: &c,
                    justification: "deletion".into(),
                    change_digest: "c1".into(),
                },
                Duration::from_secs(30),
            )
            .unwrap();
        resolver.join().unwrap().unwrap();
        assert!(outcome.approved);
        assert_eq!(outcome.request.resolved_by.as_deref(), Some("alice"));
        assert_eq!(notifier.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn notification_failure_does_not_resolve() {
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..RecordingNotifier::default()
        });
        let engine = engine(notifier);
        let (request, created) = engine
            .open_request(NewRequest {
                run: RunId::new("run-1").unwrap(),
                phase: PhaseId::new("p1").unwrap(),
                tier: ApprovalTier::RequireApproval,
                touched_paths: vec![],
                justification: "x".into(),
                risk_level: RiskLevel::High,
                risk_score: 60,
                change_digest: String::new(),
                timeout: Duration::from_secs(60),
            })
            .unwrap();
        assert!(created);
        assert_eq!(
            engine.board().get(&request.id).unwrap().status,
            RequestStatus::Pending
        );
    }

    #[test]
    fn expired_request_is_a_rejection() {
        let engine = engine(Arc::new(RecordingNotifier::default()));
        let (touched, a) = assess(&["src/lib.rs"], 12, 426);
        let c = engine.classify(&touched, &a);
        let outcome = engine
            .request_approval(
                ApprovalAsk {
                    run: &RunId::new("run-1").unwrap(),
                    phase: &PhaseId::new("p1").unwrap(),
                    assessment: &a,
                    classification: &c,
                    justification: "deletion".into(),
                    change_digest: "c1".into(),
                },
                Duration::from_millis(100),
            )
            .unwrap();
        assert!(!outcome.approved);
        assert_eq!(outcome.request.status, RequestStatus::Expired);
    }
}
