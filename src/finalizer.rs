//! Three-gate phase finalization.
//!
//! Gates run in a fixed order (regression, quality, deliverables) and stop
//! at the first one that does not pass. `assess` only runs the gates;
//! `finalize` adds governance on top, waiting for a human where the change
//! risk or the approval tier demands one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::baseline::{Baseline, CiResult, CiRunner, Delta, Severity, compute_delta_over};
use crate::config::Config;
use crate::deliverables::DeliverablesValidator;
use crate::error::GateError;
use crate::governance::{
    ApprovalAsk, ApprovalTier, Classification, GovernanceEngine, GovernanceRequest, NewRequest,
    RequestStatus,
};
use crate::phase::{Phase, PhaseId, PhaseState, RunId};
use crate::quality::{self, QualityDecision, QualityLevel, QualityRule};
use crate::risk::{ChangeStats, RiskAssessment, RiskScorer, WorkContext};
use crate::store::RunStore;

/// Regression reasons list at most this many test ids.
const MAX_LISTED_TESTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateName {
    Regression,
    Quality,
    Deliverables,
}

impl fmt::Display for GateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GateName::Regression => "regression",
            GateName::Quality => "quality",
            GateName::Deliverables => "deliverables",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub gate: GateName,
    pub passed: bool,
    /// Not evaluated because an earlier gate stopped the run.
    pub skipped: bool,
    pub reasons: Vec<String>,
}

impl GateOutcome {
    fn pass(gate: GateName, reasons: Vec<String>) -> Self {
        Self {
            gate,
            passed: true,
            skipped: false,
            reasons,
        }
    }

    fn fail(gate: GateName, reasons: Vec<String>) -> Self {
        Self {
            gate,
            passed: false,
            skipped: false,
            reasons,
        }
    }

    fn skipped(gate: GateName) -> Self {
        Self {
            gate,
            passed: false,
            skipped: true,
            reasons: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizationStatus {
    Complete,
    Blocked,
    Failed,
}

impl FinalizationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FinalizationStatus::Complete => "complete",
            FinalizationStatus::Blocked => "blocked",
            FinalizationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for FinalizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a decision is blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Regression,
    /// Critical risk or deletion threshold; needs a human decision.
    ChangeRisk,
    Deliverables,
    GovernanceRejected,
    GovernancePending,
    /// The gate machinery failed, not the change.
    Infrastructure,
}

impl BlockKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockKind::Regression => "regression",
            BlockKind::ChangeRisk => "change_risk",
            BlockKind::Deliverables => "deliverables",
            BlockKind::GovernanceRejected => "governance_rejected",
            BlockKind::GovernancePending => "governance_pending",
            BlockKind::Infrastructure => "infrastructure",
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the governance request behind a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceSummary {
    pub request_id: String,
    pub tier: ApprovalTier,
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl From<&GovernanceRequest> for GovernanceSummary {
    fn from(r: &GovernanceRequest) -> Self {
        Self {
            request_id: r.id.clone(),
            tier: r.tier,
            status: r.status,
            resolved_by: r.resolved_by.clone(),
            note: r.resolution_note.clone(),
        }
    }
}

/// The outcome of one finalization attempt. Built once; read-only after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizationDecision {
    pub(crate) run: RunId,
    pub(crate) phase: PhaseId,
    pub(crate) attempt: u32,
    status: FinalizationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    block_kind: Option<BlockKind>,
    gates: Vec<GateOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    quality: Option<QualityDecision>,
    risk: RiskAssessment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    approval_tier: Option<ApprovalTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    governance: Option<GovernanceSummary>,
    reasons: Vec<String>,
    decided_at: DateTime<Utc>,
}

impl FinalizationDecision {
    pub fn run(&self) -> &RunId {
        &self.run
    }

    pub fn phase(&self) -> &PhaseId {
        &self.phase
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn status(&self) -> FinalizationStatus {
        self.status
    }

    pub fn block_kind(&self) -> Option<BlockKind> {
        self.block_kind
    }

    pub fn gates(&self) -> &[GateOutcome] {
        &self.gates
    }

    pub fn gate(&self, gate: GateName) -> Option<&GateOutcome> {
        self.gates.iter().find(|g| g.gate == gate)
    }

    pub fn severity(&self) -> Option<Severity> {
        self.severity
    }

    pub fn quality(&self) -> Option<&QualityDecision> {
        self.quality.as_ref()
    }

    pub fn risk(&self) -> &RiskAssessment {
        &self.risk
    }

    pub fn approval_tier(&self) -> Option<ApprovalTier> {
        self.approval_tier
    }

    pub fn governance(&self) -> Option<&GovernanceSummary> {
        self.governance.as_ref()
    }

    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    pub fn decided_at(&self) -> DateTime<Utc> {
        self.decided_at
    }

    pub fn is_complete(&self) -> bool {
        self.status == FinalizationStatus::Complete
    }
}

/// The candidate change for one attempt.
#[derive(Debug)]
pub struct Candidate<'a> {
    pub stats: &'a ChangeStats,
    pub context: WorkContext,
    /// The CI run against the candidate. `Err` when the runner itself broke.
    pub ci: Result<CiResult, GateError>,
}

#[derive(Debug, Clone)]
pub struct FinalizerSettings {
    pub high_failure_threshold: usize,
    pub ci_timeout: Duration,
    pub approval_timeout: Duration,
    /// Block the calling thread on approval requests. When `false`, a needed
    /// approval yields a governance-pending decision instead.
    pub wait_for_approval: bool,
}

impl FinalizerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            high_failure_threshold: config.baseline.high_failure_threshold,
            ci_timeout: Duration::from_secs(config.baseline.ci_timeout_secs),
            approval_timeout: config.governance.approval_timeout(),
            wait_for_approval: true,
        }
    }
}

/// Where the gate sequence stopped.
enum Stop {
    Regression,
    Infrastructure,
    Quality,
    Deliverables,
}

struct GateRun {
    gates: Vec<GateOutcome>,
    stop: Option<Stop>,
    severity: Option<Severity>,
    quality: Option<QualityDecision>,
    reasons: Vec<String>,
}

pub struct PhaseFinalizer {
    baseline: Arc<Baseline>,
    ci: Arc<dyn CiRunner>,
    validator: Arc<dyn DeliverablesValidator>,
    scorer: RiskScorer,
    governance: Arc<GovernanceEngine>,
    settings: FinalizerSettings,
    store: Option<RunStore>,
}

impl PhaseFinalizer {
    pub fn new(
        baseline: Arc<Baseline>,
        ci: Arc<dyn CiRunner>,
        validator: Arc<dyn DeliverablesValidator>,
        scorer: RiskScorer,
        governance: Arc<GovernanceEngine>,
        settings: FinalizerSettings,
    ) -> Self {
        Self {
            baseline,
            ci,
            validator,
            scorer,
            governance,
            settings,
            store: None,
        }
    }

    /// Persist every finalized decision through `store`.
    #[must_use]
    pub fn with_store(mut self, store: RunStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn run_id(&self) -> &RunId {
        &self.baseline.run
    }

    /// Run the three gates without governance. All passing means complete.
    pub fn assess(&self, phase: &Phase, candidate: Candidate<'_>) -> FinalizationDecision {
        let risk = self.scorer.score(candidate.stats, candidate.context);
        let run = self.run_gates(phase, candidate.ci, &risk);
        let classification = self.governance.classify(&risk.touched_paths, &risk);
        self.decide(phase, run, risk, Some(classification.tier), None)
    }

    /// Run the gates, then settle governance.
    ///
    /// A change blocked for critical risk or deletion size goes to a human;
    /// approval resumes the deliverables gate, rejection or expiry blocks
    /// the attempt. A change that passes every gate but whose tier needs a
    /// human waits for approval too. A resolution already recorded for the
    /// same change is used without asking again. The decision is persisted
    /// when a store is attached.
    pub fn finalize(&self, phase: &mut Phase, candidate: Candidate<'_>) -> FinalizationDecision {
        phase.state = PhaseState::PendingReview;
        let risk = self.scorer.score(candidate.stats, candidate.context);
        let change_digest = candidate.stats.digest();
        let mut run = self.run_gates(phase, candidate.ci, &risk);
        let classification = self.governance.classify(&risk.touched_paths, &risk);
        let tier = classification.tier;

        let needs_governance = match run.stop {
            Some(Stop::Quality) => run.quality.as_ref().is_some_and(QualityDecision::needs_governance),
            None => tier.needs_human(),
            _ => false,
        };

        let decision = if needs_governance {
            let justification = justification(&run, &risk, &classification);
            match self.settle_governance(phase, &risk, &classification, justification, change_digest) {
                Ok(request) if request.is_approved() => {
                    if matches!(run.stop, Some(Stop::Quality)) {
                        self.resume_after_approval(phase, &mut run);
                    }
                    run.reasons.push(format!(
                        "approval granted by {}",
                        request.resolved_by.as_deref().unwrap_or("unknown")
                    ));
                    self.decide(phase, run, risk, Some(tier), Some(&request))
                }
                Ok(request) if request.is_pending() => {
                    self.governance_blocked(phase, run, risk, tier, &request, BlockKind::GovernancePending)
                }
                Ok(request) => {
                    self.governance_blocked(phase, run, risk, tier, &request, BlockKind::GovernanceRejected)
                }
                Err(e) => {
                    run.stop = Some(Stop::Infrastructure);
                    run.reasons.push(e.infrastructure_reason());
                    self.decide(phase, run, risk, Some(tier), None)
                }
            }
        } else {
            if run.stop.is_none() && tier == ApprovalTier::NotifyAndProceed {
                self.governance.notify_proceeding(
                    self.run_id(),
                    &phase.id,
                    &format!("{} ({})", classification.reason, phase.title),
                );
            }
            self.decide(phase, run, risk, Some(tier), None)
        };

        tracing::info!(
            run = %decision.run,
            phase = %decision.phase,
            attempt = decision.attempt,
            status = %decision.status,
            block_kind = decision.block_kind.map(BlockKind::as_str),
            "phase finalized"
        );
        if let Some(ref store) = self.store
            && let Err(e) = store.save_decision(&decision)
        {
            tracing::error!(phase = %decision.phase, error = %e, "failed to persist decision");
        }
        decision
    }

    fn settle_governance(
        &self,
        phase: &mut Phase,
        risk: &RiskAssessment,
        classification: &Classification,
        justification: String,
        change_digest: String,
    ) -> Result<GovernanceRequest, GateError> {
        phase.state = PhaseState::PendingApproval;
        if self.settings.wait_for_approval {
            let outcome = self.governance.request_approval(
                ApprovalAsk {
                    run: self.run_id(),
                    phase: &phase.id,
                    assessment: risk,
                    classification,
                    justification,
                    change_digest,
                },
                self.settings.approval_timeout,
            )?;
            Ok(outcome.request)
        } else {
            let paths = if classification.paths.is_empty() {
                risk.touched_paths.clone()
            } else {
                classification.paths.clone()
            };
            let (request, _) = self.governance.open_request(NewRequest {
                run: self.run_id().clone(),
                phase: phase.id.clone(),
                tier: classification.tier.max(ApprovalTier::RequireApproval),
                touched_paths: paths,
                justification,
                risk_level: risk.risk_level,
                risk_score: risk.risk_score,
                change_digest,
                timeout: self.settings.approval_timeout,
            })?;
            Ok(request)
        }
    }

    fn governance_blocked(
        &self,
        phase: &Phase,
        mut run: GateRun,
        risk: RiskAssessment,
        tier: ApprovalTier,
        request: &GovernanceRequest,
        kind: BlockKind,
    ) -> FinalizationDecision {
        let reason = match request.status {
            RequestStatus::Pending => format!("awaiting approval on request {}", request.id),
            RequestStatus::Expired => format!(
                "approval request {} expired without a decision (treated as rejection)",
                request.id
            ),
            status => {
                let mut r = format!(
                    "approval {status} by {}",
                    request.resolved_by.as_deref().unwrap_or("unknown")
                );
                if let Some(ref note) = request.resolution_note {
                    r.push_str(": ");
                    r.push_str(note);
                }
                r
            }
        };
        run.reasons.push(reason);
        let mut decision = self.decide(phase, run, risk, Some(tier), Some(request));
        decision.status = FinalizationStatus::Blocked;
        decision.block_kind = Some(kind);
        decision
    }

    /// Approval overrides the quality stop; the deliverables gate still runs.
    fn resume_after_approval(&self, phase: &Phase, run: &mut GateRun) {
        if let Some(q) = run.gates.iter_mut().find(|g| g.gate == GateName::Quality) {
            q.passed = true;
            q.reasons.push("overridden by human approval".into());
        }
        run.stop = None;
        let (outcome, stop) = self.deliverables_gate(phase, &mut run.reasons);
        if let Some(d) = run.gates.iter_mut().find(|g| g.gate == GateName::Deliverables) {
            *d = outcome;
        }
        run.stop = stop;
    }

    fn run_gates(
        &self,
        phase: &Phase,
        ci: Result<CiResult, GateError>,
        risk: &RiskAssessment,
    ) -> GateRun {
        let mut run = GateRun {
            gates: Vec::with_capacity(3),
            stop: None,
            severity: None,
            quality: None,
            reasons: Vec::new(),
        };

        // 1. regression
        let (outcome, severity, stop) = self.regression_gate(ci, &mut run.reasons);
        run.gates.push(outcome);
        run.severity = severity;
        if stop.is_some() {
            run.stop = stop;
            run.gates.push(GateOutcome::skipped(GateName::Quality));
            run.gates.push(GateOutcome::skipped(GateName::Deliverables));
            return run;
        }

        // 2. quality
        let q = quality::decide(risk, severity.unwrap_or(Severity::None));
        let blocked = q.level == QualityLevel::Blocked;
        let mut quality_reasons = vec![q.reason.clone()];
        if blocked {
            quality_reasons.extend(risk.reasons());
            run.reasons.extend(quality_reasons.iter().cloned());
            run.gates.push(GateOutcome::fail(GateName::Quality, quality_reasons));
            run.quality = Some(q);
            run.stop = Some(Stop::Quality);
            run.gates.push(GateOutcome::skipped(GateName::Deliverables));
            return run;
        }
        run.gates.push(GateOutcome::pass(GateName::Quality, quality_reasons));
        run.quality = Some(q);

        // 3. deliverables
        let (outcome, stop) = self.deliverables_gate(phase, &mut run.reasons);
        run.gates.push(outcome);
        run.stop = stop;
        run
    }

    fn regression_gate(
        &self,
        ci: Result<CiResult, GateError>,
        reasons: &mut Vec<String>,
    ) -> (GateOutcome, Option<Severity>, Option<Stop>) {
        let first = match ci {
            Ok(ci) => ci,
            Err(e) => {
                let reason = e.infrastructure_reason();
                reasons.push(reason.clone());
                return (
                    GateOutcome::fail(GateName::Regression, vec![reason]),
                    None,
                    Some(Stop::Infrastructure),
                );
            }
        };

        let threshold = self.settings.high_failure_threshold;
        let mut observations = vec![first];
        let mut delta = compute_delta_over(&self.baseline, &observations);
        let mut severity = delta.severity(threshold);
        let mut gate_reasons = Vec::new();

        if severity.is_blocking() {
            // One re-run of the newly failing subset rules out flakes.
            let subset: Vec<String> = delta.regressions().into_iter().collect();
            tracing::info!(tests = subset.len(), %severity, "re-running new failures once");
            match self.ci.run(Some(&subset), self.settings.ci_timeout) {
                Ok(rerun) => {
                    observations.push(rerun);
                    delta = compute_delta_over(&self.baseline, &observations);
                    severity = delta.severity(threshold);
                }
                Err(e) => {
                    let reason = e.infrastructure_reason();
                    reasons.push(reason.clone());
                    return (
                        GateOutcome::fail(GateName::Regression, vec![reason]),
                        Some(severity),
                        Some(Stop::Infrastructure),
                    );
                }
            }
            if severity.is_blocking() {
                gate_reasons.push(format!("regression confirmed ({severity} severity)"));
                gate_reasons.extend(regression_reasons(&delta));
                reasons.extend(gate_reasons.iter().cloned());
                return (
                    GateOutcome::fail(GateName::Regression, gate_reasons),
                    Some(severity),
                    Some(Stop::Regression),
                );
            }
        }

        if !delta.flaky.is_empty() {
            gate_reasons.push(format!(
                "flaky on re-run: {}",
                list(delta.flaky.iter(), MAX_LISTED_TESTS)
            ));
        }
        if !delta.is_clean() {
            gate_reasons.push(format!("{severity} regression severity"));
            gate_reasons.extend(regression_reasons(&delta));
        }
        (
            GateOutcome::pass(GateName::Regression, gate_reasons),
            Some(severity),
            None,
        )
    }

    fn deliverables_gate(&self, phase: &Phase, reasons: &mut Vec<String>) -> (GateOutcome, Option<Stop>) {
        match self.validator.validate(&phase.deliverables) {
            Ok(result) if result.satisfied => (GateOutcome::pass(GateName::Deliverables, Vec::new()), None),
            Ok(result) => {
                let mut gate_reasons = result.reasons.clone();
                for missing in &result.missing {
                    if !gate_reasons.iter().any(|r| r.contains(missing.as_str())) {
                        gate_reasons.push(format!("missing deliverable {missing}"));
                    }
                }
                reasons.extend(gate_reasons.iter().cloned());
                (
                    GateOutcome::fail(GateName::Deliverables, gate_reasons),
                    Some(Stop::Deliverables),
                )
            }
            Err(e) => {
                let reason = e.infrastructure_reason();
                reasons.push(reason.clone());
                (
                    GateOutcome::fail(GateName::Deliverables, vec![reason]),
                    Some(Stop::Infrastructure),
                )
            }
        }
    }

    fn decide(
        &self,
        phase: &Phase,
        run: GateRun,
        risk: RiskAssessment,
        approval_tier: Option<ApprovalTier>,
        request: Option<&GovernanceRequest>,
    ) -> FinalizationDecision {
        let (status, block_kind) = match run.stop {
            None => (FinalizationStatus::Complete, None),
            Some(Stop::Regression) => (FinalizationStatus::Blocked, Some(BlockKind::Regression)),
            Some(Stop::Infrastructure) => {
                (FinalizationStatus::Blocked, Some(BlockKind::Infrastructure))
            }
            Some(Stop::Deliverables) => {
                (FinalizationStatus::Blocked, Some(BlockKind::Deliverables))
            }
            Some(Stop::Quality) => {
                let kind = match run.quality.as_ref().map(|q| q.rule) {
                    Some(QualityRule::RegressionSeverity) => BlockKind::Regression,
                    _ => BlockKind::ChangeRisk,
                };
                (FinalizationStatus::Blocked, Some(kind))
            }
        };
        FinalizationDecision {
            run: self.run_id().clone(),
            phase: phase.id.clone(),
            attempt: phase.current_attempt(),
            status,
            block_kind,
            gates: run.gates,
            severity: run.severity,
            quality: run.quality,
            risk,
            approval_tier,
            governance: request.map(GovernanceSummary::from),
            reasons: run.reasons,
            decided_at: Utc::now(),
        }
    }
}

fn justification(run: &GateRun, risk: &RiskAssessment, classification: &Classification) -> String {
    let mut parts = Vec::new();
    if let Some(ref q) = run.quality
        && q.level == QualityLevel::Blocked
    {
        parts.push(q.reason.clone());
    }
    parts.push(format!(
        "{}: {}",
        classification.tier, classification.reason
    ));
    parts.extend(risk.reasons());
    parts.join("; ")
}

fn regression_reasons(delta: &Delta) -> Vec<String> {
    let mut out: Vec<String> = delta
        .newly_failing
        .iter()
        .take(MAX_LISTED_TESTS)
        .map(|t| format!("new test failure {t}"))
        .collect();
    out.extend(
        delta
            .newly_erroring
            .iter()
            .take(MAX_LISTED_TESTS)
            .map(|t| format!("new test error {t}")),
    );
    let total = delta.newly_failing.len() + delta.newly_erroring.len();
    if total > out.len() {
        out.push(format!("and {} more", total - out.len()));
    }
    out
}

fn list<'a>(items: impl Iterator<Item = &'a String>, max: usize) -> String {
    let items: Vec<&str> = items.map(String::as_str).collect();
    if items.len() <= max {
        items.join(", ")
    } else {
        format!("{}, and {} more", items[..max].join(", "), items.len() - max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::TestOutcome::{self, Fail, Pass};
    use crate::config::{GovernanceConfig, RiskConfig};
    use crate::deliverables::DeliverablesResult;
    use crate::governance::{ApprovalBoard, Decision, Notice, Notifier};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns queued results for re-runs, recording each filter.
    #[derive(Default)]
    struct ScriptedCi {
        reruns: Mutex<Vec<Result<CiResult, GateError>>>,
        filters: Mutex<Vec<Vec<String>>>,
    }

    impl CiRunner for ScriptedCi {
        fn run(&self, filter: Option<&[String]>, _: Duration) -> Result<CiResult, GateError> {
            self.filters
                .lock()
                .unwrap()
                .push(filter.map(<[String]>::to_vec).unwrap_or_default());
            let mut reruns = self.reruns.lock().unwrap();
            if reruns.is_empty() {
                Err(GateError::CiRun("no scripted result".into()))
            } else {
                reruns.remove(0)
            }
        }
    }

    struct StaticValidator(Result<DeliverablesResult, String>, AtomicUsize);

    impl DeliverablesValidator for StaticValidator {
        fn validate(&self, _: &[String]) -> Result<DeliverablesResult, GateError> {
            self.1.fetch_add(1, Ordering::SeqCst);
            self.0.clone().map_err(GateError::Validator)
        }
    }

    struct QuietNotifier(Mutex<usize>);

    impl Notifier for QuietNotifier {
        fn notify(&self, _: Notice<'_>) -> anyhow::Result<()> {
            *self.0.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct Harness {
        ci: Arc<ScriptedCi>,
        validator: Arc<StaticValidator>,
        board: Arc<ApprovalBoard>,
        notifier: Arc<QuietNotifier>,
        finalizer: PhaseFinalizer,
    }

    fn harness(
        baseline: &[(&str, TestOutcome)],
        deliverables: Result<DeliverablesResult, String>,
        approval_timeout: Duration,
    ) -> Harness {
        harness_on(baseline, deliverables, approval_timeout, Arc::new(ApprovalBoard::new()))
    }

    fn harness_on(
        baseline: &[(&str, TestOutcome)],
        deliverables: Result<DeliverablesResult, String>,
        approval_timeout: Duration,
        board: Arc<ApprovalBoard>,
    ) -> Harness {
        let run = RunId::new("run-1").unwrap();
        let baseline = Arc::new(Baseline::from_ci(
            run,
            "c0",
            &CiResult::from_outcomes(baseline.iter().copied()),
        ));
        let ci = Arc::new(ScriptedCi::default());
        let validator = Arc::new(StaticValidator(deliverables, AtomicUsize::new(0)));
        let notifier = Arc::new(QuietNotifier(Mutex::new(0)));
        let gov_config = GovernanceConfig {
            poll_interval_secs: 1,
            ..GovernanceConfig::default()
        };
        let governance = Arc::new(
            GovernanceEngine::new(
                gov_config.clone(),
                &RiskConfig::default().protected_paths,
                board.clone(),
                notifier.clone(),
            )
            .unwrap(),
        );
        let scorer =
            RiskScorer::new(RiskConfig::default(), &gov_config.never_auto_approve).unwrap();
        let finalizer = PhaseFinalizer::new(
            baseline,
            ci.clone(),
            validator.clone(),
            scorer,
            governance,
            FinalizerSettings {
                high_failure_threshold: 3,
                ci_timeout: Duration::from_secs(5),
                approval_timeout,
                wait_for_approval: true,
            },
        );
        Harness {
            ci,
            validator,
            board,
            notifier,
            finalizer,
        }
    }

    fn phase() -> Phase {
        Phase::new(PhaseId::new("p1").unwrap(), "Parser", vec!["src/parser.rs".into()])
    }

    fn stats(files: &[&str], added: u32, removed: u32) -> ChangeStats {
        ChangeStats {
            files_changed: files.iter().map(|s| (*s).to_string()).collect(),
            lines_added: added,
            lines_removed: removed,
            patch_content: None,
        }
    }

    fn ci(outcomes: &[(&str, TestOutcome)]) -> Result<CiResult, GateError> {
        Ok(CiResult::from_outcomes(outcomes.iter().copied()))
    }

    fn resolve_when_opened(board: Arc<ApprovalBoard>, decision: Decision) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            for _ in 0..200 {
                if let Some(r) = board.list().unwrap().into_iter().find(GovernanceRequest::is_pending) {
                    board
                        .resolve(&r.id, decision, "reviewer", Some("checked by hand".into()))
                        .unwrap();
                    return;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            panic!("no request opened");
        })
    }

    #[test]
    fn clean_small_change_completes() {
        let h = harness(&[("a", Pass)], Ok(DeliverablesResult::satisfied()), Duration::from_secs(1));
        let s = stats(&["src/parser.rs"], 40, 2);
        let d = h.finalizer.assess(
            &phase(),
            Candidate {
                stats: &s,
                context: WorkContext::Feature,
                ci: ci(&[("a", Pass)]),
            },
        );
        assert_eq!(d.status(), FinalizationStatus::Complete);
        assert!(d.gates().iter().all(|g| g.passed));
        assert_eq!(d.gates().len(), 3);
        assert_eq!(d.approval_tier(), Some(ApprovalTier::AutoApprove));
    }

    #[test]
    fn baseline_failures_do_not_block() {
        let h = harness(
            &[("old", Fail), ("a", Pass)],
            Ok(DeliverablesResult::satisfied()),
            Duration::from_secs(1),
        );
        let s = stats(&["src/parser.rs"], 10, 0);
        let d = h.finalizer.assess(
            &phase(),
            Candidate {
                stats: &s,
                context: WorkContext::Feature,
                ci: ci(&[("old", Fail), ("a", Pass)]),
            },
        );
        assert!(d.gate(GateName::Regression).unwrap().passed);
        assert!(d.is_complete());
    }

    #[test]
    fn confirmed_regression_blocks_after_subset_rerun() {
        let baseline: Vec<(&str, TestOutcome)> =
            vec![("a", Pass), ("b", Pass), ("c", Pass), ("d", Pass), ("e", Pass)];
        let h = harness(&baseline, Ok(DeliverablesResult::satisfied()), Duration::from_secs(1));
        let failing = [("a", Fail), ("b", Fail), ("c", Fail), ("d", Fail), ("e", Pass)];
        h.ci.reruns
            .lock()
            .unwrap()
            .push(ci(&[("a", Fail), ("b", Fail), ("c", Fail), ("d", Fail)]));
        let s = stats(&["src/parser.rs"], 10, 0);
        let d = h.finalizer.assess(
            &phase(),
            Candidate {
                stats: &s,
                context: WorkContext::Feature,
                ci: ci(&failing),
            },
        );
        assert_eq!(d.status(), FinalizationStatus::Blocked);
        assert_eq!(d.block_kind(), Some(BlockKind::Regression));
        assert!(d.reasons().iter().any(|r| r.contains("regression confirmed")));
        assert!(d.reasons().iter().any(|r| r == "new test failure a"));
        assert!(d.gate(GateName::Quality).unwrap().skipped);
        assert_eq!(h.ci.filters.lock().unwrap()[0], vec!["a", "b", "c", "d"]);
        assert_eq!(h.validator.1.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn flaky_failures_pass_after_rerun() {
        let baseline: Vec<(&str, TestOutcome)> =
            vec![("a", Pass), ("b", Pass), ("c", Pass), ("d", Pass)];
        let h = harness(&baseline, Ok(DeliverablesResult::satisfied()), Duration::from_secs(1));
        h.ci.reruns
            .lock()
            .unwrap()
            .push(ci(&[("a", Pass), ("b", Pass), ("c", Pass), ("d", Pass)]));
        let s = stats(&["src/parser.rs"], 10, 0);
        let d = h.finalizer.assess(
            &phase(),
            Candidate {
                stats: &s,
                context: WorkContext::Feature,
                ci: ci(&[("a", Fail), ("b", Fail), ("c", Fail), ("d", Fail)]),
            },
        );
        assert!(d.is_complete(), "{:?}", d.reasons());
        assert!(
            d.gate(GateName::Regression)
                .unwrap()
                .reasons
                .iter()
                .any(|r| r.starts_with("flaky on re-run"))
        );
    }

    #[test]
    fn unreadable_ci_is_infrastructure_not_regression() {
        let h = harness(&[("a", Pass)], Ok(DeliverablesResult::satisfied()), Duration::from_secs(1));
        let s = stats(&["src/parser.rs"], 10, 0);
        let d = h.finalizer.assess(
            &phase(),
            Candidate {
                stats: &s,
                context: WorkContext::Feature,
                ci: Err(GateError::UnreadableCiOutput("garbage".into())),
            },
        );
        assert_eq!(d.block_kind(), Some(BlockKind::Infrastructure));
        assert!(d.reasons()[0].starts_with("validation-infrastructure-error"));
    }

    #[test]
    fn validator_crash_is_infrastructure() {
        let h = harness(&[("a", Pass)], Err("validator panicked".into()), Duration::from_secs(1));
        let s = stats(&["src/parser.rs"], 10, 0);
        let d = h.finalizer.assess(
            &phase(),
            Candidate {
                stats: &s,
                context: WorkContext::Feature,
                ci: ci(&[("a", Pass)]),
            },
        );
        assert_eq!(d.block_kind(), Some(BlockKind::Infrastructure));
    }

    #[test]
    fn missing_deliverable_blocks_with_actionable_reason() {
        let h = harness(
            &[("a", Pass)],
            Ok(DeliverablesResult {
                satisfied: false,
                missing: vec!["src/parser.rs".into()],
                reasons: vec![],
            }),
            Duration::from_secs(1),
        );
        let s = stats(&["src/lexer.rs"], 10, 0);
        let d = h.finalizer.assess(
            &phase(),
            Candidate {
                stats: &s,
                context: WorkContext::Feature,
                ci: ci(&[("a", Pass)]),
            },
        );
        assert_eq!(d.block_kind(), Some(BlockKind::Deliverables));
        assert!(d.reasons().contains(&"missing deliverable src/parser.rs".to_string()));
    }

    #[test]
    fn assess_blocks_critical_deletion_as_change_risk() {
        let h = harness(&[("a", Pass)], Ok(DeliverablesResult::satisfied()), Duration::from_secs(1));
        let s = stats(&["src/parser.rs"], 12, 426);
        let d = h.finalizer.assess(
            &phase(),
            Candidate {
                stats: &s,
                context: WorkContext::Troubleshooting,
                ci: ci(&[("a", Pass)]),
            },
        );
        assert_eq!(d.block_kind(), Some(BlockKind::ChangeRisk));
        assert!(d.reasons().iter().any(|r| r.contains("deletion")));
        assert!(h.board.list().unwrap().is_empty());
    }

    #[test]
    fn rejected_deletion_blocks_with_approval_reason() {
        let h = harness(&[("a", Pass)], Ok(DeliverablesResult::satisfied()), Duration::from_secs(30));
        let resolver = resolve_when_opened(h.board.clone(), Decision::Reject);
        let s = stats(&["src/parser.rs"], 12, 426);
        let mut p = phase();
        let d = h.finalizer.finalize(
            &mut p,
            Candidate {
                stats: &s,
                context: WorkContext::Troubleshooting,
                ci: ci(&[("a", Pass)]),
            },
        );
        resolver.join().unwrap();
        assert_eq!(d.status(), FinalizationStatus::Blocked);
        assert_eq!(d.block_kind(), Some(BlockKind::GovernanceRejected));
        assert!(d.reasons().iter().any(|r| r.contains("approval")));
        assert!(d.reasons().iter().any(|r| r.contains("deletion")));
        assert_eq!(d.governance().unwrap().status, RequestStatus::Rejected);
        assert_eq!(d.governance().unwrap().note.as_deref(), Some("checked by hand"));
        assert_eq!(p.state, PhaseState::PendingApproval);
        assert_eq!(*h.notifier.0.lock().unwrap(), 1);
    }

    #[test]
    fn approved_deletion_resumes_deliverables_gate() {
        let h = harness(&[("a", Pass)], Ok(DeliverablesResult::satisfied()), Duration::from_secs(30));
        let resolver = resolve_when_opened(h.board.clone(), Decision::Approve);
        let s = stats(&["src/parser.rs"], 12, 426);
        let d = h.finalizer.finalize(
            &mut phase(),
            Candidate {
                stats: &s,
                context: WorkContext::Troubleshooting,
                ci: ci(&[("a", Pass)]),
            },
        );
        resolver.join().unwrap();
        assert!(d.is_complete(), "{:?}", d.reasons());
        assert!(d.gate(GateName::Deliverables).unwrap().passed);
        assert_eq!(h.validator.1.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn approval_timeout_blocks_as_rejection() {
        let h = harness(&[("a", Pass)], Ok(DeliverablesResult::satisfied()), Duration::from_millis(100));
        let s = stats(&["src/parser.rs"], 12, 426);
        let d = h.finalizer.finalize(
            &mut phase(),
            Candidate {
                stats: &s,
                context: WorkContext::Troubleshooting,
                ci: ci(&[("a", Pass)]),
            },
        );
        assert_eq!(d.block_kind(), Some(BlockKind::GovernanceRejected));
        assert_eq!(d.governance().unwrap().status, RequestStatus::Expired);
        assert!(d.reasons().iter().any(|r| r.contains("expired")));
    }

    #[test]
    fn protected_path_change_waits_for_approval_after_gates_pass() {
        let h = harness(&[("a", Pass)], Ok(DeliverablesResult::satisfied()), Duration::from_secs(30));
        let resolver = resolve_when_opened(h.board.clone(), Decision::Approve);
        let s = stats(&["Cargo.toml", "src/parser.rs"], 3, 1);
        let d = h.finalizer.finalize(
            &mut phase(),
            Candidate {
                stats: &s,
                context: WorkContext::Feature,
                ci: ci(&[("a", Pass)]),
            },
        );
        resolver.join().unwrap();
        assert!(d.is_complete());
        assert_eq!(d.approval_tier(), Some(ApprovalTier::RequireApproval));
        assert!(d.governance().is_some());
    }

    #[test]
    fn non_blocking_mode_reports_pending() {
        let mut h = harness(&[("a", Pass)], Ok(DeliverablesResult::satisfied()), Duration::from_secs(30));
        h.finalizer.settings.wait_for_approval = false;
        let s = stats(&["src/parser.rs"], 12, 426);
        let d = h.finalizer.finalize(
            &mut phase(),
            Candidate {
                stats: &s,
                context: WorkContext::Troubleshooting,
                ci: ci(&[("a", Pass)]),
            },
        );
        assert_eq!(d.block_kind(), Some(BlockKind::GovernancePending));
        assert_eq!(h.board.list().unwrap().len(), 1);
    }

    #[test]
    fn finalize_persists_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        let mut h = harness(&[("a", Pass)], Ok(DeliverablesResult::satisfied()), Duration::from_secs(1));
        h.finalizer = h.finalizer.with_store(store.clone());
        let s = stats(&["src/parser.rs"], 5, 0);
        h.finalizer.finalize(
            &mut phase(),
            Candidate {
                stats: &s,
                context: WorkContext::Feature,
                ci: ci(&[("a", Pass)]),
            },
        );
        let saved = store.list_decisions(&RunId::new("run-1").unwrap()).unwrap();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].is_complete());
        assert_eq!(saved[0].attempt(), 1);
    }

    /// A finalizer that reports pending instead of waiting, as
    /// `assess --govern` runs it, over a board persisted in `store`.
    fn detached(store: &RunStore) -> Harness {
        let mut h = harness_on(
            &[("a", Pass)],
            Ok(DeliverablesResult::satisfied()),
            Duration::from_secs(60),
            Arc::new(ApprovalBoard::with_store(store.clone()).unwrap()),
        );
        h.finalizer.settings.wait_for_approval = false;
        h.finalizer = h.finalizer.with_store(store.clone());
        h
    }

    fn finalize_deletion(h: &Harness) -> FinalizationDecision {
        let s = stats(&["src/parser.rs"], 12, 426);
        h.finalizer.finalize(
            &mut phase(),
            Candidate {
                stats: &s,
                context: WorkContext::Troubleshooting,
                ci: ci(&[("a", Pass)]),
            },
        )
    }

    #[test]
    fn approval_given_between_invocations_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());

        let first = finalize_deletion(&detached(&store));
        assert_eq!(first.block_kind(), Some(BlockKind::GovernancePending));
        let request_id = first.governance().unwrap().request_id.clone();

        ApprovalBoard::with_store(store.clone())
            .unwrap()
            .resolve(&request_id, Decision::Approve, "alice", None)
            .unwrap();

        let h = detached(&store);
        let second = finalize_deletion(&h);
        assert!(second.is_complete(), "{:?}", second.reasons());
        assert_eq!(second.governance().unwrap().request_id, request_id);
        assert!(second.reasons().iter().any(|r| r.contains("approval granted by alice")));
        assert_eq!(h.board.list().unwrap().len(), 1);
        assert_eq!(*h.notifier.0.lock().unwrap(), 0);
    }

    #[test]
    fn rejection_given_between_invocations_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        let first = finalize_deletion(&detached(&store));
        let request_id = first.governance().unwrap().request_id.clone();
        ApprovalBoard::with_store(store.clone())
            .unwrap()
            .resolve(&request_id, Decision::Reject, "bob", Some("too much".into()))
            .unwrap();

        let second = finalize_deletion(&detached(&store));
        assert_eq!(second.block_kind(), Some(BlockKind::GovernanceRejected));
        assert_eq!(second.governance().unwrap().request_id, request_id);
        assert!(second.reasons().iter().any(|r| r.contains("too much")));
    }

    #[test]
    fn a_different_change_asks_again() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        let first = finalize_deletion(&detached(&store));
        let request_id = first.governance().unwrap().request_id.clone();
        ApprovalBoard::with_store(store.clone())
            .unwrap()
            .resolve(&request_id, Decision::Approve, "alice", None)
            .unwrap();

        let s = stats(&["src/parser.rs", "src/lexer.rs"], 12, 500);
        let other = detached(&store).finalizer.finalize(
            &mut phase(),
            Candidate {
                stats: &s,
                context: WorkContext::Troubleshooting,
                ci: ci(&[("a", Pass)]),
            },
        );
        assert_eq!(other.block_kind(), Some(BlockKind::GovernancePending));
        assert_ne!(other.governance().unwrap().request_id, request_id);
    }

    #[test]
    fn every_finalization_keeps_its_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        let first = finalize_deletion(&detached(&store));
        let second = finalize_deletion(&detached(&store));
        assert_eq!(first.attempt(), second.attempt());

        let saved = store.list_decisions(&RunId::new("run-1").unwrap()).unwrap();
        assert_eq!(saved.len(), 2);
        assert!(saved[0].decided_at() <= saved[1].decided_at());
    }
}
