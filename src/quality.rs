//! Quality decision over risk and regression severity.
//!
//! Rule order, first match wins:
//! 1. deletion threshold exceeded → blocked
//! 2. critical risk → blocked
//! 3. high or critical regression severity → blocked
//! 4. medium severity or high risk → needs review
//! 5. otherwise → ok

use serde::{Deserialize, Serialize};

use crate::baseline::Severity;
use crate::risk::{RiskAssessment, RiskLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    Ok,
    NeedsReview,
    Blocked,
}

impl QualityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityLevel::Ok => "ok",
            QualityLevel::NeedsReview => "needs_review",
            QualityLevel::Blocked => "blocked",
        }
    }
}

/// Which rule produced the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityRule {
    DeletionThreshold,
    CriticalRisk,
    RegressionSeverity,
    MediumSeverity,
    HighRisk,
    Clean,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityDecision {
    pub level: QualityLevel,
    pub rule: QualityRule,
    pub reason: String,
}

impl QualityDecision {
    /// Blocked by change risk rather than by regressions. These need a human
    /// decision instead of a plain retry.
    pub fn needs_governance(&self) -> bool {
        self.level == QualityLevel::Blocked
            && matches!(
                self.rule,
                QualityRule::DeletionThreshold | QualityRule::CriticalRisk
            )
    }
}

pub fn decide(assessment: &RiskAssessment, severity: Severity) -> QualityDecision {
    let (level, rule, reason) = if assessment.deletion_threshold_exceeded() {
        (
            QualityLevel::Blocked,
            QualityRule::DeletionThreshold,
            format!(
                "deletion threshold exceeded: net deletion of {} lines",
                assessment.net_deletion
            ),
        )
    } else if assessment.risk_level == RiskLevel::Critical {
        (
            QualityLevel::Blocked,
            QualityRule::CriticalRisk,
            format!("critical change risk (score {})", assessment.risk_score),
        )
    } else if severity.is_blocking() {
        (
            QualityLevel::Blocked,
            QualityRule::RegressionSeverity,
            format!("{severity} regression severity"),
        )
    } else if severity == Severity::Medium {
        (
            QualityLevel::NeedsReview,
            QualityRule::MediumSeverity,
            "medium regression severity".to_string(),
        )
    } else if assessment.risk_level == RiskLevel::High {
        (
            QualityLevel::NeedsReview,
            QualityRule::HighRisk,
            format!("high change risk (score {})", assessment.risk_score),
        )
    } else {
        (QualityLevel::Ok, QualityRule::Clean, "ok".to_string())
    };
    QualityDecision {
        level,
        rule,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::risk::{ChangeStats, RiskScorer, WorkContext};

    fn assess(added: u32, removed: u32, files: usize) -> RiskAssessment {
        let stats = ChangeStats {
            files_changed: (0..files).map(|i| format!("src/f{i}.rs")).collect(),
            lines_added: added,
            lines_removed: removed,
            patch_content: None,
        };
        RiskScorer::new(RiskConfig::default(), &[])
            .unwrap()
            .score(&stats, WorkContext::Troubleshooting)
    }

    fn with_level(level: RiskLevel) -> RiskAssessment {
        let mut a = assess(1, 0, 1);
        a.risk_level = level;
        a
    }

    #[test]
    fn deletion_blocks_before_anything_else() {
        let d = decide(&assess(12, 426, 1), Severity::None);
        assert_eq!(d.level, QualityLevel::Blocked);
        assert_eq!(d.rule, QualityRule::DeletionThreshold);
        assert!(d.needs_governance());
    }

    #[test]
    fn critical_risk_blocks() {
        let d = decide(&with_level(RiskLevel::Critical), Severity::None);
        assert_eq!(d.rule, QualityRule::CriticalRisk);
        assert!(d.needs_governance());
    }

    #[test]
    fn regression_severity_blocks_without_governance() {
        for sev in [Severity::High, Severity::Critical] {
            let d = decide(&with_level(RiskLevel::Low), sev);
            assert_eq!(d.level, QualityLevel::Blocked);
            assert!(!d.needs_governance());
        }
    }

    #[test]
    fn deletion_is_not_masked_by_clean_regressions_and_vice_versa() {
        assert_eq!(
            decide(&assess(0, 500, 1), Severity::None).level,
            QualityLevel::Blocked
        );
        assert_eq!(
            decide(&with_level(RiskLevel::Low), Severity::Critical).level,
            QualityLevel::Blocked
        );
    }

    #[test]
    fn needs_review_cases() {
        assert_eq!(
            decide(&with_level(RiskLevel::Low), Severity::Medium).level,
            QualityLevel::NeedsReview
        );
        assert_eq!(
            decide(&with_level(RiskLevel::High), Severity::None).rule,
            QualityRule::HighRisk
        );
    }

    #[test]
    fn ok_when_nothing_fires() {
        for sev in [Severity::None, Severity::Low] {
            for level in [RiskLevel::Low, RiskLevel::Medium] {
                assert_eq!(decide(&with_level(level), sev).level, QualityLevel::Ok);
            }
        }
    }
}
