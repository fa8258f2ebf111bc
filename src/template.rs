//! Template rendering for approval notifications and agent prompts.

use minijinja::Environment;
use serde::Serialize;

use crate::governance::GovernanceRequest;

const APPROVAL_TEMPLATE: &str = include_str!("templates/approval-request.txt.jinja");
const PHASE_PROMPT_TEMPLATE: &str = include_str!("templates/phase-prompt.md.jinja");

/// Context for the human-readable approval prompt.
#[derive(Debug, Serialize)]
pub struct ApprovalContext<'a> {
    pub project: &'a str,
    pub request: &'a GovernanceRequest,
    /// Inline action links, present when the approval server has a public URL.
    pub approve_url: Option<String>,
    pub reject_url: Option<String>,
}

impl<'a> ApprovalContext<'a> {
    pub fn new(project: &'a str, request: &'a GovernanceRequest, public_url: Option<&str>) -> Self {
        let base = public_url.map(|u| u.trim_end_matches('/').to_string());
        Self {
            project,
            request,
            approve_url: base
                .as_ref()
                .map(|b| format!("{b}/api/v1/approvals/{}/approve", request.id)),
            reject_url: base.map(|b| format!("{b}/api/v1/approvals/{}/reject", request.id)),
        }
    }
}

/// Context for the prompt handed to the agent for one attempt.
#[derive(Debug, Serialize)]
pub struct PhasePromptContext<'a> {
    pub phase_id: &'a str,
    pub title: &'a str,
    pub prompt: &'a str,
    pub deliverables: &'a [String],
    pub attempt: u32,
    /// Reasons the previous attempt was blocked, fed back to the agent.
    pub previous_reasons: &'a [String],
}

fn render<S: Serialize>(name: &str, source: &str, ctx: &S) -> anyhow::Result<String> {
    let mut env = Environment::new();
    env.add_template(name, source)?;
    let template = env.get_template(name)?;
    Ok(template.render(ctx)?)
}

/// Render the approval request text sent to the notification channel.
pub fn render_approval_message(ctx: &ApprovalContext<'_>) -> anyhow::Result<String> {
    render("approval-request", APPROVAL_TEMPLATE, ctx)
}

pub fn render_phase_prompt(ctx: &PhasePromptContext<'_>) -> anyhow::Result<String> {
    render("phase-prompt", PHASE_PROMPT_TEMPLATE, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::{ApprovalTier, RequestStatus};
    use crate::phase::{PhaseId, RunId};
    use crate::risk::RiskLevel;
    use chrono::Utc;

    fn request() -> GovernanceRequest {
        let now = Utc::now();
        GovernanceRequest {
            id: "gov-00000000000000aa".into(),
            run: RunId::new("run-1").unwrap(),
            phase: PhaseId::new("p3").unwrap(),
            tier: ApprovalTier::AlwaysBlock,
            touched_paths: vec!["db/migrations/001.sql".into()],
            justification: "never-auto-approve path touched".into(),
            risk_level: RiskLevel::High,
            risk_score: 65,
            change_digest: String::new(),
            status: RequestStatus::Pending,
            created_at: now,
            expires_at: now + chrono::Duration::hours(1),
            resolved_by: None,
            resolved_at: None,
            resolution_note: None,
        }
    }

    #[test]
    fn approval_message_with_links() {
        let req = request();
        let ctx = ApprovalContext::new("myapp", &req, Some("https://gate.example.com/"));
        let text = render_approval_message(&ctx).unwrap();
        assert!(text.contains("[myapp] approval needed: phase p3 of run run-1"));
        assert!(text.contains("always_block"));
        assert!(text.contains("db/migrations/001.sql"));
        assert!(text.contains(
            "https://gate.example.com/api/v1/approvals/gov-00000000000000aa/approve"
        ));
    }

    #[test]
    fn approval_message_without_links_points_at_cli() {
        let req = request();
        let text = render_approval_message(&ApprovalContext::new("myapp", &req, None)).unwrap();
        assert!(text.contains("phasegate approvals approve gov-00000000000000aa"));
    }

    #[test]
    fn phase_prompt_includes_feedback() {
        let deliverables = vec!["src/parser.rs".to_string()];
        let reasons = vec!["missing deliverable src/parser.rs".to_string()];
        let text = render_phase_prompt(&PhasePromptContext {
            phase_id: "p1",
            title: "Parser",
            prompt: "Write the parser.",
            deliverables: &deliverables,
            attempt: 2,
            previous_reasons: &reasons,
        })
        .unwrap();
        assert!(text.contains("# Phase p1: Parser"));
        assert!(text.contains("`src/parser.rs`"));
        assert!(text.contains("Previous attempt 1 was blocked"));
        assert!(text.contains("missing deliverable src/parser.rs"));
    }
}
