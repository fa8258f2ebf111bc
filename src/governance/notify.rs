//! Notification channel for approval requests.
//!
//! Delivery failures are logged by the caller and never resolve a request.

use std::time::Duration;

use anyhow::Context;
use serde_json::json;

use super::GovernanceRequest;
use crate::phase::{PhaseId, RunId};
use crate::template::{ApprovalContext, render_approval_message};

/// Something the humans should hear about.
#[derive(Debug, Clone, Copy)]
pub enum Notice<'a> {
    ApprovalRequested(&'a GovernanceRequest),
    /// A notify-and-proceed change went through without waiting.
    Proceeding {
        run: &'a RunId,
        phase: &'a PhaseId,
        summary: &'a str,
    },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice<'_>) -> anyhow::Result<()>;
}

/// Logs notices. Used when no webhook is configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice<'_>) -> anyhow::Result<()> {
        match notice {
            Notice::ApprovalRequested(request) => tracing::warn!(
                request_id = %request.id,
                run = %request.run,
                phase = %request.phase,
                tier = %request.tier,
                expires_at = %request.expires_at,
                "approval required: {}",
                request.justification
            ),
            Notice::Proceeding {
                run,
                phase,
                summary,
            } => tracing::info!(run = %run, phase = %phase, "proceeding after notify: {summary}"),
        }
        Ok(())
    }
}

/// POSTs JSON notices to a webhook.
pub struct WebhookNotifier {
    url: String,
    project: String,
    public_url: Option<String>,
    agent: ureq::Agent,
}

impl WebhookNotifier {
    pub fn new(url: &str, project: &str, public_url: Option<String>) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(10)))
            .build()
            .into();
        Self {
            url: url.to_string(),
            project: project.to_string(),
            public_url,
            agent,
        }
    }

    fn payload(&self, notice: Notice<'_>) -> anyhow::Result<serde_json::Value> {
        Ok(match notice {
            Notice::ApprovalRequested(request) => {
                let ctx = ApprovalContext::new(&self.project, request, self.public_url.as_deref());
                let text = render_approval_message(&ctx)?;
                json!({
                    "event": "approval_requested",
                    "project": self.project,
                    "text": text,
                    "request": request,
                    "actions": {
                        "approve": ctx.approve_url,
                        "reject": ctx.reject_url,
                    },
                })
            }
            Notice::Proceeding {
                run,
                phase,
                summary,
            } => json!({
                "event": "notify_and_proceed",
                "project": self.project,
                "text": format!("[{}] phase {phase} of run {run} proceeding: {summary}", self.project),
                "run": run,
                "phase": phase,
            }),
        })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, notice: Notice<'_>) -> anyhow::Result<()> {
        let body = serde_json::to_string(&self.payload(notice)?)?;
        self.agent
            .post(&self.url)
            .header("Content-Type", "application/json")
            .send(body)
            .with_context(|| format!("posting notification to {}", self.url))?;
        Ok(())
    }
}
