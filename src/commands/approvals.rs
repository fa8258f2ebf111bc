use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Subcommand};
use serde::de::DeserializeOwned;
use serde_json::json;

use super::{OutputFormat, Project, print_markdown};
use crate::error::ExitError;
use crate::governance::{AuditEntry, GovernanceRequest, RequestStatus};

#[derive(Debug, Args)]
pub struct ApprovalsArgs {
    /// Approval server base URL (defaults to http://<server.bind>)
    #[arg(long, global = true)]
    pub server: Option<String>,
    /// Project root directory
    #[arg(long, global = true)]
    pub project_root: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, global = true)]
    pub format: Option<OutputFormat>,
    #[command(subcommand)]
    pub command: ApprovalsCommand,
}

#[derive(Debug, Subcommand)]
pub enum ApprovalsCommand {
    /// List approval requests
    List {
        /// Only requests with this status (pending, approved, rejected, expired)
        #[arg(long)]
        status: Option<String>,
        /// Only requests of this run
        #[arg(long)]
        run: Option<String>,
    },
    /// Show one request
    Show { id: String },
    /// Approve a pending request
    Approve(ResolveArgs),
    /// Reject a pending request
    Reject(ResolveArgs),
    /// Show the audit trail of a request
    Audit { id: String },
}

#[derive(Debug, Args)]
pub struct ResolveArgs {
    pub id: String,
    /// Who is deciding (defaults to $USER)
    #[arg(long)]
    pub actor: Option<String>,
    /// Note recorded with the decision
    #[arg(long)]
    pub note: Option<String>,
    /// Skip the confirmation prompt
    #[arg(long, short = 'y')]
    pub yes: bool,
}

/// Thin JSON client for the approval API.
struct ApprovalClient {
    base: String,
    agent: ureq::Agent,
}

impl ApprovalClient {
    fn new(base: &str) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(30)))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            base: base.trim_end_matches('/').to_string(),
            agent,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.base)
    }

    fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> anyhow::Result<T> {
        let mut request = self.agent.get(&self.url(path));
        for (key, value) in query {
            request = request.query(*key, *value);
        }
        let response = request
            .call()
            .with_context(|| format!("contacting approval server at {}", self.base))?;
        decode(response)
    }

    fn post<T: DeserializeOwned>(&self, path: &str, body: &serde_json::Value) -> anyhow::Result<T> {
        let response = self
            .agent
            .post(&self.url(path))
            .send_json(body)
            .with_context(|| format!("contacting approval server at {}", self.base))?;
        decode(response)
    }
}

fn decode<T: DeserializeOwned>(mut response: ureq::http::Response<ureq::Body>) -> anyhow::Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .body_mut()
            .read_json::<T>()
            .context("decoding approval server response");
    }
    let message = response
        .body_mut()
        .read_json::<serde_json::Value>()
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| status.to_string());
    Err(ExitError::Other(format!("approval server returned {}: {message}", status.as_u16())).into())
}

fn prompt_confirm(prompt: &str, default: bool) -> anyhow::Result<bool> {
    dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(default)
        .interact()
        .context("reading user confirmation")
}

impl ApprovalsArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let base = match self.server {
            Some(ref url) => url.clone(),
            None => {
                let project = Project::load(self.project_root.as_deref())?;
                format!("http://{}", project.config.server.bind)
            }
        };
        let client = ApprovalClient::new(&base);
        let format = OutputFormat::resolve(self.format);

        match &self.command {
            ApprovalsCommand::List { status, run } => {
                if let Some(s) = status {
                    parse_status(s)?;
                }
                let mut query = Vec::new();
                if let Some(s) = status {
                    query.push(("status", s.as_str()));
                }
                if let Some(r) = run {
                    query.push(("run", r.as_str()));
                }
                let requests: Vec<GovernanceRequest> = client.get("/approvals", &query)?;
                print_requests(&requests, format)
            }
            ApprovalsCommand::Show { id } => {
                let request: GovernanceRequest = client.get(&format!("/approvals/{id}"), &[])?;
                print_requests(std::slice::from_ref(&request), format)
            }
            ApprovalsCommand::Approve(args) => resolve(&client, args, "approve", format),
            ApprovalsCommand::Reject(args) => resolve(&client, args, "reject", format),
            ApprovalsCommand::Audit { id } => {
                let entries: Vec<AuditEntry> = client.get(&format!("/approvals/{id}/audit"), &[])?;
                print_audit(&entries, format)
            }
        }
    }
}

fn parse_status(value: &str) -> anyhow::Result<RequestStatus> {
    serde_json::from_value(json!(value))
        .map_err(|_| ExitError::Config(format!("unknown status {value:?}")).into())
}

fn resolve(
    client: &ApprovalClient,
    args: &ResolveArgs,
    action: &str,
    format: OutputFormat,
) -> anyhow::Result<()> {
    if !args.yes && std::io::stdin().is_terminal() {
        let request: GovernanceRequest = client.get(&format!("/approvals/{}", args.id), &[])?;
        print_requests(std::slice::from_ref(&request), format)?;
        if !prompt_confirm(&format!("{action} {}?", args.id), false)? {
            println!("aborted");
            return Ok(());
        }
    }
    let actor = args
        .actor
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "cli".to_string());
    let request: GovernanceRequest = client.post(
        &format!("/approvals/{}/{action}", args.id),
        &json!({ "actor": actor, "note": args.note }),
    )?;
    print_requests(std::slice::from_ref(&request), format)
}

fn print_requests(requests: &[GovernanceRequest], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Pretty => {
            if requests.is_empty() {
                print_markdown("*no approval requests*\n");
                return Ok(());
            }
            let mut md = String::from("| id | run | phase | tier | risk | status | expires |\n|-|-|-|-|-|-|-|\n");
            for r in requests {
                md.push_str(&format!(
                    "| {} | {} | {} | {} | {} ({}) | {} | {} |\n",
                    r.id,
                    r.run,
                    r.phase,
                    r.tier,
                    r.risk_level,
                    r.risk_score,
                    r.status,
                    r.expires_at.format("%Y-%m-%d %H:%M:%S")
                ));
            }
            if let [single] = requests {
                md.push_str(&format!("\n{}\n", single.justification));
            }
            print_markdown(&md);
        }
        OutputFormat::Text => {
            for r in requests {
                println!(
                    "{} run={} phase={} tier={} risk={}({}) status={}",
                    r.id, r.run, r.phase, r.tier, r.risk_level, r.risk_score, r.status
                );
                if let Some(ref by) = r.resolved_by {
                    println!("  resolved by {by}");
                }
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(requests)?),
    }
    Ok(())
}

fn print_audit(entries: &[AuditEntry], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(entries)?),
        OutputFormat::Pretty | OutputFormat::Text => {
            for e in entries {
                let note = e.note.as_deref().map(|n| format!(": {n}")).unwrap_or_default();
                println!(
                    "{} {} {} by {}{note}",
                    e.at.format("%Y-%m-%d %H:%M:%S"),
                    e.request_id,
                    e.status,
                    e.actor
                );
            }
        }
    }
    Ok(())
}
