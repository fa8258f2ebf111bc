//! Approval API handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{ApiError, ApiResult};
use crate::governance::{
    ApprovalTier, AuditEntry, Decision, GovernanceEngine, GovernanceRequest, NewRequest,
    RequestStatus,
};
use crate::phase::{PhaseId, RunId};
use crate::risk::RiskLevel;

/// Actor recorded when a resolution names nobody.
const ANONYMOUS_ACTOR: &str = "http";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<GovernanceEngine>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(engine: Arc<GovernanceEngine>) -> Self {
        Self {
            engine,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub pending: usize,
}

pub async fn health(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let pending = state
        .engine
        .board()
        .list()?
        .iter()
        .filter(|r| r.is_pending())
        .count();
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at,
        pending,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateApprovalBody {
    pub run: String,
    pub phase: String,
    #[serde(default = "default_tier")]
    pub tier: ApprovalTier,
    #[serde(default)]
    pub touched_paths: Vec<String>,
    pub justification: String,
    #[serde(default = "default_risk_level")]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub risk_score: u8,
    /// Ties the request to one change so a later ask for it gets the same
    /// resolution back.
    #[serde(default)]
    pub change_digest: String,
    /// Falls back to `governance.approval_timeout_secs`.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

const fn default_tier() -> ApprovalTier {
    ApprovalTier::RequireApproval
}

const fn default_risk_level() -> RiskLevel {
    RiskLevel::High
}

/// Open a request, or return the phase's existing pending one, or the
/// resolved one for the same change.
pub async fn create_approval(
    State(state): State<AppState>,
    payload: Result<Json<CreateApprovalBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<GovernanceRequest>)> {
    let Json(body) = payload?;
    let run = RunId::new(body.run).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let phase = PhaseId::new(body.phase).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if !body.tier.needs_human() {
        return Err(ApiError::BadRequest(format!(
            "tier {} does not take approval requests",
            body.tier
        )));
    }
    if body.justification.trim().is_empty() {
        return Err(ApiError::BadRequest("justification must not be empty".into()));
    }
    let timeout = match body.timeout_secs {
        Some(0) => return Err(ApiError::BadRequest("timeout_secs must be positive".into())),
        Some(secs) => Duration::from_secs(secs),
        None => state.engine.default_timeout(),
    };

    let (request, created) = state.engine.open_request(NewRequest {
        run,
        phase,
        tier: body.tier,
        touched_paths: body.touched_paths,
        justification: body.justification,
        risk_level: body.risk_level,
        risk_score: body.risk_score,
        change_digest: body.change_digest,
        timeout,
    })?;
    let status = if created {
        tracing::info!(request_id = %request.id, "approval request opened over HTTP");
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(request)))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<RequestStatus>,
    pub run: Option<String>,
}

pub async fn list_approvals(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<GovernanceRequest>>> {
    let requests = state
        .engine
        .board()
        .list()?
        .into_iter()
        .filter(|r| query.status.is_none_or(|s| r.status == s))
        .filter(|r| query.run.as_deref().is_none_or(|run| r.run.as_str() == run))
        .collect();
    Ok(Json(requests))
}

pub async fn get_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<GovernanceRequest>> {
    Ok(Json(state.engine.board().get(&id)?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolveBody {
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

pub async fn approve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ResolveBody>>,
) -> ApiResult<Json<GovernanceRequest>> {
    resolve(&state, &id, Decision::Approve, body.map(|Json(b)| b).unwrap_or_default())
}

pub async fn reject(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ResolveBody>>,
) -> ApiResult<Json<GovernanceRequest>> {
    resolve(&state, &id, Decision::Reject, body.map(|Json(b)| b).unwrap_or_default())
}

/// Callback from the notification channel's action buttons.
#[derive(Debug, Deserialize)]
pub struct WebhookBody {
    pub request_id: String,
    pub action: String,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

pub async fn approval_webhook(
    State(state): State<AppState>,
    payload: Result<Json<WebhookBody>, JsonRejection>,
) -> ApiResult<Json<GovernanceRequest>> {
    let Json(body) = payload?;
    let decision = match body.action.to_ascii_lowercase().as_str() {
        "approve" | "approved" => Decision::Approve,
        "reject" | "rejected" | "deny" => Decision::Reject,
        other => return Err(ApiError::BadRequest(format!("unknown action {other:?}"))),
    };
    resolve(
        &state,
        &body.request_id,
        decision,
        ResolveBody {
            actor: body.actor,
            note: body.note,
        },
    )
}

pub async fn approval_audit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    Ok(Json(state.engine.board().audit(&id)?))
}

fn resolve(
    state: &AppState,
    id: &str,
    decision: Decision,
    body: ResolveBody,
) -> ApiResult<Json<GovernanceRequest>> {
    let actor = body
        .actor
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| ANONYMOUS_ACTOR.to_string());
    let request = state.engine.board().resolve(id, decision, &actor, body.note)?;
    tracing::info!(request_id = %request.id, status = %request.status, %actor, "approval resolved over HTTP");
    Ok(Json(request))
}
