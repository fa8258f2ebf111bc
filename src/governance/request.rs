//! Governance requests and the approval board that resolves them.
//!
//! The board is the single owner of request state within a process.
//! Resolution is one atomic transition under the board lock, and under the
//! store's governance lock when persisted: the first writer wins and later
//! writers get `AlreadyResolved`. Waiters block on a condition variable in
//! bounded intervals and mark the request expired once its deadline passes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ApprovalTier;
use crate::error::GateError;
use crate::phase::{PhaseId, RunId};
use crate::risk::RiskLevel;
use crate::store::RunStore;

/// Actor recorded when a request runs out of time.
pub const TIMEOUT_ACTOR: &str = "system:timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl RequestStatus {
    pub fn is_resolved(self) -> bool {
        self != RequestStatus::Pending
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A human's answer to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    fn status(self) -> RequestStatus {
        match self {
            Decision::Approve => RequestStatus::Approved,
            Decision::Reject => RequestStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceRequest {
    pub id: String,
    pub run: RunId,
    pub phase: PhaseId,
    pub tier: ApprovalTier,
    /// Paths that triggered the requirement.
    pub touched_paths: Vec<String>,
    pub justification: String,
    pub risk_level: RiskLevel,
    pub risk_score: u8,
    /// Digest of the change the request is about. Empty when not tied to one.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub change_digest: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Reason given by the resolving actor, kept verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_note: Option<String>,
}

impl GovernanceRequest {
    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && now >= self.expires_at
    }

    /// Approved is the only outcome that lets a phase proceed.
    pub fn is_approved(&self) -> bool {
        self.status == RequestStatus::Approved
    }
}

/// One resolution of one request. Never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub request_id: String,
    pub run: RunId,
    pub phase: PhaseId,
    pub status: RequestStatus,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

/// Input to `ApprovalBoard::open`.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub run: RunId,
    pub phase: PhaseId,
    pub tier: ApprovalTier,
    pub touched_paths: Vec<String>,
    pub justification: String,
    pub risk_level: RiskLevel,
    pub risk_score: u8,
    /// Lets a resolved request be found again for the same change.
    pub change_digest: String,
    pub timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("governance request {0} not found")]
    NotFound(String),

    #[error("governance request {id} is already {status}")]
    AlreadyResolved { id: String, status: RequestStatus },

    #[error(transparent)]
    Store(#[from] GateError),
}

#[derive(Default)]
struct BoardState {
    requests: BTreeMap<String, GovernanceRequest>,
    audit: Vec<AuditEntry>,
}

impl BoardState {
    fn load(store: &RunStore) -> Result<Self, GateError> {
        let mut state = Self::default();
        for request in store.load_requests()? {
            let run = request.run.clone();
            if !state.requests.values().any(|r| r.run == run) {
                state.audit.extend(store.read_audit(&run)?);
            }
            state.requests.insert(request.id.clone(), request);
        }
        Ok(state)
    }
}

/// What a state change did.
enum Transition {
    Applied(GovernanceRequest),
    /// Someone else resolved it first; carries their record.
    Superseded(GovernanceRequest),
}

impl Transition {
    fn into_request(self) -> GovernanceRequest {
        match self {
            Transition::Applied(r) | Transition::Superseded(r) => r,
        }
    }
}

pub struct ApprovalBoard {
    state: Mutex<BoardState>,
    changed: Condvar,
    store: Option<RunStore>,
}

impl Default for ApprovalBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalBoard {
    /// An in-memory board.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BoardState::default()),
            changed: Condvar::new(),
            store: None,
        }
    }

    /// A board persisted through `store`. The store is authoritative: every
    /// read picks up requests and resolutions written by other processes.
    pub fn with_store(store: RunStore) -> Result<Self, GateError> {
        let state = BoardState::load(&store)?;
        Ok(Self {
            state: Mutex::new(state),
            changed: Condvar::new(),
            store: Some(store),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, BoardState>, GateError> {
        self.state
            .lock()
            .map_err(|_| GateError::Store("approval board lock poisoned".into()))
    }

    fn lock_synced(&self) -> Result<MutexGuard<'_, BoardState>, GateError> {
        let mut state = self.lock()?;
        self.sync_locked(&mut state)?;
        Ok(state)
    }

    /// Persisted records only move forward, so the store's view replaces
    /// ours wholesale.
    fn sync_locked(&self, state: &mut BoardState) -> Result<(), GateError> {
        if let Some(ref store) = self.store {
            *state = BoardState::load(store)?;
        }
        Ok(())
    }

    /// Open a request for a phase.
    ///
    /// A request already resolved for the same change is returned as is, so
    /// an approval given while nobody was waiting still counts. Otherwise the
    /// phase's pending request is reused. The flag is `true` when a new
    /// request was created.
    pub fn open(&self, new: NewRequest) -> Result<(GovernanceRequest, bool), GateError> {
        let mut state = self.lock_synced()?;
        let now = Utc::now();
        self.expire_overdue_locked(&mut state, now)?;
        let _guard = match self.store {
            Some(ref store) => Some(store.lock_governance(&new.run)?),
            None => None,
        };
        self.sync_locked(&mut state)?;

        let same_phase = |r: &&GovernanceRequest| r.run == new.run && r.phase == new.phase;
        if !new.change_digest.is_empty()
            && let Some(prior) = state
                .requests
                .values()
                .filter(same_phase)
                .filter(|r| r.status.is_resolved() && r.change_digest == new.change_digest)
                .max_by_key(|r| r.resolved_at)
        {
            tracing::info!(
                request_id = %prior.id,
                phase = %new.phase,
                status = %prior.status,
                "change already has a resolved governance request"
            );
            return Ok((prior.clone(), false));
        }
        if let Some(existing) = state
            .requests
            .values()
            .filter(same_phase)
            .find(|r| r.is_pending())
        {
            tracing::info!(request_id = %existing.id, phase = %new.phase, "reusing pending governance request");
            return Ok((existing.clone(), false));
        }

        let timeout = chrono::Duration::from_std(new.timeout)
            .unwrap_or_else(|_| chrono::Duration::hours(1))
            .max(chrono::Duration::milliseconds(1));
        let request = GovernanceRequest {
            id: new_request_id(),
            run: new.run,
            phase: new.phase,
            tier: new.tier,
            touched_paths: new.touched_paths,
            justification: new.justification,
            risk_level: new.risk_level,
            risk_score: new.risk_score,
            change_digest: new.change_digest,
            status: RequestStatus::Pending,
            created_at: now,
            expires_at: now + timeout,
            resolved_by: None,
            resolved_at: None,
            resolution_note: None,
        };
        if let Some(ref store) = self.store {
            store.save_request(&request)?;
        }
        tracing::info!(
            request_id = %request.id,
            run = %request.run,
            phase = %request.phase,
            tier = %request.tier,
            expires_at = %request.expires_at,
            "governance request opened"
        );
        state.requests.insert(request.id.clone(), request.clone());
        Ok((request, true))
    }

    pub fn get(&self, id: &str) -> Result<GovernanceRequest, ResolveError> {
        let mut state = self.lock_synced()?;
        self.expire_overdue_locked(&mut state, Utc::now())?;
        state
            .requests
            .get(id)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(id.to_string()))
    }

    /// All requests, oldest first.
    pub fn list(&self) -> Result<Vec<GovernanceRequest>, GateError> {
        let mut state = self.lock_synced()?;
        self.expire_overdue_locked(&mut state, Utc::now())?;
        let mut all: Vec<_> = state.requests.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    /// Resolve a pending request. The first resolution wins, across
    /// processes sharing the store too.
    pub fn resolve(
        &self,
        id: &str,
        decision: Decision,
        actor: &str,
        note: Option<String>,
    ) -> Result<GovernanceRequest, ResolveError> {
        let mut state = self.lock_synced()?;
        // An overdue request has already failed closed.
        self.expire_overdue_locked(&mut state, Utc::now())?;
        let current = state
            .requests
            .get(id)
            .ok_or_else(|| ResolveError::NotFound(id.to_string()))?;
        if current.status.is_resolved() {
            return Err(ResolveError::AlreadyResolved {
                id: id.to_string(),
                status: current.status,
            });
        }
        match self.transition_locked(&mut state, id, decision.status(), actor, note)? {
            Transition::Applied(resolved) => {
                drop(state);
                self.changed.notify_all();
                Ok(resolved)
            }
            Transition::Superseded(winner) => Err(ResolveError::AlreadyResolved {
                id: id.to_string(),
                status: winner.status,
            }),
        }
    }

    /// Block until the request is resolved or expires.
    ///
    /// Wakes at least every `poll_interval` to check the deadline and, for a
    /// persisted board, to pick up resolutions made by other processes.
    /// Expiry is recorded as `Expired`, which callers treat as a rejection.
    pub fn wait(
        &self,
        id: &str,
        poll_interval: Duration,
    ) -> Result<GovernanceRequest, ResolveError> {
        let poll_interval = poll_interval.max(Duration::from_millis(10));
        let mut state = self.lock()?;
        loop {
            self.sync_locked(&mut state)?;
            let request = state
                .requests
                .get(id)
                .ok_or_else(|| ResolveError::NotFound(id.to_string()))?;
            if request.status.is_resolved() {
                return Ok(request.clone());
            }
            let expires_at = request.expires_at;
            let now = Utc::now();
            if now >= expires_at {
                let done = self
                    .transition_locked(
                        &mut state,
                        id,
                        RequestStatus::Expired,
                        TIMEOUT_ACTOR,
                        Some("no decision before the approval timeout".into()),
                    )?
                    .into_request();
                drop(state);
                self.changed.notify_all();
                return Ok(done);
            }
            let remaining = (expires_at - now).to_std().unwrap_or(Duration::ZERO);
            let (guard, _) = self
                .changed
                .wait_timeout(state, remaining.min(poll_interval))
                .map_err(|_| GateError::Store("approval board lock poisoned".into()))?;
            state = guard;
        }
    }

    /// Audit entries for one request, in resolution order.
    pub fn audit(&self, id: &str) -> Result<Vec<AuditEntry>, ResolveError> {
        let state = self.lock_synced()?;
        if !state.requests.contains_key(id) {
            return Err(ResolveError::NotFound(id.to_string()));
        }
        Ok(state
            .audit
            .iter()
            .filter(|e| e.request_id == id)
            .cloned()
            .collect())
    }

    /// Mark every overdue pending request expired. Returns how many changed.
    pub fn expire_overdue(&self) -> Result<usize, GateError> {
        let mut state = self.lock_synced()?;
        let n = self.expire_overdue_locked(&mut state, Utc::now())?;
        drop(state);
        if n > 0 {
            self.changed.notify_all();
        }
        Ok(n)
    }

    fn expire_overdue_locked(
        &self,
        state: &mut BoardState,
        now: DateTime<Utc>,
    ) -> Result<usize, GateError> {
        let overdue: Vec<String> = state
            .requests
            .values()
            .filter(|r| r.is_overdue(now))
            .map(|r| r.id.clone())
            .collect();
        let mut expired = 0;
        for id in &overdue {
            let transition = self
                .transition_locked(
                    state,
                    id,
                    RequestStatus::Expired,
                    TIMEOUT_ACTOR,
                    Some("no decision before the approval timeout".into()),
                )
                .map_err(|e| match e {
                    ResolveError::Store(g) => g,
                    other => GateError::Store(other.to_string()),
                })?;
            if matches!(transition, Transition::Applied(_)) {
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Move a pending request to a resolved status, persist it, and append
    /// the audit entry. The in-memory record only changes once persisted.
    ///
    /// With a store, the check and the write happen under the run's
    /// governance lock, and a record already resolved on disk is adopted
    /// instead of overwritten.
    fn transition_locked(
        &self,
        state: &mut BoardState,
        id: &str,
        status: RequestStatus,
        actor: &str,
        note: Option<String>,
    ) -> Result<Transition, ResolveError> {
        let mut updated = state
            .requests
            .get(id)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(id.to_string()))?;
        let _guard = match self.store {
            Some(ref store) => {
                let guard = store.lock_governance(&updated.run)?;
                if let Some(on_disk) = store.load_request(&updated.run, id)?
                    && on_disk.status.is_resolved()
                {
                    tracing::debug!(request_id = id, status = %on_disk.status, "request resolved elsewhere");
                    self.sync_locked(state)?;
                    return Ok(Transition::Superseded(on_disk));
                }
                Some(guard)
            }
            None => None,
        };
        if updated.status.is_resolved() {
            return Ok(Transition::Superseded(updated));
        }

        let now = Utc::now();
        updated.status = status;
        updated.resolved_by = Some(actor.to_string());
        updated.resolved_at = Some(now);
        updated.resolution_note.clone_from(&note);

        let entry = AuditEntry {
            request_id: id.to_string(),
            run: updated.run.clone(),
            phase: updated.phase.clone(),
            status,
            actor: actor.to_string(),
            note,
            at: now,
        };
        if let Some(ref store) = self.store {
            store.save_request(&updated)?;
            store.append_audit(&updated.run, &entry)?;
        }
        tracing::info!(
            request_id = id,
            run = %updated.run,
            phase = %updated.phase,
            status = %status,
            actor,
            "governance request resolved"
        );
        state.audit.push(entry);
        state.requests.insert(id.to_string(), updated.clone());
        Ok(Transition::Applied(updated))
    }
}

fn new_request_id() -> String {
    format!("gov-{:016x}", rand::random::<u64>())
}
