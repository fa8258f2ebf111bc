//! Persisted run state.
//!
//! Layout under the state dir:
//!
//! ```text
//! runs/<run>/baselines/<commit>.json
//! runs/<run>/decisions/<phase>-<attempt>-<decided-at-micros>.json
//! runs/<run>/governance/<request-id>.json
//! runs/<run>/governance/.lock
//! runs/<run>/audit.jsonl
//! ```
//!
//! Every JSON record is written to a temp file and renamed into place so
//! readers never observe a torn write. Governance writes from separate
//! processes serialize on the run's `governance/.lock`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::baseline::Baseline;
use crate::error::GateError;
use crate::finalizer::FinalizationDecision;
use crate::governance::{AuditEntry, GovernanceRequest};
use crate::phase::RunId;

/// Exclusive hold on one run's governance records. Released on drop.
#[derive(Debug)]
pub struct GovernanceLock {
    file: File,
}

impl Drop for GovernanceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, "failed to release governance lock");
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run: &RunId) -> PathBuf {
        self.root.join("runs").join(run.as_str())
    }

    pub fn save_baseline(&self, baseline: &Baseline) -> Result<(), GateError> {
        let path = self
            .run_dir(&baseline.run)
            .join("baselines")
            .join(format!("{}.json", file_key(&baseline.commit)));
        write_json_atomic(&path, baseline)
    }

    pub fn load_baseline(&self, run: &RunId, commit: &str) -> Result<Option<Baseline>, GateError> {
        let path = self
            .run_dir(run)
            .join("baselines")
            .join(format!("{}.json", file_key(commit)));
        read_json_opt(&path)
    }

    /// One file per finalization. Attempt numbers restart in every process,
    /// so the decision time keeps keys unique.
    pub fn save_decision(&self, decision: &FinalizationDecision) -> Result<(), GateError> {
        let dir = self.run_dir(&decision.run).join("decisions");
        let stem = format!(
            "{}-{}-{}",
            decision.phase,
            decision.attempt,
            decision.decided_at().timestamp_micros()
        );
        let mut path = dir.join(format!("{stem}.json"));
        let mut n = 1;
        while path.exists() {
            n += 1;
            path = dir.join(format!("{stem}-{n}.json"));
        }
        write_json_atomic(&path, decision)
    }

    /// All decisions recorded for a run, ordered by phase then decision time.
    pub fn list_decisions(&self, run: &RunId) -> Result<Vec<FinalizationDecision>, GateError> {
        let mut decisions: Vec<FinalizationDecision> =
            read_dir_json(&self.run_dir(run).join("decisions"))?;
        decisions.sort_by(|a, b| {
            (&a.phase, a.decided_at(), a.attempt).cmp(&(&b.phase, b.decided_at(), b.attempt))
        });
        Ok(decisions)
    }

    pub fn save_request(&self, request: &GovernanceRequest) -> Result<(), GateError> {
        let path = self
            .run_dir(&request.run)
            .join("governance")
            .join(format!("{}.json", file_key(&request.id)));
        write_json_atomic(&path, request)
    }

    pub fn load_request(
        &self,
        run: &RunId,
        id: &str,
    ) -> Result<Option<GovernanceRequest>, GateError> {
        read_json_opt(
            &self
                .run_dir(run)
                .join("governance")
                .join(format!("{}.json", file_key(id))),
        )
    }

    /// Block until this process holds the run's governance lock.
    pub fn lock_governance(&self, run: &RunId) -> Result<GovernanceLock, GateError> {
        let dir = self.run_dir(run).join("governance");
        fs::create_dir_all(&dir).map_err(|e| store_err(&dir, &e))?;
        let path = dir.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| store_err(&path, &e))?;
        FileExt::lock_exclusive(&file).map_err(|e| store_err(&path, &e))?;
        Ok(GovernanceLock { file })
    }

    /// Every governance request across all runs in this state dir.
    pub fn load_requests(&self) -> Result<Vec<GovernanceRequest>, GateError> {
        let runs_dir = self.root.join("runs");
        let entries = match fs::read_dir(&runs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(store_err(&runs_dir, &e)),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| store_err(&runs_dir, &e))?;
            out.extend(read_dir_json::<GovernanceRequest>(
                &entry.path().join("governance"),
            )?);
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    pub fn append_audit(&self, run: &RunId, entry: &AuditEntry) -> Result<(), GateError> {
        let dir = self.run_dir(run);
        fs::create_dir_all(&dir).map_err(|e| store_err(&dir, &e))?;
        let path = dir.join("audit.jsonl");
        let mut line = serde_json::to_string(entry)
            .map_err(|e| GateError::Store(format!("serializing audit entry: {e}")))?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| store_err(&path, &e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| store_err(&path, &e))
    }

    pub fn read_audit(&self, run: &RunId) -> Result<Vec<AuditEntry>, GateError> {
        let path = self.run_dir(run).join("audit.jsonl");
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(store_err(&path, &e)),
        };
        // A line without its newline is still being appended.
        contents
            .split_inclusive('\n')
            .filter(|l| l.ends_with('\n') && !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l)
                    .map_err(|e| GateError::Store(format!("{}: {e}", path.display())))
            })
            .collect()
    }
}

/// Commit ids come from git, but keep them safe as file names anyway.
fn file_key(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn store_err(path: &Path, e: &std::io::Error) -> GateError {
    GateError::Store(format!("{}: {e}", path.display()))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), GateError> {
    let dir = path
        .parent()
        .ok_or_else(|| GateError::Store(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(dir).map_err(|e| store_err(dir, &e))?;
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| GateError::Store(format!("serializing {}: {e}", path.display())))?;
    let tmp = path.with_extension(format!("json.tmp.{}", std::process::id()));
    fs::write(&tmp, json).map_err(|e| store_err(&tmp, &e))?;
    fs::rename(&tmp, path).map_err(|e| store_err(path, &e))
}

fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, GateError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| GateError::Store(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(store_err(path, &e)),
    }
}

fn read_dir_json<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, GateError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(store_err(dir, &e)),
    };
    let mut out = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| store_err(dir, &e))?.path();
        if path.extension().is_some_and(|ext| ext == "json")
            && let Some(value) = read_json_opt(&path)?
        {
            out.push(value);
        }
    }
    Ok(out)
}
