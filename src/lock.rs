//! Per-run execution lock.
//!
//! An advisory `flock` on `runs/<run>/run.lock`, held for as long as the
//! `ExecutionLock` lives. The kernel drops it when the process exits, so a
//! crashed run never leaves a lock behind. The pid written into the file is
//! informational only.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;
use crate::phase::RunId;

const LOCK_FILE: &str = "run.lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Exclusive lock on a run. Released when dropped.
#[derive(Debug)]
pub struct ExecutionLock {
    path: PathBuf,
    run: RunId,
    file: File,
}

impl ExecutionLock {
    /// Take the lock for `run` under `run_dir`. Fails fast with
    /// [`ExitError::LockHeld`] when another holder has it.
    pub fn acquire(run_dir: &Path, run: &RunId) -> anyhow::Result<Self> {
        std::fs::create_dir_all(run_dir)
            .with_context(|| format!("creating {}", run_dir.display()))?;
        let path = run_dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                return Err(ExitError::LockHeld {
                    run: run.to_string(),
                    pid: read_holder(&mut file).map_or(0, |i| i.pid),
                }
                .into());
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("locking {}", path.display())));
            }
        }

        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        write_holder(&mut file, &info).with_context(|| format!("writing {}", path.display()))?;
        tracing::debug!(run = %run, path = %path.display(), "execution lock acquired");
        Ok(Self {
            path,
            run: run.clone(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ExecutionLock {
    // The file stays: unlinking it would let a late opener lock a dead inode.
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release execution lock");
        } else {
            tracing::debug!(run = %self.run, "execution lock released");
        }
    }
}

fn write_holder(file: &mut File, info: &LockInfo) -> anyhow::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(serde_json::to_string(info)?.as_bytes())?;
    file.flush()?;
    Ok(())
}

fn read_holder(file: &mut File) -> Option<LockInfo> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut text).ok()?;
    serde_json::from_str(&text).ok()
}
