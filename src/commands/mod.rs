pub mod approvals;
pub mod assess;
pub mod baseline;
pub mod init;
pub mod run;
pub mod schema;
pub mod score;
pub mod serve;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use termimad::MadSkin;

use crate::config::{self, Config};
use crate::governance::{ApprovalBoard, GovernanceEngine, LogNotifier, Notifier, WebhookNotifier};
use crate::orchestrator::{ChangeSource, GitChanges};
use crate::risk::ChangeStats;
use crate::store::RunStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

impl OutputFormat {
    /// Explicit choice, else pretty on a terminal and text otherwise.
    pub fn resolve(explicit: Option<Self>) -> Self {
        explicit.unwrap_or_else(|| {
            if std::io::stdout().is_terminal() {
                OutputFormat::Pretty
            } else {
                OutputFormat::Text
            }
        })
    }
}

/// Print markdown through termimad.
pub fn print_markdown(markdown: &str) {
    MadSkin::default().print_text(markdown);
}

/// A loaded project: root directory, config, and state store.
pub struct Project {
    pub root: PathBuf,
    pub config: Config,
    pub store: RunStore,
}

impl Project {
    pub fn load(project_root: Option<&Path>) -> anyhow::Result<Self> {
        let root = match project_root {
            Some(p) => p.to_path_buf(),
            None => std::env::current_dir().context("determining project root")?,
        };
        let config = config::load_project_config(&root)?;
        let state_dir = config.state_dir();
        let store = if state_dir.is_relative() {
            RunStore::new(root.join(state_dir))
        } else {
            RunStore::new(state_dir)
        };
        Ok(Self {
            root,
            config,
            store,
        })
    }

    /// The working tree the agent edits and CI runs in.
    pub fn workspace(&self) -> PathBuf {
        match self.config.project.workspace {
            Some(ref ws) if ws.is_absolute() => ws.clone(),
            Some(ref ws) => self.root.join(ws),
            None => self.root.clone(),
        }
    }

    /// Governance engine over the persisted approval board.
    pub fn governance_engine(&self) -> anyhow::Result<Arc<GovernanceEngine>> {
        let board = Arc::new(
            ApprovalBoard::with_store(self.store.clone()).context("loading approval requests")?,
        );
        let gov = &self.config.governance;
        let notifier: Arc<dyn Notifier> = match gov.notify_webhook_url {
            Some(ref url) => Arc::new(WebhookNotifier::new(
                url,
                &self.config.project.name,
                gov.public_url.clone(),
            )),
            None => Arc::new(LogNotifier),
        };
        Ok(Arc::new(GovernanceEngine::new(
            gov.clone(),
            &self.config.risk.protected_paths,
            board,
            notifier,
        )?))
    }
}

/// Change statistics given on the command line or read from git.
#[derive(Debug, Clone, Args)]
pub struct ChangeArgs {
    /// Read the change from `git diff HEAD` in the workspace
    #[arg(long, conflicts_with_all = ["files", "added", "removed"])]
    pub git: bool,
    /// Changed file (repeatable)
    #[arg(long = "file", value_name = "PATH")]
    pub files: Vec<String>,
    /// Lines added
    #[arg(long, default_value_t = 0)]
    pub added: u32,
    /// Lines removed
    #[arg(long, default_value_t = 0)]
    pub removed: u32,
    /// Unified diff used for per-file deletion counts
    #[arg(long, value_name = "FILE")]
    pub patch: Option<PathBuf>,
}

impl ChangeArgs {
    pub fn stats(&self, workspace: &Path) -> anyhow::Result<ChangeStats> {
        if self.git {
            return GitChanges::new(workspace).collect();
        }
        let patch_content = match self.patch {
            Some(ref p) => Some(
                std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?,
            ),
            None => None,
        };
        Ok(ChangeStats {
            files_changed: self.files.clone(),
            lines_added: self.added,
            lines_removed: self.removed,
            patch_content,
        })
    }
}
