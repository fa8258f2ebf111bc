use std::path::PathBuf;

use clap::Args;

use super::Project;
use crate::server;

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to bind (defaults to `server.bind`)
    #[arg(long)]
    pub bind: Option<String>,
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
}

impl ServeArgs {
    /// Serve the persisted approval requests until Ctrl-C. Overdue requests
    /// are expired before serving.
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = Project::load(self.project_root.as_deref())?;
        let engine = project.governance_engine()?;
        let expired = engine.board().expire_overdue()?;
        if expired > 0 {
            tracing::info!(expired, "expired overdue approval requests");
        }
        let bind = self
            .bind
            .clone()
            .unwrap_or_else(|| project.config.server.bind.clone());
        server::serve(&bind, engine)
    }
}
