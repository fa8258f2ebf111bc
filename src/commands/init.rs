use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use crate::config::{CONFIG_JSON, CONFIG_TOML, Config};
use crate::error::ExitError;

/// Infer the project name from the root directory name.
fn infer_project_name(root: &Path) -> Option<String> {
    let name = root.file_name()?.to_str()?;
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('-').to_string();
    if trimmed.is_empty() || validate_name(&trimmed, "project name").is_err() {
        return None;
    }
    Some(trimmed)
}

/// Names end up in state paths and webhook payloads: [a-z0-9-], at most 64.
fn validate_name(name: &str, label: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        anyhow::bail!("{label} must be 1-64 characters, got {}", name.len());
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        anyhow::bail!("{label} must match [a-z0-9-], got {name:?}");
    }
    if name.starts_with('-') || name.ends_with('-') {
        anyhow::bail!("{label} must not start or end with '-', got {name:?}");
    }
    Ok(())
}

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Project name
    #[arg(long)]
    pub name: Option<String>,
    /// Command that runs the test suite
    #[arg(long)]
    pub test_command: Option<String>,
    /// Command that runs the coding agent for one attempt
    #[arg(long)]
    pub agent_command: Option<String>,
    /// Overwrite an existing config
    #[arg(long)]
    pub force: bool,
    /// Never prompt
    #[arg(long)]
    pub no_interactive: bool,
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
}

impl InitArgs {
    pub fn execute(&self) -> Result<()> {
        let root = match self.project_root {
            Some(ref p) => p.clone(),
            None => std::env::current_dir().context("could not determine current directory")?,
        };
        let target = root.join(CONFIG_TOML);
        if !self.force && (target.exists() || root.join(CONFIG_JSON).exists()) {
            return Err(ExitError::Config(format!(
                "{} already has a phasegate config (use --force to overwrite)",
                root.display()
            ))
            .into());
        }

        let interactive = !self.no_interactive && std::io::stdin().is_terminal();
        let inferred = infer_project_name(&root);

        let name = match (&self.name, interactive) {
            (Some(n), _) => n.clone(),
            (None, true) => prompt_input("Project name", inferred.as_deref())?,
            (None, false) => inferred.ok_or_else(|| {
                ExitError::Config("cannot infer a project name; pass --name".into())
            })?,
        };
        validate_name(&name, "project name")?;

        let mut config = Config::new(&name);
        if let Some(ref cmd) = self.test_command {
            config.project.test_command = Some(cmd.clone());
        } else if interactive {
            let default = config.project.test_command.clone();
            config.project.test_command =
                Some(prompt_input("Test command", default.as_deref())?);
        }
        if let Some(ref cmd) = self.agent_command {
            config.project.agent_command = Some(cmd.clone());
        } else if interactive {
            let cmd = prompt_input("Agent command (empty to set later)", Some(""))?;
            if !cmd.trim().is_empty() {
                config.project.agent_command = Some(cmd);
            }
        }
        if interactive {
            config.server.enabled =
                prompt_confirm("Serve the approval API during runs?", false)?;
        }

        fs::write(&target, config.to_toml()?)
            .with_context(|| format!("writing {}", target.display()))?;
        tracing::info!(path = %target.display(), project = %name, "wrote config");
        println!("Created {}", target.display());
        Ok(())
    }
}

fn prompt_input(prompt: &str, default: Option<&str>) -> Result<String> {
    let mut builder = dialoguer::Input::<String>::new()
        .with_prompt(prompt)
        .allow_empty(true);
    if let Some(d) = default {
        builder = builder.default(d.to_string());
    }
    builder.interact_text().context("reading user input")
}

fn prompt_confirm(prompt: &str, default: bool) -> Result<bool> {
    dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(default)
        .interact()
        .context("reading user confirmation")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_sanitized_name() {
        assert_eq!(
            infer_project_name(Path::new("/work/My_Service")).as_deref(),
            Some("my-service")
        );
        assert_eq!(infer_project_name(Path::new("/work/___")), None);
    }

    #[test]
    fn rejects_bad_names() {
        assert!(validate_name("ok-name", "n").is_ok());
        assert!(validate_name("-lead", "n").is_err());
        assert!(validate_name("Upper", "n").is_err());
        assert!(validate_name("../x", "n").is_err());
    }

    #[test]
    fn writes_config_and_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let args = InitArgs {
            name: Some("demo".into()),
            test_command: Some("cargo test --quiet".into()),
            agent_command: Some("agent-run".into()),
            force: false,
            no_interactive: true,
            project_root: Some(dir.path().to_path_buf()),
        };
        args.execute().unwrap();

        let config = Config::load(&dir.path().join(CONFIG_TOML)).unwrap();
        assert_eq!(config.project.name, "demo");
        assert_eq!(config.project.test_command.as_deref(), Some("cargo test --quiet"));
        assert_eq!(config.project.agent_command.as_deref(), Some("agent-run"));

        let err = args.execute().unwrap_err();
        assert!(matches!(err.downcast_ref::<ExitError>(), Some(ExitError::Config(_))));
    }
}
