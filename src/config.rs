use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use rand::seq::SliceRandom;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;
use crate::phase::CapabilityTier;
use crate::risk::WorkContext;

/// Config file name constants.
pub const CONFIG_TOML: &str = ".phasegate.toml";
pub const CONFIG_JSON: &str = ".phasegate.json";

/// Find the config file path, preferring .phasegate.toml over .phasegate.json.
/// Returns None if neither exists.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    let toml_path = dir.join(CONFIG_TOML);
    if toml_path.exists() {
        return Some(toml_path);
    }
    let json_path = dir.join(CONFIG_JSON);
    if json_path.exists() {
        return Some(json_path);
    }
    None
}

/// Load the project config from `root`, applying environment overrides.
pub fn load_project_config(root: &Path) -> anyhow::Result<Config> {
    let path = find_config(root).ok_or_else(|| {
        ExitError::Config(format!(
            "no {CONFIG_TOML} or {CONFIG_JSON} found in {}",
            root.display()
        ))
    })?;
    let mut config = Config::load(&path)?;
    config.apply_env_overrides()?;
    Ok(config)
}

/// Top-level .phasegate.toml config.
///
/// The loaded value is immutable for the lifetime of a run: scorers, the
/// governance engine and the escalation policy each take the section they
/// need by value at construction time.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Where baselines, decisions and governance records are persisted.
    #[serde(default, alias = "stateDir", skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    pub project: ProjectConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub governance: GovernanceConfig,
    #[serde(default)]
    pub baseline: BaselineConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub models: ModelsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProjectConfig {
    pub name: String,
    /// Command that runs the project's test suite (e.g. "cargo test").
    #[serde(default, alias = "testCommand")]
    pub test_command: Option<String>,
    /// Command that runs the code-generation agent. Receives the prompt on stdin.
    #[serde(default, alias = "agentCommand")]
    pub agent_command: Option<String>,
    /// Working tree the agent edits and CI runs in (defaults to the project root).
    #[serde(default)]
    pub workspace: Option<PathBuf>,
}

/// Net-deletion thresholds for one work context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeletionThresholds {
    pub notify: u32,
    pub block: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RiskConfig {
    /// Paths that raise risk and require approval, but are not always-block.
    #[serde(default = "default_protected_paths", alias = "protectedPaths")]
    pub protected_paths: Vec<String>,
    #[serde(default = "default_troubleshooting_thresholds")]
    pub troubleshooting: DeletionThresholds,
    #[serde(default = "default_feature_thresholds")]
    pub feature: DeletionThresholds,
    #[serde(default = "default_refactor_thresholds")]
    pub refactor: DeletionThresholds,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            protected_paths: default_protected_paths(),
            troubleshooting: default_troubleshooting_thresholds(),
            feature: default_feature_thresholds(),
            refactor: default_refactor_thresholds(),
        }
    }
}

impl RiskConfig {
    pub fn thresholds(&self, context: WorkContext) -> DeletionThresholds {
        match context {
            WorkContext::Troubleshooting => self.troubleshooting,
            WorkContext::Feature => self.feature,
            WorkContext::Refactor => self.refactor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GovernanceConfig {
    #[serde(default = "default_approval_timeout", alias = "approvalTimeoutSecs")]
    pub approval_timeout_secs: u64,
    #[serde(default = "default_poll_interval", alias = "pollIntervalSecs")]
    pub poll_interval_secs: u64,
    /// Paths that always yield the always-block tier regardless of change size.
    #[serde(default = "default_never_auto_approve", alias = "neverAutoApprove")]
    pub never_auto_approve: Vec<String>,
    /// Paths an auto-approved or notify-and-proceed change may touch.
    #[serde(default = "default_allowed_paths", alias = "allowedPaths")]
    pub allowed_paths: Vec<String>,
    #[serde(default, alias = "notifyWebhookUrl")]
    pub notify_webhook_url: Option<String>,
    /// Externally reachable base URL of the approval server, used in action links.
    #[serde(default, alias = "publicUrl")]
    pub public_url: Option<String>,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: default_approval_timeout(),
            poll_interval_secs: default_poll_interval(),
            never_auto_approve: default_never_auto_approve(),
            allowed_paths: default_allowed_paths(),
            notify_webhook_url: None,
            public_url: None,
        }
    }
}

impl GovernanceConfig {
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BaselineConfig {
    #[serde(default = "default_capture_timeout", alias = "captureTimeoutSecs")]
    pub capture_timeout_secs: u64,
    /// New failures above this count are high severity.
    #[serde(default = "default_high_failure_threshold", alias = "highFailureThreshold")]
    pub high_failure_threshold: usize,
    #[serde(default = "default_ci_timeout", alias = "ciTimeoutSecs")]
    pub ci_timeout_secs: u64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            capture_timeout_secs: default_capture_timeout(),
            high_failure_threshold: default_high_failure_threshold(),
            ci_timeout_secs: default_ci_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EscalationConfig {
    #[serde(default = "default_max_attempts", alias = "maxAttempts")]
    pub max_attempts: u32,
    /// Optional command consulted for non-authoritative fix/skip hints.
    #[serde(default, alias = "diagnosisCommand")]
    pub diagnosis_command: Option<String>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            diagnosis_command: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ServerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_bind(),
        }
    }
}

/// Model pools per capability tier.
///
/// Each tier maps to a list of `provider/model:thinking` strings. Retries at a
/// tier try the pool in shuffled order, falling back on rate limits.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ModelsConfig {
    #[serde(default = "default_tier_fast")]
    pub fast: Vec<String>,
    #[serde(default = "default_tier_balanced")]
    pub balanced: Vec<String>,
    #[serde(default = "default_tier_strong")]
    pub strong: Vec<String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            fast: default_tier_fast(),
            balanced: default_tier_balanced(),
            strong: default_tier_strong(),
        }
    }
}

fn default_tier_fast() -> Vec<String> {
    vec![
        "anthropic/claude-haiku-4-5:low".into(),
        "google-gemini-cli/gemini-3-flash-preview:low".into(),
    ]
}

fn default_tier_balanced() -> Vec<String> {
    vec![
        "anthropic/claude-sonnet-4-6:medium".into(),
        "openai-codex/gpt-5.3-codex:medium".into(),
    ]
}

fn default_tier_strong() -> Vec<String> {
    vec![
        "anthropic/claude-opus-4-6:high".into(),
        "openai-codex/gpt-5.3-codex:xhigh".into(),
    ]
}

// Default value functions for serde
fn default_troubleshooting_thresholds() -> DeletionThresholds { DeletionThresholds { notify: 100, block: 200 } }
fn default_feature_thresholds() -> DeletionThresholds { DeletionThresholds { notify: 150, block: 300 } }
fn default_refactor_thresholds() -> DeletionThresholds { DeletionThresholds { notify: 200, block: 400 } }
fn default_approval_timeout() -> u64 { 3600 }
fn default_poll_interval() -> u64 { 5 }
fn default_capture_timeout() -> u64 { 180 }
fn default_high_failure_threshold() -> usize { 3 }
fn default_ci_timeout() -> u64 { 600 }
fn default_max_attempts() -> u32 { 5 }
fn default_bind() -> String { "127.0.0.1:8787".into() }

fn default_protected_paths() -> Vec<String> {
    vec![
        "Cargo.toml".into(),
        "Cargo.lock".into(),
        "package.json".into(),
        "build.rs".into(),
        "**/config/**".into(),
    ]
}

fn default_never_auto_approve() -> Vec<String> {
    vec![
        ".git/".into(),
        ".github/workflows/**".into(),
        "**/migrations/**".into(),
        "**/*.sql".into(),
        "**/schema.*".into(),
        "**/.env*".into(),
        "**/*.pem".into(),
        "**/*.key".into(),
        "**/credentials*".into(),
        "**/secrets*".into(),
        CONFIG_TOML.into(),
        CONFIG_JSON.into(),
    ]
}

fn default_allowed_paths() -> Vec<String> {
    vec![
        "src/**".into(),
        "tests/**".into(),
        "docs/**".into(),
        "benches/**".into(),
        "*.md".into(),
    ]
}

impl Config {
    /// A fresh config for `phasegate init`.
    pub fn new(project_name: &str) -> Self {
        Self {
            state_dir: None,
            project: ProjectConfig {
                name: project_name.to_string(),
                test_command: Some("cargo test".into()),
                agent_command: None,
                workspace: None,
            },
            risk: RiskConfig::default(),
            governance: GovernanceConfig::default(),
            baseline: BaselineConfig::default(),
            escalation: EscalationConfig::default(),
            server: ServerConfig::default(),
            models: ModelsConfig::default(),
        }
    }

    /// Load config from a file (TOML or JSON, auto-detected by extension).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "toml" => Self::parse_toml(&contents),
            "json" => Self::parse_json(&contents),
            _ => Self::parse_toml(&contents).or_else(|_| Self::parse_json(&contents)),
        }
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_TOML}: {e}")).into())
    }

    /// Parse config from a JSON string.
    pub fn parse_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_JSON}: {e}")).into())
    }

    /// Apply `PHASEGATE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(v) = lookup("PHASEGATE_APPROVAL_TIMEOUT") {
            self.governance.approval_timeout_secs = parse_env("PHASEGATE_APPROVAL_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("PHASEGATE_MAX_ATTEMPTS") {
            self.escalation.max_attempts = parse_env("PHASEGATE_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("PHASEGATE_BASELINE_TIMEOUT") {
            self.baseline.capture_timeout_secs = parse_env("PHASEGATE_BASELINE_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("PHASEGATE_STATE_DIR") {
            self.state_dir = Some(PathBuf::from(v));
        }
        if self.escalation.max_attempts == 0 {
            return Err(ExitError::Config("escalation.max_attempts must be at least 1".into()).into());
        }
        Ok(())
    }

    /// Serialize config to a TOML string with helpful comments.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        let raw = toml::to_string_pretty(self).context("serializing config to TOML")?;

        let mut doc: toml_edit::DocumentMut = raw
            .parse()
            .context("parsing generated TOML for comment injection")?;

        doc.decor_mut()
            .set_prefix("# phasegate project configuration\n\n");

        fn set_table_comment(doc: &mut toml_edit::DocumentMut, key: &str, comment: &str) {
            if let Some(tbl) = doc.get_mut(key).and_then(|item| item.as_table_mut()) {
                tbl.decor_mut().set_prefix(comment);
            }
        }

        set_table_comment(&mut doc, "risk", "\n# Net-deletion notify/block thresholds per work context\n");
        set_table_comment(&mut doc, "governance", "\n# Approval tiers, protected paths and the human-approval timeout\n");
        set_table_comment(&mut doc, "baseline", "\n# Regression baseline capture and severity\n");
        set_table_comment(&mut doc, "escalation", "\n# Retry and capability-tier escalation\n");
        set_table_comment(&mut doc, "server", "\n# HTTP approval surface\n");
        set_table_comment(&mut doc, "models", "\n# Model pools per capability tier (low=fast, medium=balanced, high=strong)\n");

        Ok(doc.to_string())
    }

    /// Directory for persisted run state.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.state_dir {
            return dir.clone();
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("phasegate")
            .join(&self.project.name)
    }

    /// The model pool for a capability tier, shuffled for load balancing.
    pub fn resolve_model_pool(&self, tier: CapabilityTier) -> Vec<String> {
        let pool = match tier {
            CapabilityTier::Low => &self.models.fast,
            CapabilityTier::Medium => &self.models.balanced,
            CapabilityTier::High => &self.models.strong,
        };
        let mut pool = pool.clone();
        pool.shuffle(&mut rand::rng());
        pool
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ExitError::Config(format!("{key}={value:?} is not a valid number")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parse_full_toml_config() {
        let toml_str = r#"
state_dir = "/tmp/pg"

[project]
name = "myapp"
test_command = "cargo test --workspace"
agent_command = "pi run"

[risk]
troubleshooting = { notify = 80, block = 160 }
protected_paths = ["Cargo.toml"]

[governance]
approval_timeout_secs = 600
never_auto_approve = ["**/migrations/**"]
allowed_paths = ["src/**"]
notify_webhook_url = "https://hooks.example.com/approve"

[baseline]
capture_timeout_secs = 90
high_failure_threshold = 5

[escalation]
max_attempts = 3

[server]
enabled = true
bind = "0.0.0.0:9000"
"#;

        let config = Config::parse_toml(toml_str).unwrap();
        assert_eq!(config.project.name, "myapp");
        assert_eq!(config.project.test_command.as_deref(), Some("cargo test --workspace"));
        assert_eq!(
            config.risk.thresholds(WorkContext::Troubleshooting),
            DeletionThresholds { notify: 80, block: 160 }
        );
        // unspecified contexts keep defaults
        assert_eq!(config.risk.feature, DeletionThresholds { notify: 150, block: 300 });
        assert_eq!(config.governance.approval_timeout(), Duration::from_secs(600));
        assert_eq!(config.governance.never_auto_approve, vec!["**/migrations/**"]);
        assert_eq!(config.baseline.high_failure_threshold, 5);
        assert_eq!(config.escalation.max_attempts, 3);
        assert!(config.server.enabled);
        assert_eq!(config.state_dir(), PathBuf::from("/tmp/pg"));
    }

    #[test]
    fn parse_minimal_toml_config_uses_documented_defaults() {
        let config = Config::parse_toml(
            r#"
[project]
name = "test"
"#,
        )
        .unwrap();
        assert_eq!(config.governance.approval_timeout_secs, 3600);
        assert_eq!(config.baseline.capture_timeout_secs, 180);
        assert_eq!(config.escalation.max_attempts, 5);
        assert_eq!(config.risk.troubleshooting, DeletionThresholds { notify: 100, block: 200 });
        assert!(!config.server.enabled);
        assert!(config.governance.never_auto_approve.iter().any(|p| p == ".git/"));
    }

    #[test]
    fn parse_json_with_camel_case() {
        let json = r#"{
            "project": { "name": "myapp", "testCommand": "pytest" },
            "governance": { "approvalTimeoutSecs": 120 },
            "escalation": { "maxAttempts": 4 }
        }"#;
        let config = Config::parse_json(json).unwrap();
        assert_eq!(config.project.test_command.as_deref(), Some("pytest"));
        assert_eq!(config.governance.approval_timeout_secs, 120);
        assert_eq!(config.escalation.max_attempts, 4);
    }

    #[test]
    fn parse_malformed_toml() {
        let err = Config::parse_toml("not valid toml [[[").unwrap_err();
        assert!(err.to_string().contains("invalid .phasegate.toml"));
    }

    #[test]
    fn parse_missing_required_fields() {
        assert!(Config::parse_toml("state_dir = \"/tmp\"").is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::new("demo");
        let env: HashMap<&str, &str> = [
            ("PHASEGATE_APPROVAL_TIMEOUT", "30"),
            ("PHASEGATE_MAX_ATTEMPTS", "2"),
            ("PHASEGATE_BASELINE_TIMEOUT", "60"),
        ]
        .into_iter()
        .collect();
        config
            .apply_overrides(|k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.governance.approval_timeout_secs, 30);
        assert_eq!(config.escalation.max_attempts, 2);
        assert_eq!(config.baseline.capture_timeout_secs, 60);
    }

    #[test]
    fn env_override_rejects_garbage() {
        let mut config = Config::new("demo");
        let err = config
            .apply_overrides(|k| (k == "PHASEGATE_MAX_ATTEMPTS").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PHASEGATE_MAX_ATTEMPTS"));
    }

    #[test]
    fn zero_max_attempts_is_rejected() {
        let mut config = Config::new("demo");
        config.escalation.max_attempts = 0;
        assert!(config.apply_overrides(|_| None).is_err());
    }

    #[test]
    fn roundtrip_toml_with_comments() {
        let config = Config::new("roundtrip");
        let output = config.to_toml().unwrap();
        assert!(output.contains("# phasegate project configuration"));
        assert!(output.contains("# Retry and capability-tier escalation"));
        let parsed = Config::parse_toml(&output).unwrap();
        assert_eq!(parsed.project.name, "roundtrip");
        assert_eq!(parsed.governance.allowed_paths, config.governance.allowed_paths);
    }

    #[test]
    fn model_pool_follows_tier() {
        let mut config = Config::new("demo");
        config.models.fast = vec!["custom/a".into()];
        config.models.strong = vec!["custom/c".into()];
        assert_eq!(config.resolve_model_pool(CapabilityTier::Low), vec!["custom/a"]);
        assert_eq!(config.resolve_model_pool(CapabilityTier::High), vec!["custom/c"]);
        assert_eq!(config.resolve_model_pool(CapabilityTier::Medium).len(), 2);
    }

    #[test]
    fn find_config_prefers_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_TOML), "").unwrap();
        std::fs::write(dir.path().join(CONFIG_JSON), "").unwrap();
        let found = find_config(dir.path()).unwrap();
        assert!(found.to_string_lossy().ends_with(".phasegate.toml"));
    }

    #[test]
    fn find_config_returns_none_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_config(dir.path()).is_none());
        let err = load_project_config(dir.path()).unwrap_err();
        assert!(err.to_string().contains("no .phasegate.toml"));
    }
}
