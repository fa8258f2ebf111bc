use std::process::ExitCode;

/// Errors that cause phasegate to exit with a specific code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("run {run} is already being executed by pid {pid}")]
    LockHeld { run: String, pid: u32 },

    #[error("{0}")]
    Gate(#[from] GateError),

    #[error("phase {phase} failed: {reason}")]
    PhaseFailed { phase: String, reason: String },

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExitError::Config(_) => ExitCode::from(2),
            ExitError::ToolNotFound { .. } => ExitCode::from(3),
            ExitError::ToolFailed { .. } => ExitCode::from(4),
            ExitError::Timeout { .. } => ExitCode::from(5),
            ExitError::PhaseFailed { .. } => ExitCode::from(6),
            ExitError::LockHeld { .. } => ExitCode::from(7),
            ExitError::Gate(_) => ExitCode::from(8),
            ExitError::Other(_) => ExitCode::from(1),
        }
    }
}

/// Failures of the gate machinery itself, as opposed to failures of the
/// candidate change being judged.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("baseline capture failed for commit {commit}: {message}")]
    BaselineCapture { commit: String, message: String },

    #[error("unreadable CI output: {0}")]
    UnreadableCiOutput(String),

    #[error("CI run failed: {0}")]
    CiRun(String),

    #[error("deliverables validator failed: {0}")]
    Validator(String),

    #[error("agent produced no candidate: {0}")]
    Agent(String),

    #[error("state store error: {0}")]
    Store(String),
}

impl GateError {
    /// Short reason string recorded on blocked decisions.
    pub fn infrastructure_reason(&self) -> String {
        format!("validation-infrastructure-error: {self}")
    }
}
