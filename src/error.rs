use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PandemicError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("{0}")]
    Conflict(String),

    #[error("infection not found: {0}")]
    NotFound(String),

    #[error("state file {path} is unreadable: {reason}")]
    StateCorruption { path: String, reason: String },

    #[error("install of {0} cancelled by a concurrent remove")]
    Cancelled(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PandemicError {
    /// Error kind carried on the wire in `error.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Source(_) => "SourceError",
            Self::Supervisor(_) => "SupervisorError",
            Self::Conflict(_) => "ConflictError",
            Self::NotFound(_) => "NotFoundError",
            Self::StateCorruption { .. } => "StateCorruptionError",
            Self::Cancelled(_) => "CancelledError",
            Self::Io(_) | Self::Serialization(_) => "InternalError",
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source not found: {0}")]
    NotFound(String),

    #[error("source not allowed by allowlist: {0}")]
    Forbidden(String),

    #[error("invalid manifest in {source_uri}: {reason}")]
    InvalidManifest { source_uri: String, reason: String },

    #[error("fetching {uri} failed after {attempts} attempt(s): {reason}")]
    Network {
        uri: String,
        attempts: u32,
        reason: String,
    },

    #[error("unsupported source: {0}")]
    UnsupportedScheme(String),

    #[error("failed to unpack {uri}: {reason}")]
    Archive { uri: String, reason: String },
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("`{command}` exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to run `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    #[error("{service} did not reach {target} within {}s", .waited.as_secs())]
    Timeout {
        service: String,
        target: String,
        waited: Duration,
    },

    #[error("{service} entered failed state while {action}")]
    Crashed { service: String, action: String },

    #[error("refusing to write unit for {service}: {reason}")]
    InvalidUnit { service: String, reason: String },

    #[error("invalid service name: {0}")]
    InvalidServiceName(String),

    #[error("unparseable supervisor output: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, PandemicError>;
