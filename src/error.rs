use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Tmux error: {0}")]
    Tmux(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Malformed JSON in {}: {source}", path.display())]
    MalformedJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Schema violation in {}: {message}", path.display())]
    SchemaViolation { path: PathBuf, message: String },

    #[error("Team not found: {0}")]
    TeamNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Dependency not found: {0}")]
    DependencyNotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Dispatch rule not found: {0}")]
    RuleNotFound(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Task {id} is not available: {reason}")]
    Contention { id: String, reason: String },

    #[error("Circular dependency: {task} would depend on itself through {via}")]
    CircularDependency { task: String, via: String },

    #[error("Task {id} is still a dependency of: {}", dependents.join(", "))]
    ReferentialIntegrity { id: String, dependents: Vec<String> },

    #[error("Timed out after {timeout:?} waiting for lock {}", path.display())]
    LockTimeout {
        path: PathBuf,
        timeout: std::time::Duration,
    },

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

/// Coarse classification used by callers that translate failures into
/// `{success: false, error}` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    State,
    Contention,
    CircularDependency,
    ReferentialIntegrity,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TeamNotFound(_)
            | Error::TaskNotFound(_)
            | Error::DependencyNotFound(_)
            | Error::AgentNotFound(_)
            | Error::RuleNotFound(_) => ErrorKind::NotFound,
            Error::Validation(_)
            | Error::FileNotFound(_)
            | Error::MalformedJson { .. }
            | Error::SchemaViolation { .. } => ErrorKind::Validation,
            Error::InvalidStatusTransition { .. } | Error::InvalidState(_) => ErrorKind::State,
            Error::Contention { .. } => ErrorKind::Contention,
            Error::CircularDependency { .. } => ErrorKind::CircularDependency,
            Error::ReferentialIntegrity { .. } => ErrorKind::ReferentialIntegrity,
            Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::Tmux(_)
            | Error::NoHomeDir
            | Error::LockTimeout { .. }
            | Error::TaskJoin(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
