use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::storage::WaitPolicy;

/// Kind of record a lookup was made against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Command,
    Chain,
    EditHistory,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Command => write!(f, "command"),
            Entity::Chain => write!(f, "chain"),
            Entity::EditHistory => write!(f, "edit history for command"),
        }
    }
}

/// Which branch of a step a handler command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    OnSuccess,
    OnFailure,
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::OnSuccess => write!(f, "success"),
            Handler::OnFailure => write!(f, "failure"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("{entity} with ID {id} not found")]
    NotFound { entity: Entity, id: u64 },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("command {command_id} failed: {message}")]
    Execution {
        command_id: u64,
        exit_code: Option<i32>,
        message: String,
        output: String,
    },

    #[error("dependency chain {chain_id} failed (wait policy '{policy}'): {source}")]
    DependencyFailure {
        chain_id: u64,
        policy: WaitPolicy,
        source: Box<SaveError>,
    },

    #[error("main command {command_id} failed: {source}")]
    StepFailed {
        command_id: u64,
        source: Box<SaveError>,
    },

    #[error("{handler} handler command {command_id} failed: {source}")]
    HandlerFailed {
        handler: Handler,
        command_id: u64,
        source: Box<SaveError>,
    },

    #[error("cyclic chain dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<u64> },

    #[error("command {command_id} timed out after {}s", .after.as_secs_f64())]
    Timeout { command_id: u64, after: Duration },

    #[error("command {command_id} was cancelled")]
    Cancelled { command_id: u64 },

    #[error("storage error at {}: {source}", .path.display())]
    Storage {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("terminal I/O failed: {0}")]
    Terminal(#[source] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SaveError>;

pub(crate) fn format_cycle(cycle: &[u64]) -> String {
    cycle
        .iter()
        .map(|id| format!("#{}", id))
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl SaveError {
    pub fn command_not_found(id: u64) -> Self {
        Self::NotFound {
            entity: Entity::Command,
            id,
        }
    }

    pub fn chain_not_found(id: u64) -> Self {
        Self::NotFound {
            entity: Entity::Chain,
            id,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Exit code of the innermost failed process, if one ran to completion.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SaveError::Execution { exit_code, .. } => *exit_code,
            SaveError::StepFailed { source, .. }
            | SaveError::HandlerFailed { source, .. }
            | SaveError::DependencyFailure { source, .. } => source.exit_code(),
            _ => None,
        }
    }

    /// Output captured from the innermost failed process.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            SaveError::Execution { output, .. } if !output.is_empty() => Some(output),
            SaveError::StepFailed { source, .. }
            | SaveError::HandlerFailed { source, .. }
            | SaveError::DependencyFailure { source, .. } => source.captured_output(),
            _ => None,
        }
    }
}
