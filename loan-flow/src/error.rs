use thiserror::Error;

use crate::state::Stage;

pub type Result<T> = std::result::Result<T, FlowError>;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("{collaborator} did not answer after {attempts} attempt(s)")]
    CollaboratorTimeout {
        collaborator: &'static str,
        attempts: u32,
    },

    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    #[error("Handler for stage {0} exceeded its deadline")]
    HandlerTimeout(Stage),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Turn {received} arrived after turn {last_accepted}")]
    OutOfOrderTurn { received: u64, last_accepted: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }

    /// A collaborator or a whole handler ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::CollaboratorTimeout { .. } | Self::HandlerTimeout(_))
    }

    /// Whether the driver may retry the same turn later without intervention.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::CollaboratorTimeout { .. }
                | Self::Collaborator { .. }
                | Self::HandlerTimeout(_)
        )
    }
}

/// Failure reported by an external collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollaboratorError {
    #[error("timed out")]
    Timeout,

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Failure(String),
}

impl CollaboratorError {
    /// Timeouts and transient unavailability are retried, the rest are final answers.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_))
    }
}
