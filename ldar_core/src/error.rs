//! Error taxonomy for the simulation engine.
//!
//! Only three kinds of failure surface as `Err`:
//! - [`ConfigError`]: the configuration is unusable; nothing runs.
//! - [`SimError::InputData`]: an input collaborator failed; the replicate aborts.
//! - [`SimError::Numerical`]: a replicate produced non-physical totals.
//!
//! Sampling problems and scheduling conflicts are recovered in place and
//! recorded in the replicate's [`AuditLog`](crate::audit::AuditLog).

use ldar_env::EnvError;
use thiserror::Error;

/// Configuration errors, reported before any replicate starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// The document is not valid JSON for the configuration schema
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// A field has an unusable value
    #[error("{path}: {message}")]
    Invalid {
        /// Dotted path of the offending field
        path: String,
        /// What is wrong with it
        message: String,
    },

    /// A follow-up reference names a method the program does not define
    #[error("{path}: unknown follow-up method '{target}'")]
    UnknownFollowUp {
        /// Dotted path of the reference
        path: String,
        /// Referenced label
        target: String,
    },

    /// Follow-up references form a loop
    #[error("programs.{program}: follow-up chain cycles through '{method}'")]
    FollowUpCycle {
        /// Program containing the cycle
        program: String,
        /// First method found on the cycle
        method: String,
    },
}

impl ConfigError {
    /// Creates an invalid-field error.
    pub fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Errors that abort a replicate (or, for `Config`, the whole batch).
#[derive(Debug, Error)]
pub enum SimError {
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Missing or malformed input data
    #[error("Input data error: {0}")]
    InputData(#[from] EnvError),

    /// Non-finite or otherwise non-physical results
    #[error("Numerical error: {0}")]
    Numerical(String),
}

impl SimError {
    /// Creates a numerical error.
    pub fn numerical(msg: impl Into<String>) -> Self {
        Self::Numerical(msg.into())
    }
}
