//! The error taxonomy of spec §7, realized as a single `thiserror` enum.
//!
//! Every public operation across the nine components returns
//! `crate::error::Result<T>`. The `exit_code` method is consulted only by
//! the demonstration CLI binary; the library itself never calls
//! `std::process::exit`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("external tool missing: {0}")]
    ExternalToolMissing(String),

    #[error("external tool {tool} failed (exit {exit_code:?}): {stderr}")]
    ExternalToolError {
        tool: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("guest agent unreachable")]
    AgentUnreachable,

    #[error("secret not found: provider={provider} path={path}")]
    SecretNotFound { provider: String, path: String },

    #[error("secret provider error: provider={provider}: {message}")]
    ProviderError { provider: String, message: String },

    #[error("transaction rolled back: {cleaned} artifact(s) cleaned, target={target}")]
    TransactionRolledBack { target: String, cleaned: usize },

    #[error("internal invariant violation: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The exit-code convention of spec §6, for the embedding CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => 2,
            Error::NotFound { .. } => 3,
            Error::AlreadyExists { .. } => 3,
            Error::PreconditionFailed(_) => 3,
            Error::ExternalToolMissing(_) => 4,
            Error::ExternalToolError { .. } => 1,
            Error::Timeout(_) => 1,
            Error::AgentUnreachable => 1,
            Error::SecretNotFound { .. } => 1,
            Error::ProviderError { .. } => 1,
            Error::TransactionRolledBack { .. } => 5,
            Error::Internal(_) => 1,
            Error::Io(_) | Error::Json(_) | Error::Yaml(_) | Error::Http(_) => 1,
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind,
            name: name.into(),
        }
    }
}
