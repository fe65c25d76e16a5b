// src/error.rs

use std::io;
use thiserror::Error;

/// Errors raised while driving a CI step.
///
/// Two families exist. Configuration errors (bad arguments, missing secrets or
/// identifiers, unknown profiles) are fatal and never retried. Operation
/// failures come from a delegated tool and carry its status where one exists.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("unknown build step: {0}")]
    UnknownStep(String),

    #[error("environment '{0}' is not recognized by this driver")]
    UnknownProfile(String),

    #[error("{name} is not defined ({hint})")]
    MissingVariable {
        name: &'static str,
        hint: &'static str,
    },

    #[error("cannot determine the job ordinal from job identifier '{0}'")]
    MalformedJobId(String),

    #[error("cannot get private tests because encrypted environment variables are not defined")]
    MissingCredentials,

    #[error("invalid value '{value}' for {name}: {reason}")]
    InvalidSetting {
        name: String,
        value: String,
        reason: String,
    },

    #[error("invalid platform profile table: {0}")]
    InvalidProfiles(String),

    #[error("{what} exited with status {code}")]
    CommandFailed { what: String, code: i32 },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("expected artifact is missing: {0}")]
    MissingArtifact(String),

    #[error("external test suite failed")]
    ExternalSuiteFailed,

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for DriverError {
    fn from(err: reqwest::Error) -> Self {
        DriverError::Transfer(err.to_string())
    }
}

impl DriverError {
    pub fn command_failed(what: impl Into<String>, code: i32) -> Self {
        DriverError::CommandFailed {
            what: what.into(),
            code,
        }
    }

    /// True for errors caused by how the driver was invoked or configured.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DriverError::UnknownStep(_)
                | DriverError::UnknownProfile(_)
                | DriverError::MissingVariable { .. }
                | DriverError::MalformedJobId(_)
                | DriverError::MissingCredentials
                | DriverError::InvalidSetting { .. }
                | DriverError::InvalidProfiles(_)
        )
    }

    /// Whether the usage text should accompany this error.
    pub fn wants_usage(&self) -> bool {
        matches!(self, DriverError::UnknownStep(_) | DriverError::UnknownProfile(_))
    }

    /// Process exit code for this error. A delegated tool's own status is
    /// carried through verbatim; everything else is 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            DriverError::CommandFailed { code, .. } if *code != 0 => *code,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
