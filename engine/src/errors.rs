//! Error types for the deployment engine

use std::fmt;

use thiserror::Error;

/// A single service's pull failure, kept so the aggregate can name every offender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFailure {
    pub service: String,
    pub message: String,
}

impl fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.service, self.message)
    }
}

/// Main error type for the deployment engine
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("malformed image reference for service {service}: '{reference}' (expected image:tag)")]
    MalformedImageReference { service: String, reference: String },

    #[error("command `{command}` failed: {exit_info}")]
    SubprocessFailure { command: String, exit_info: String },

    #[error("unable to pull images: {}", join_failures(.0))]
    PullAggregateFailure(Vec<ServiceFailure>),

    #[error("unable to back up configuration: {0}")]
    BackupFailure(String),

    #[error("rollback could not restore a startable state: {0}")]
    RollbackPartialFailure(String),

    #[error("services still referenced by dependents: {}", .dependents.join(", "))]
    ReconciliationBlocked { dependents: Vec<String> },

    #[error("persistence error: {0}")]
    PersistenceFailure(String),

    #[error("deployment failed during {step}: {source}")]
    DeploymentFailed {
        step: String,
        #[source]
        source: Box<DeployError>,
    },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Build a subprocess failure from the rendered command line
    pub fn subprocess(command: impl Into<String>, exit_info: impl Into<String>) -> Self {
        DeployError::SubprocessFailure {
            command: command.into(),
            exit_info: exit_info.into(),
        }
    }

    /// Unwrap a transaction failure down to the error that triggered it
    pub fn root_cause(&self) -> &DeployError {
        match self {
            DeployError::DeploymentFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

fn join_failures(failures: &[ServiceFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Internal(err.to_string())
    }
}
