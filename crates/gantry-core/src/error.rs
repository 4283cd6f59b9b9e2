//! Error taxonomy for gantry-core.
//!
//! Only [`Error::Transient`] is ever retried, and only by the stage
//! executor within a stage's retry policy. Every other kind immediately
//! fails the run.

use std::time::Duration;

use thiserror::Error;

use gantry_state::StorageError;

/// Result type for gantry-core operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Missing tag, environment, pipeline, run, or approval request.
    #[error("not found: {0}")]
    NotFound(String),

    /// Policy denial. Never downgraded, never retried.
    #[error("permission denied: {identity} lacks {action} on {environment}")]
    PermissionDenied {
        identity: String,
        action: String,
        environment: String,
    },

    /// Concurrent promotion in flight for the same destination tag.
    #[error("conflict: concurrent promotion in flight for {env}:{tag}")]
    Conflict { env: String, tag: String },

    /// Stage or approval deadline exceeded.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A second decision arrived for an already-decided approval request.
    #[error("approval request {0} already decided")]
    AlreadyDecided(String),

    /// Retryable action failure (spawn error, I/O, network).
    #[error("transient failure: {0}")]
    Transient(String),

    /// A stage command exited non-zero. Terminal, not retried.
    #[error("command exited with code {code}")]
    CommandFailed { code: i32, stderr: String },

    /// Pipeline definition failed validation.
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// Run cannot be resumed in its current state.
    #[error("run {run_id} is {state} and cannot be resumed")]
    NotResumable { run_id: String, state: String },

    /// Run was aborted by operator request.
    #[error("aborted")]
    Aborted,

    /// Persistence-layer failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl Error {
    /// Stable kind label, recorded in stage results and run failures.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::PermissionDenied { .. } => "permission_denied",
            Error::Conflict { .. } => "conflict",
            Error::Timeout(_) => "timeout",
            Error::AlreadyDecided(_) => "already_decided",
            Error::Transient(_) => "transient",
            Error::CommandFailed { .. } => "command_failed",
            Error::InvalidPipeline(_) => "invalid_pipeline",
            Error::NotResumable { .. } => "not_resumable",
            Error::Aborted => "aborted",
            Error::Storage(_) => "storage",
        }
    }

    /// Whether the stage executor may retry this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

/// Map storage-layer lookup failures onto the core taxonomy.
pub(crate) fn from_lookup(err: StorageError) -> Error {
    match err {
        StorageError::EnvNotFound { env } => Error::NotFound(format!("environment {env}")),
        StorageError::TagNotFound { env, tag } => Error::NotFound(format!("tag {env}:{tag}")),
        StorageError::RunNotFound { run_id } => Error::NotFound(format!("run {run_id}")),
        StorageError::PipelineNotFound { pipeline_id } => {
            Error::NotFound(format!("pipeline {pipeline_id}"))
        }
        StorageError::ApprovalNotFound { request_id } => {
            Error::NotFound(format!("approval request {request_id}"))
        }
        StorageError::ApprovalAlreadyDecided { request_id } => Error::AlreadyDecided(request_id),
        StorageError::NoPreviousBinding { env, tag } => {
            Error::NotFound(format!("no previous binding for {env}:{tag}"))
        }
        other => Error::Storage(other),
    }
}
