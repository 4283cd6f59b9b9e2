//! Error types for gantry-state

use thiserror::Error;

/// Errors raised while establishing or migrating the persistence backend.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

/// Errors raised by the storage trait operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Environment has not been created
    #[error("Environment not found: {env}")]
    EnvNotFound { env: String },

    /// Tag is unbound in the given environment
    #[error("Tag not found: {env}:{tag}")]
    TagNotFound { env: String, tag: String },

    /// No run with the given ID
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// No pipeline with the given ID
    #[error("Pipeline not found: {pipeline_id}")]
    PipelineNotFound { pipeline_id: String },

    /// No approval request with the given ID
    #[error("Approval request not found: {request_id}")]
    ApprovalNotFound { request_id: String },

    /// Approval request already has a terminal disposition
    #[error("Approval request already decided: {request_id}")]
    ApprovalAlreadyDecided { request_id: String },

    /// Run state transition violates the run state machine
    #[error("Invalid run transition for {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: String,
        from: String,
        to: String,
    },

    /// Operation requires an active (non-terminal) run
    #[error("Run {run_id} is not active (state: {state})")]
    RunNotActive { run_id: String, state: String },

    /// Rollback requested for a tag with fewer than two bindings
    #[error("No previous binding for {env}:{tag}")]
    NoPreviousBinding { env: String, tag: String },

    /// Digest string failed validation
    #[error("Invalid image digest: {digest}")]
    InvalidDigest { digest: String },

    /// Backend-level failure (query, serialization, connection)
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}
