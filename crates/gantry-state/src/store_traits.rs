//! Storage trait definitions for Gantry
//!
//! These traits define the core persistence abstractions:
//! - `RunStore`: pipeline run records, stage result logs, approval requests
//! - `PipelineStore`: pipeline definitions, versioned by content digest
//! - `TagStore`: per-environment tag bindings with append-only history
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identifiers and digests
// ---------------------------------------------------------------------------

/// Unique identifier for a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a stored pipeline definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineId(pub String);

impl PipelineId {
    pub fn new() -> Self {
        PipelineId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for PipelineId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an approval request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        RequestId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable image digest in canonical `sha256:<64 hex>` form.
///
/// The inner field is private to guarantee the string is always canonical,
/// produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageDigest(String);

impl ImageDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = sha2::Sha256::new();
        hasher.update(data);
        ImageDigest(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    /// Return the full canonical string (`sha256:<hex>`).
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars after the algorithm prefix).
    pub fn short(&self) -> &str {
        let hex = &self.0["sha256:".len()..];
        &hex[..12.min(hex.len())]
    }
}

impl TryFrom<String> for ImageDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        // Accept either bare hex or the canonical prefixed form.
        let hex = s.strip_prefix("sha256:").unwrap_or(&s);
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ImageDigest(format!("sha256:{}", hex.to_ascii_lowercase())))
    }
}

impl std::str::FromStr for ImageDigest {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ImageDigest::try_from(s.to_string())
    }
}

impl std::fmt::Display for ImageDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Run records
// ---------------------------------------------------------------------------

/// State of a pipeline run.
///
/// Transitions are linear: `Pending -> Running -> {Succeeded, Failed,
/// Aborted}`, with `AwaitingApproval` as a transient sub-state entered and
/// left only from `Running`. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    AwaitingApproval,
    Succeeded,
    Failed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::AwaitingApproval => "awaiting_approval",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Aborted => "aborted",
        }
    }

    /// Whether the run state machine permits `from -> to`.
    ///
    /// No backward transitions, no skipping. A no-op transition between
    /// identical non-terminal states is permitted so that resumed runs can
    /// re-assert their current state.
    pub fn can_transition(from: RunState, to: RunState) -> bool {
        if from == to {
            return !from.is_terminal();
        }
        match (from, to) {
            (RunState::Pending, RunState::Running) => true,
            (RunState::Pending, RunState::Aborted) => true,
            (RunState::Running, RunState::AwaitingApproval) => true,
            (RunState::AwaitingApproval, RunState::Running) => true,
            (RunState::Running | RunState::AwaitingApproval, s) if s.is_terminal() => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RunState {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunState::Pending),
            "running" => Ok(RunState::Running),
            "awaiting_approval" => Ok(RunState::AwaitingApproval),
            "succeeded" => Ok(RunState::Succeeded),
            "failed" => Ok(RunState::Failed),
            "aborted" => Ok(RunState::Aborted),
            other => Err(StorageError::Backend(format!(
                "unknown run state: {other}"
            ))),
        }
    }
}

/// Why a run failed: failing stage name, error kind, and captured output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: String,
    pub kind: String,
    pub message: String,
}

/// Full run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub pipeline_id: PipelineId,
    /// Content digest of the pipeline definition the run executes.
    pub pipeline_digest: String,
    /// Identity that started the run.
    pub initiator: String,
    pub state: RunState,
    pub failure: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Outcome of a single executed stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Rejected,
}

impl StageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageOutcome::Succeeded => "succeeded",
            StageOutcome::Failed => "failed",
            StageOutcome::TimedOut => "timed_out",
            StageOutcome::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry in a run's ordered stage result log. Append-only; never
/// mutated after write. `seq` is 1-based and strictly increasing per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResultRecord {
    pub seq: u64,
    pub stage_name: String,
    pub outcome: StageOutcome,
    /// Number of attempts actually made (retries included).
    pub attempts: u32,
    /// Error kind for non-succeeded outcomes (e.g. "timeout", "conflict").
    pub error_kind: Option<String>,
    /// Free-form captured output of the final attempt.
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Approval records
// ---------------------------------------------------------------------------

/// Terminal disposition of an approval request, set at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Approved,
    Rejected,
    Expired,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Approved => "approved",
            Disposition::Rejected => "rejected",
            Disposition::Expired => "expired",
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted approval request. At most one exists per (run, gate stage).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub request_id: RequestId,
    pub run_id: RunId,
    pub stage_name: String,
    pub deadline: DateTime<Utc>,
    pub disposition: Option<Disposition>,
    pub decided_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl ApprovalRecord {
    pub fn is_open(&self) -> bool {
        self.disposition.is_none()
    }
}

// ---------------------------------------------------------------------------
// Pipeline records
// ---------------------------------------------------------------------------

/// A stored pipeline definition, versioned by content digest. The
/// definition JSON is opaque to the storage layer; gantry-core owns its
/// shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub pipeline_id: PipelineId,
    /// SHA-256 hex digest of the canonical definition JSON.
    pub digest: String,
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tag bindings
// ---------------------------------------------------------------------------

/// One tag binding event: `(env, tag)` bound to a digest by an actor.
/// Bindings are append-only; the highest `seq` for a tag is its current
/// binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagBinding {
    pub env: String,
    pub tag: String,
    pub digest: ImageDigest,
    pub seq: u64,
    pub bound_by: String,
    pub bound_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// RunStore — run records, stage results, approvals
// ---------------------------------------------------------------------------

/// Persistence for pipeline runs.
///
/// Guarantees:
/// - Stage results are ordered by monotonic `seq` within a run and are
///   append-only while the run is active.
/// - Run state transitions obey [`RunState::can_transition`]; terminal
///   states are immutable.
/// - An approval request's disposition is set at most once.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create a new run in `Pending` state for the given pipeline.
    async fn create_run(
        &self,
        pipeline: &PipelineRecord,
        initiator: &str,
    ) -> StorageResult<RunRecord>;

    /// Move a run between non-terminal states (`Running`,
    /// `AwaitingApproval`). Fails with `InvalidTransition` otherwise.
    async fn transition(&self, run_id: &RunId, to: RunState) -> StorageResult<()>;

    /// Mark a run as succeeded.
    async fn complete_run(&self, run_id: &RunId) -> StorageResult<()>;

    /// Mark a run as failed, recording the failing stage and error kind.
    async fn fail_run(&self, run_id: &RunId, failure: RunFailure) -> StorageResult<()>;

    /// Mark a run as aborted by operator request.
    async fn abort_run(&self, run_id: &RunId) -> StorageResult<()>;

    /// Append a stage result to an active run. `result.seq` must be exactly
    /// one greater than the current log length.
    async fn append_stage_result(
        &self,
        run_id: &RunId,
        result: StageResultRecord,
    ) -> StorageResult<()>;

    /// Retrieve a run record by ID.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    /// Retrieve the stage result log for a run, ordered by seq.
    async fn get_stage_results(&self, run_id: &RunId) -> StorageResult<Vec<StageResultRecord>>;

    /// List runs, optionally filtered by pipeline, newest first.
    async fn list_runs(&self, pipeline_id: Option<&PipelineId>) -> StorageResult<Vec<RunRecord>>;

    /// Persist a newly opened approval request. Fails if one already exists
    /// for the same (run, stage).
    async fn put_approval(&self, approval: ApprovalRecord) -> StorageResult<()>;

    /// Retrieve an approval request by ID.
    async fn get_approval(&self, request_id: &RequestId) -> StorageResult<ApprovalRecord>;

    /// Retrieve the approval request for a specific gate stage of a run.
    async fn approval_for_stage(
        &self,
        run_id: &RunId,
        stage_name: &str,
    ) -> StorageResult<Option<ApprovalRecord>>;

    /// Record the terminal disposition of an approval request. Fails with
    /// `ApprovalAlreadyDecided` if a disposition has already been set.
    async fn resolve_approval(
        &self,
        request_id: &RequestId,
        disposition: Disposition,
        decided_by: &str,
    ) -> StorageResult<ApprovalRecord>;
}

// ---------------------------------------------------------------------------
// PipelineStore — definitions keyed by id, versioned by content
// ---------------------------------------------------------------------------

/// Persistence for pipeline definitions.
///
/// `put_pipeline` is idempotent per digest: storing the same definition
/// twice returns the existing record rather than a duplicate.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn put_pipeline(
        &self,
        definition: serde_json::Value,
        digest: &str,
    ) -> StorageResult<PipelineRecord>;

    async fn get_pipeline(&self, pipeline_id: &PipelineId) -> StorageResult<PipelineRecord>;

    async fn list_pipelines(&self) -> StorageResult<Vec<PipelineRecord>>;
}

// ---------------------------------------------------------------------------
// TagStore — per-environment tag bindings
// ---------------------------------------------------------------------------

/// Persistence for environments and tag bindings.
///
/// Guarantees:
/// - A tag resolves to exactly one digest at any instant (highest seq).
/// - Binding history is append-only; rebinding never destroys prior
///   entries.
#[async_trait]
pub trait TagStore: Send + Sync {
    /// Create an environment. Idempotent.
    async fn create_env(&self, name: &str) -> StorageResult<()>;

    /// Whether an environment exists.
    async fn env_exists(&self, name: &str) -> StorageResult<bool>;

    /// Resolve a tag to its current digest. `TagNotFound` if unbound,
    /// `EnvNotFound` if the environment was never created.
    async fn resolve(&self, env: &str, tag: &str) -> StorageResult<ImageDigest>;

    /// Atomically rebind a tag to a digest, appending to its history.
    async fn bind(
        &self,
        env: &str,
        tag: &str,
        digest: &ImageDigest,
        bound_by: &str,
    ) -> StorageResult<TagBinding>;

    /// Full binding history for a tag, newest first.
    async fn history(&self, env: &str, tag: &str) -> StorageResult<Vec<TagBinding>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_from_bytes_is_canonical() {
        let d = ImageDigest::from_bytes(b"layer data");
        assert!(d.as_str().starts_with("sha256:"));
        assert_eq!(d.as_str().len(), "sha256:".len() + 64);
        assert_eq!(d.short().len(), 12);
    }

    #[test]
    fn digest_parse_accepts_bare_and_prefixed_hex() {
        let d = ImageDigest::from_bytes(b"x");
        let bare = d.as_str().strip_prefix("sha256:").unwrap().to_string();
        assert_eq!(ImageDigest::try_from(bare).unwrap(), d);
        assert_eq!(ImageDigest::try_from(d.as_str().to_string()).unwrap(), d);
    }

    #[test]
    fn digest_parse_rejects_garbage() {
        assert!(ImageDigest::try_from("not-a-digest".to_string()).is_err());
        assert!(ImageDigest::try_from("sha256:abcd".to_string()).is_err());
    }

    #[test]
    fn run_state_transitions() {
        use RunState::*;
        assert!(RunState::can_transition(Pending, Running));
        assert!(RunState::can_transition(Running, AwaitingApproval));
        assert!(RunState::can_transition(AwaitingApproval, Running));
        assert!(RunState::can_transition(Running, Succeeded));
        assert!(RunState::can_transition(AwaitingApproval, Aborted));
        assert!(RunState::can_transition(Running, Running));

        // No skipping, no backward moves, terminal states immutable.
        assert!(!RunState::can_transition(Pending, Succeeded));
        assert!(!RunState::can_transition(Succeeded, Running));
        assert!(!RunState::can_transition(Failed, Failed));
        assert!(!RunState::can_transition(AwaitingApproval, Pending));
    }
}
