//! Gantry-Core: promotion-pipeline orchestration engine.
//!
//! The engine drives pipeline runs through their stages in order: build,
//! deploy, and test stages run opaque commands; approval stages block on
//! a human decision with a hard deadline; promote stages atomically move
//! an artifact tag between environments. Every stage result is committed
//! to the run store before the next stage starts, so interrupted runs
//! resume where they left off.
//!
//! Persistence lives in `gantry-state`; this crate holds the semantics.

pub mod action;
pub mod approval;
pub mod engine;
pub mod error;
pub mod executor;
pub mod identity;
pub mod pipeline;
pub mod registry;
pub mod telemetry;

pub use action::{CommandAction, StageAction};
pub use approval::{ApprovalGate, Decision};
pub use engine::{PipelineEngine, RunStatus};
pub use error::{Error, Result};
pub use executor::ExecutionReport;
pub use identity::{
    ChangeKind, GrantEntry, Identity, Permission, PolicyChange, PolicyDocument, PolicyStore,
};
pub use pipeline::{PipelineDefinition, RetryPolicy, StageKind, StageSpec};
pub use registry::{ArtifactRegistry, TagMoved};

// Storage-layer types that appear in this crate's public API.
pub use gantry_state::{
    ApprovalRecord, Disposition, ImageDigest, PipelineId, PipelineRecord, RequestId, RunFailure,
    RunId, RunRecord, RunState, StageOutcome, StageResultRecord, TagBinding,
};
