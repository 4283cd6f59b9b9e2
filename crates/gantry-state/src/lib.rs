//! Gantry-State: persistence layer for the Gantry promotion-pipeline
//! orchestrator.
//!
//! This crate owns all I/O with the storage backend. It defines the
//! backend-agnostic storage traits ([`RunStore`], [`PipelineStore`],
//! [`TagStore`]), a SurrealDB implementation ([`SurrealStore`]), and
//! in-memory fakes for testing and for the default in-process engine.
//!
//! ## Key guarantees
//!
//! - Run state transitions obey the run state machine; terminal states are
//!   immutable.
//! - Stage result logs and tag binding histories are append-only.
//! - An approval request's disposition is set at most once.

mod error;
pub mod fakes;
mod migrations;
mod schema;
pub mod store_traits;
mod surreal_store;

pub use error::{StateError, StorageError};
pub use schema::{
    ApprovalRow, EnvRow, PipelineRow, RunRow, StageResultRow, TagBindingRow,
};
pub use store_traits::{
    ApprovalRecord, Disposition, ImageDigest, PipelineId, PipelineRecord, PipelineStore,
    RequestId, RunFailure, RunId, RunRecord, RunState, RunStore, StageOutcome, StageResultRecord,
    StorageResult, TagBinding, TagStore,
};
pub use surreal_store::SurrealStore;

/// Result type for gantry-state setup operations
pub type Result<T> = std::result::Result<T, StateError>;
