//! SurrealDB schema migrations and initialization
//!
//! Sets up all tables with their uniqueness constraints and indexes.
//! Safe to call multiple times (idempotent).

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::Result;

/// Initialize all Gantry tables in SurrealDB.
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Gantry SurrealDB schema");

    init_runs_table(db).await?;
    init_stage_results_table(db).await?;
    init_approvals_table(db).await?;
    init_pipelines_table(db).await?;
    init_environments_table(db).await?;
    init_tag_bindings_table(db).await?;

    info!("Gantry schema initialization complete");
    Ok(())
}

/// Initialize `runs` table.
///
/// Constraints:
/// - `run_id` is unique
/// - state transitions and terminal-state immutability are enforced by
///   application logic in the store
async fn init_runs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing runs table");

    let sql = r#"
        DEFINE TABLE runs
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX idx_run_id ON TABLE runs COLUMNS run_id UNIQUE;
        DEFINE INDEX idx_run_pipeline ON TABLE runs COLUMNS pipeline_id;
        DEFINE INDEX idx_run_state ON TABLE runs COLUMNS state;
    "#;

    db.query(sql)
        .await
        .map_err(|e| crate::StateError::SchemaSetup(e.to_string()))?;
    Ok(())
}

/// Initialize `stage_results` table. The `(run_id, seq)` pair is unique:
/// the log is append-only and seq-ordered per run.
async fn init_stage_results_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing stage_results table");

    let sql = r#"
        DEFINE TABLE stage_results
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX idx_result_run_seq ON TABLE stage_results COLUMNS run_id, seq UNIQUE;
    "#;

    db.query(sql)
        .await
        .map_err(|e| crate::StateError::SchemaSetup(e.to_string()))?;
    Ok(())
}

/// Initialize `approvals` table. At most one approval request exists per
/// `(run_id, stage_name)` gate instance.
async fn init_approvals_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing approvals table");

    let sql = r#"
        DEFINE TABLE approvals
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX idx_approval_request ON TABLE approvals COLUMNS request_id UNIQUE;
        DEFINE INDEX idx_approval_stage ON TABLE approvals COLUMNS run_id, stage_name UNIQUE;
    "#;

    db.query(sql)
        .await
        .map_err(|e| crate::StateError::SchemaSetup(e.to_string()))?;
    Ok(())
}

/// Initialize `pipelines` table, versioned by content digest.
async fn init_pipelines_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing pipelines table");

    let sql = r#"
        DEFINE TABLE pipelines
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX idx_pipeline_id ON TABLE pipelines COLUMNS pipeline_id UNIQUE;
        DEFINE INDEX idx_pipeline_digest ON TABLE pipelines COLUMNS digest UNIQUE;
    "#;

    db.query(sql)
        .await
        .map_err(|e| crate::StateError::SchemaSetup(e.to_string()))?;
    Ok(())
}

/// Initialize `environments` table.
async fn init_environments_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing environments table");

    let sql = r#"
        DEFINE TABLE environments
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX idx_env_name ON TABLE environments COLUMNS name UNIQUE;
    "#;

    db.query(sql)
        .await
        .map_err(|e| crate::StateError::SchemaSetup(e.to_string()))?;
    Ok(())
}

/// Initialize `tag_bindings` table. History is append-only; the highest
/// `seq` per `(env, tag)` is the current binding.
async fn init_tag_bindings_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing tag_bindings table");

    let sql = r#"
        DEFINE TABLE tag_bindings
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX idx_binding_seq ON TABLE tag_bindings COLUMNS env, tag, seq UNIQUE;
    "#;

    db.query(sql)
        .await
        .map_err(|e| crate::StateError::SchemaSetup(e.to_string()))?;
    Ok(())
}
