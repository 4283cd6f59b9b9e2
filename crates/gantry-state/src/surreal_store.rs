//! SurrealDB-backed storage implementation
//!
//! `SurrealStore` implements [`RunStore`], [`PipelineStore`], and
//! [`TagStore`] over a single connection, converting between
//! `storage_traits` types and `schema` row types at the boundary.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::schema::{
    ApprovalRow, EnvRow, PipelineRow, RunRow, StageResultRow, TagBindingRow,
};
use crate::store_traits::*;

/// SurrealDB-backed implementation of the Gantry storage traits.
pub struct SurrealStore {
    db: Surreal<Any>,
}

impl SurrealStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `gantry/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::open("mem://").await
    }

    /// Create from environment variables.
    ///
    /// Uses `GANTRY_DB_URL` if set, otherwise local persistence in
    /// `.gantry/db`.
    pub async fn from_env() -> crate::Result<Self> {
        if let Ok(url) = std::env::var("GANTRY_DB_URL") {
            return Self::open(&url).await;
        }

        let path = ".gantry/db";
        std::fs::create_dir_all(path).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                path, e
            ))
        })?;
        let url = format!("surrealkv://{}", path);
        info!("GANTRY_DB_URL not set, using local persistence: {}", url);
        Self::open(&url).await
    }

    /// Connect to an arbitrary SurrealDB endpoint and initialize the schema.
    pub async fn open(url: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns("gantry")
            .use_db("main")
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        info!("SurrealStore connected ({})", url);
        Ok(Self { db })
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_run(&self, rid: &str) -> StorageResult<RunRow> {
        let rid_owned = rid.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM runs WHERE run_id = $rid")
            .bind(("rid", rid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<RunRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: rid.to_string(),
            })
    }

    /// Fetch a run row and verify it has not reached a terminal state.
    async fn fetch_active(&self, rid: &str) -> StorageResult<RunRow> {
        let row = self.fetch_run(rid).await?;
        let state = RunState::from_str(&row.state)?;
        if state.is_terminal() {
            return Err(StorageError::RunNotActive {
                run_id: rid.to_string(),
                state: row.state,
            });
        }
        Ok(row)
    }

    async fn update_run(&self, rid: &str, row: RunRow) -> StorageResult<()> {
        let rid_owned = rid.to_string();
        self.db
            .query("UPDATE runs CONTENT $row WHERE run_id = $rid")
            .bind(("row", row))
            .bind(("rid", rid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: &RunId,
        to: RunState,
        failure: Option<RunFailure>,
    ) -> StorageResult<()> {
        let mut row = self.fetch_active(&run_id.0).await?;
        let from = RunState::from_str(&row.state)?;
        if !RunState::can_transition(from, to) {
            return Err(StorageError::InvalidTransition {
                run_id: run_id.0.clone(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        row.state = to.as_str().to_string();
        if let Some(f) = failure {
            row.failure_stage = Some(f.stage);
            row.failure_kind = Some(f.kind);
            row.failure_message = Some(f.message);
        }
        row.finished_at = Some(Utc::now());
        self.update_run(&run_id.0, row).await
    }

    async fn fetch_approval(&self, request_id: &str) -> StorageResult<ApprovalRow> {
        let req_owned = request_id.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM approvals WHERE request_id = $req")
            .bind(("req", req_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<ApprovalRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::ApprovalNotFound {
                request_id: request_id.to_string(),
            })
    }

    fn row_to_run(row: RunRow) -> StorageResult<RunRecord> {
        let state = RunState::from_str(&row.state)?;
        let failure = match (row.failure_stage, row.failure_kind, row.failure_message) {
            (Some(stage), Some(kind), Some(message)) => Some(RunFailure {
                stage,
                kind,
                message,
            }),
            _ => None,
        };
        Ok(RunRecord {
            run_id: RunId(row.run_id),
            pipeline_id: PipelineId(row.pipeline_id),
            pipeline_digest: row.pipeline_digest,
            initiator: row.initiator,
            state,
            failure,
            created_at: row.created_at,
            finished_at: row.finished_at,
        })
    }

    fn row_to_result(row: StageResultRow) -> StorageResult<StageResultRecord> {
        let outcome = match row.outcome.as_str() {
            "succeeded" => StageOutcome::Succeeded,
            "failed" => StageOutcome::Failed,
            "timed_out" => StageOutcome::TimedOut,
            "rejected" => StageOutcome::Rejected,
            other => {
                return Err(StorageError::Backend(format!(
                    "unknown stage outcome: {other}"
                )))
            }
        };
        Ok(StageResultRecord {
            seq: row.seq,
            stage_name: row.stage_name,
            outcome,
            attempts: row.attempts,
            error_kind: row.error_kind,
            output: row.output,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }

    fn row_to_approval(row: ApprovalRow) -> StorageResult<ApprovalRecord> {
        let disposition = match row.disposition.as_deref() {
            None => None,
            Some("approved") => Some(Disposition::Approved),
            Some("rejected") => Some(Disposition::Rejected),
            Some("expired") => Some(Disposition::Expired),
            Some(other) => {
                return Err(StorageError::Backend(format!(
                    "unknown disposition: {other}"
                )))
            }
        };
        Ok(ApprovalRecord {
            request_id: RequestId(row.request_id),
            run_id: RunId(row.run_id),
            stage_name: row.stage_name,
            deadline: row.deadline,
            disposition,
            decided_by: row.decided_by,
            created_at: row.created_at,
            decided_at: row.decided_at,
        })
    }

    fn row_to_binding(row: TagBindingRow) -> StorageResult<TagBinding> {
        Ok(TagBinding {
            env: row.env,
            tag: row.tag,
            digest: ImageDigest::try_from(row.digest)?,
            seq: row.seq,
            bound_by: row.bound_by,
            bound_at: row.bound_at,
        })
    }

    async fn latest_binding(&self, env: &str, tag: &str) -> StorageResult<Option<TagBindingRow>> {
        let env_owned = env.to_string();
        let tag_owned = tag.to_string();
        let mut res = self
            .db
            .query(
                "SELECT * FROM tag_bindings WHERE env = $env AND tag = $tag \
                 ORDER BY seq DESC LIMIT 1",
            )
            .bind(("env", env_owned))
            .bind(("tag", tag_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<TagBindingRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.into_iter().next())
    }

    async fn require_env(&self, env: &str) -> StorageResult<()> {
        if !self.env_exists(env).await? {
            return Err(StorageError::EnvNotFound {
                env: env.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RunStore for SurrealStore {
    async fn create_run(
        &self,
        pipeline: &PipelineRecord,
        initiator: &str,
    ) -> StorageResult<RunRecord> {
        let run_id = RunId::new();
        let row = RunRow::new(
            run_id.0.clone(),
            pipeline.pipeline_id.0.clone(),
            pipeline.digest.clone(),
            initiator.to_string(),
        );

        debug!(run_id = %run_id, "creating run");

        let record = Self::row_to_run(row.clone())?;
        let _created: Option<RunRow> = self
            .db
            .create("runs")
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(record)
    }

    async fn transition(&self, run_id: &RunId, to: RunState) -> StorageResult<()> {
        let mut row = self.fetch_active(&run_id.0).await?;
        let from = RunState::from_str(&row.state)?;
        if to.is_terminal() || !RunState::can_transition(from, to) {
            return Err(StorageError::InvalidTransition {
                run_id: run_id.0.clone(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        row.state = to.as_str().to_string();
        self.update_run(&run_id.0, row).await
    }

    async fn complete_run(&self, run_id: &RunId) -> StorageResult<()> {
        self.finish_run(run_id, RunState::Succeeded, None).await
    }

    async fn fail_run(&self, run_id: &RunId, failure: RunFailure) -> StorageResult<()> {
        self.finish_run(run_id, RunState::Failed, Some(failure)).await
    }

    async fn abort_run(&self, run_id: &RunId) -> StorageResult<()> {
        self.finish_run(run_id, RunState::Aborted, None).await
    }

    async fn append_stage_result(
        &self,
        run_id: &RunId,
        result: StageResultRecord,
    ) -> StorageResult<()> {
        self.fetch_active(&run_id.0).await?;

        let existing = self.get_stage_results(run_id).await?;
        let expected = existing.len() as u64 + 1;
        if result.seq != expected {
            return Err(StorageError::Backend(format!(
                "stage result seq {} out of order (expected {})",
                result.seq, expected
            )));
        }

        let row = StageResultRow {
            run_id: run_id.0.clone(),
            seq: result.seq,
            stage_name: result.stage_name,
            outcome: result.outcome.as_str().to_string(),
            attempts: result.attempts,
            error_kind: result.error_kind,
            output: result.output,
            started_at: result.started_at,
            finished_at: result.finished_at,
        };

        let _created: Option<StageResultRow> = self
            .db
            .create("stage_results")
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let row = self.fetch_run(&run_id.0).await?;
        Self::row_to_run(row)
    }

    async fn get_stage_results(&self, run_id: &RunId) -> StorageResult<Vec<StageResultRecord>> {
        self.fetch_run(&run_id.0).await?;

        let rid_owned = run_id.0.clone();
        let mut res = self
            .db
            .query("SELECT * FROM stage_results WHERE run_id = $rid ORDER BY seq ASC")
            .bind(("rid", rid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<StageResultRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter().map(Self::row_to_result).collect()
    }

    async fn list_runs(&self, pipeline_id: Option<&PipelineId>) -> StorageResult<Vec<RunRecord>> {
        let rows: Vec<RunRow> = if let Some(pid) = pipeline_id {
            let pid_owned = pid.0.clone();
            let mut res = self
                .db
                .query("SELECT * FROM runs WHERE pipeline_id = $pid ORDER BY created_at DESC")
                .bind(("pid", pid_owned))
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))?
        } else {
            let mut res = self
                .db
                .query("SELECT * FROM runs ORDER BY created_at DESC")
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))?
        };

        rows.into_iter().map(Self::row_to_run).collect()
    }

    async fn put_approval(&self, approval: ApprovalRecord) -> StorageResult<()> {
        self.fetch_active(&approval.run_id.0).await?;

        if self
            .approval_for_stage(&approval.run_id, &approval.stage_name)
            .await?
            .is_some()
        {
            return Err(StorageError::Backend(format!(
                "approval request already exists for stage {}",
                approval.stage_name
            )));
        }

        let row = ApprovalRow {
            request_id: approval.request_id.0,
            run_id: approval.run_id.0,
            stage_name: approval.stage_name,
            deadline: approval.deadline,
            disposition: approval.disposition.map(|d| d.as_str().to_string()),
            decided_by: approval.decided_by,
            created_at: approval.created_at,
            decided_at: approval.decided_at,
        };

        let _created: Option<ApprovalRow> = self
            .db
            .create("approvals")
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn get_approval(&self, request_id: &RequestId) -> StorageResult<ApprovalRecord> {
        let row = self.fetch_approval(&request_id.0).await?;
        Self::row_to_approval(row)
    }

    async fn approval_for_stage(
        &self,
        run_id: &RunId,
        stage_name: &str,
    ) -> StorageResult<Option<ApprovalRecord>> {
        let rid_owned = run_id.0.clone();
        let stage_owned = stage_name.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM approvals WHERE run_id = $rid AND stage_name = $stage")
            .bind(("rid", rid_owned))
            .bind(("stage", stage_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<ApprovalRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter().next().map(Self::row_to_approval).transpose()
    }

    async fn resolve_approval(
        &self,
        request_id: &RequestId,
        disposition: Disposition,
        decided_by: &str,
    ) -> StorageResult<ApprovalRecord> {
        let mut row = self.fetch_approval(&request_id.0).await?;
        if row.disposition.is_some() {
            return Err(StorageError::ApprovalAlreadyDecided {
                request_id: request_id.0.clone(),
            });
        }
        row.disposition = Some(disposition.as_str().to_string());
        row.decided_by = Some(decided_by.to_string());
        row.decided_at = Some(Utc::now());

        let req_owned = request_id.0.clone();
        self.db
            .query("UPDATE approvals CONTENT $row WHERE request_id = $req")
            .bind(("row", row.clone()))
            .bind(("req", req_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Self::row_to_approval(row)
    }
}

#[async_trait]
impl PipelineStore for SurrealStore {
    async fn put_pipeline(
        &self,
        definition: serde_json::Value,
        digest: &str,
    ) -> StorageResult<PipelineRecord> {
        // Idempotent per digest: return the existing record if present.
        let digest_owned = digest.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM pipelines WHERE digest = $digest")
            .bind(("digest", digest_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows: Vec<PipelineRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        if let Some(existing) = rows.into_iter().next() {
            return Ok(PipelineRecord {
                pipeline_id: PipelineId(existing.pipeline_id),
                digest: existing.digest,
                definition: existing.definition,
                created_at: existing.created_at,
            });
        }

        let row = PipelineRow {
            pipeline_id: PipelineId::new().0,
            digest: digest.to_string(),
            definition,
            created_at: Utc::now(),
        };
        let record = PipelineRecord {
            pipeline_id: PipelineId(row.pipeline_id.clone()),
            digest: row.digest.clone(),
            definition: row.definition.clone(),
            created_at: row.created_at,
        };

        let _created: Option<PipelineRow> = self
            .db
            .create("pipelines")
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(record)
    }

    async fn get_pipeline(&self, pipeline_id: &PipelineId) -> StorageResult<PipelineRecord> {
        let pid_owned = pipeline_id.0.clone();
        let mut res = self
            .db
            .query("SELECT * FROM pipelines WHERE pipeline_id = $pid")
            .bind(("pid", pid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<PipelineRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter()
            .next()
            .map(|row| PipelineRecord {
                pipeline_id: PipelineId(row.pipeline_id),
                digest: row.digest,
                definition: row.definition,
                created_at: row.created_at,
            })
            .ok_or_else(|| StorageError::PipelineNotFound {
                pipeline_id: pipeline_id.0.clone(),
            })
    }

    async fn list_pipelines(&self) -> StorageResult<Vec<PipelineRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM pipelines ORDER BY created_at DESC")
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<PipelineRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| PipelineRecord {
                pipeline_id: PipelineId(row.pipeline_id),
                digest: row.digest,
                definition: row.definition,
                created_at: row.created_at,
            })
            .collect())
    }
}

#[async_trait]
impl TagStore for SurrealStore {
    async fn create_env(&self, name: &str) -> StorageResult<()> {
        if self.env_exists(name).await? {
            return Ok(());
        }
        let row = EnvRow {
            name: name.to_string(),
            created_at: Utc::now(),
        };
        let _created: Option<EnvRow> = self
            .db
            .create("environments")
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn env_exists(&self, name: &str) -> StorageResult<bool> {
        let name_owned = name.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM environments WHERE name = $name")
            .bind(("name", name_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows: Vec<EnvRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(!rows.is_empty())
    }

    async fn resolve(&self, env: &str, tag: &str) -> StorageResult<ImageDigest> {
        self.require_env(env).await?;
        let row = self
            .latest_binding(env, tag)
            .await?
            .ok_or_else(|| StorageError::TagNotFound {
                env: env.to_string(),
                tag: tag.to_string(),
            })?;
        ImageDigest::try_from(row.digest)
    }

    async fn bind(
        &self,
        env: &str,
        tag: &str,
        digest: &ImageDigest,
        bound_by: &str,
    ) -> StorageResult<TagBinding> {
        self.require_env(env).await?;
        let seq = self
            .latest_binding(env, tag)
            .await?
            .map(|b| b.seq + 1)
            .unwrap_or(1);

        let row = TagBindingRow {
            env: env.to_string(),
            tag: tag.to_string(),
            digest: digest.as_str().to_string(),
            seq,
            bound_by: bound_by.to_string(),
            bound_at: Utc::now(),
        };
        let binding = Self::row_to_binding(row.clone())?;

        let _created: Option<TagBindingRow> = self
            .db
            .create("tag_bindings")
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(binding)
    }

    async fn history(&self, env: &str, tag: &str) -> StorageResult<Vec<TagBinding>> {
        self.require_env(env).await?;
        let env_owned = env.to_string();
        let tag_owned = tag.to_string();
        let mut res = self
            .db
            .query(
                "SELECT * FROM tag_bindings WHERE env = $env AND tag = $tag ORDER BY seq DESC",
            )
            .bind(("env", env_owned))
            .bind(("tag", tag_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<TagBindingRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter().map(Self::row_to_binding).collect()
    }
}
