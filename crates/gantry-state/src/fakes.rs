//! In-memory fakes for storage traits
//!
//! Provides `MemoryRunStore`, `MemoryPipelineStore`, and `MemoryTagStore`
//! that satisfy the trait contracts without any external dependencies.
//! They back the tests and the default in-process engine.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::store_traits::*;

// ---------------------------------------------------------------------------
// MemoryRunStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunSlot {
    record: RunRecord,
    results: Vec<StageResultRecord>,
    approvals: Vec<ApprovalRecord>,
}

/// In-memory run store backed by a `HashMap<RunId, RunSlot>`.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<String, RunSlot>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_active<T>(
        &self,
        run_id: &RunId,
        f: impl FnOnce(&mut RunSlot) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut runs = self.runs.lock().unwrap();
        let slot = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        if slot.record.state.is_terminal() {
            return Err(StorageError::RunNotActive {
                run_id: run_id.0.clone(),
                state: slot.record.state.to_string(),
            });
        }
        f(slot)
    }

    fn terminal(&self, run_id: &RunId, to: RunState, failure: Option<RunFailure>) -> StorageResult<()> {
        self.with_active(run_id, |slot| {
            let from = slot.record.state;
            if !RunState::can_transition(from, to) {
                return Err(StorageError::InvalidTransition {
                    run_id: run_id.0.clone(),
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            slot.record.state = to;
            slot.record.failure = failure;
            slot.record.finished_at = Some(Utc::now());
            Ok(())
        })
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(
        &self,
        pipeline: &PipelineRecord,
        initiator: &str,
    ) -> StorageResult<RunRecord> {
        let record = RunRecord {
            run_id: RunId::new(),
            pipeline_id: pipeline.pipeline_id.clone(),
            pipeline_digest: pipeline.digest.clone(),
            initiator: initiator.to_string(),
            state: RunState::Pending,
            failure: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        let mut runs = self.runs.lock().unwrap();
        runs.insert(
            record.run_id.0.clone(),
            RunSlot {
                record: record.clone(),
                results: Vec::new(),
                approvals: Vec::new(),
            },
        );
        Ok(record)
    }

    async fn transition(&self, run_id: &RunId, to: RunState) -> StorageResult<()> {
        if to.is_terminal() {
            return Err(StorageError::InvalidTransition {
                run_id: run_id.0.clone(),
                from: "?".to_string(),
                to: to.to_string(),
            });
        }
        self.with_active(run_id, |slot| {
            let from = slot.record.state;
            if !RunState::can_transition(from, to) {
                return Err(StorageError::InvalidTransition {
                    run_id: run_id.0.clone(),
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            slot.record.state = to;
            Ok(())
        })
    }

    async fn complete_run(&self, run_id: &RunId) -> StorageResult<()> {
        self.terminal(run_id, RunState::Succeeded, None)
    }

    async fn fail_run(&self, run_id: &RunId, failure: RunFailure) -> StorageResult<()> {
        self.terminal(run_id, RunState::Failed, Some(failure))
    }

    async fn abort_run(&self, run_id: &RunId) -> StorageResult<()> {
        self.terminal(run_id, RunState::Aborted, None)
    }

    async fn append_stage_result(
        &self,
        run_id: &RunId,
        result: StageResultRecord,
    ) -> StorageResult<()> {
        self.with_active(run_id, |slot| {
            let expected = slot.results.len() as u64 + 1;
            if result.seq != expected {
                return Err(StorageError::Backend(format!(
                    "stage result seq {} out of order (expected {})",
                    result.seq, expected
                )));
            }
            slot.results.push(result);
            Ok(())
        })
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let runs = self.runs.lock().unwrap();
        runs.get(&run_id.0)
            .map(|s| s.record.clone())
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn get_stage_results(&self, run_id: &RunId) -> StorageResult<Vec<StageResultRecord>> {
        let runs = self.runs.lock().unwrap();
        let slot = runs
            .get(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        Ok(slot.results.clone())
    }

    async fn list_runs(&self, pipeline_id: Option<&PipelineId>) -> StorageResult<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap();
        let mut records: Vec<RunRecord> = runs
            .values()
            .filter(|s| {
                pipeline_id
                    .map(|p| s.record.pipeline_id == *p)
                    .unwrap_or(true)
            })
            .map(|s| s.record.clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn put_approval(&self, approval: ApprovalRecord) -> StorageResult<()> {
        let run_id = approval.run_id.clone();
        self.with_active(&run_id, |slot| {
            if slot
                .approvals
                .iter()
                .any(|a| a.stage_name == approval.stage_name)
            {
                return Err(StorageError::Backend(format!(
                    "approval request already exists for stage {}",
                    approval.stage_name
                )));
            }
            slot.approvals.push(approval);
            Ok(())
        })
    }

    async fn get_approval(&self, request_id: &RequestId) -> StorageResult<ApprovalRecord> {
        let runs = self.runs.lock().unwrap();
        runs.values()
            .flat_map(|s| s.approvals.iter())
            .find(|a| a.request_id == *request_id)
            .cloned()
            .ok_or_else(|| StorageError::ApprovalNotFound {
                request_id: request_id.0.clone(),
            })
    }

    async fn approval_for_stage(
        &self,
        run_id: &RunId,
        stage_name: &str,
    ) -> StorageResult<Option<ApprovalRecord>> {
        let runs = self.runs.lock().unwrap();
        let slot = runs
            .get(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        Ok(slot
            .approvals
            .iter()
            .find(|a| a.stage_name == stage_name)
            .cloned())
    }

    async fn resolve_approval(
        &self,
        request_id: &RequestId,
        disposition: Disposition,
        decided_by: &str,
    ) -> StorageResult<ApprovalRecord> {
        let mut runs = self.runs.lock().unwrap();
        let approval = runs
            .values_mut()
            .flat_map(|s| s.approvals.iter_mut())
            .find(|a| a.request_id == *request_id)
            .ok_or_else(|| StorageError::ApprovalNotFound {
                request_id: request_id.0.clone(),
            })?;
        if approval.disposition.is_some() {
            return Err(StorageError::ApprovalAlreadyDecided {
                request_id: request_id.0.clone(),
            });
        }
        approval.disposition = Some(disposition);
        approval.decided_by = Some(decided_by.to_string());
        approval.decided_at = Some(Utc::now());
        Ok(approval.clone())
    }
}

// ---------------------------------------------------------------------------
// MemoryPipelineStore
// ---------------------------------------------------------------------------

/// In-memory pipeline store, idempotent per content digest.
#[derive(Debug, Default)]
pub struct MemoryPipelineStore {
    pipelines: Mutex<Vec<PipelineRecord>>,
}

impl MemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineStore for MemoryPipelineStore {
    async fn put_pipeline(
        &self,
        definition: serde_json::Value,
        digest: &str,
    ) -> StorageResult<PipelineRecord> {
        let mut pipelines = self.pipelines.lock().unwrap();
        if let Some(existing) = pipelines.iter().find(|p| p.digest == digest) {
            return Ok(existing.clone());
        }
        let record = PipelineRecord {
            pipeline_id: PipelineId::new(),
            digest: digest.to_string(),
            definition,
            created_at: Utc::now(),
        };
        pipelines.push(record.clone());
        Ok(record)
    }

    async fn get_pipeline(&self, pipeline_id: &PipelineId) -> StorageResult<PipelineRecord> {
        let pipelines = self.pipelines.lock().unwrap();
        pipelines
            .iter()
            .find(|p| p.pipeline_id == *pipeline_id)
            .cloned()
            .ok_or_else(|| StorageError::PipelineNotFound {
                pipeline_id: pipeline_id.0.clone(),
            })
    }

    async fn list_pipelines(&self) -> StorageResult<Vec<PipelineRecord>> {
        let pipelines = self.pipelines.lock().unwrap();
        Ok(pipelines.clone())
    }
}

// ---------------------------------------------------------------------------
// MemoryTagStore
// ---------------------------------------------------------------------------

/// In-memory tag store: environments mapping tags to append-only binding
/// histories (newest last internally).
#[derive(Debug, Default)]
pub struct MemoryTagStore {
    envs: Mutex<HashMap<String, HashMap<String, Vec<TagBinding>>>>,
}

impl MemoryTagStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TagStore for MemoryTagStore {
    async fn create_env(&self, name: &str) -> StorageResult<()> {
        let mut envs = self.envs.lock().unwrap();
        envs.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn env_exists(&self, name: &str) -> StorageResult<bool> {
        let envs = self.envs.lock().unwrap();
        Ok(envs.contains_key(name))
    }

    async fn resolve(&self, env: &str, tag: &str) -> StorageResult<ImageDigest> {
        let envs = self.envs.lock().unwrap();
        let tags = envs.get(env).ok_or_else(|| StorageError::EnvNotFound {
            env: env.to_string(),
        })?;
        tags.get(tag)
            .and_then(|h| h.last())
            .map(|b| b.digest.clone())
            .ok_or_else(|| StorageError::TagNotFound {
                env: env.to_string(),
                tag: tag.to_string(),
            })
    }

    async fn bind(
        &self,
        env: &str,
        tag: &str,
        digest: &ImageDigest,
        bound_by: &str,
    ) -> StorageResult<TagBinding> {
        let mut envs = self.envs.lock().unwrap();
        let tags = envs.get_mut(env).ok_or_else(|| StorageError::EnvNotFound {
            env: env.to_string(),
        })?;
        let history = tags.entry(tag.to_string()).or_default();
        let binding = TagBinding {
            env: env.to_string(),
            tag: tag.to_string(),
            digest: digest.clone(),
            seq: history.len() as u64 + 1,
            bound_by: bound_by.to_string(),
            bound_at: Utc::now(),
        };
        history.push(binding.clone());
        Ok(binding)
    }

    async fn history(&self, env: &str, tag: &str) -> StorageResult<Vec<TagBinding>> {
        let envs = self.envs.lock().unwrap();
        let tags = envs.get(env).ok_or_else(|| StorageError::EnvNotFound {
            env: env.to_string(),
        })?;
        let mut history = tags.get(tag).cloned().unwrap_or_default();
        history.reverse(); // newest first
        Ok(history)
    }
}
