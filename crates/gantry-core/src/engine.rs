//! Pipeline engine: owns run execution from start to terminal state.
//!
//! Each run is driven by one spawned task. Stages execute strictly in
//! order; the first non-succeeded stage ends the run. Every stage result
//! is committed to the run store before the next stage starts, so a run
//! interrupted by a crash resumes from its last committed result (stages
//! execute at least once).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{error, info, warn};

use gantry_state::{
    ApprovalRecord, Disposition, PipelineId, PipelineRecord, PipelineStore, RequestId, RunFailure,
    RunId, RunRecord, RunState, RunStore, StageOutcome, StageResultRecord, StorageError,
};

use crate::action::CommandAction;
use crate::approval::{ApprovalGate, Decision};
use crate::error::{from_lookup, Error, Result};
use crate::executor::{self, ExecutionReport};
use crate::identity::{Identity, PolicyStore};
use crate::pipeline::{PipelineDefinition, StageKind, StageSpec};
use crate::registry::ArtifactRegistry;

/// Point-in-time view of a run: its record, committed stage results, and
/// the pending approval request if the run is blocked on one.
#[derive(Debug)]
pub struct RunStatus {
    pub run: RunRecord,
    pub results: Vec<StageResultRecord>,
    pub pending_approval: Option<ApprovalRecord>,
}

struct RunHandle {
    abort_tx: watch::Sender<bool>,
    done: Arc<Notify>,
}

pub struct PipelineEngine {
    runs: Arc<dyn RunStore>,
    pipelines: Arc<dyn PipelineStore>,
    registry: Arc<ArtifactRegistry>,
    gate: ApprovalGate,
    active: Mutex<HashMap<String, RunHandle>>,
    approvals_tx: broadcast::Sender<ApprovalRecord>,
}

impl PipelineEngine {
    pub fn new(
        runs: Arc<dyn RunStore>,
        pipelines: Arc<dyn PipelineStore>,
        registry: Arc<ArtifactRegistry>,
    ) -> Self {
        let (approvals_tx, _) = broadcast::channel(64);
        Self {
            runs,
            pipelines,
            registry,
            gate: ApprovalGate::new(),
            active: Mutex::new(HashMap::new()),
            approvals_tx,
        }
    }

    /// Convenience constructor wiring the registry from its parts.
    pub fn with_stores(
        runs: Arc<dyn RunStore>,
        pipelines: Arc<dyn PipelineStore>,
        tags: Arc<dyn gantry_state::TagStore>,
        policy: Arc<PolicyStore>,
    ) -> Self {
        Self::new(runs, pipelines, Arc::new(ArtifactRegistry::new(tags, policy)))
    }

    pub fn registry(&self) -> &ArtifactRegistry {
        &self.registry
    }

    /// Validate and store a pipeline definition. Idempotent per content
    /// digest.
    pub async fn register_pipeline(&self, definition: &PipelineDefinition) -> Result<PipelineRecord> {
        definition.validate()?;
        let digest = definition.digest();
        let value = serde_json::to_value(definition)
            .map_err(|e| Error::InvalidPipeline(e.to_string()))?;
        let record = self
            .pipelines
            .put_pipeline(value, &digest)
            .await
            .map_err(from_lookup)?;
        info!(pipeline_id = %record.pipeline_id, name = definition.name, "pipeline registered");
        Ok(record)
    }

    pub async fn get_pipeline(&self, pipeline_id: &PipelineId) -> Result<PipelineRecord> {
        self.pipelines.get_pipeline(pipeline_id).await.map_err(from_lookup)
    }

    pub async fn list_pipelines(&self) -> Result<Vec<PipelineRecord>> {
        self.pipelines.list_pipelines().await.map_err(from_lookup)
    }

    /// Start a new run of a stored pipeline. Returns once the run record
    /// exists; execution proceeds in a background task.
    pub async fn start(self: &Arc<Self>, pipeline_id: &PipelineId, initiator: Identity) -> Result<RunId> {
        let record = self.get_pipeline(pipeline_id).await?;
        let definition: PipelineDefinition = serde_json::from_value(record.definition.clone())
            .map_err(|e| Error::InvalidPipeline(e.to_string()))?;

        let run = self
            .runs
            .create_run(&record, initiator.as_str())
            .await
            .map_err(from_lookup)?;
        info!(run_id = %run.run_id, pipeline = definition.name, initiator = %initiator, "run started");

        self.spawn_run(run.run_id.clone(), definition, 0, initiator);
        Ok(run.run_id)
    }

    /// Resume an interrupted run from its last committed stage result.
    ///
    /// The stage after the last committed result executes again from
    /// scratch. An approval stage with an open request re-arms against the
    /// original deadline; one already decided has its disposition applied
    /// without waiting.
    pub async fn resume(self: &Arc<Self>, run_id: &RunId) -> Result<()> {
        if self.active.lock().unwrap().contains_key(&run_id.0) {
            return Err(Error::NotResumable {
                run_id: run_id.0.clone(),
                state: "active".to_string(),
            });
        }

        let run = self.runs.get_run(run_id).await.map_err(from_lookup)?;
        if run.state.is_terminal() {
            return Err(Error::NotResumable {
                run_id: run_id.0.clone(),
                state: run.state.to_string(),
            });
        }

        let record = self.get_pipeline(&run.pipeline_id).await?;
        let definition: PipelineDefinition = serde_json::from_value(record.definition.clone())
            .map_err(|e| Error::InvalidPipeline(e.to_string()))?;

        let results = self.runs.get_stage_results(run_id).await.map_err(from_lookup)?;
        let skip = results.len();

        // The acting identity for later stages is the most recent approver
        // among the already-completed gates, else the initiator.
        let mut actor = Identity::new(run.initiator.clone());
        for stage in definition.stages.iter().take(skip) {
            if matches!(stage.kind, StageKind::Approval) {
                if let Some(approval) = self
                    .runs
                    .approval_for_stage(run_id, &stage.name)
                    .await
                    .map_err(from_lookup)?
                {
                    if approval.disposition == Some(Disposition::Approved) {
                        if let Some(who) = approval.decided_by {
                            actor = Identity::new(who);
                        }
                    }
                }
            }
        }

        info!(run_id = %run_id, skip, "resuming run");
        self.spawn_run(run_id.clone(), definition, skip, actor);
        Ok(())
    }

    /// Request an abort. Takes effect at the next stage boundary, or
    /// immediately for a stage blocked on a command, timeout, or approval.
    pub async fn abort(&self, run_id: &RunId) -> Result<()> {
        let sent = {
            let active = self.active.lock().unwrap();
            match active.get(&run_id.0) {
                Some(handle) => handle.abort_tx.send(true).is_ok(),
                None => false,
            }
        };
        if sent {
            info!(run_id = %run_id, "abort requested");
            return Ok(());
        }
        // Not actively driven here: abort the stored record directly.
        self.runs.abort_run(run_id).await.map_err(from_lookup)?;
        info!(run_id = %run_id, "inactive run aborted");
        Ok(())
    }

    /// Deliver a decision on a pending approval request. Exactly one
    /// decision per request ever takes effect.
    pub async fn decide(
        &self,
        run_id: &RunId,
        request_id: &RequestId,
        decision: Decision,
        decided_by: Identity,
    ) -> Result<()> {
        let record = self.runs.get_approval(request_id).await.map_err(from_lookup)?;
        if record.run_id != *run_id {
            return Err(Error::NotFound(format!(
                "approval request {request_id} on run {run_id}"
            )));
        }
        if !record.is_open() {
            return Err(Error::AlreadyDecided(request_id.0.clone()));
        }
        self.gate.decide(request_id, decision, decided_by)
    }

    pub async fn status(&self, run_id: &RunId) -> Result<RunStatus> {
        let run = self.runs.get_run(run_id).await.map_err(from_lookup)?;
        let results = self.runs.get_stage_results(run_id).await.map_err(from_lookup)?;

        let mut pending_approval = None;
        if run.state == RunState::AwaitingApproval {
            // The blocked stage is the one after the last committed result.
            let record = self.get_pipeline(&run.pipeline_id).await?;
            let definition: PipelineDefinition =
                serde_json::from_value(record.definition.clone())
                    .map_err(|e| Error::InvalidPipeline(e.to_string()))?;
            if let Some(stage) = definition.stages.get(results.len()) {
                pending_approval = self
                    .runs
                    .approval_for_stage(run_id, &stage.name)
                    .await
                    .map_err(from_lookup)?
                    .filter(|a| a.is_open());
            }
        }

        Ok(RunStatus {
            run,
            results,
            pending_approval,
        })
    }

    pub async fn list_runs(&self, pipeline_id: Option<&PipelineId>) -> Result<Vec<RunRecord>> {
        self.runs.list_runs(pipeline_id).await.map_err(from_lookup)
    }

    /// Subscribe to newly opened approval requests across all runs.
    pub fn subscribe_approvals(&self) -> broadcast::Receiver<ApprovalRecord> {
        self.approvals_tx.subscribe()
    }

    /// Wait until the run reaches a terminal state and return its record.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunRecord> {
        loop {
            let done = {
                let active = self.active.lock().unwrap();
                active.get(&run_id.0).map(|h| h.done.clone())
            };
            match done {
                Some(done) => {
                    let notified = done.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    let run = self.runs.get_run(run_id).await.map_err(from_lookup)?;
                    if run.state.is_terminal() {
                        return Ok(run);
                    }
                    notified.await;
                }
                None => {
                    let run = self.runs.get_run(run_id).await.map_err(from_lookup)?;
                    if run.state.is_terminal() {
                        return Ok(run);
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            }
        }
    }

    fn spawn_run(
        self: &Arc<Self>,
        run_id: RunId,
        definition: PipelineDefinition,
        skip: usize,
        actor: Identity,
    ) {
        let (abort_tx, abort_rx) = watch::channel(false);
        let done = Arc::new(Notify::new());
        self.active.lock().unwrap().insert(
            run_id.0.clone(),
            RunHandle {
                abort_tx,
                done: done.clone(),
            },
        );

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine
                .drive(&run_id, &definition, skip, actor, abort_rx)
                .await
            {
                error!(run_id = %run_id, error = %e, "run driver failed");
                let failure = RunFailure {
                    stage: String::new(),
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                };
                if let Err(e) = engine.runs.fail_run(&run_id, failure).await {
                    error!(run_id = %run_id, error = %e, "could not record run failure");
                }
            }
            engine.active.lock().unwrap().remove(&run_id.0);
            done.notify_waiters();
        });
    }

    async fn drive(
        &self,
        run_id: &RunId,
        definition: &PipelineDefinition,
        skip: usize,
        mut actor: Identity,
        mut abort: watch::Receiver<bool>,
    ) -> Result<()> {
        self.runs
            .transition(run_id, RunState::Running)
            .await
            .map_err(from_lookup)?;

        for (idx, stage) in definition.stages.iter().enumerate().skip(skip) {
            if *abort.borrow() {
                self.runs.abort_run(run_id).await.map_err(from_lookup)?;
                info!(run_id = %run_id, stage = stage.name, "run aborted at stage boundary");
                return Ok(());
            }

            let seq = (idx + 1) as u64;
            let ended = match &stage.kind {
                StageKind::Build { command }
                | StageKind::Deploy { command }
                | StageKind::Test { command } => {
                    self.run_command_stage(run_id, stage, seq, command, &mut abort)
                        .await?
                }
                StageKind::Approval => {
                    match self
                        .run_approval_stage(run_id, stage, seq, &mut abort)
                        .await?
                    {
                        Some(approver) => {
                            actor = approver;
                            false
                        }
                        None => true,
                    }
                }
                StageKind::Promote {
                    source_env,
                    source_tag,
                    target_env,
                    target_tag,
                } => {
                    self.run_promote_stage(
                        run_id, stage, seq, source_env, source_tag, target_env, target_tag,
                        &actor,
                    )
                    .await?
                }
            };

            if ended {
                return Ok(());
            }
        }

        self.runs.complete_run(run_id).await.map_err(from_lookup)?;
        info!(run_id = %run_id, "run succeeded");
        Ok(())
    }

    /// Returns true if the stage ended the run.
    async fn run_command_stage(
        &self,
        run_id: &RunId,
        stage: &StageSpec,
        seq: u64,
        command: &[String],
        abort: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        let started_at = Utc::now();
        let action = CommandAction::new(command)?;
        let report = match executor::run_stage(
            &stage.name,
            &action,
            stage.timeout(),
            stage.retry,
            abort,
        )
        .await
        {
            Ok(report) => report,
            Err(Error::Aborted) => {
                // No stage result is committed for an aborted attempt; the
                // run record alone marks the abort.
                self.runs.abort_run(run_id).await.map_err(from_lookup)?;
                info!(run_id = %run_id, stage = stage.name, "run aborted mid-stage");
                return Ok(true);
            }
            Err(other) => return Err(other),
        };

        self.commit_report(run_id, stage, seq, started_at, report).await
    }

    /// Returns the approver on approval, `None` if the run ended.
    /// (Approved is the only outcome that lets the run continue.)
    async fn run_approval_stage(
        &self,
        run_id: &RunId,
        stage: &StageSpec,
        seq: u64,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<Option<Identity>> {
        let started_at = Utc::now();

        // Reuse the persisted request on resume; otherwise open a new one.
        // The gate waiter is registered before the request becomes visible
        // to deciders, so a prompt decision always finds it.
        let existing = self
            .runs
            .approval_for_stage(run_id, &stage.name)
            .await
            .map_err(from_lookup)?;
        let (record, waiter) = match existing {
            Some(existing) if existing.is_open() => {
                let rx = self.gate.open(&existing.request_id);
                (existing, Some(rx))
            }
            // A decision recorded before a crash is applied without waiting.
            Some(decided) => (decided, None),
            None => {
                let timeout = stage
                    .timeout()
                    .ok_or_else(|| Error::InvalidPipeline(format!(
                        "approval stage {} has no timeout",
                        stage.name
                    )))?;
                let record = ApprovalRecord {
                    request_id: RequestId::new(),
                    run_id: run_id.clone(),
                    stage_name: stage.name.clone(),
                    deadline: Utc::now()
                        + chrono::Duration::from_std(timeout)
                            .unwrap_or_else(|_| chrono::Duration::seconds(0)),
                    disposition: None,
                    decided_by: None,
                    created_at: Utc::now(),
                    decided_at: None,
                };
                self.runs
                    .put_approval(record.clone())
                    .await
                    .map_err(from_lookup)?;
                let rx = self.gate.open(&record.request_id);
                let _ = self.approvals_tx.send(record.clone());
                (record, Some(rx))
            }
        };

        let record = match waiter {
            Some(rx) => self.await_decision(run_id, record, rx, abort).await?,
            None => record,
        };

        let Some(record) = record.disposition.map(|d| (d, record.clone())) else {
            // Aborted while waiting.
            return Ok(None);
        };
        let (disposition, record) = record;

        let decided_by = record.decided_by.clone().unwrap_or_else(|| "system".to_string());
        let (outcome, error_kind, output) = match disposition {
            Disposition::Approved => (
                StageOutcome::Succeeded,
                None,
                format!("approved by {decided_by}"),
            ),
            Disposition::Rejected => (
                StageOutcome::Rejected,
                Some("rejected".to_string()),
                format!("rejected by {decided_by}"),
            ),
            Disposition::Expired => (
                StageOutcome::TimedOut,
                Some("timeout".to_string()),
                "approval deadline expired".to_string(),
            ),
        };

        self.runs
            .append_stage_result(
                run_id,
                StageResultRecord {
                    seq,
                    stage_name: stage.name.clone(),
                    outcome,
                    attempts: 1,
                    error_kind: error_kind.clone(),
                    output: output.clone(),
                    started_at,
                    finished_at: Utc::now(),
                },
            )
            .await
            .map_err(from_lookup)?;

        match disposition {
            Disposition::Approved => {
                info!(run_id = %run_id, stage = stage.name, approver = decided_by, "gate approved");
                Ok(Some(Identity::new(decided_by)))
            }
            _ => {
                warn!(run_id = %run_id, stage = stage.name, disposition = %disposition, "gate closed the run");
                self.runs
                    .fail_run(
                        run_id,
                        RunFailure {
                            stage: stage.name.clone(),
                            kind: error_kind.unwrap_or_else(|| "rejected".to_string()),
                            message: output,
                        },
                    )
                    .await
                    .map_err(from_lookup)?;
                Ok(None)
            }
        }
    }

    /// Block until the open request is decided, expires, or the run is
    /// aborted. Returns the record with its disposition set, or with no
    /// disposition if the run was aborted.
    async fn await_decision(
        &self,
        run_id: &RunId,
        record: ApprovalRecord,
        rx: tokio::sync::oneshot::Receiver<(Decision, Identity)>,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<ApprovalRecord> {
        if let Err(e) = self.runs.transition(run_id, RunState::AwaitingApproval).await {
            self.gate.close(&record.request_id);
            return Err(from_lookup(e));
        }

        let remaining = (record.deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        let resolved = tokio::select! {
            decided = rx => match decided {
                Ok((Decision::Approve, who)) => Some((Disposition::Approved, who.0)),
                Ok((Decision::Reject, who)) => Some((Disposition::Rejected, who.0)),
                // Waiter replaced; treat as expiry.
                Err(_) => Some((Disposition::Expired, "system".to_string())),
            },
            _ = tokio::time::sleep(remaining) => {
                Some((Disposition::Expired, "system".to_string()))
            }
            _ = wait_for_abort(abort) => None,
        };

        self.gate.close(&record.request_id);

        match resolved {
            Some((disposition, who)) => {
                let record = self
                    .runs
                    .resolve_approval(&record.request_id, disposition, &who)
                    .await
                    .map_err(from_lookup)?;
                self.runs
                    .transition(run_id, RunState::Running)
                    .await
                    .map_err(from_lookup)?;
                Ok(record)
            }
            None => {
                // The request is closed alongside the run so it cannot be
                // decided later. A decision that raced the abort is fine.
                if let Err(e) = self
                    .runs
                    .resolve_approval(&record.request_id, Disposition::Expired, "system")
                    .await
                {
                    if !matches!(e, StorageError::ApprovalAlreadyDecided { .. }) {
                        return Err(from_lookup(e));
                    }
                }
                self.runs.abort_run(run_id).await.map_err(from_lookup)?;
                info!(run_id = %run_id, "run aborted while awaiting approval");
                Ok(ApprovalRecord {
                    disposition: None,
                    ..record
                })
            }
        }
    }

    /// Returns true if the stage ended the run.
    #[allow(clippy::too_many_arguments)]
    async fn run_promote_stage(
        &self,
        run_id: &RunId,
        stage: &StageSpec,
        seq: u64,
        source_env: &str,
        source_tag: &str,
        target_env: &str,
        target_tag: &str,
        actor: &Identity,
    ) -> Result<bool> {
        let started_at = Utc::now();
        let report = match self
            .registry
            .promote(source_env, source_tag, target_env, target_tag, actor)
            .await
        {
            Ok(digest) => ExecutionReport {
                outcome: StageOutcome::Succeeded,
                attempts: 1,
                error_kind: None,
                message: None,
                output: Some(digest.to_string()),
            },
            Err(err) => ExecutionReport {
                outcome: StageOutcome::Failed,
                attempts: 1,
                error_kind: Some(err.kind().to_string()),
                message: Some(err.to_string()),
                output: None,
            },
        };
        self.commit_report(run_id, stage, seq, started_at, report).await
    }

    /// Commit a stage result, failing the run if the stage did not
    /// succeed. Returns true if the stage ended the run.
    async fn commit_report(
        &self,
        run_id: &RunId,
        stage: &StageSpec,
        seq: u64,
        started_at: chrono::DateTime<Utc>,
        report: ExecutionReport,
    ) -> Result<bool> {
        self.runs
            .append_stage_result(
                run_id,
                StageResultRecord {
                    seq,
                    stage_name: stage.name.clone(),
                    outcome: report.outcome,
                    attempts: report.attempts,
                    error_kind: report.error_kind.clone(),
                    output: report.output.unwrap_or_default(),
                    started_at,
                    finished_at: Utc::now(),
                },
            )
            .await
            .map_err(from_lookup)?;

        if report.outcome == StageOutcome::Succeeded {
            info!(run_id = %run_id, stage = stage.name, "stage succeeded");
            return Ok(false);
        }

        let failure = RunFailure {
            stage: stage.name.clone(),
            kind: report
                .error_kind
                .unwrap_or_else(|| report.outcome.as_str().to_string()),
            message: report.message.unwrap_or_default(),
        };
        warn!(run_id = %run_id, stage = stage.name, kind = failure.kind, "stage failed, ending run");
        self.runs.fail_run(run_id, failure).await.map_err(from_lookup)?;
        Ok(true)
    }
}

async fn wait_for_abort(abort: &mut watch::Receiver<bool>) {
    while !*abort.borrow() {
        if abort.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}
