//! End-to-end engine tests against the in-memory stores.

use std::sync::Arc;
use std::time::Duration;

use gantry_core::{
    Decision, Disposition, Error, Identity, ImageDigest, Permission, PipelineDefinition,
    PipelineEngine, PolicyStore, RetryPolicy, RunState, StageKind, StageOutcome, StageSpec,
};
use gantry_state::fakes::{MemoryPipelineStore, MemoryRunStore, MemoryTagStore};
use gantry_state::{ApprovalRecord, RequestId, RunId, RunStore, StageResultRecord};

struct Harness {
    engine: Arc<PipelineEngine>,
    runs: Arc<MemoryRunStore>,
    policy: Arc<PolicyStore>,
}

fn harness() -> Harness {
    let runs = Arc::new(MemoryRunStore::new());
    let pipelines = Arc::new(MemoryPipelineStore::new());
    let tags = Arc::new(MemoryTagStore::new());
    let policy = Arc::new(PolicyStore::new());
    let engine = Arc::new(PipelineEngine::with_stores(
        runs.clone(),
        pipelines.clone(),
        tags,
        policy.clone(),
    ));
    Harness {
        engine,
        runs,
        policy,
    }
}

fn command_stage(name: &str, command: &[&str]) -> StageSpec {
    StageSpec {
        name: name.to_string(),
        kind: StageKind::Build {
            command: command.iter().map(|s| s.to_string()).collect(),
        },
        timeout_secs: None,
        retry: RetryPolicy::default(),
    }
}

fn approval_stage(name: &str, timeout_secs: u64) -> StageSpec {
    StageSpec {
        name: name.to_string(),
        kind: StageKind::Approval,
        timeout_secs: Some(timeout_secs),
        retry: RetryPolicy::default(),
    }
}

fn promote_stage(name: &str) -> StageSpec {
    StageSpec {
        name: name.to_string(),
        kind: StageKind::Promote {
            source_env: "staging".to_string(),
            source_tag: "candidate".to_string(),
            target_env: "prod".to_string(),
            target_tag: "current".to_string(),
        },
        timeout_secs: None,
        retry: RetryPolicy::default(),
    }
}

/// Seed staging:candidate and create prod. Returns the seeded digest.
async fn seed_artifact(h: &Harness) -> ImageDigest {
    let admin = Identity::new("admin");
    h.policy.grant(&admin, "staging", Permission::Deploy);
    let digest = ImageDigest::from_bytes(b"release-artifact");
    h.engine.registry().create_env("staging").await.unwrap();
    h.engine.registry().create_env("prod").await.unwrap();
    h.engine
        .registry()
        .set_tag("staging", "candidate", &digest, &admin)
        .await
        .unwrap();
    digest
}

#[tokio::test]
async fn gated_promotion_runs_to_success() {
    let h = harness();
    let digest = seed_artifact(&h).await;
    let releaser = Identity::new("releaser");
    h.policy.grant(&releaser, "prod", Permission::Promote);

    let def = PipelineDefinition {
        name: "release".to_string(),
        stages: vec![
            command_stage("build", &["echo", "built"]),
            approval_stage("hold-for-prod", 30),
            promote_stage("promote-prod"),
        ],
    };
    let pipeline = h.engine.register_pipeline(&def).await.unwrap();

    let mut approvals = h.engine.subscribe_approvals();
    let run_id = h
        .engine
        .start(&pipeline.pipeline_id, Identity::new("dev"))
        .await
        .unwrap();

    let request = approvals.recv().await.unwrap();
    assert_eq!(request.run_id, run_id);
    assert_eq!(request.stage_name, "hold-for-prod");

    h.engine
        .decide(&request.run_id, &request.request_id, Decision::Approve, releaser)
        .await
        .unwrap();

    let run = h.engine.wait(&run_id).await.unwrap();
    assert_eq!(run.state, RunState::Succeeded);

    let status = h.engine.status(&run_id).await.unwrap();
    assert_eq!(status.results.len(), 3);
    assert!(status
        .results
        .iter()
        .all(|r| r.outcome == StageOutcome::Succeeded));
    assert_eq!(status.results[0].output, "built");
    assert_eq!(status.results[1].output, "approved by releaser");
    assert_eq!(status.results[2].output, digest.to_string());

    // The promotion rebound prod:current to the staged digest.
    let current = h.engine.registry().resolve("prod", "current").await.unwrap();
    assert_eq!(current, digest);

    let approval = h.runs.get_approval(&request.request_id).await.unwrap();
    assert_eq!(approval.disposition, Some(Disposition::Approved));
    assert_eq!(approval.decided_by.as_deref(), Some("releaser"));
}

#[tokio::test]
async fn first_stage_gate_reaches_a_subscriber_taken_before_start() {
    let h = harness();
    seed_artifact(&h).await;
    let releaser = Identity::new("releaser");
    h.policy.grant(&releaser, "prod", Permission::Promote);

    let def = PipelineDefinition {
        name: "release".to_string(),
        stages: vec![approval_stage("hold", 30), promote_stage("promote-prod")],
    };
    let pipeline = h.engine.register_pipeline(&def).await.unwrap();

    // Broadcast receivers only see messages sent after subscription. A
    // receiver taken before start must observe a gate that opens as the
    // very first stage, even when the run task announces it immediately.
    let mut approvals = h.engine.subscribe_approvals();
    let run_id = h
        .engine
        .start(&pipeline.pipeline_id, Identity::new("dev"))
        .await
        .unwrap();

    let request = tokio::time::timeout(Duration::from_secs(5), approvals.recv())
        .await
        .expect("gate announcement was dropped")
        .unwrap();
    assert_eq!(request.run_id, run_id);
    assert_eq!(request.stage_name, "hold");

    h.engine
        .decide(&request.run_id, &request.request_id, Decision::Approve, releaser)
        .await
        .unwrap();
    let run = h.engine.wait(&run_id).await.unwrap();
    assert_eq!(run.state, RunState::Succeeded);
}

#[tokio::test]
async fn rejection_fails_the_run_and_leaves_the_tag() {
    let h = harness();
    seed_artifact(&h).await;

    let def = PipelineDefinition {
        name: "release".to_string(),
        stages: vec![approval_stage("hold", 30), promote_stage("promote-prod")],
    };
    let pipeline = h.engine.register_pipeline(&def).await.unwrap();

    let mut approvals = h.engine.subscribe_approvals();
    let run_id = h
        .engine
        .start(&pipeline.pipeline_id, Identity::new("dev"))
        .await
        .unwrap();
    let request = approvals.recv().await.unwrap();

    h.engine
        .decide(&request.run_id, &request.request_id, Decision::Reject, Identity::new("releaser"))
        .await
        .unwrap();

    let run = h.engine.wait(&run_id).await.unwrap();
    assert_eq!(run.state, RunState::Failed);
    let failure = run.failure.unwrap();
    assert_eq!(failure.stage, "hold");
    assert_eq!(failure.kind, "rejected");

    // Only the gate stage produced a result; the promote never ran.
    let status = h.engine.status(&run_id).await.unwrap();
    assert_eq!(status.results.len(), 1);
    assert_eq!(status.results[0].outcome, StageOutcome::Rejected);
    assert!(matches!(
        h.engine.registry().resolve("prod", "current").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn second_decision_is_rejected() {
    let h = harness();
    seed_artifact(&h).await;
    let releaser = Identity::new("releaser");
    h.policy.grant(&releaser, "prod", Permission::Promote);

    let def = PipelineDefinition {
        name: "release".to_string(),
        stages: vec![approval_stage("hold", 30), promote_stage("promote-prod")],
    };
    let pipeline = h.engine.register_pipeline(&def).await.unwrap();

    let mut approvals = h.engine.subscribe_approvals();
    let run_id = h
        .engine
        .start(&pipeline.pipeline_id, Identity::new("dev"))
        .await
        .unwrap();
    let request = approvals.recv().await.unwrap();

    h.engine
        .decide(&request.run_id, &request.request_id, Decision::Approve, releaser)
        .await
        .unwrap();
    h.engine.wait(&run_id).await.unwrap();

    let err = h
        .engine
        .decide(&request.run_id, &request.request_id, Decision::Reject, Identity::new("bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyDecided(_)));
}

#[tokio::test]
async fn expired_gate_fails_the_run_with_timeout() {
    let h = harness();
    seed_artifact(&h).await;

    let def = PipelineDefinition {
        name: "release".to_string(),
        stages: vec![approval_stage("hold", 1), promote_stage("promote-prod")],
    };
    let pipeline = h.engine.register_pipeline(&def).await.unwrap();
    let run_id = h
        .engine
        .start(&pipeline.pipeline_id, Identity::new("dev"))
        .await
        .unwrap();

    let run = h.engine.wait(&run_id).await.unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.failure.unwrap().kind, "timeout");

    let status = h.engine.status(&run_id).await.unwrap();
    assert_eq!(status.results.len(), 1);
    assert_eq!(status.results[0].outcome, StageOutcome::TimedOut);
}

#[tokio::test]
async fn approver_without_promote_permission_fails_the_promote_stage() {
    let h = harness();
    seed_artifact(&h).await;

    let def = PipelineDefinition {
        name: "release".to_string(),
        stages: vec![approval_stage("hold", 30), promote_stage("promote-prod")],
    };
    let pipeline = h.engine.register_pipeline(&def).await.unwrap();

    let mut approvals = h.engine.subscribe_approvals();
    let run_id = h
        .engine
        .start(&pipeline.pipeline_id, Identity::new("dev"))
        .await
        .unwrap();
    let request = approvals.recv().await.unwrap();

    // Approval succeeds; the promotion then runs as the approver, who
    // holds no promote grant on prod.
    h.engine
        .decide(&request.run_id, &request.request_id, Decision::Approve, Identity::new("intern"))
        .await
        .unwrap();

    let run = h.engine.wait(&run_id).await.unwrap();
    assert_eq!(run.state, RunState::Failed);
    let failure = run.failure.unwrap();
    assert_eq!(failure.stage, "promote-prod");
    assert_eq!(failure.kind, "permission_denied");

    assert!(matches!(
        h.engine.registry().resolve("prod", "current").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn failing_stage_stops_the_run_after_its_result() {
    let h = harness();

    let def = PipelineDefinition {
        name: "broken".to_string(),
        stages: vec![
            command_stage("ok", &["true"]),
            command_stage("boom", &["sh", "-c", "exit 7"]),
            command_stage("never", &["echo", "unreachable"]),
        ],
    };
    let pipeline = h.engine.register_pipeline(&def).await.unwrap();
    let run_id = h
        .engine
        .start(&pipeline.pipeline_id, Identity::new("dev"))
        .await
        .unwrap();

    let run = h.engine.wait(&run_id).await.unwrap();
    assert_eq!(run.state, RunState::Failed);
    let failure = run.failure.unwrap();
    assert_eq!(failure.stage, "boom");
    assert_eq!(failure.kind, "command_failed");

    // The result log is an exact prefix of the pipeline.
    let status = h.engine.status(&run_id).await.unwrap();
    assert_eq!(status.results.len(), 2);
    assert_eq!(status.results[0].stage_name, "ok");
    assert_eq!(status.results[0].outcome, StageOutcome::Succeeded);
    assert_eq!(status.results[1].stage_name, "boom");
    assert_eq!(status.results[1].outcome, StageOutcome::Failed);
}

#[tokio::test]
async fn abort_while_awaiting_approval() {
    let h = harness();
    seed_artifact(&h).await;

    let def = PipelineDefinition {
        name: "release".to_string(),
        stages: vec![approval_stage("hold", 60), promote_stage("promote-prod")],
    };
    let pipeline = h.engine.register_pipeline(&def).await.unwrap();

    let mut approvals = h.engine.subscribe_approvals();
    let run_id = h
        .engine
        .start(&pipeline.pipeline_id, Identity::new("dev"))
        .await
        .unwrap();
    let request = approvals.recv().await.unwrap();

    h.engine.abort(&run_id).await.unwrap();
    let run = h.engine.wait(&run_id).await.unwrap();
    assert_eq!(run.state, RunState::Aborted);

    // The request died with the run.
    let err = h
        .engine
        .decide(&request.run_id, &request.request_id, Decision::Approve, Identity::new("releaser"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyDecided(_)));
}

#[tokio::test]
async fn status_reports_the_pending_approval() {
    let h = harness();
    seed_artifact(&h).await;

    let def = PipelineDefinition {
        name: "release".to_string(),
        stages: vec![approval_stage("hold", 60), promote_stage("promote-prod")],
    };
    let pipeline = h.engine.register_pipeline(&def).await.unwrap();

    let mut approvals = h.engine.subscribe_approvals();
    let run_id = h
        .engine
        .start(&pipeline.pipeline_id, Identity::new("dev"))
        .await
        .unwrap();
    let request = approvals.recv().await.unwrap();

    // The run reaches AwaitingApproval just after the request is announced.
    let status = loop {
        let status = h.engine.status(&run_id).await.unwrap();
        if status.run.state == RunState::AwaitingApproval {
            break status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    let pending = status.pending_approval.unwrap();
    assert_eq!(pending.request_id, request.request_id);

    h.engine.abort(&run_id).await.unwrap();
    h.engine.wait(&run_id).await.unwrap();
}

#[tokio::test]
async fn resume_skips_committed_stages_and_rearms_the_gate() {
    let h = harness();
    let digest = seed_artifact(&h).await;
    let releaser = Identity::new("releaser");
    h.policy.grant(&releaser, "prod", Permission::Promote);

    let def = PipelineDefinition {
        name: "release".to_string(),
        stages: vec![
            command_stage("build", &["echo", "built"]),
            approval_stage("hold", 60),
            promote_stage("promote-prod"),
        ],
    };
    let pipeline = h.engine.register_pipeline(&def).await.unwrap();

    // Simulate a run interrupted after the build stage, with its approval
    // request already opened.
    let run = h.runs.create_run(&pipeline, "dev").await.unwrap();
    h.runs.transition(&run.run_id, RunState::Running).await.unwrap();
    h.runs
        .append_stage_result(
            &run.run_id,
            StageResultRecord {
                seq: 1,
                stage_name: "build".to_string(),
                outcome: StageOutcome::Succeeded,
                attempts: 1,
                error_kind: None,
                output: "built".to_string(),
                started_at: chrono::Utc::now(),
                finished_at: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();
    let request_id = RequestId::new();
    h.runs
        .put_approval(ApprovalRecord {
            request_id: request_id.clone(),
            run_id: run.run_id.clone(),
            stage_name: "hold".to_string(),
            deadline: chrono::Utc::now() + chrono::Duration::seconds(60),
            disposition: None,
            decided_by: None,
            created_at: chrono::Utc::now(),
            decided_at: None,
        })
        .await
        .unwrap();

    h.engine.resume(&run.run_id).await.unwrap();

    // The original request is honored by the resumed run.
    loop {
        let status = h.engine.status(&run.run_id).await.unwrap();
        if status.pending_approval.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    h.engine
        .decide(&run.run_id, &request_id, Decision::Approve, releaser)
        .await
        .unwrap();

    let finished = h.engine.wait(&run.run_id).await.unwrap();
    assert_eq!(finished.state, RunState::Succeeded);

    let status = h.engine.status(&run.run_id).await.unwrap();
    assert_eq!(status.results.len(), 3);
    assert_eq!(status.results[1].output, "approved by releaser");

    let current = h.engine.registry().resolve("prod", "current").await.unwrap();
    assert_eq!(current, digest);
}

#[tokio::test]
async fn resume_applies_a_decision_recorded_before_the_crash() {
    let h = harness();
    let digest = seed_artifact(&h).await;
    let releaser = Identity::new("releaser");
    h.policy.grant(&releaser, "prod", Permission::Promote);

    let def = PipelineDefinition {
        name: "release".to_string(),
        stages: vec![approval_stage("hold", 60), promote_stage("promote-prod")],
    };
    let pipeline = h.engine.register_pipeline(&def).await.unwrap();

    let run = h.runs.create_run(&pipeline, "dev").await.unwrap();
    h.runs.transition(&run.run_id, RunState::Running).await.unwrap();
    let request_id = RequestId::new();
    h.runs
        .put_approval(ApprovalRecord {
            request_id: request_id.clone(),
            run_id: run.run_id.clone(),
            stage_name: "hold".to_string(),
            deadline: chrono::Utc::now() + chrono::Duration::seconds(60),
            disposition: None,
            decided_by: None,
            created_at: chrono::Utc::now(),
            decided_at: None,
        })
        .await
        .unwrap();
    h.runs
        .resolve_approval(&request_id, Disposition::Approved, "releaser")
        .await
        .unwrap();

    h.engine.resume(&run.run_id).await.unwrap();
    let finished = h.engine.wait(&run.run_id).await.unwrap();
    assert_eq!(finished.state, RunState::Succeeded);

    // The promotion ran as the pre-crash approver.
    let history = h.engine.registry().history("prod", "current").await.unwrap();
    assert_eq!(history[0].bound_by, "releaser");
    assert_eq!(history[0].digest, digest);
}

#[tokio::test]
async fn terminal_runs_are_not_resumable() {
    let h = harness();
    let def = PipelineDefinition {
        name: "quick".to_string(),
        stages: vec![command_stage("ok", &["true"])],
    };
    let pipeline = h.engine.register_pipeline(&def).await.unwrap();
    let run_id = h
        .engine
        .start(&pipeline.pipeline_id, Identity::new("dev"))
        .await
        .unwrap();
    h.engine.wait(&run_id).await.unwrap();

    let err = h.engine.resume(&run_id).await.unwrap_err();
    assert!(matches!(err, Error::NotResumable { .. }));
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let h = harness();
    assert!(matches!(
        h.engine.status(&RunId::new()).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        h.engine
            .decide(&RunId::new(), &RequestId::new(), Decision::Approve, Identity::new("x"))
            .await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn register_pipeline_rejects_invalid_definitions() {
    let h = harness();
    let def = PipelineDefinition {
        name: "bad".to_string(),
        stages: vec![],
    };
    assert!(matches!(
        h.engine.register_pipeline(&def).await,
        Err(Error::InvalidPipeline(_))
    ));
}
