//! Stage executor: drives one stage to completion under its timeout and
//! retry policy, honoring operator aborts.
//!
//! Retry rules are strict: only [`Error::Transient`] failures are
//! retried, never more than `max_attempts` total, with a fixed backoff
//! between attempts. Timeouts and non-transient failures end the stage
//! on the attempt that produced them.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

use gantry_state::StageOutcome;

use crate::action::StageAction;
use crate::error::{Error, Result};
use crate::pipeline::RetryPolicy;

/// What one stage execution produced, in the shape the engine commits
/// as a stage result.
#[derive(Debug)]
pub struct ExecutionReport {
    pub outcome: StageOutcome,
    pub attempts: u32,
    pub error_kind: Option<String>,
    pub message: Option<String>,
    pub output: Option<String>,
}

impl ExecutionReport {
    fn succeeded(attempts: u32, output: String) -> Self {
        Self {
            outcome: StageOutcome::Succeeded,
            attempts,
            error_kind: None,
            message: None,
            output: Some(output),
        }
    }

    fn failed(attempts: u32, err: &Error) -> Self {
        let outcome = match err {
            Error::Timeout(_) => StageOutcome::TimedOut,
            _ => StageOutcome::Failed,
        };
        Self {
            outcome,
            attempts,
            error_kind: Some(err.kind().to_string()),
            message: Some(err.to_string()),
            output: None,
        }
    }
}

/// Wait until the abort flag flips to true.
async fn aborted(abort: &mut watch::Receiver<bool>) {
    while !*abort.borrow() {
        if abort.changed().await.is_err() {
            // Sender dropped without aborting; never resolves.
            futures::future::pending::<()>().await;
        }
    }
}

/// Execute a stage action until it succeeds, exhausts its retry budget,
/// times out, or the run is aborted.
///
/// Returns `Err(Error::Aborted)` only for operator aborts; every other
/// ending is reported in the [`ExecutionReport`].
pub async fn run_stage(
    stage_name: &str,
    action: &dyn StageAction,
    timeout: Option<Duration>,
    retry: RetryPolicy,
    abort: &mut watch::Receiver<bool>,
) -> Result<ExecutionReport> {
    let max_attempts = retry.max_attempts.max(1);
    let backoff = Duration::from_millis(retry.backoff_ms);

    for attempt in 1..=max_attempts {
        if *abort.borrow() {
            return Err(Error::Aborted);
        }

        debug!(stage = stage_name, attempt, "executing stage attempt");

        let result = tokio::select! {
            res = attempt_once(action, timeout) => res,
            _ = aborted(abort) => return Err(Error::Aborted),
        };

        match result {
            Ok(output) => return Ok(ExecutionReport::succeeded(attempt, output)),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                warn!(
                    stage = stage_name,
                    attempt,
                    error = %err,
                    "transient stage failure, retrying"
                );
                if !backoff.is_zero() {
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = aborted(abort) => return Err(Error::Aborted),
                    }
                }
            }
            Err(err) => {
                warn!(stage = stage_name, attempt, error = %err, "stage failed");
                return Ok(ExecutionReport::failed(attempt, &err));
            }
        }
    }

    unreachable!("retry loop returns on every attempt")
}

async fn attempt_once(action: &dyn StageAction, timeout: Option<Duration>) -> Result<String> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, action.execute()).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(limit)),
        },
        None => action.execute().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Fails transiently `failures` times, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StageAction for Flaky {
        async fn execute(&self) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(Error::Transient(format!("flake {call}")))
            } else {
                Ok("done".to_string())
            }
        }
    }

    struct Hang;

    #[async_trait]
    impl StageAction for Hang {
        async fn execute(&self) -> Result<String> {
            futures::future::pending().await
        }
    }

    struct HardFail;

    #[async_trait]
    impl StageAction for HardFail {
        async fn execute(&self) -> Result<String> {
            Err(Error::CommandFailed {
                code: 2,
                stderr: "boom".into(),
            })
        }
    }

    fn no_abort() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the test duration.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn transient_failures_are_retried_up_to_budget() {
        let action = Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let retry = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 0,
        };
        let mut abort = no_abort();
        let report = run_stage("build", &action, None, retry, &mut abort)
            .await
            .unwrap();
        assert_eq!(report.outcome, StageOutcome::Succeeded);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.output.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn exhausted_retries_report_the_last_failure() {
        let action = Flaky {
            failures: 5,
            calls: AtomicU32::new(0),
        };
        let retry = RetryPolicy {
            max_attempts: 2,
            backoff_ms: 0,
        };
        let mut abort = no_abort();
        let report = run_stage("build", &action, None, retry, &mut abort)
            .await
            .unwrap();
        assert_eq!(report.outcome, StageOutcome::Failed);
        assert_eq!(report.attempts, 2);
        assert_eq!(report.error_kind.as_deref(), Some("transient"));
    }

    #[tokio::test]
    async fn non_transient_failure_is_never_retried() {
        let mut abort = no_abort();
        let retry = RetryPolicy {
            max_attempts: 5,
            backoff_ms: 0,
        };
        let report = run_stage("deploy", &HardFail, None, retry, &mut abort)
            .await
            .unwrap();
        assert_eq!(report.outcome, StageOutcome::Failed);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.error_kind.as_deref(), Some("command_failed"));
    }

    #[tokio::test]
    async fn timeout_ends_the_stage_without_retry() {
        let mut abort = no_abort();
        let retry = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 0,
        };
        let report = run_stage(
            "test",
            &Hang,
            Some(Duration::from_millis(50)),
            retry,
            &mut abort,
        )
        .await
        .unwrap();
        assert_eq!(report.outcome, StageOutcome::TimedOut);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.error_kind.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn abort_interrupts_a_running_stage() {
        let (tx, mut abort) = watch::channel(false);
        let retry = RetryPolicy::default();

        let handle = tokio::spawn(async move {
            run_stage("test", &Hang, None, retry, &mut abort).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let res = handle.await.unwrap();
        assert!(matches!(res, Err(Error::Aborted)));
    }
}
