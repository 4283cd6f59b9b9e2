//! Stage actions: the unit of work the executor drives.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// A single attempt of a stage's work. Implementations must be safe to
/// invoke more than once: the executor retries transient failures and a
/// resumed run may re-execute a stage whose result was never committed.
#[async_trait]
pub trait StageAction: Send + Sync {
    /// Run one attempt, returning the stage's output on success.
    async fn execute(&self) -> Result<String>;
}

/// Runs an opaque subprocess and captures its output.
///
/// The child is spawned with `kill_on_drop`, so cancelling the attempt
/// (timeout or abort) terminates the process rather than leaking it.
pub struct CommandAction {
    program: String,
    args: Vec<String>,
}

impl CommandAction {
    /// Build from an argv-style command line. The first element is the
    /// program; validation upstream guarantees it is non-empty.
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::InvalidPipeline("empty command".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl StageAction for CommandAction {
    async fn execute(&self) -> Result<String> {
        debug!(program = %self.program, "spawning stage command");

        let output = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Transient(format!("failed to spawn {}: {e}", self.program)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
        } else {
            Err(Error::CommandFailed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_success_captures_stdout() {
        let action = CommandAction::new(&["echo".to_string(), "hello".to_string()]).unwrap();
        let out = action.execute().await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_command_failed() {
        let action = CommandAction::new(&[
            "sh".to_string(),
            "-c".to_string(),
            "echo oops >&2; exit 3".to_string(),
        ])
        .unwrap();
        match action.execute().await {
            Err(Error::CommandFailed { code, stderr }) => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "oops");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_transient() {
        let action =
            CommandAction::new(&["gantry-no-such-binary-on-path".to_string()]).unwrap();
        assert!(matches!(action.execute().await, Err(Error::Transient(_))));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(
            CommandAction::new(&[]),
            Err(Error::InvalidPipeline(_))
        ));
    }
}
