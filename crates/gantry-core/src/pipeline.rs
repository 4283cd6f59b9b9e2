//! Pipeline definitions and stage specifications.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// What a stage does. Build, deploy, and test stages invoke opaque
/// subprocess commands; approval stages block on an external decision;
/// promote stages rebind an image tag across environments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageKind {
    Build { command: Vec<String> },
    Deploy { command: Vec<String> },
    Test { command: Vec<String> },
    Approval,
    Promote {
        source_env: String,
        source_tag: String,
        target_env: String,
        target_tag: String,
    },
}

impl StageKind {
    pub fn label(&self) -> &'static str {
        match self {
            StageKind::Build { .. } => "build",
            StageKind::Deploy { .. } => "deploy",
            StageKind::Test { .. } => "test",
            StageKind::Approval => "approval",
            StageKind::Promote { .. } => "promote",
        }
    }

    /// The subprocess command for command-backed stage kinds.
    pub fn command(&self) -> Option<&[String]> {
        match self {
            StageKind::Build { command }
            | StageKind::Deploy { command }
            | StageKind::Test { command } => Some(command),
            _ => None,
        }
    }
}

/// Retry policy for a stage. Only transient failures are retried; a
/// `max_attempts` of 1 disables retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed delay between attempts, in milliseconds.
    #[serde(default)]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }
}

/// A named unit of work within a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,

    #[serde(flatten)]
    pub kind: StageKind,

    /// Wall-clock limit for the stage. Required for approval stages (the
    /// gate deadline); optional elsewhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl StageSpec {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// An ordered sequence of stages. Immutable once a run starts: runs
/// reference the stored definition by id and content digest, and edits
/// produce a new digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub stages: Vec<StageSpec>,
}

impl PipelineDefinition {
    /// SHA-256 hex digest of the definition's canonical JSON form.
    /// Struct field order is fixed, so equal definitions hash equally.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }

    /// Validate the definition before it may be stored or started.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::InvalidPipeline("no stages defined".into()));
        }

        let mut names = HashSet::new();
        for stage in &self.stages {
            if stage.name.is_empty() {
                return Err(Error::InvalidPipeline("stage with empty name".into()));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(Error::InvalidPipeline(format!(
                    "duplicate stage name: {}",
                    stage.name
                )));
            }
            match &stage.kind {
                StageKind::Approval => {
                    if stage.timeout_secs.is_none() {
                        return Err(Error::InvalidPipeline(format!(
                            "approval stage {} has no timeout",
                            stage.name
                        )));
                    }
                }
                StageKind::Promote {
                    source_env,
                    source_tag,
                    target_env,
                    target_tag,
                } => {
                    if source_env.is_empty()
                        || source_tag.is_empty()
                        || target_env.is_empty()
                        || target_tag.is_empty()
                    {
                        return Err(Error::InvalidPipeline(format!(
                            "promote stage {} has empty source or target",
                            stage.name
                        )));
                    }
                }
                other => {
                    if other.command().map(|c| c.is_empty()).unwrap_or(false) {
                        return Err(Error::InvalidPipeline(format!(
                            "stage {} has empty command",
                            stage.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_stage(name: &str) -> StageSpec {
        StageSpec {
            name: name.to_string(),
            kind: StageKind::Build {
                command: vec!["echo".to_string(), name.to_string()],
            },
            timeout_secs: None,
            retry: RetryPolicy::default(),
        }
    }

    fn sample_definition() -> PipelineDefinition {
        PipelineDefinition {
            name: "promote-api".to_string(),
            stages: vec![
                command_stage("build"),
                StageSpec {
                    name: "hold-for-prod".to_string(),
                    kind: StageKind::Approval,
                    timeout_secs: Some(900),
                    retry: RetryPolicy::default(),
                },
                StageSpec {
                    name: "promote-prod".to_string(),
                    kind: StageKind::Promote {
                        source_env: "dev".to_string(),
                        source_tag: "latest".to_string(),
                        target_env: "prod".to_string(),
                        target_tag: "latest".to_string(),
                    },
                    timeout_secs: None,
                    retry: RetryPolicy::default(),
                },
            ],
        }
    }

    #[test]
    fn digest_is_deterministic_and_content_sensitive() {
        let def = sample_definition();
        assert_eq!(def.digest(), sample_definition().digest());

        let mut edited = sample_definition();
        edited.stages[0].name = "build-image".to_string();
        assert_ne!(def.digest(), edited.digest());
    }

    #[test]
    fn validate_accepts_well_formed_definition() {
        assert!(sample_definition().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_and_duplicates() {
        let empty = PipelineDefinition {
            name: "empty".to_string(),
            stages: vec![],
        };
        assert!(matches!(
            empty.validate(),
            Err(Error::InvalidPipeline(_))
        ));

        let dup = PipelineDefinition {
            name: "dup".to_string(),
            stages: vec![command_stage("build"), command_stage("build")],
        };
        assert!(matches!(dup.validate(), Err(Error::InvalidPipeline(_))));
    }

    #[test]
    fn validate_requires_approval_timeout() {
        let def = PipelineDefinition {
            name: "gate".to_string(),
            stages: vec![StageSpec {
                name: "hold".to_string(),
                kind: StageKind::Approval,
                timeout_secs: None,
                retry: RetryPolicy::default(),
            }],
        };
        assert!(matches!(def.validate(), Err(Error::InvalidPipeline(_))));
    }

    #[test]
    fn stage_spec_round_trips_through_json() {
        let def = sample_definition();
        let json = serde_json::to_value(&def).unwrap();
        let back: PipelineDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(def, back);
    }

    #[test]
    fn stage_spec_parses_from_flat_json() {
        let stage: StageSpec = serde_json::from_value(serde_json::json!({
            "name": "push-image",
            "kind": "build",
            "command": ["make", "push"],
            "retry": { "max_attempts": 3, "backoff_ms": 100 }
        }))
        .unwrap();
        assert_eq!(stage.kind.label(), "build");
        assert_eq!(stage.retry.max_attempts, 3);
    }
}
