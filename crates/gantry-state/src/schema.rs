//! Schema definitions for Gantry SurrealDB tables
//!
//! Tables:
//! - runs: pipeline run records
//! - stage_results: append-only stage result log entries
//! - approvals: approval requests opened by gate stages
//! - pipelines: stored pipeline definitions, versioned by content digest
//! - environments: administratively created namespaces
//! - tag_bindings: append-only tag binding history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Row in the `runs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRow {
    pub run_id: String,
    pub pipeline_id: String,
    pub pipeline_digest: String,
    pub initiator: String,
    /// One of: pending | running | awaiting_approval | succeeded | failed | aborted
    pub state: String,
    pub failure_stage: Option<String>,
    pub failure_kind: Option<String>,
    pub failure_message: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRow {
    pub fn new(
        run_id: String,
        pipeline_id: String,
        pipeline_digest: String,
        initiator: String,
    ) -> Self {
        Self {
            run_id,
            pipeline_id,
            pipeline_digest,
            initiator,
            state: "pending".to_string(),
            failure_stage: None,
            failure_kind: None,
            failure_message: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Row in the `stage_results` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResultRow {
    pub run_id: String,
    pub seq: u64,
    pub stage_name: String,
    /// One of: succeeded | failed | timed_out | rejected
    pub outcome: String,
    pub attempts: u32,
    pub error_kind: Option<String>,
    pub output: String,
    #[serde(with = "surreal_datetime")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub finished_at: DateTime<Utc>,
}

/// Row in the `approvals` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRow {
    pub request_id: String,
    pub run_id: String,
    pub stage_name: String,
    #[serde(with = "surreal_datetime")]
    pub deadline: DateTime<Utc>,
    /// One of: approved | rejected | expired, unset while open
    pub disposition: Option<String>,
    pub decided_by: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub decided_at: Option<DateTime<Utc>>,
}

/// Row in the `pipelines` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRow {
    pub pipeline_id: String,
    pub digest: String,
    pub definition: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

/// Row in the `environments` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvRow {
    pub name: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

/// Row in the `tag_bindings` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagBindingRow {
    pub env: String,
    pub tag: String,
    pub digest: String,
    pub seq: u64,
    pub bound_by: String,
    #[serde(with = "surreal_datetime")]
    pub bound_at: DateTime<Utc>,
}
