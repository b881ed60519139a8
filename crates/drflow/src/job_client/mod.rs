//! Recovery job client: the external replication service's job API.
//!
//! The service exposes only start, query, and cancel. There are no
//! completion callbacks; drflow learns about progress exclusively by polling
//! [`RecoveryJobClient::get_job_status`]. Jobs are durable on the service
//! side, so re-querying is always safe.
//!
//! Every job is tagged with the execution and wave that started it (see
//! [`tags`]) so operators can trace an external job back to its execution.

pub mod http;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::{JobId, ServerId};

/// Metadata tag keys attached to every started job.
pub mod tags {
    /// Execution that started the job.
    pub const EXECUTION_ID: &str = "drflow:execution-id";
    /// Wave number within the execution.
    pub const WAVE_NUMBER: &str = "drflow:wave-number";
    /// Plan being executed.
    pub const PLAN_ID: &str = "drflow:plan-id";
    /// `drill` or `recovery`.
    pub const EXECUTION_TYPE: &str = "drflow:execution-type";
}

/// Job-level status reported by the external service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Accepted, not yet launching.
    #[serde(alias = "pending")]
    Pending,
    /// Launching recovery instances.
    #[serde(alias = "running", alias = "STARTED", alias = "started")]
    Running,
    /// Finished; per-server results are final.
    #[serde(alias = "completed")]
    Completed,
    /// Terminally errored.
    #[serde(alias = "failed")]
    Failed,
}

impl JobStatus {
    /// Returns true once the job will not change any further.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Per-server launch result in the external service's own vocabulary.
///
/// `launch_status` is kept as the raw external string; the poller maps it
/// with [`crate::execution::LaunchStatus::from_external`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerLaunchReport {
    /// The source server.
    pub server_id: ServerId,
    /// External launch status (e.g. `PENDING`, `LAUNCHED`, `FAILED`).
    pub launch_status: String,
    /// Recovery instance created for the server, once launched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_instance_id: Option<String>,
    /// Failure description, if the launch failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerLaunchReport {
    /// Creates a report with no instance or error.
    #[must_use]
    pub fn new(server_id: ServerId, launch_status: impl Into<String>) -> Self {
        Self {
            server_id,
            launch_status: launch_status.into(),
            recovery_instance_id: None,
            error: None,
        }
    }
}

/// Point-in-time view of an external job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    /// The queried job.
    pub job_id: JobId,
    /// Job-level status.
    pub status: JobStatus,
    /// Per-server launch results.
    #[serde(default)]
    pub per_server: Vec<ServerLaunchReport>,
    /// Job-level error, if the service reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Request to launch recovery for one wave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartJobRequest {
    /// Servers to recover, sorted and deduplicated.
    pub server_ids: Vec<ServerId>,
    /// Traceability metadata (see [`tags`]).
    pub tags: BTreeMap<String, String>,
    /// True for a drill, false for a production failover.
    pub is_drill: bool,
}

impl StartJobRequest {
    /// Creates a request with no tags.
    #[must_use]
    pub fn new(server_ids: Vec<ServerId>, is_drill: bool) -> Self {
        Self {
            server_ids,
            tags: BTreeMap::new(),
            is_drill,
        }
    }

    /// Adds a metadata tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Returns a tag value.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Client for the external replication service's job API.
///
/// Implementations do not need to bound their own latency; the orchestrator
/// wraps every call in [`crate::context::OrchestratorContext::bounded`].
#[async_trait]
pub trait RecoveryJobClient: Send + Sync {
    /// Starts a recovery job and returns its identifier.
    async fn start_job(&self, request: &StartJobRequest) -> Result<JobId>;

    /// Queries the current status of a job.
    async fn get_job_status(&self, job_id: &JobId) -> Result<JobSnapshot>;

    /// Requests cancellation of a job. Best-effort; may fail or be slow.
    async fn cancel_job(&self, job_id: &JobId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_accepts_external_spellings() {
        let parsed: JobStatus = serde_json::from_str("\"STARTED\"").unwrap();
        assert_eq!(parsed, JobStatus::Running);
        let parsed: JobStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(parsed, JobStatus::Completed);
        assert!(parsed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }

    #[test]
    fn snapshot_deserializes_without_optional_fields() {
        let json = r#"{"jobId":"drsjob-1","status":"RUNNING","perServer":[{"serverId":"s-1","launchStatus":"IN_PROGRESS"}]}"#;
        let snapshot: JobSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.per_server.len(), 1);
        assert!(snapshot.per_server[0].recovery_instance_id.is_none());
        assert!(snapshot.error.is_none());
    }

    #[test]
    fn start_request_tags() {
        let request = StartJobRequest::new(vec![ServerId::from("s-1")], true)
            .with_tag(tags::WAVE_NUMBER, "2");
        assert_eq!(request.tag(tags::WAVE_NUMBER), Some("2"));
        assert!(request.tag(tags::PLAN_ID).is_none());
    }
}
