//! Job identity, status and the per-job record kept by the registry.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobFailure;

/// Stable identifier of a job (e.g. `"02_NYC"`).
///
/// The roster order, not the string order, defines the canonical sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle status of a job within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    /// Success and Failed are terminal for the current batch.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Mirror of the on-disk output folder naming convention.
///
/// `<job>_IN_PROGRESS` while the job runs, `<job>_COMPLETED` once it has
/// finished successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFolderState {
    None,
    InProgress,
    Completed,
}

/// Progress of a job's output through post-processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostProcessStage {
    NotStarted,
    Enriching,
    Enriched,
    Uploading,
    Uploaded,
    Failed,
}

/// One record per job, owned by the [`JobRegistry`](crate::registry::JobRegistry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Index in the canonical roster.
    pub position: usize,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub progress_percent: u8,
    pub log_path: PathBuf,
    /// Process id while Running. The handle itself belongs to the supervisor.
    pub pid: Option<u32>,
    pub output_folder: OutputFolderState,
    pub failure: Option<JobFailure>,
    pub post_process: PostProcessStage,
    /// Upload attempts made for this job's output folder.
    pub upload_attempts: u32,
}

impl JobRecord {
    pub fn new(id: JobId, position: usize, log_path: PathBuf) -> Self {
        Self {
            id,
            position,
            status: JobStatus::Pending,
            started_at: None,
            ended_at: None,
            progress_percent: 0,
            log_path,
            pid: None,
            output_folder: OutputFolderState::None,
            failure: None,
            post_process: PostProcessStage::NotStarted,
            upload_attempts: 0,
        }
    }

    /// Wall-clock runtime, if the job has started.
    pub fn runtime(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        Some(self.ended_at.unwrap_or_else(Utc::now) - started)
    }

    /// Back to a fresh Pending record for a new batch.
    pub(crate) fn reset(&mut self) {
        let id = self.id.clone();
        let log_path = std::mem::take(&mut self.log_path);
        *self = JobRecord::new(id, self.position, log_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_job_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&JobId::from("17_BidNet")).unwrap();
        assert_eq!(json, "\"17_BidNet\"");
    }

    #[test]
    fn test_reset_keeps_identity() {
        let mut record = JobRecord::new(JobId::from("02_NYC"), 2, PathBuf::from("logs/02_NYC.log"));
        record.status = JobStatus::Failed;
        record.progress_percent = 40;
        record.failure = Some(JobFailure::Terminated);

        record.reset();

        assert_eq!(record.id.as_str(), "02_NYC");
        assert_eq!(record.position, 2);
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.progress_percent, 0);
        assert!(record.failure.is_none());
        assert_eq!(record.log_path, PathBuf::from("logs/02_NYC.log"));
    }
}
