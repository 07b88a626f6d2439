//! Structured error types for the orchestrator.
//!
//! Three families, one per layer:
//! - [`OrchestratorError`] - control/registry errors returned to callers
//! - [`JobFailure`] - why a single job ended in `Failed` (never aborts a batch)
//! - [`PostProcessError`] - enrichment/upload failures surfaced after a batch
//!
//! `anyhow` stays at the edges (external command adapters, the binary).
//! Everything that crosses the status feed is one of the types below.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobId;

/// Errors returned by the registry, scheduler and control surface.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The job id is not part of the configured roster.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// A start request hit a job that is already running.
    ///
    /// Reported as a conflict, never treated as a fatal error.
    #[error("job already running: {0}")]
    AlreadyRunning(JobId),

    /// The job finished successfully in this batch and cannot be restarted.
    #[error("job {0} already succeeded in this batch")]
    NotRestartable(JobId),

    /// A new batch was requested while the previous batch is still being
    /// enriched or uploaded.
    #[error("post-processing of batch {0} is still running")]
    PostProcessingActive(u64),

    /// The coordination loop has shut down.
    #[error("scheduler is not running")]
    SchedulerUnavailable,

    /// The durable ledger could not be read or appended.
    #[error("ledger error: {0}")]
    Ledger(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Whether this error is a benign conflict rather than a failure.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            OrchestratorError::AlreadyRunning(_) | OrchestratorError::PostProcessingActive(_)
        )
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

/// Why a job ended in `Failed`.
///
/// Spawn errors, runtime failures and terminations are terminal for the job
/// but never stop the scheduler from admitting the next one.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobFailure {
    /// The executable could not be started.
    #[error("failed to spawn job: {message}")]
    SpawnError { message: String },

    /// The process exited with a non-zero code (or was killed by a signal
    /// it did not receive from us, in which case `code` is `None`).
    #[error("job exited with {}", exit_description(*code))]
    NonZeroExit { code: Option<i32> },

    /// The process tree was stopped on request.
    #[error("job was terminated")]
    Terminated,

    /// The job was found unfinished after an orchestrator restart.
    #[error("job did not finish before the orchestrator restarted")]
    Crashed,
}

fn exit_description(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "no exit code (killed by signal)".to_string(),
    }
}

/// Failures of the post-processing pipeline.
///
/// Both variants keep the folder on disk for manual follow-up.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PostProcessError {
    /// Enrichment reported failure; the folder is not uploaded.
    #[error("enrichment failed for {}: {reason}", folder.display())]
    EnrichmentFailure { folder: PathBuf, reason: String },

    /// Every upload attempt failed.
    #[error("upload failed for {} after {attempts} attempts: {last_error}", folder.display())]
    UploadFailure {
        folder: PathBuf,
        attempts: u32,
        last_error: String,
    },
}

impl PostProcessError {
    pub fn folder(&self) -> &PathBuf {
        match self {
            PostProcessError::EnrichmentFailure { folder, .. } => folder,
            PostProcessError::UploadFailure { folder, .. } => folder,
        }
    }
}
