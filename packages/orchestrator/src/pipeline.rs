//! Post-processing: enrichment, then upload, once a batch has finished.
//!
//! ```text
//!   Completed folders ──► Enrich (sequential, every folder)
//!                              │  failed → folder kept, not uploaded
//!                              ▼
//!                         Upload (bounded retry)
//!                              │  ok     → .upload_complete, prune, delete
//!                              │  failed → folder kept, failure surfaced
//!                              ▼
//!                         BatchSummary
//! ```
//!
//! Enrichment rewrites the files the uploader reads, so no upload starts
//! until every enrichment in the batch has returned.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::completion::BatchCompletionHandler;
use crate::error::{JobFailure, PostProcessError};
use crate::events::{EventBus, FleetEvent};
use crate::job::{JobId, JobStatus, OutputFolderState, PostProcessStage};
use crate::layout::{RunLayout, LEDGER_FILE};
use crate::ledger::{Ledger, LedgerEntry};
use crate::registry::JobRegistry;

/// Written into a folder right before it is deleted after a confirmed upload.
pub const UPLOAD_MARKER: &str = ".upload_complete";

// =============================================================================
// External stages
// =============================================================================

/// Enrich a completed output folder in place. Must be idempotent.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, folder: &Path) -> anyhow::Result<()>;
}

/// Transfer a folder. `Ok` means its contents may be deleted.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, folder: &Path) -> anyhow::Result<()>;
}

/// `program [args..] <folder>`; exit 0 is success.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ExternalCommand {
    /// Parse a whitespace separated command line, e.g. `python upload_bids.py`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    async fn run(&self, folder: &Path) -> anyhow::Result<()> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(folder)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(3)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join(" | ");
            bail!(
                "{} exited with {}: {}",
                self.program,
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                tail
            );
        }
        Ok(())
    }
}

pub struct CommandEnricher(pub ExternalCommand);

#[async_trait]
impl Enricher for CommandEnricher {
    async fn enrich(&self, folder: &Path) -> anyhow::Result<()> {
        self.0.run(folder).await
    }
}

pub struct CommandUploader(pub ExternalCommand);

#[async_trait]
impl Uploader for CommandUploader {
    async fn upload(&self, folder: &Path) -> anyhow::Result<()> {
        self.0.run(folder).await
    }
}

// =============================================================================
// Retry and results
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

/// One folder's way through the upload stage.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub job: JobId,
    pub folder: PathBuf,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UploadOutcome {
    /// The job produced no completed folder.
    NoOutput,
    /// Upload is disabled; the folder stays on disk.
    Disabled,
    Uploaded { attempts: u32 },
    EnrichmentFailed { reason: String },
    UploadFailed { attempts: u32, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job: JobId,
    pub status: JobStatus,
    pub failure: Option<JobFailure>,
    pub duration_secs: Option<i64>,
    pub log: PathBuf,
    pub upload: UploadOutcome,
}

/// Final report of a batch, logged and put on the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub epoch: u64,
    pub jobs: Vec<JobSummary>,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.jobs.iter().filter(|j| j.status == JobStatus::Success).count()
    }

    pub fn failed(&self) -> usize {
        self.jobs.iter().filter(|j| j.status == JobStatus::Failed).count()
    }

    pub fn uploaded(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| matches!(j.upload, UploadOutcome::Uploaded { .. }))
            .count()
    }

    /// Folders left on disk for manual follow-up.
    pub fn needs_attention(&self) -> Vec<&JobSummary> {
        self.jobs
            .iter()
            .filter(|j| {
                matches!(
                    j.upload,
                    UploadOutcome::EnrichmentFailed { .. } | UploadOutcome::UploadFailed { .. }
                )
            })
            .collect()
    }
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct PostProcessor {
    layout: RunLayout,
    registry: Arc<JobRegistry>,
    ledger: Arc<Ledger>,
    events: EventBus,
    enricher: Option<Arc<dyn Enricher>>,
    uploader: Option<Arc<dyn Uploader>>,
    retry: RetryPolicy,
}

impl PostProcessor {
    pub fn new(
        layout: RunLayout,
        registry: Arc<JobRegistry>,
        ledger: Arc<Ledger>,
        events: EventBus,
    ) -> Self {
        Self {
            layout,
            registry,
            ledger,
            events,
            enricher: None,
            uploader: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// At least one attempt is always made.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            max_attempts: retry.max_attempts.max(1),
            ..retry
        };
        self
    }

    /// Post-process every job whose output folder is Completed.
    pub async fn run(&self, epoch: u64) -> BatchSummary {
        self.events.emit(FleetEvent::PostProcessingStarted { epoch });

        let records = self.registry.snapshot();
        let targets: Vec<(JobId, PathBuf)> = records
            .iter()
            .filter(|r| r.output_folder == OutputFolderState::Completed)
            .map(|r| (r.id.clone(), self.layout.completed_dir(&r.id)))
            .filter(|(id, folder)| {
                let exists = folder.is_dir();
                if !exists {
                    warn!(job_id = %id, folder = %folder.display(), "completed folder vanished before post-processing");
                }
                exists
            })
            .collect();

        info!(epoch, folders = targets.len(), "post-processing started");
        let outcomes = self.process_folders(targets, true).await;
        self.ledger.flush().await;

        let jobs = records
            .into_iter()
            .map(|r| {
                let upload = outcomes
                    .iter()
                    .find(|(id, _)| *id == r.id)
                    .map(|(_, o)| o.clone())
                    .unwrap_or(UploadOutcome::NoOutput);
                JobSummary {
                    duration_secs: r.runtime().map(|d| d.num_seconds()),
                    job: r.id,
                    status: r.status,
                    failure: r.failure,
                    log: r.log_path,
                    upload,
                }
            })
            .collect();

        BatchSummary { epoch, jobs }
    }

    /// Re-run post-processing for folders a previous run left behind.
    ///
    /// These belong to an earlier batch, so the current records are not touched.
    pub async fn upload_pending(&self, folders: Vec<(JobId, PathBuf)>) -> Vec<(JobId, UploadOutcome)> {
        if folders.is_empty() {
            return Vec::new();
        }
        info!(folders = folders.len(), "post-processing folders left by a previous run");
        let outcomes = self.process_folders(folders, false).await;
        self.ledger.flush().await;
        outcomes
    }

    async fn process_folders(
        &self,
        targets: Vec<(JobId, PathBuf)>,
        track: bool,
    ) -> Vec<(JobId, UploadOutcome)> {
        let mut outcomes = Vec::with_capacity(targets.len());
        let mut enriched = Vec::new();

        for (id, folder) in targets {
            if track {
                self.stage(&id, PostProcessStage::Enriching);
            }
            match self.enrich(&id, &folder).await {
                Ok(()) => {
                    if track {
                        self.stage(&id, PostProcessStage::Enriched);
                    }
                    enriched.push((id, folder));
                }
                Err(e) => {
                    if track {
                        self.stage(&id, PostProcessStage::Failed);
                    }
                    let reason = match &e {
                        PostProcessError::EnrichmentFailure { reason, .. } => reason.clone(),
                        other => other.to_string(),
                    };
                    outcomes.push((id, UploadOutcome::EnrichmentFailed { reason }));
                }
            }
        }

        for (id, folder) in enriched {
            if self.uploader.is_none() {
                info!(job_id = %id, folder = %folder.display(), "upload disabled, keeping folder");
                outcomes.push((id, UploadOutcome::Disabled));
                continue;
            }
            if track {
                self.stage(&id, PostProcessStage::Uploading);
            }
            let task = UploadTask {
                job: id.clone(),
                folder,
                attempt_count: 0,
                last_error: None,
            };
            let outcome = match self.upload(task, track).await {
                Ok(task) => {
                    if track {
                        self.stage(&id, PostProcessStage::Uploaded);
                    }
                    UploadOutcome::Uploaded {
                        attempts: task.attempt_count,
                    }
                }
                Err(PostProcessError::UploadFailure {
                    attempts,
                    last_error,
                    ..
                }) => {
                    if track {
                        self.stage(&id, PostProcessStage::Failed);
                    }
                    UploadOutcome::UploadFailed {
                        attempts,
                        error: last_error,
                    }
                }
                Err(other) => UploadOutcome::UploadFailed {
                    attempts: 0,
                    error: other.to_string(),
                },
            };
            outcomes.push((id, outcome));
        }

        outcomes
    }

    async fn enrich(&self, id: &JobId, folder: &Path) -> Result<(), PostProcessError> {
        let Some(enricher) = &self.enricher else {
            debug!(job_id = %id, "no enricher configured, skipping enrichment");
            return Ok(());
        };

        info!(job_id = %id, folder = %folder.display(), "enriching");
        let result = enricher.enrich(folder).await;
        self.events.emit(FleetEvent::EnrichmentFinished {
            job: id.clone(),
            success: result.is_ok(),
        });

        result.map_err(|e| {
            error!(job_id = %id, folder = %folder.display(), error = %e, "enrichment failed, folder will not be uploaded");
            PostProcessError::EnrichmentFailure {
                folder: folder.to_path_buf(),
                reason: format!("{e:#}"),
            }
        })
    }

    /// Upload with bounded retry. On success the folder is gone; on failure
    /// it is still on disk.
    pub async fn upload(&self, mut task: UploadTask, track: bool) -> Result<UploadTask, PostProcessError> {
        let Some(uploader) = &self.uploader else {
            return Err(PostProcessError::UploadFailure {
                folder: task.folder,
                attempts: 0,
                last_error: "upload disabled".to_string(),
            });
        };

        while task.attempt_count < self.retry.max_attempts {
            task.attempt_count += 1;
            let attempt = task.attempt_count;
            if track {
                let _ = self.registry.set_upload_attempts(&task.job, attempt);
            }
            self.events.emit(FleetEvent::UploadAttempt {
                job: task.job.clone(),
                attempt,
            });
            info!(job_id = %task.job, attempt, max = self.retry.max_attempts, "uploading");

            match uploader.upload(&task.folder).await {
                Ok(()) => {
                    // Recorded first so a folder whose cleanup fails is not
                    // uploaded again after a restart.
                    self.record_upload(LedgerEntry::UploadSucceeded {
                        job: task.job.clone(),
                        folder: task.folder.clone(),
                    })
                    .await;
                    finalize_folder(&task.folder).await;
                    self.events.emit(FleetEvent::UploadSucceeded {
                        job: task.job.clone(),
                        folder: task.folder.clone(),
                    });
                    info!(job_id = %task.job, attempt, "upload succeeded");
                    return Ok(task);
                }
                Err(e) => {
                    warn!(job_id = %task.job, attempt, error = %e, "upload attempt failed");
                    task.last_error = Some(format!("{e:#}"));
                    if task.attempt_count < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay).await;
                    }
                }
            }
        }

        let last_error = task.last_error.clone().unwrap_or_default();
        error!(
            job_id = %task.job,
            folder = %task.folder.display(),
            attempts = task.attempt_count,
            error = %last_error,
            "upload failed after all retries, keeping folder"
        );
        self.record_upload(LedgerEntry::UploadFailed {
            job: task.job.clone(),
            folder: task.folder.clone(),
            attempts: task.attempt_count,
            error: last_error.clone(),
        })
        .await;
        self.events.emit(FleetEvent::UploadFailed {
            job: task.job.clone(),
            folder: task.folder.clone(),
            attempts: task.attempt_count,
            error: last_error.clone(),
        });
        Err(PostProcessError::UploadFailure {
            folder: task.folder,
            attempts: task.attempt_count,
            last_error,
        })
    }

    /// Upload entries go to the ledger of the folder's own run-date, which is
    /// the one recovery consults for that folder.
    async fn record_upload(&self, entry: LedgerEntry) {
        let run_dir = self.layout.run_dir();
        let other_run_dir = match &entry {
            LedgerEntry::UploadSucceeded { folder, .. } | LedgerEntry::UploadFailed { folder, .. } => folder
                .parent()
                .filter(|dir| *dir != run_dir)
                .map(Path::to_path_buf),
            _ => None,
        };
        let Some(dir) = other_run_dir else {
            self.ledger.record(entry);
            return;
        };

        let path = dir.join(LEDGER_FILE);
        let result = tokio::task::spawn_blocking(move || Ledger::new(path).append(entry)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(dir = %dir.display(), error = %e, "failed to append ledger entry"),
            Err(e) => error!(error = %e, "ledger append task panicked"),
        }
    }

    fn stage(&self, id: &JobId, stage: PostProcessStage) {
        if let Err(e) = self.registry.set_post_process(id, stage) {
            debug!(job_id = %id, error = %e, "cannot record post-processing stage");
        }
    }
}

#[async_trait]
impl BatchCompletionHandler for PostProcessor {
    async fn on_batch_complete(&self, epoch: u64) {
        let summary = self.run(epoch).await;

        info!(
            epoch,
            jobs = summary.jobs.len(),
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            uploaded = summary.uploaded(),
            "batch complete"
        );
        for job in summary.needs_attention() {
            warn!(job_id = %job.job, outcome = ?job.upload, "folder kept for manual follow-up");
        }

        self.events.emit(FleetEvent::BatchCompleted { summary });
    }
}

/// Marker, prune empty subfolders, delete. Errors are logged: the upload
/// itself already succeeded.
async fn finalize_folder(folder: &Path) {
    let folder = folder.to_path_buf();
    let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        std::fs::write(folder.join(UPLOAD_MARKER), Utc::now().to_rfc3339())?;
        prune_empty_dirs(&folder)?;
        std::fs::remove_dir_all(&folder)
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "failed to clean up uploaded folder"),
        Err(e) => error!(error = %e, "cleanup task panicked"),
    }
}

/// Remove empty directories below `root`, deepest first. `root` itself stays.
fn prune_empty_dirs(root: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_dir() {
            prune_empty_dirs(&path)?;
            if std::fs::read_dir(&path)?.next().is_none() {
                std::fs::remove_dir(&path)?;
            }
        }
    }
    Ok(())
}
