//! Single source of truth for job records.
//!
//! The scheduler moves jobs `Pending -> Running`, the supervisor moves them
//! `Running -> Success | Failed`. Both run on different tasks, so every
//! mutation goes through a per-record shard lock (`DashMap::get_mut`) and
//! reads hand out cloned snapshots. No caller ever holds a reference into the
//! map across an await point.

use std::path::PathBuf;

use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{JobFailure, OrchestratorError, Result};
use crate::job::{JobId, JobRecord, JobStatus, OutputFolderState, PostProcessStage};

#[derive(Debug)]
pub struct JobRegistry {
    records: DashMap<JobId, JobRecord>,
    /// Canonical roster order. Fixed at construction.
    order: Vec<JobId>,
}

impl JobRegistry {
    /// Build a registry from the roster, one Pending record per job.
    ///
    /// Duplicate ids keep their first position.
    pub fn new(roster: Vec<JobId>, log_path: impl Fn(&JobId) -> PathBuf) -> Self {
        let records = DashMap::new();
        let mut order = Vec::with_capacity(roster.len());
        for id in roster {
            if records.contains_key(&id) {
                continue;
            }
            let record = JobRecord::new(id.clone(), order.len(), log_path(&id));
            records.insert(id.clone(), record);
            order.push(id);
        }
        Self { records, order }
    }

    pub fn order(&self) -> &[JobId] {
        &self.order
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: &JobId) -> Result<JobRecord> {
        self.records
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| OrchestratorError::JobNotFound(id.clone()))
    }

    pub fn status(&self, id: &JobId) -> Result<JobStatus> {
        self.records
            .get(id)
            .map(|r| r.status)
            .ok_or_else(|| OrchestratorError::JobNotFound(id.clone()))
    }

    /// Records with the given status, in canonical order.
    pub fn list_by_status(&self, status: JobStatus) -> Vec<JobRecord> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| r.status == status)
            .map(|r| r.value().clone())
            .collect()
    }

    /// Every record, in canonical order.
    pub fn snapshot(&self) -> Vec<JobRecord> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id).map(|r| r.value().clone()))
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == JobStatus::Running)
            .count()
    }

    /// True when every job is Success or Failed.
    pub fn all_terminal(&self) -> bool {
        self.records.iter().all(|r| r.status.is_terminal())
    }

    /// Atomically claim a job for admission.
    ///
    /// Pending always qualifies. Failed qualifies only for explicit restarts.
    /// The check and the transition happen under the same shard lock, so two
    /// concurrent admissions of the same id cannot both succeed.
    pub fn begin_run(&self, id: &JobId, allow_restart: bool) -> Result<JobRecord> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::JobNotFound(id.clone()))?;

        match record.status {
            JobStatus::Running => return Err(OrchestratorError::AlreadyRunning(id.clone())),
            JobStatus::Success => return Err(OrchestratorError::NotRestartable(id.clone())),
            JobStatus::Failed if !allow_restart => {
                return Err(OrchestratorError::NotRestartable(id.clone()))
            }
            JobStatus::Pending | JobStatus::Failed => {}
        }

        record.status = JobStatus::Running;
        record.started_at = Some(Utc::now());
        record.ended_at = None;
        record.progress_percent = 0;
        record.failure = None;
        record.pid = None;
        record.output_folder = OutputFolderState::InProgress;
        record.post_process = PostProcessStage::NotStarted;
        record.upload_attempts = 0;
        debug!(job_id = %id, "job claimed for admission");
        Ok(record.value().clone())
    }

    /// Set the status and stamp timestamps.
    ///
    /// Entering Running stamps `started_at`; entering a terminal status stamps
    /// `ended_at` and drops the pid.
    pub fn set_status(&self, id: &JobId, status: JobStatus) -> Result<JobRecord> {
        self.update(id, |record| {
            let now = Utc::now();
            match status {
                JobStatus::Running => {
                    record.started_at = Some(now);
                    record.ended_at = None;
                }
                JobStatus::Success | JobStatus::Failed => {
                    record.ended_at = Some(now);
                    record.pid = None;
                }
                JobStatus::Pending => {}
            }
            record.status = status;
        })
    }

    /// Record the final outcome of a run in one step.
    pub fn finish(
        &self,
        id: &JobId,
        status: JobStatus,
        failure: Option<JobFailure>,
        folder: OutputFolderState,
    ) -> Result<JobRecord> {
        self.update(id, |record| {
            record.status = status;
            record.ended_at = Some(Utc::now());
            record.pid = None;
            record.failure = failure;
            record.output_folder = folder;
            if status == JobStatus::Success {
                record.progress_percent = 100;
            }
        })
    }

    /// Progress is clamped to 100 and ignored once the job left Running.
    pub fn set_progress(&self, id: &JobId, percent: u8) -> Result<()> {
        self.update(id, |record| {
            if record.status == JobStatus::Running {
                record.progress_percent = percent.min(100);
            }
        })
        .map(|_| ())
    }

    pub fn set_pid(&self, id: &JobId, pid: Option<u32>) -> Result<()> {
        self.update(id, |record| record.pid = pid).map(|_| ())
    }

    pub fn set_post_process(&self, id: &JobId, stage: PostProcessStage) -> Result<()> {
        self.update(id, |record| record.post_process = stage).map(|_| ())
    }

    pub fn set_upload_attempts(&self, id: &JobId, attempts: u32) -> Result<()> {
        self.update(id, |record| record.upload_attempts = attempts)
            .map(|_| ())
    }

    /// Reset every record to Pending for a new batch.
    ///
    /// Running records are left alone; callers only reset once the previous
    /// batch is fully terminal.
    pub fn reset_all(&self) {
        for mut entry in self.records.iter_mut() {
            if entry.status != JobStatus::Running {
                entry.reset();
            }
        }
    }

    fn update(&self, id: &JobId, f: impl FnOnce(&mut JobRecord)) -> Result<JobRecord> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::JobNotFound(id.clone()))?;
        f(record.value_mut());
        Ok(record.value().clone())
    }
}
