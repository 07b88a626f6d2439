//! On-disk layout of a run.
//!
//! ```text
//! <work_dir>/
//!   <run_date>/                 one working folder per run-date
//!     <job>_IN_PROGRESS/        while the job runs (created by the job)
//!     <job>_COMPLETED/          renamed by the job on success
//!     logs/<job>.log            per-job output
//!     ledger.jsonl              append-only run ledger
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{Duration, NaiveDate, Utc};

use crate::job::{JobId, OutputFolderState};

pub const IN_PROGRESS_SUFFIX: &str = "_IN_PROGRESS";
pub const COMPLETED_SUFFIX: &str = "_COMPLETED";
pub const LEDGER_FILE: &str = "ledger.jsonl";

/// Fingerprint of a folder: its modification time and how many entries it
/// holds. Adding, removing or renaming anything inside changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderStamp {
    modified: Option<SystemTime>,
    entries: usize,
}

impl FolderStamp {
    pub fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok().filter(|m| m.is_dir())?;
        let entries = fs::read_dir(path).map(|d| d.count()).unwrap_or(0);
        Some(Self {
            modified: meta.modified().ok(),
            entries,
        })
    }
}

/// Paths for one run-date folder.
#[derive(Debug, Clone)]
pub struct RunLayout {
    work_dir: PathBuf,
    run_date: String,
}

impl RunLayout {
    pub fn new(work_dir: impl Into<PathBuf>, run_date: impl Into<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            run_date: run_date.into(),
        }
    }

    /// Crawlers collect the previous day's postings, so runs are filed under yesterday.
    pub fn default_run_date() -> String {
        format_run_date((Utc::now() - Duration::days(1)).date_naive())
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn run_date(&self) -> &str {
        &self.run_date
    }

    pub fn run_dir(&self) -> PathBuf {
        self.work_dir.join(&self.run_date)
    }

    pub fn in_progress_dir(&self, id: &JobId) -> PathBuf {
        self.run_dir().join(format!("{id}{IN_PROGRESS_SUFFIX}"))
    }

    pub fn completed_dir(&self, id: &JobId) -> PathBuf {
        self.run_dir().join(format!("{id}{COMPLETED_SUFFIX}"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.run_dir().join("logs")
    }

    pub fn log_path(&self, id: &JobId) -> PathBuf {
        self.logs_dir().join(format!("{id}.log"))
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.run_dir().join(LEDGER_FILE)
    }

    /// Folder state as it currently exists on disk.
    ///
    /// A `_COMPLETED` folder wins if both exist.
    pub fn folder_state(&self, id: &JobId) -> OutputFolderState {
        if self.completed_dir(id).is_dir() {
            OutputFolderState::Completed
        } else if self.in_progress_dir(id).is_dir() {
            OutputFolderState::InProgress
        } else {
            OutputFolderState::None
        }
    }

    pub fn completed_stamp(&self, id: &JobId) -> Option<FolderStamp> {
        FolderStamp::of(&self.completed_dir(id))
    }
}

pub fn format_run_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Recover the job id from a `<job>_COMPLETED` / `<job>_IN_PROGRESS` folder name.
pub fn job_id_from_folder(path: &Path) -> Option<JobId> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(COMPLETED_SUFFIX)
        .or_else(|| name.strip_suffix(IN_PROGRESS_SUFFIX))
        .filter(|id| !id.is_empty())
        .map(JobId::from)
}

/// Whether a directory name looks like a run-date folder (`YYYY-MM-DD`).
pub fn is_run_date_folder(name: &str) -> bool {
    NaiveDate::parse_from_str(name, "%Y-%m-%d").is_ok()
}
