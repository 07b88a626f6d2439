//! Startup recovery after an orchestrator restart.
//!
//! Two things can be left behind by a previous process:
//! - jobs that were running when it died (an `_IN_PROGRESS` folder, or a
//!   ledger start without a finish). These are recorded as crashed failures.
//! - `_COMPLETED` folders that never made it through upload. These are
//!   handed back to the post-processing pipeline.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{JobFailure, Result};
use crate::job::{JobId, JobStatus, OutputFolderState};
use crate::layout::{is_run_date_folder, job_id_from_folder, RunLayout, COMPLETED_SUFFIX};
use crate::ledger::{Ledger, LedgerEntry, LedgerState};
use crate::registry::JobRegistry;

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub crashed: Vec<JobId>,
    pub pending_uploads: Vec<(JobId, PathBuf)>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.crashed.is_empty() && self.pending_uploads.is_empty()
    }

    /// Pending uploads inside `run_dir`, then the ones from other run-dates.
    ///
    /// Folders of the current run-date share paths with the next batch's
    /// output, so they have to be settled before that batch starts.
    pub fn split_pending(&self, run_dir: &Path) -> (Vec<(JobId, PathBuf)>, Vec<(JobId, PathBuf)>) {
        self.pending_uploads
            .iter()
            .cloned()
            .partition(|(_, folder)| folder.parent() == Some(run_dir))
    }
}

pub fn recover(layout: &RunLayout, registry: &JobRegistry, ledger: &Ledger) -> Result<RecoveryReport> {
    let state = LedgerState::fold(&ledger.load()?);
    let mut report = RecoveryReport::default();

    let mut crashed: Vec<JobId> = registry
        .order()
        .iter()
        .filter(|id| layout.folder_state(id) == OutputFolderState::InProgress)
        .cloned()
        .collect();
    for id in state.unfinished {
        if !crashed.contains(&id) {
            crashed.push(id);
        }
    }

    for id in &crashed {
        warn!(job_id = %id, "job did not finish before the last shutdown, marking crashed");
        if registry.contains(id) {
            registry.finish(id, JobStatus::Failed, Some(JobFailure::Crashed), OutputFolderState::None)?;
        }
        ledger.append(LedgerEntry::JobFinished {
            job: id.clone(),
            status: JobStatus::Failed,
            failure: Some(JobFailure::Crashed),
        })?;
    }
    report.crashed = crashed;
    report.pending_uploads = completed_folders(layout)?;

    if report.is_clean() {
        info!("no unfinished work from a previous run");
    } else {
        info!(
            crashed = report.crashed.len(),
            pending_uploads = report.pending_uploads.len(),
            "recovered unfinished work"
        );
    }
    Ok(report)
}

/// Every `<job>_COMPLETED` folder under any run-date folder of the work dir
/// that the run-date's ledger does not already record as uploaded.
fn completed_folders(layout: &RunLayout) -> Result<Vec<(JobId, PathBuf)>> {
    let mut found = Vec::new();
    let work_dir = layout.work_dir();
    if !work_dir.is_dir() {
        return Ok(found);
    }

    let mut run_dirs: Vec<PathBuf> = fs::read_dir(work_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(is_run_date_folder)
                .unwrap_or(false)
        })
        .collect();
    run_dirs.sort();

    for run_dir in run_dirs {
        let Some(run_date) = run_dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let uploaded = LedgerState::fold(&Ledger::read(
            &RunLayout::new(work_dir, run_date).ledger_path(),
        )?)
        .uploaded;

        let mut folders: Vec<PathBuf> = fs::read_dir(&run_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(COMPLETED_SUFFIX))
                    .unwrap_or(false)
            })
            .collect();
        folders.sort();
        for folder in folders {
            let Some(id) = job_id_from_folder(&folder) else {
                continue;
            };
            if uploaded.contains(&id) {
                warn!(job_id = %id, folder = %folder.display(), "folder was already uploaded but not removed, skipping");
                continue;
            }
            found.push((id, folder));
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovers_crashed_and_pending() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path(), "2024-03-02");
        let roster: Vec<JobId> = ["a", "b", "c"].iter().map(|s| JobId::from(*s)).collect();
        let registry = JobRegistry::new(roster, |id| layout.log_path(id));
        let ledger = Ledger::new(layout.ledger_path());

        // a: crashed mid-run (folder still in progress)
        fs::create_dir_all(layout.in_progress_dir(&JobId::from("a"))).unwrap();
        // b: started per the ledger, never finished, no folder
        ledger
            .append(LedgerEntry::JobStarted { job: JobId::from("b") })
            .unwrap();
        // c: completed yesterday, never uploaded
        let old = RunLayout::new(tmp.path(), "2024-03-01");
        fs::create_dir_all(old.completed_dir(&JobId::from("c"))).unwrap();
        // noise
        fs::create_dir_all(tmp.path().join("cache")).unwrap();

        let report = recover(&layout, &registry, &ledger).unwrap();

        assert_eq!(report.crashed, vec![JobId::from("a"), JobId::from("b")]);
        assert_eq!(report.pending_uploads.len(), 1);
        assert_eq!(report.pending_uploads[0].0, JobId::from("c"));

        let a = registry.get(&JobId::from("a")).unwrap();
        assert_eq!(a.status, JobStatus::Failed);
        assert_eq!(a.failure, Some(JobFailure::Crashed));

        let state = LedgerState::fold(&ledger.load().unwrap());
        assert!(state.unfinished.is_empty());
    }

    #[test]
    fn test_uploaded_folders_are_not_pending() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path(), "2024-03-02");
        let roster: Vec<JobId> = ["a", "b"].iter().map(|s| JobId::from(*s)).collect();
        let registry = JobRegistry::new(roster, |id| layout.log_path(id));
        let ledger = Ledger::new(layout.ledger_path());

        // a: uploaded, but its folder could not be deleted
        let a = layout.completed_dir(&JobId::from("a"));
        fs::create_dir_all(&a).unwrap();
        ledger.append(LedgerEntry::JobStarted { job: JobId::from("a") }).unwrap();
        ledger
            .append(LedgerEntry::JobFinished {
                job: JobId::from("a"),
                status: JobStatus::Success,
                failure: None,
            })
            .unwrap();
        ledger
            .append(LedgerEntry::UploadSucceeded {
                job: JobId::from("a"),
                folder: a.clone(),
            })
            .unwrap();
        // b: uploaded in an older run-date, then produced again and not uploaded
        let b = layout.completed_dir(&JobId::from("b"));
        fs::create_dir_all(&b).unwrap();
        let older = RunLayout::new(tmp.path(), "2024-03-01");
        let old_b = older.completed_dir(&JobId::from("b"));
        fs::create_dir_all(&old_b).unwrap();
        Ledger::new(older.ledger_path())
            .append(LedgerEntry::UploadSucceeded {
                job: JobId::from("b"),
                folder: old_b.clone(),
            })
            .unwrap();

        let report = recover(&layout, &registry, &ledger).unwrap();
        assert_eq!(report.pending_uploads, vec![(JobId::from("b"), b)]);
    }

    #[test]
    fn test_split_pending_by_run_dir() {
        let layout = RunLayout::new("/data", "2024-03-02");
        let older = RunLayout::new("/data", "2024-03-01");
        let report = RecoveryReport {
            crashed: Vec::new(),
            pending_uploads: vec![
                (JobId::from("a"), older.completed_dir(&JobId::from("a"))),
                (JobId::from("b"), layout.completed_dir(&JobId::from("b"))),
            ],
        };

        let (current, other) = report.split_pending(&layout.run_dir());
        assert_eq!(current, vec![(JobId::from("b"), layout.completed_dir(&JobId::from("b")))]);
        assert_eq!(other, vec![(JobId::from("a"), older.completed_dir(&JobId::from("a")))]);
    }

    #[test]
    fn test_clean_start() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path().join("missing"), "2024-03-02");
        let registry = JobRegistry::new(vec![JobId::from("a")], |id| layout.log_path(id));
        let ledger = Ledger::new(layout.ledger_path());

        let report = recover(&layout, &registry, &ledger).unwrap();
        assert!(report.is_clean());
    }
}
