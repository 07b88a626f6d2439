//! Shared fixtures for process-level tests.
//!
//! Jobs are `sh -c '<script>' sh <jobId> --days N`, so inside the script the
//! job id is `$1` and `$RUN` (substituted before spawning) is the run-date
//! folder.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orchestrator_core::control::FleetBuilder;
use orchestrator_core::layout::RunLayout;
use orchestrator_core::pipeline::{RetryPolicy, Uploader};
use orchestrator_core::supervisor::{RunnerCommand, SuccessPolicy, SupervisorConfig};
use orchestrator_core::{ControlSurface, FleetEvent, JobId, JobStatus};
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const RUN_DATE: &str = "2024-03-01";

pub struct Fleet {
    pub tmp: TempDir,
    pub layout: RunLayout,
    pub control: ControlSurface,
}

pub fn ids(n: usize) -> Vec<JobId> {
    (1..=n).map(|i| JobId::new(format!("{i:02}_Job"))).collect()
}

pub fn builder(tmp: &TempDir, roster: Vec<JobId>, script: &str, grace: Duration) -> FleetBuilder {
    let layout = RunLayout::new(tmp.path(), RUN_DATE);
    std::fs::create_dir_all(layout.run_dir()).unwrap();
    let script = script.replace("$RUN", &layout.run_dir().display().to_string());

    let supervisor = SupervisorConfig {
        runner: RunnerCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script, "sh".to_string()],
            lookback_days: 2,
        },
        grace,
        success_policy: SuccessPolicy::ExitCodeOrMarker,
    };
    ControlSurface::builder(layout, roster, supervisor).retry(RetryPolicy {
        max_attempts: 3,
        delay: Duration::from_millis(10),
    })
}

pub fn fleet(roster: Vec<JobId>, max_concurrency: usize, script: &str) -> Fleet {
    let tmp = tempfile::tempdir().unwrap();
    let control = builder(&tmp, roster, script, Duration::from_millis(500))
        .max_concurrency(max_concurrency)
        .build();
    let layout = control.layout().clone();
    Fleet { tmp, layout, control }
}

/// Poll until `f` holds or the timeout elapses.
pub async fn eventually(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    f()
}

pub fn count(control: &ControlSurface, status: JobStatus) -> usize {
    control.status().iter().filter(|r| r.status == status).count()
}

/// Drain whatever is buffered on a feed receiver.
pub fn drain(rx: &mut broadcast::Receiver<FleetEvent>) -> Vec<FleetEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Uploader that counts calls and fails the first `fail_first` of them.
pub struct CountingUploader {
    pub calls: AtomicU32,
    pub fail_first: u32,
}

impl CountingUploader {
    pub fn new(fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_first,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Uploader for CountingUploader {
    async fn upload(&self, folder: &Path) -> anyhow::Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        anyhow::ensure!(folder.is_dir(), "folder missing: {}", folder.display());
        anyhow::ensure!(n > self.fail_first, "simulated failure {n}");
        Ok(())
    }
}

/// Alive and not a zombie (Linux only).
#[cfg(target_os = "linux")]
pub fn process_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .map(|state| state != "Z" && state != "X")
            .unwrap_or(false),
        Err(_) => false,
    }
}

pub fn completed_dir(layout: &RunLayout, id: &str) -> PathBuf {
    layout.completed_dir(&JobId::from(id))
}
