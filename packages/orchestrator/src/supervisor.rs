//! Worker supervisor: one OS process per running job.
//!
//! ```text
//!   start(id) ──► spawn task ──► Command::spawn (own process group)
//!                                   │
//!                      stdout/stderr copied to logs/<id>.log
//!                      PROGRESS lines update the registry
//!                                   │
//!                               child.wait()
//!                                   │
//!                  sweep leftover group members (SIGKILL)
//!                                   │
//!              decide outcome ─► registry ─► ledger ─► feed ─► JobExit
//! ```
//!
//! The supervisor is the only owner of process handles. A job's entry in
//! `running` exists from `start` until its exit has been fully recorded, so a
//! stop request that arrives while the process is still being spawned is not
//! lost: the spawn task sees the `terminated` flag and escalates itself.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::JobFailure;
use crate::events::{EventBus, FleetEvent};
use crate::job::{JobId, JobStatus, OutputFolderState};
use crate::layout::RunLayout;
use crate::ledger::{Ledger, LedgerEntry};
use crate::process_tree::{terminate_tree, tree_alive, TerminateMode};
use crate::registry::JobRegistry;

/// How long output copiers may keep draining after the process tree is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for exit after SIGKILL before giving up on the handle.
const KILL_WAIT: Duration = Duration::from_secs(2);

// =============================================================================
// Configuration
// =============================================================================

/// Which signals count as a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuccessPolicy {
    /// Exit code 0, or a non-zero exit when the `_COMPLETED` folder exists.
    /// Some crawlers restart themselves and exit non-zero after finishing.
    #[default]
    ExitCodeOrMarker,
    /// Exit code 0 only. The folder is a consistency check.
    ExitCodeOnly,
}

impl FromStr for SuccessPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exit_code_or_marker" => Ok(SuccessPolicy::ExitCodeOrMarker),
            "exit_code_only" => Ok(SuccessPolicy::ExitCodeOnly),
            other => Err(format!(
                "unknown success policy '{other}' (expected exit_code_or_marker or exit_code_only)"
            )),
        }
    }
}

/// The job executable: `program [args..] <jobId> --days N`.
#[derive(Debug, Clone)]
pub struct RunnerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub lookback_days: u32,
}

impl RunnerCommand {
    pub fn command(&self, id: &JobId) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(id.as_str())
            .arg("--days")
            .arg(self.lookback_days.to_string());
        cmd
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub runner: RunnerCommand,
    /// Bounded wait between the graceful and the forceful signal.
    pub grace: Duration,
    pub success_policy: SuccessPolicy,
}

/// Reported to the scheduler exactly once per run, after the registry,
/// ledger and feed have all seen the outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobExit {
    pub id: JobId,
    pub status: JobStatus,
}

// =============================================================================
// Supervisor
// =============================================================================

#[derive(Debug)]
struct RunningJob {
    /// 0 until the process has been spawned.
    pid: AtomicU32,
    terminated: AtomicBool,
    /// Cancelled as soon as the child has been waited on. Its pid may be
    /// reused from then on, so nothing signals it afterwards.
    reaped: CancellationToken,
    /// Cancelled once the exit has been fully recorded.
    exited: CancellationToken,
}

impl RunningJob {
    fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }
}

#[derive(Clone)]
pub struct WorkerSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: SupervisorConfig,
    layout: RunLayout,
    registry: Arc<JobRegistry>,
    ledger: Arc<Ledger>,
    events: EventBus,
    exits: mpsc::UnboundedSender<JobExit>,
    running: DashMap<JobId, Arc<RunningJob>>,
}

impl WorkerSupervisor {
    pub fn new(
        config: SupervisorConfig,
        layout: RunLayout,
        registry: Arc<JobRegistry>,
        ledger: Arc<Ledger>,
        events: EventBus,
        exits: mpsc::UnboundedSender<JobExit>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                layout,
                registry,
                ledger,
                events,
                exits,
                running: DashMap::new(),
            }),
        }
    }

    pub fn running_ids(&self) -> Vec<JobId> {
        self.inner.running.iter().map(|e| e.key().clone()).collect()
    }

    /// Start a job the registry has already moved to Running.
    ///
    /// Returns immediately; spawning and waiting happen on their own task.
    /// The outcome arrives on the exit channel.
    pub fn start(&self, id: JobId) {
        let job = Arc::new(RunningJob {
            pid: AtomicU32::new(0),
            terminated: AtomicBool::new(false),
            reaped: CancellationToken::new(),
            exited: CancellationToken::new(),
        });
        if self.inner.running.insert(id.clone(), job.clone()).is_some() {
            // The registry's begin_run makes this unreachable; keep the
            // newer handle rather than orphaning the exit report.
            warn!(job_id = %id, "replaced an existing process handle");
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_job(id, job).await;
        });
    }

    /// Stop a running job and everything it spawned.
    ///
    /// Graceful signal first, forceful kill after the grace period. Returns
    /// once the exit has been recorded or the bound has elapsed. Returns
    /// `false` if the job was not running.
    pub async fn stop(&self, id: &JobId) -> bool {
        let Some(job) = self.inner.running.get(id).map(|e| e.value().clone()) else {
            return false;
        };
        if job.terminated.swap(true, Ordering::SeqCst) {
            debug!(job_id = %id, "stop already in progress");
        }

        let grace = self.inner.config.grace;
        match job.pid() {
            Some(pid) => {
                info!(job_id = %id, pid, "stopping job");
                escalate(id, pid, grace, &job).await;
            }
            None => {
                // Still spawning; the spawn task sees the flag and escalates.
                let _ = timeout(grace + KILL_WAIT, job.exited.cancelled()).await;
            }
        }

        let _ = timeout(DRAIN_TIMEOUT, job.exited.cancelled()).await;
        true
    }

    /// Stop every running job concurrently. Returns the ids that were stopped.
    pub async fn stop_all(&self) -> Vec<JobId> {
        let ids = self.running_ids();
        let stops = ids.iter().map(|id| self.stop(id));
        let stopped = join_all(stops).await;
        ids.into_iter()
            .zip(stopped)
            .filter_map(|(id, stopped)| stopped.then_some(id))
            .collect()
    }
}

/// Graceful signal, bounded wait, forceful kill of survivors.
///
/// Once the child has been reaped the group is swept by the spawn task, so
/// escalation stops signalling.
async fn escalate(id: &JobId, pid: u32, grace: Duration, job: &RunningJob) {
    if job.reaped.is_cancelled() {
        debug!(job_id = %id, pid, "job already exited");
        return;
    }
    if !terminate_tree(pid, TerminateMode::Graceful) {
        debug!(job_id = %id, pid, "process tree already gone");
    }
    if timeout(grace, job.reaped.cancelled()).await.is_ok() {
        return;
    }
    warn!(job_id = %id, pid, grace_secs = grace.as_secs_f32(), "grace period elapsed, killing process tree");
    terminate_tree(pid, TerminateMode::Force);
    if timeout(KILL_WAIT, job.reaped.cancelled()).await.is_err() && tree_alive(pid) {
        error!(job_id = %id, pid, "process tree survived SIGKILL");
    }
}

impl Inner {
    async fn run_job(self: Arc<Self>, id: JobId, job: Arc<RunningJob>) {
        let log_path = self.layout.log_path(&id);
        self.ledger.record(LedgerEntry::JobStarted { job: id.clone() });

        let (status, failure, fresh_output) = match self.spawn_and_wait(&id, &job, &log_path).await {
            Ok(outcome) => outcome,
            Err(message) => {
                error!(job_id = %id, error = %message, "failed to spawn job");
                job.reaped.cancel();
                (JobStatus::Failed, Some(JobFailure::SpawnError { message }), false)
            }
        };

        let folder = match (status, fresh_output) {
            (JobStatus::Success, true) => OutputFolderState::Completed,
            (JobStatus::Success, false) => {
                warn!(job_id = %id, "job succeeded without producing a _COMPLETED folder");
                OutputFolderState::None
            }
            _ => OutputFolderState::None,
        };

        if let Err(e) = self.registry.finish(&id, status, failure.clone(), folder) {
            error!(job_id = %id, error = %e, "failed to record job outcome");
        }
        self.ledger.record(LedgerEntry::JobFinished {
            job: id.clone(),
            status,
            failure: failure.clone(),
        });

        match &failure {
            None => info!(job_id = %id, "job succeeded"),
            Some(f) => warn!(job_id = %id, failure = %f, "job failed"),
        }
        self.events.emit(FleetEvent::JobFinished {
            job: id.clone(),
            status,
            failure,
        });

        self.running.remove_if(&id, |_, current| Arc::ptr_eq(current, &job));
        job.exited.cancel();

        if self.exits.send(JobExit { id: id.clone(), status }).is_err() {
            debug!(job_id = %id, "scheduler gone, exit not reported");
        }
    }

    async fn spawn_and_wait(
        &self,
        id: &JobId,
        job: &RunningJob,
        log_path: &Path,
    ) -> Result<(JobStatus, Option<JobFailure>, bool), String> {
        if let Some(dir) = log_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| format!("cannot create log directory {}: {e}", dir.display()))?;
        }
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await
            .map_err(|e| format!("cannot open log {}: {e}", log_path.display()))?;
        let header = format!("=== {id} started {} ===\n", chrono::Utc::now().to_rfc3339());
        let _ = log.write_all(header.as_bytes()).await;
        let log = Arc::new(Mutex::new(log));

        let mut cmd = self.config.runner.command(id);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        cmd.creation_flags(0x0000_0200); // CREATE_NEW_PROCESS_GROUP

        // A _COMPLETED folder kept from an earlier run is not this run's output.
        let stamp_before = self.layout.completed_stamp(id);

        let mut child = cmd.spawn().map_err(|e| {
            format!("{} {:?}: {e}", self.config.runner.program, self.config.runner.args)
        })?;

        let pid = child.id();
        if let Some(pid) = pid {
            job.pid.store(pid, Ordering::SeqCst);
        }
        if let Err(e) = self.registry.set_pid(id, pid) {
            warn!(job_id = %id, error = %e, "failed to record pid");
        }
        info!(job_id = %id, pid = ?pid, log = %log_path.display(), "job started");
        self.events.emit(FleetEvent::JobStarted {
            job: id.clone(),
            pid,
            log: log_path.to_path_buf(),
        });

        let mut copiers = Vec::new();
        if let Some(out) = child.stdout.take() {
            copiers.push(tokio::spawn(copy_output(
                out,
                id.clone(),
                log.clone(),
                self.registry.clone(),
                self.events.clone(),
            )));
        }
        if let Some(err) = child.stderr.take() {
            copiers.push(tokio::spawn(copy_output(
                err,
                id.clone(),
                log.clone(),
                self.registry.clone(),
                self.events.clone(),
            )));
        }

        // A stop that raced the spawn.
        if job.terminated.load(Ordering::SeqCst) {
            if let Some(pid) = pid {
                let grace = self.config.grace;
                let id = id.clone();
                let reaped = job.reaped.clone();
                tokio::spawn(async move {
                    terminate_tree(pid, TerminateMode::Graceful);
                    if timeout(grace, reaped.cancelled()).await.is_err()
                        && terminate_tree(pid, TerminateMode::Force)
                    {
                        debug!(job_id = %id, pid, "forced kill after racing stop");
                    }
                });
            }
        }

        let exit = child.wait().await;
        job.reaped.cancel();

        // Descendants outlive the leader unless swept; they also keep the
        // output pipes open. The group id stays reserved while any member
        // is left in it.
        if let Some(pid) = pid {
            terminate_tree(pid, TerminateMode::Force);
        }
        for copier in copiers {
            let abort = copier.abort_handle();
            if timeout(DRAIN_TIMEOUT, copier).await.is_err() {
                abort.abort();
            }
        }

        let terminated = job.terminated.load(Ordering::SeqCst);
        let fresh_output = match self.layout.completed_stamp(id) {
            Some(after) => stamp_before != Some(after),
            None => false,
        };
        if !fresh_output && stamp_before.is_some() {
            debug!(job_id = %id, "_COMPLETED folder predates this run, ignoring it");
        }
        let outcome = match exit {
            Ok(status) => decide_outcome(
                id,
                self.config.success_policy,
                &status,
                terminated,
                fresh_output,
            ),
            Err(e) => {
                error!(job_id = %id, error = %e, "failed to wait for job");
                let failure = if terminated {
                    JobFailure::Terminated
                } else {
                    JobFailure::NonZeroExit { code: None }
                };
                (JobStatus::Failed, Some(failure))
            }
        };

        let mut log = log.lock().await;
        let footer = format!("=== {id} exited: {} ===\n", outcome.0);
        let _ = log.write_all(footer.as_bytes()).await;
        let _ = log.flush().await;

        Ok((outcome.0, outcome.1, fresh_output))
    }
}

/// Map an exit to a final status. `fresh_output` means this run created or
/// changed the `_COMPLETED` folder.
fn decide_outcome(
    id: &JobId,
    policy: SuccessPolicy,
    exit: &ExitStatus,
    terminated: bool,
    fresh_output: bool,
) -> (JobStatus, Option<JobFailure>) {
    if terminated {
        return (JobStatus::Failed, Some(JobFailure::Terminated));
    }
    if exit.success() {
        return (JobStatus::Success, None);
    }
    match (policy, fresh_output) {
        (SuccessPolicy::ExitCodeOrMarker, true) => {
            warn!(job_id = %id, code = ?exit.code(), "non-zero exit but the run produced its _COMPLETED folder, accepting as success");
            (JobStatus::Success, None)
        }
        (SuccessPolicy::ExitCodeOnly, true) => {
            warn!(job_id = %id, code = ?exit.code(), "non-zero exit with a _COMPLETED folder, treating as failure");
            (JobStatus::Failed, Some(JobFailure::NonZeroExit { code: exit.code() }))
        }
        (_, false) => (JobStatus::Failed, Some(JobFailure::NonZeroExit { code: exit.code() })),
    }
}

/// Copy one output stream into the job log, line by line.
async fn copy_output<R>(
    stream: R,
    id: JobId,
    log: Arc<Mutex<tokio::fs::File>>,
    registry: Arc<JobRegistry>,
    events: EventBus,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if !line.ends_with(b"\n") {
                    line.push(b'\n');
                }
                if let Err(e) = log.lock().await.write_all(&line).await {
                    warn!(job_id = %id, error = %e, "failed to write job log");
                }
                if let Some(percent) = parse_progress(&String::from_utf8_lossy(&line)) {
                    if registry.set_progress(&id, percent).is_ok() {
                        events.emit(FleetEvent::JobProgress {
                            job: id.clone(),
                            percent,
                        });
                    }
                }
            }
            Err(e) => {
                debug!(job_id = %id, error = %e, "output stream closed");
                break;
            }
        }
    }
}

/// `PROGRESS 40`, `PROGRESS: 40%` and `PROGRESS: 40.5%` all parse.
pub fn parse_progress(line: &str) -> Option<u8> {
    let rest = line.trim().strip_prefix("PROGRESS")?;
    let value = rest
        .trim_start_matches(':')
        .trim()
        .trim_end_matches('%')
        .trim();
    let value: f32 = value.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(value.min(100.0) as u8)
}
