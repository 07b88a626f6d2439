//! Admission loop.
//!
//! A single task owns the [`Backlog`] and makes every admission decision.
//! Everything else talks to it through [`SchedulerHandle`]:
//!
//! ```text
//!   ControlSurface ──SchedulerCommand──►┐
//!                                       ├──► Scheduler task ──► WorkerSupervisor::start
//!   WorkerSupervisor ────JobExit───────►┘         │
//!                                                 └──► CompletionWatcher::evaluate
//! ```
//!
//! Admission is event driven: a batch start admits up to `max_concurrency`
//! jobs and each job exit admits the next one. There is no polling.
//!
//! Command handling never awaits. Stops are delegated to their own tasks so
//! a slow process tree cannot starve admission, and a panic while handling
//! one command is caught and logged instead of killing the loop.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::backlog::Backlog;
use crate::completion::CompletionWatcher;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, FleetEvent};
use crate::job::{JobId, JobStatus};
use crate::registry::JobRegistry;
use crate::supervisor::{JobExit, WorkerSupervisor};

/// Result of a start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The backlog was (re)filled and admission ran.
    Started {
        epoch: u64,
        admitted: Vec<JobId>,
        queued: Vec<JobId>,
    },
    /// The requested job is already running. Nothing changed.
    Conflict(JobId),
}

pub enum SchedulerCommand {
    /// Refill the backlog (full order, or the suffix from `from`) and admit.
    StartBatch {
        from: Option<JobId>,
        reply: oneshot::Sender<Result<StartOutcome>>,
    },
    Stop {
        id: JobId,
        reply: oneshot::Sender<Result<bool>>,
    },
    StopAll {
        reply: oneshot::Sender<Vec<JobId>>,
    },
    Backlog {
        reply: oneshot::Sender<Vec<JobId>>,
    },
}

impl std::fmt::Debug for SchedulerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerCommand::StartBatch { from, .. } => {
                f.debug_struct("StartBatch").field("from", from).finish()
            }
            SchedulerCommand::Stop { id, .. } => f.debug_struct("Stop").field("id", id).finish(),
            SchedulerCommand::StopAll { .. } => f.write_str("StopAll"),
            SchedulerCommand::Backlog { .. } => f.write_str("Backlog"),
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle to the scheduler task.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
    terminating: Arc<AtomicBool>,
}

impl SchedulerHandle {
    pub async fn start_batch(&self, from: Option<JobId>) -> Result<StartOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::StartBatch { from, reply })?;
        rx.await.map_err(|_| OrchestratorError::SchedulerUnavailable)?
    }

    /// Stop one job. `Ok(false)` when it was not running.
    pub async fn stop(&self, id: JobId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::Stop { id, reply })?;
        rx.await.map_err(|_| OrchestratorError::SchedulerUnavailable)?
    }

    /// Block admission and stop every running job.
    pub async fn stop_all(&self) -> Result<Vec<JobId>> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::StopAll { reply })?;
        rx.await.map_err(|_| OrchestratorError::SchedulerUnavailable)
    }

    /// Ids still waiting for admission, in order.
    pub async fn backlog(&self) -> Result<Vec<JobId>> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::Backlog { reply })?;
        rx.await.map_err(|_| OrchestratorError::SchedulerUnavailable)
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    fn send(&self, cmd: SchedulerCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| OrchestratorError::SchedulerUnavailable)
    }
}

// =============================================================================
// Scheduler task
// =============================================================================

pub struct Scheduler {
    max_concurrency: usize,
    registry: Arc<JobRegistry>,
    supervisor: WorkerSupervisor,
    watcher: Arc<CompletionWatcher>,
    events: EventBus,
    backlog: Backlog,
    /// Ids explicitly restarted; only these may leave Failed.
    restarts: HashSet<JobId>,
    terminating: Arc<AtomicBool>,
    epoch: u64,
    batch_active: bool,
}

impl Scheduler {
    pub fn new(
        max_concurrency: usize,
        registry: Arc<JobRegistry>,
        supervisor: WorkerSupervisor,
        watcher: Arc<CompletionWatcher>,
        events: EventBus,
    ) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            registry,
            supervisor,
            watcher,
            events,
            backlog: Backlog::new(),
            restarts: HashSet::new(),
            terminating: Arc::new(AtomicBool::new(false)),
            epoch: 0,
            batch_active: false,
        }
    }

    /// Run the loop on its own task. `exits` is the receiving side of the
    /// channel the supervisor reports job exits on.
    pub fn spawn(self, exits: mpsc::UnboundedReceiver<JobExit>) -> SchedulerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SchedulerHandle {
            tx,
            terminating: self.terminating.clone(),
        };
        tokio::spawn(self.run(rx, exits));
        handle
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SchedulerCommand>,
        mut exits: mpsc::UnboundedReceiver<JobExit>,
    ) {
        info!(max_concurrency = self.max_concurrency, jobs = self.registry.len(), "scheduler started");
        loop {
            tokio::select! {
                Some(exit) = exits.recv() => {
                    self.guarded("job exit", |s| s.on_job_finished(exit));
                }
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        debug!(command = ?cmd, "scheduler command");
                        self.guarded("command", |s| s.handle(cmd));
                    }
                    None => break,
                },
            }
        }
        info!("scheduler stopped");
    }

    /// Run one decision step; a panic is logged and the loop continues.
    fn guarded(&mut self, what: &'static str, f: impl FnOnce(&mut Self)) {
        let result = catch_unwind(AssertUnwindSafe(|| f(self)));
        if let Err(panic_info) = result {
            let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            error!(step = what, panic = %panic_msg, "scheduler panicked, continuing");
        }
    }

    fn handle(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::StartBatch { from, reply } => {
                let _ = reply.send(self.start_batch(from));
            }
            SchedulerCommand::Stop { id, reply } => {
                if !self.registry.contains(&id) {
                    let _ = reply.send(Err(OrchestratorError::JobNotFound(id)));
                    return;
                }
                self.events.emit(FleetEvent::StopRequested {
                    job: Some(id.clone()),
                });
                let supervisor = self.supervisor.clone();
                tokio::spawn(async move {
                    let stopped = supervisor.stop(&id).await;
                    let _ = reply.send(Ok(stopped));
                });
            }
            SchedulerCommand::StopAll { reply } => {
                self.terminating.store(true, Ordering::SeqCst);
                self.backlog.clear();
                self.restarts.clear();
                self.events.emit(FleetEvent::StopRequested { job: None });
                warn!("stopping all jobs, admission blocked");

                let supervisor = self.supervisor.clone();
                let watcher = self.watcher.clone();
                tokio::spawn(async move {
                    let stopped = supervisor.stop_all().await;
                    info!(stopped = stopped.len(), "all running jobs stopped");
                    watcher.evaluate();
                    let _ = reply.send(stopped);
                });
            }
            SchedulerCommand::Backlog { reply } => {
                let _ = reply.send(self.backlog.ids());
            }
        }
    }

    fn start_batch(&mut self, from: Option<JobId>) -> Result<StartOutcome> {
        if let Some(id) = &from {
            match self.registry.status(id)? {
                JobStatus::Running => {
                    info!(job_id = %id, "start requested for a running job");
                    self.events.emit(FleetEvent::JobConflict { job: id.clone() });
                    return Ok(StartOutcome::Conflict(id.clone()));
                }
                JobStatus::Success if !self.needs_new_batch() => {
                    return Err(OrchestratorError::NotRestartable(id.clone()));
                }
                _ => {}
            }
        }

        if self.needs_new_batch() {
            if self.watcher.has_fired() && *self.watcher.finished().borrow() != Some(self.epoch) {
                return Err(OrchestratorError::PostProcessingActive(self.epoch));
            }
            self.registry.reset_all();
            self.epoch += 1;
            self.watcher.rearm(self.epoch);
            self.batch_active = true;
            self.restarts.clear();
            info!(epoch = self.epoch, from = ?from, "batch started");
            self.events.emit(FleetEvent::BatchStarted {
                epoch: self.epoch,
                from: from.clone(),
            });
        }

        if self.terminating.swap(false, Ordering::SeqCst) {
            info!("admission resumed");
        }

        match &from {
            Some(id) => {
                self.backlog.resume_from(self.registry.order(), id);
                if self.registry.status(id)? == JobStatus::Failed {
                    self.restarts.insert(id.clone());
                }
            }
            None => self.backlog.reset_full(self.registry.order()),
        }

        let admitted = self.admit();
        Ok(StartOutcome::Started {
            epoch: self.epoch,
            admitted,
            queued: self.backlog.ids(),
        })
    }

    /// A new batch starts on the first start request and after the previous
    /// batch's completion trigger has fired.
    fn needs_new_batch(&self) -> bool {
        !self.batch_active || self.watcher.has_fired()
    }

    fn on_job_finished(&mut self, exit: JobExit) {
        debug!(job_id = %exit.id, status = %exit.status, "job exit received");
        self.admit();
        self.watcher.evaluate();
    }

    /// Admit from the backlog while under the concurrency cap.
    fn admit(&mut self) -> Vec<JobId> {
        let mut admitted = Vec::new();
        if self.terminating.load(Ordering::SeqCst) {
            debug!("admission blocked by stop-all");
            return admitted;
        }

        while self.registry.running_count() < self.max_concurrency {
            let Some(id) = self.backlog.pop_front() else {
                break;
            };
            let allow_restart = self.restarts.remove(&id);
            match self.registry.begin_run(&id, allow_restart) {
                Ok(_) => {
                    info!(job_id = %id, running = self.registry.running_count(), "job admitted");
                    self.events.emit(FleetEvent::JobAdmitted { job: id.clone() });
                    self.supervisor.start(id.clone());
                    admitted.push(id);
                }
                Err(OrchestratorError::JobNotFound(id)) => {
                    warn!(job_id = %id, "backlog entry not in roster, dropped");
                }
                Err(e) => {
                    debug!(job_id = %id, reason = %e, "skipping backlog entry");
                }
            }
        }

        if self.backlog.is_empty() && self.registry.running_count() == 0 {
            self.watcher.evaluate();
        }
        admitted
    }
}
