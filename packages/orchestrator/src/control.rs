//! Control surface: the one entry point for start, stop and status.
//!
//! A thin façade. Mutations go through the scheduler's command channel,
//! reads are registry snapshots, so every method is safe to call
//! concurrently with the admission loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::completion::CompletionWatcher;
use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, FleetEvent};
use crate::job::{JobId, JobRecord};
use crate::layout::RunLayout;
use crate::ledger::Ledger;
use crate::pipeline::{
    CommandEnricher, CommandUploader, Enricher, PostProcessor, RetryPolicy, UploadOutcome, Uploader,
};
use crate::recovery::{recover, RecoveryReport};
use crate::registry::JobRegistry;
use crate::scheduler::{Scheduler, SchedulerHandle, StartOutcome};
use crate::supervisor::{SupervisorConfig, WorkerSupervisor};

#[derive(Clone)]
pub struct ControlSurface {
    scheduler: SchedulerHandle,
    registry: Arc<JobRegistry>,
    watcher: Arc<CompletionWatcher>,
    post_processor: Arc<PostProcessor>,
    ledger: Arc<Ledger>,
    events: EventBus,
    layout: RunLayout,
}

impl ControlSurface {
    pub fn builder(layout: RunLayout, roster: Vec<JobId>, supervisor: SupervisorConfig) -> FleetBuilder {
        FleetBuilder {
            layout,
            roster,
            supervisor,
            max_concurrency: 4,
            retry: RetryPolicy::default(),
            enricher: None,
            uploader: None,
        }
    }

    /// Wire every component from configuration. Must run inside a runtime.
    pub fn from_config(config: &Config) -> Self {
        let mut builder = Self::builder(config.layout(), config.jobs.clone(), config.supervisor())
            .max_concurrency(config.max_concurrency)
            .retry(config.upload_retry);
        if let Some(cmd) = &config.enrich_command {
            builder = builder.enricher(Arc::new(CommandEnricher(cmd.clone())));
        }
        if let Some(cmd) = &config.upload_command {
            builder = builder.uploader(Arc::new(CommandUploader(cmd.clone())));
        }
        builder.build()
    }

    /// `None` starts (or resumes) the batch from the top. `Some(id)` restarts
    /// from that job: the backlog becomes the canonical suffix starting at it.
    pub async fn start(&self, job: Option<JobId>) -> Result<StartOutcome> {
        self.scheduler.start_batch(job).await
    }

    /// `None` stops every running job and blocks admission. Returns the ids
    /// that were actually stopped.
    pub async fn stop(&self, job: Option<JobId>) -> Result<Vec<JobId>> {
        match job {
            Some(id) => {
                let stopped = self.scheduler.stop(id.clone()).await?;
                Ok(if stopped { vec![id] } else { Vec::new() })
            }
            None => self.scheduler.stop_all().await,
        }
    }

    pub fn status(&self) -> Vec<JobRecord> {
        self.registry.snapshot()
    }

    pub fn job(&self, id: &JobId) -> Result<JobRecord> {
        self.registry.get(id)
    }

    pub async fn backlog(&self) -> Result<Vec<JobId>> {
        self.scheduler.backlog().await
    }

    pub fn is_terminating(&self) -> bool {
        self.scheduler.is_terminating()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Contents of a job's log. Tolerates UTF-8 and UTF-16 byte order marks.
    pub async fn read_log(&self, id: &JobId) -> Result<Option<String>> {
        let record = self.registry.get(id)?;
        match tokio::fs::read(&record.log_path).await {
            Ok(bytes) => Ok(Some(decode_log(&bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Mark interrupted jobs as crashed and collect folders left for upload.
    pub fn recover(&self) -> Result<RecoveryReport> {
        recover(&self.layout, &self.registry, &self.ledger)
    }

    /// Post-process folders a previous run left behind.
    pub async fn upload_pending(&self, folders: Vec<(JobId, PathBuf)>) -> Vec<(JobId, UploadOutcome)> {
        self.post_processor.upload_pending(folders).await
    }

    /// Recover, then post-process the current run-date's leftovers to
    /// completion. A batch writes to the same paths, so call this before the
    /// first start. Leftovers from older run-dates are returned; they can be
    /// processed alongside a batch.
    pub async fn recover_and_settle(&self) -> Result<Vec<(JobId, PathBuf)>> {
        let report = self.recover()?;
        let (current, older) = report.split_pending(&self.layout.run_dir());
        for (job, outcome) in self.upload_pending(current).await {
            info!(job_id = %job, outcome = ?outcome, "leftover folder of this run-date processed");
        }
        Ok(older)
    }

    /// Wait until every ledger entry recorded so far is on disk.
    pub async fn flush_ledger(&self) {
        self.ledger.flush().await;
    }

    /// Wait until post-processing of batch `epoch` has finished.
    pub async fn wait_for_batch(&self, epoch: u64) -> Result<()> {
        let mut finished = self.watcher.finished();
        finished
            .wait_for(|done| done.is_some_and(|e| e >= epoch))
            .await
            .map(|_| ())
            .map_err(|_| OrchestratorError::SchedulerUnavailable)
    }
}

/// Assembles registry, ledger, supervisor, watcher, pipeline and scheduler.
pub struct FleetBuilder {
    layout: RunLayout,
    roster: Vec<JobId>,
    supervisor: SupervisorConfig,
    max_concurrency: usize,
    retry: RetryPolicy,
    enricher: Option<Arc<dyn Enricher>>,
    uploader: Option<Arc<dyn Uploader>>,
}

impl FleetBuilder {
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn build(self) -> ControlSurface {
        let layout = self.layout;
        let registry = Arc::new(JobRegistry::new(self.roster, |id| layout.log_path(id)));
        let ledger = Arc::new(Ledger::new(layout.ledger_path()));
        let events = EventBus::new();

        let mut post_processor =
            PostProcessor::new(layout.clone(), registry.clone(), ledger.clone(), events.clone())
                .with_retry(self.retry);
        if let Some(enricher) = self.enricher {
            post_processor = post_processor.with_enricher(enricher);
        }
        if let Some(uploader) = self.uploader {
            post_processor = post_processor.with_uploader(uploader);
        }
        let post_processor = Arc::new(post_processor);

        let watcher = Arc::new(
            CompletionWatcher::new(registry.clone(), post_processor.clone())
                .with_ledger(ledger.clone()),
        );

        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let supervisor = WorkerSupervisor::new(
            self.supervisor,
            layout.clone(),
            registry.clone(),
            ledger.clone(),
            events.clone(),
            exits_tx,
        );
        let scheduler = Scheduler::new(
            self.max_concurrency,
            registry.clone(),
            supervisor,
            watcher.clone(),
            events.clone(),
        )
        .spawn(exits_rx);

        info!(
            run_dir = %layout.run_dir().display(),
            jobs = registry.len(),
            max_concurrency = self.max_concurrency,
            "fleet assembled"
        );

        ControlSurface {
            scheduler,
            registry,
            watcher,
            post_processor,
            ledger,
            events,
            layout,
        }
    }
}

/// Decode log bytes written by jobs on any platform.
pub fn decode_log(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8_lossy(rest).into_owned();
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    String::from_utf8_lossy(bytes).into_owned()
}

/// Resolve a job id from user input, accepting the `scrapers/<id>.py` form.
pub fn normalize_job_id(raw: &str) -> JobId {
    let name = Path::new(raw.trim())
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(raw.trim());
    JobId::from(name)
}
