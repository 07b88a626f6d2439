//! Append-only run ledger.
//!
//! The `_IN_PROGRESS` -> `_COMPLETED` rename is not atomic with anything the
//! orchestrator keeps in memory. The ledger closes that gap: every start,
//! finish and upload is appended as one synced JSON line, so a restart can
//! tell a crashed job from a finished one and an uploaded folder from a
//! pending one.
//!
//! ```text
//! {"at":"2024-03-02T08:00:01Z","entry":"job_started","job":"02_NYC"}
//! {"at":"2024-03-02T08:14:40Z","entry":"job_finished","job":"02_NYC","status":"success","failure":null}
//! ```

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{JobFailure, OrchestratorError, Result};
use crate::job::{JobId, JobStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum LedgerEntry {
    JobStarted {
        job: JobId,
    },
    JobFinished {
        job: JobId,
        status: JobStatus,
        failure: Option<JobFailure>,
    },
    PostProcessingTriggered {
        epoch: u64,
    },
    UploadSucceeded {
        job: JobId,
        folder: PathBuf,
    },
    UploadFailed {
        job: JobId,
        folder: PathBuf,
        attempts: u32,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: LedgerEntry,
}

enum WriteRequest {
    Append(LedgerRecord),
    Flush(oneshot::Sender<()>),
}

/// JSON-lines ledger for one run-date.
///
/// `append` writes synchronously. `record` hands the entry to a writer
/// thread so async tasks and the admission loop never wait on `fsync`;
/// entries keep the order they were recorded in.
#[derive(Debug)]
pub struct Ledger {
    file: Arc<LedgerFile>,
    queue: OnceLock<Option<mpsc::UnboundedSender<WriteRequest>>>,
}

#[derive(Debug)]
struct LedgerFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl std::fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteRequest::Append(record) => f.debug_tuple("Append").field(&record.entry).finish(),
            WriteRequest::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: Arc::new(LedgerFile {
                path: path.into(),
                lock: Mutex::new(()),
            }),
            queue: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    /// Append one entry and flush it to disk before returning.
    pub fn append(&self, entry: LedgerEntry) -> Result<()> {
        self.file.write(&LedgerRecord {
            at: Utc::now(),
            entry,
        })
    }

    /// Queue an entry for the writer thread, logging instead of failing.
    /// Used on paths where losing one ledger line must not stop the fleet.
    pub fn record(&self, entry: LedgerEntry) {
        let record = LedgerRecord {
            at: Utc::now(),
            entry,
        };
        let record = match self.writer() {
            Some(queue) => match queue.send(WriteRequest::Append(record)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(WriteRequest::Append(record))) => record,
                Err(_) => return,
            },
            None => record,
        };
        if let Err(e) = self.file.write(&record) {
            warn!(path = %self.file.path.display(), error = %e, "failed to append ledger entry");
        }
    }

    /// Wait until every entry recorded so far is on disk.
    pub async fn flush(&self) {
        let Some(queue) = self.queue.get().and_then(Option::as_ref) else {
            return;
        };
        let (done, wait) = oneshot::channel();
        if queue.send(WriteRequest::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Read every well-formed record. A missing file is an empty ledger.
    pub fn load(&self) -> Result<Vec<LedgerRecord>> {
        Self::read(&self.file.path)
    }

    /// Read the ledger at `path`.
    ///
    /// Malformed lines (e.g. a torn write from a crash) are skipped with a
    /// warning.
    pub fn read(path: &Path) -> Result<Vec<LedgerRecord>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), line = n + 1, error = %e, "skipping malformed ledger line"),
            }
        }
        Ok(records)
    }

    /// The writer thread, started on first use. `None` if it could not be
    /// started, in which case `record` writes inline.
    fn writer(&self) -> Option<&mpsc::UnboundedSender<WriteRequest>> {
        self.queue
            .get_or_init(|| {
                let (tx, mut rx) = mpsc::unbounded_channel::<WriteRequest>();
                let file = self.file.clone();
                let spawned = std::thread::Builder::new()
                    .name("ledger-writer".to_string())
                    .spawn(move || {
                        while let Some(request) = rx.blocking_recv() {
                            match request {
                                WriteRequest::Append(record) => {
                                    if let Err(e) = file.write(&record) {
                                        warn!(path = %file.path.display(), error = %e, "failed to append ledger entry");
                                    }
                                }
                                WriteRequest::Flush(done) => {
                                    let _ = done.send(());
                                }
                            }
                        }
                        debug!(path = %file.path.display(), "ledger writer stopped");
                    });
                match spawned {
                    Ok(_) => Some(tx),
                    Err(e) => {
                        warn!(error = %e, "cannot start ledger writer, writing inline");
                        None
                    }
                }
            })
            .as_ref()
    }
}

impl LedgerFile {
    fn write(&self, record: &LedgerRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).map_err(|e| OrchestratorError::Ledger(e.to_string()))?;
        line.push('\n');

        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        // A crash can leave a torn last line. Terminate it so this record
        // starts on a line of its own.
        if file.metadata()?.len() > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                warn!(path = %self.path.display(), "ledger ends in a torn line, terminating it");
                line.insert(0, '\n');
            }
        }

        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }
}

/// What the ledger says about a run, folded from its records.
#[derive(Debug, Default)]
pub struct LedgerState {
    /// Jobs whose last start has no matching finish.
    pub unfinished: Vec<JobId>,
    /// Jobs whose output was uploaded after their last start.
    pub uploaded: HashSet<JobId>,
}

impl LedgerState {
    pub fn fold(records: &[LedgerRecord]) -> Self {
        let mut open: Vec<JobId> = Vec::new();
        let mut state = LedgerState::default();

        for record in records {
            match &record.entry {
                LedgerEntry::JobStarted { job } => {
                    if !open.contains(job) {
                        open.push(job.clone());
                    }
                    state.uploaded.remove(job);
                }
                LedgerEntry::JobFinished { job, .. } => {
                    open.retain(|j| j != job);
                }
                LedgerEntry::UploadSucceeded { job, .. } => {
                    state.uploaded.insert(job.clone());
                }
                LedgerEntry::PostProcessingTriggered { .. } | LedgerEntry::UploadFailed { .. } => {}
            }
        }

        state.unfinished = open;
        state
    }
}
