//! Batch completion detection.
//!
//! `evaluate()` is called after every job exit and after a global stop. It is
//! idempotent and safe to call redundantly from any task: the first call that
//! observes every job terminal wins a compare-and-swap on the one-shot flag and
//! is the only one that invokes the handler for that batch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::ledger::{Ledger, LedgerEntry};
use crate::registry::JobRegistry;

/// What runs once a batch has fully finished.
#[async_trait]
pub trait BatchCompletionHandler: Send + Sync {
    async fn on_batch_complete(&self, epoch: u64);
}

pub struct CompletionWatcher {
    registry: Arc<JobRegistry>,
    handler: Arc<dyn BatchCompletionHandler>,
    ledger: Option<Arc<Ledger>>,
    epoch: AtomicU64,
    fired: AtomicBool,
    /// Last epoch whose handler has returned.
    finished: watch::Sender<Option<u64>>,
}

impl CompletionWatcher {
    pub fn new(registry: Arc<JobRegistry>, handler: Arc<dyn BatchCompletionHandler>) -> Self {
        let (finished, _) = watch::channel(None);
        Self {
            registry,
            handler,
            ledger: None,
            epoch: AtomicU64::new(0),
            fired: AtomicBool::new(false),
            finished,
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Arm the trigger for a new batch.
    pub fn rearm(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::SeqCst);
        self.fired.store(false, Ordering::SeqCst);
        debug!(epoch, "completion trigger armed");
    }

    /// Fire the handler if every job is terminal and it has not fired yet
    /// for this batch. Returns whether this call fired it.
    ///
    /// The handler runs on its own task; this never blocks.
    pub fn evaluate(&self) -> bool {
        if !self.registry.all_terminal() {
            return false;
        }
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let epoch = self.epoch();
        info!(epoch, "all jobs finished, triggering post-processing");
        if let Some(ledger) = &self.ledger {
            ledger.record(LedgerEntry::PostProcessingTriggered { epoch });
        }

        let handler = self.handler.clone();
        let ledger = self.ledger.clone();
        let finished = self.finished.clone();
        tokio::spawn(async move {
            handler.on_batch_complete(epoch).await;
            if let Some(ledger) = ledger {
                ledger.flush().await;
            }
            finished.send_replace(Some(epoch));
        });
        true
    }

    /// Subscribe to "post-processing for epoch N finished" notifications.
    pub fn finished(&self) -> watch::Receiver<Option<u64>> {
        self.finished.subscribe()
    }
}
