//! Status feed: typed events broadcast to external observers.
//!
//! # Guarantees
//!
//! - **Best effort**: slow receivers may miss events (`RecvError::Lagged`)
//! - **In-memory only**: the durable record of a run is the ledger, not the feed
//! - **No replay**: subscribers only see events emitted after subscribing
//!
//! One event is emitted per state change. Consumers that need the current
//! state should read `Status()` first and then follow the feed.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::JobFailure;
use crate::job::{JobId, JobStatus};
use crate::pipeline::BatchSummary;

/// Default channel capacity for the event bus.
const DEFAULT_CAPACITY: usize = 1024;

/// Everything observers can see happen to the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    BatchStarted {
        epoch: u64,
        from: Option<JobId>,
    },
    JobAdmitted {
        job: JobId,
    },
    JobStarted {
        job: JobId,
        pid: Option<u32>,
        log: PathBuf,
    },
    JobProgress {
        job: JobId,
        percent: u8,
    },
    JobFinished {
        job: JobId,
        status: JobStatus,
        failure: Option<JobFailure>,
    },
    /// A start request hit a job that is already running.
    JobConflict {
        job: JobId,
    },
    StopRequested {
        job: Option<JobId>,
    },
    PostProcessingStarted {
        epoch: u64,
    },
    EnrichmentFinished {
        job: JobId,
        success: bool,
    },
    UploadAttempt {
        job: JobId,
        attempt: u32,
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
    BatchCompleted {
        summary: BatchSummary,
    },
}

impl FleetEvent {
    /// Event name used as the SSE `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            FleetEvent::BatchStarted { .. } => "batch_started",
            FleetEvent::JobAdmitted { .. } => "job_admitted",
            FleetEvent::JobStarted { .. } => "job_started",
            FleetEvent::JobProgress { .. } => "job_progress",
            FleetEvent::JobFinished { .. } => "job_finished",
            FleetEvent::JobConflict { .. } => "job_conflict",
            FleetEvent::StopRequested { .. } => "stop_requested",
            FleetEvent::PostProcessingStarted { .. } => "post_processing_started",
            FleetEvent::EnrichmentFinished { .. } => "enrichment_finished",
            FleetEvent::UploadAttempt { .. } => "upload_attempt",
            FleetEvent::UploadSucceeded { .. } => "upload_succeeded",
            FleetEvent::UploadFailed { .. } => "upload_failed",
            FleetEvent::BatchCompleted { .. } => "batch_completed",
        }
    }
}

/// Broadcast channel for [`FleetEvent`]s.
///
/// Cloning is cheap; every clone emits into the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// The capacity determines how many events can be buffered before
    /// slow receivers start lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit to all subscribers (fire-and-forget).
    ///
    /// Returns the number of receivers that received the event.
    pub fn emit(&self, event: FleetEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let delivered = bus.emit(FleetEvent::JobAdmitted {
            job: JobId::from("02_NYC"),
        });
        assert_eq!(delivered, 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "job_admitted");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.emit(FleetEvent::StopRequested { job: None }), 0);
    }

    #[test]
    fn test_event_json_shape() {
        let event = FleetEvent::JobFinished {
            job: JobId::from("02_NYC"),
            status: JobStatus::Failed,
            failure: Some(JobFailure::NonZeroExit { code: Some(2) }),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_finished");
        assert_eq!(json["job"], "02_NYC");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["failure"]["kind"], "non_zero_exit");
        assert_eq!(json["failure"]["code"], 2);
    }
}
