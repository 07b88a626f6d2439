// Crawler Fleet Orchestrator - Core
//
// Runs a roster of independent data-collection jobs under a concurrency cap,
// supervises their process trees, and hands finished output to enrichment
// and upload exactly once per batch.
//
// Components, leaves first: registry, backlog/scheduler, supervisor,
// completion watcher, post-processing pipeline, dedup cache, control surface.

pub mod backlog;
pub mod completion;
pub mod config;
pub mod control;
pub mod dedup;
pub mod error;
pub mod events;
pub mod http;
pub mod job;
pub mod layout;
pub mod ledger;
pub mod pipeline;
pub mod process_tree;
pub mod recovery;
pub mod registry;
pub mod scheduler;
pub mod supervisor;

pub use config::Config;
pub use control::ControlSurface;
pub use error::{JobFailure, OrchestratorError, PostProcessError, Result};
pub use events::{EventBus, FleetEvent};
pub use job::{JobId, JobRecord, JobStatus, OutputFolderState, PostProcessStage};
pub use scheduler::StartOutcome;
