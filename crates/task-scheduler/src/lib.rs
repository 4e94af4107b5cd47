//! Concurrent batch processing for Aerial QA
//!
//! A fixed pool of worker threads runs the full per-image pipeline, one image per worker.
//! Workers communicate with a single coordinator over channels using a small tagged
//! protocol, so a crashed worker loses only its own task and is replaced in the
//! background.
//!
//! # Features
//!
//! - **Correlated protocol**: every request and response carries its [`TaskId`]
//! - **Crash isolation**: a panicking worker rejects only its task with
//!   [`TaskError::WorkerCrashed`] and is respawned after a backoff
//! - **Cooperative cancellation**: [`TaskScheduler::clear_queue`] rejects pending handles
//!   and discards in-flight results when they arrive
//! - **Batch progress**: [`ProcessingProgress`] snapshots and a [`SchedulerObserver`] hook

pub mod config;
pub mod error;
pub mod progress;
pub mod protocol;
pub mod scheduler;

pub use config::{default_workers, SchedulerConfig};
pub use error::{SchedulerError, TaskError};
pub use progress::{NoopObserver, ProcessingProgress, ProcessingStep, SchedulerObserver};
pub use protocol::{TaskId, WorkerRequest, WorkerResponse};
pub use scheduler::{SlotState, TaskHandle, TaskScheduler};
