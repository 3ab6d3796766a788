//! # Jobs Module
//!
//! The transcription job lifecycle and the engine that drives it.
//!
//! ## Key Components:
//! - **Job model**: `Job`, its state machine and transitions
//! - **Job Store**: version-gated persistence (in-memory or SQLite)
//! - **Admission Queue**: bounded priority queue with reservations
//! - **Execution Pool**: workers that lease models and run transcriptions
//! - **Stuck-job sweep**: fails jobs whose worker disappeared
//! - **Status Facade**: read-only views for polling clients
//! - **TranscriptionService**: the public entry point tying it all together

pub mod error;       // Caller-facing errors
pub mod facade;      // Status and result views
pub mod job;         // Job record and state machine
pub mod pool;        // Worker tasks
pub mod queue;       // Priority admission queue
pub mod service;     // Public entry point
pub mod sqlite;      // Durable store
pub mod store;       // Store trait and in-memory store
pub mod sweep;       // Stuck-job sweep
pub mod transition;  // CAS retry helper

pub use error::{JobError, StoreError};
pub use job::{InputRef, JobId};
pub use service::{SchedulerSettings, SchedulerStats, TranscriptionService};
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, JobStore};
