//! Persisted background job system.
//!
//! ## Design
//!
//! - Every job is persisted before it counts as queued and deleted only after
//!   a terminal outcome, so a crash never loses or duplicates accepted work
//!   beyond at-least-once re-execution of jobs that were running
//! - One scheduler thread owns the queue; a fixed worker pool runs jobs
//! - Dependencies, constraints and retry backoff decide eligibility
//! - Records that cannot be reconstructed at startup are dead-lettered
//!
//! ## Components
//!
//! - `JobStore`: persistence (`InMemoryJobStore`, `SqliteJobStore`)
//! - `JobQueue`: in-memory eligibility index
//! - `ConstraintState`: condition and concurrency-group bookkeeping
//! - `JobManager`: facade; recovery, enqueue, cancel, status

pub mod config;
pub mod constraints;
pub mod manager;
pub mod queue;
mod scheduler;
pub mod sqlite;
pub mod store;

pub use config::{ConfigError, JobManagerConfig};
pub use constraints::ConstraintState;
pub use manager::{
    CancelOutcome, JobCompletion, JobManager, JobManagerBuilder, JobRequest, ManagerError,
    ManagerStats, QuarantinedJob, RecoveryReport,
};
pub use queue::{Dispatch, EntryState, JobQueue, QueueEntry};
pub use scheduler::CANCELLED;
pub use sqlite::SqliteJobStore;
pub use store::{
    DeadLetter, InMemoryJobStore, JobStore, JobStoreError, PendingSnapshot, UnreadableRecord,
};
