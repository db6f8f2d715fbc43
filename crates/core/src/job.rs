//! The job execution contract and its policies.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::data::Data;
use crate::id::JobId;

/// Result of one execution attempt.
///
/// Failures inside a job never escape as faults; they are reported through
/// this type and the manager decides what happens next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The work is done; the record is deleted.
    Success,
    /// Transient failure (network hiccup, resource busy); retried with backoff.
    RetryableFailure(String),
    /// The job can never succeed; terminal, cascades to dependents.
    PermanentFailure(String),
}

impl Outcome {
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::RetryableFailure(reason.into())
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::PermanentFailure(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Declarative precondition gating dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    /// A named environmental condition (e.g. `"network"`) must currently hold.
    Requires(String),
    /// At most `limit` jobs of `group` may run at once.
    MaxConcurrent { group: String, limit: usize },
}

impl Constraint {
    /// Condition name reported by connectivity observers.
    pub const NETWORK: &'static str = "network";

    pub fn requires(condition: impl Into<String>) -> Self {
        Self::Requires(condition.into())
    }

    pub fn network() -> Self {
        Self::Requires(Self::NETWORK.to_string())
    }

    pub fn max_concurrent(group: impl Into<String>, limit: usize) -> Self {
        Self::MaxConcurrent {
            group: group.into(),
            limit,
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy of a job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of executions allowed (at least one).
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Run once; any retryable failure becomes permanent.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// `max_attempts`, never less than one.
    pub fn attempt_limit(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before the next run after `attempt` failed runs (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                // 2^31 already exceeds any sane cap
                let exp = (attempt - 1).min(31);
                self.base_delay.saturating_mul(1u32 << exp)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };

        delay.min(self.max_delay)
    }

    /// Whether another run is allowed after `failed_attempts` failed runs.
    pub fn should_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.attempt_limit()
    }
}

/// Cooperative cancellation flag shared between the manager and a running job.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Per-attempt context handed to [`Job::run`].
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: JobId,
    /// Failed attempts so far (0 on the first run).
    pub run_attempt: u32,
    pub cancellation: CancellationToken,
}

impl JobContext {
    pub fn new(id: JobId, run_attempt: u32) -> Self {
        Self {
            id,
            run_attempt,
            cancellation: CancellationToken::new(),
        }
    }

    /// True once a caller asked for this job to be cancelled. Long-running
    /// jobs should check this between steps and bail out.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// A unit of deferred work.
///
/// Concrete job types implement this trait and register a factory under
/// [`Job::factory_key`] so persisted records can be turned back into live
/// instances after a restart.
///
/// `run` executes on a worker thread and may block (e.g. on network I/O).
/// Any operation-specific timeout is the job's responsibility.
pub trait Job: Send + 'static {
    /// Stable key identifying the job type across versions.
    fn factory_key(&self) -> &str;

    /// Parameters needed to reconstruct this job.
    fn serialize(&self) -> Data;

    fn constraints(&self) -> Vec<Constraint> {
        Vec::new()
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    fn run(&mut self, ctx: &JobContext) -> Outcome;

    /// Called once when the job ends in terminal failure: exhausted retries,
    /// a permanent failure, a failed dependency, or cancellation. Runs on the
    /// scheduler thread, so keep it short.
    fn on_failure(&mut self, _reason: &str) {}
}

impl std::fmt::Debug for dyn Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("factory_key", &self.factory_key())
            .finish_non_exhaustive()
    }
}
