//! Persisted job record.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::Data;
use crate::id::JobId;

/// Queue priority. Higher values dispatch first; equal priorities are FIFO.
pub type Priority = i32;

/// The durable form of a job.
///
/// Only `factory_key` and `data` are needed to rebuild the job instance; the
/// remaining fields restore its place in the queue after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: JobId,
    pub factory_key: String,
    pub data: Data,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    /// Failed executions so far.
    pub run_attempt: u32,
    pub max_attempts: u32,
    /// Earliest time the job may run again.
    pub next_run_at: DateTime<Utc>,
    #[serde(default)]
    pub depends_on: BTreeSet<JobId>,
}

impl JobSpec {
    /// A fresh record, runnable immediately.
    pub fn new(factory_key: impl Into<String>, data: Data, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            factory_key: factory_key.into(),
            data,
            priority: 0,
            created_at: now,
            run_attempt: 0,
            max_attempts: max_attempts.max(1),
            next_run_at: now,
            depends_on: BTreeSet::new(),
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.next_run_at = self.next_run_at.max(at);
        self
    }

    pub fn depending_on(mut self, deps: impl IntoIterator<Item = JobId>) -> Self {
        self.depends_on.extend(deps);
        self
    }

    /// Whether the retry ceiling has been reached.
    pub fn attempts_exhausted(&self) -> bool {
        self.run_attempt >= self.max_attempts.max(1)
    }
}

/// Externally visible state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for dependencies, constraints or backoff
    Pending,
    /// Currently being executed
    Running,
    /// Completed successfully (record deleted)
    Succeeded,
    /// Terminal failure (record deleted or quarantined)
    Failed { reason: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_spec_is_immediately_runnable() {
        let spec = JobSpec::new("send_message", Data::empty(), 3);
        assert_eq!(spec.run_attempt, 0);
        assert!(spec.next_run_at <= Utc::now());
        assert!(spec.depends_on.is_empty());
    }

    #[test]
    fn attempts_exhaust_at_max() {
        let mut spec = JobSpec::new("send_message", Data::empty(), 2);
        spec.run_attempt = 1;
        assert!(!spec.attempts_exhausted());
        spec.run_attempt = 2;
        assert!(spec.attempts_exhausted());
    }

    #[test]
    fn persisted_json_keeps_dependencies() {
        let dep = JobId::new();
        let spec = JobSpec::new("upload", Data::builder().put_int("part", 1).build(), 5)
            .with_priority(2)
            .depending_on([dep]);

        let json = serde_json::to_string(&spec).unwrap();
        let back: JobSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
        assert!(back.depends_on.contains(&dep));
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed { reason: "x".into() }.is_terminal());
    }
}
