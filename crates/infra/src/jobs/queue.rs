//! In-memory eligibility index.
//!
//! The queue holds one handle per pending or running job and answers a single
//! question: which job runs next. It never touches the store; the scheduler
//! persists first and then mutates the queue.
//!
//! ## Eligibility
//!
//! A pending handle is eligible when:
//!
//! - none of its dependencies is still outstanding
//! - its constraints are satisfied
//! - its `next_run_at` has passed
//!
//! Handles without outstanding dependencies sit in an ordered ready set keyed
//! by (priority desc, created_at asc, insertion order), so the first eligible
//! handle found while walking the set is the one to dispatch.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};

use courier_core::{
    CancellationToken, Constraint, Job, JobContext, JobId, JobSpec, Priority, RetryPolicy,
};

use super::constraints::ConstraintState;

/// Lifecycle of a queued handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Running,
}

/// Lightweight handle of a persisted job.
#[derive(Debug)]
pub struct QueueEntry {
    pub id: JobId,
    pub factory_key: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub run_attempt: u32,
    pub max_attempts: u32,
    pub next_run_at: DateTime<Utc>,
    pub constraints: Vec<Constraint>,
    pub retry_policy: RetryPolicy,
    /// Present while pending; moved to a worker while running.
    pub job: Option<Box<dyn Job>>,
    pub cancellation: CancellationToken,
    pub cancel_requested: bool,
    state: EntryState,
    seq: u64,
}

impl QueueEntry {
    pub fn new(spec: &JobSpec, job: Box<dyn Job>) -> Self {
        Self {
            id: spec.id,
            factory_key: spec.factory_key.clone(),
            priority: spec.priority,
            created_at: spec.created_at,
            run_attempt: spec.run_attempt,
            max_attempts: spec.max_attempts.max(1),
            next_run_at: spec.next_run_at,
            constraints: job.constraints(),
            retry_policy: job.retry_policy(),
            job: Some(job),
            cancellation: CancellationToken::new(),
            cancel_requested: false,
            state: EntryState::Pending,
            seq: 0,
        }
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    fn key(&self) -> ReadyKey {
        ReadyKey {
            priority: Reverse(self.priority),
            created_at: self.created_at,
            seq: self.seq,
            id: self.id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey {
    priority: Reverse<Priority>,
    created_at: DateTime<Utc>,
    seq: u64,
    id: JobId,
}

/// A job handed out for execution.
#[derive(Debug)]
pub struct Dispatch {
    pub id: JobId,
    pub job: Box<dyn Job>,
    pub context: JobContext,
}

/// Ordered set of pending handles plus the dependency-completion index.
#[derive(Debug, Default)]
pub struct JobQueue {
    entries: HashMap<JobId, QueueEntry>,
    ready: BTreeSet<ReadyKey>,
    /// job -> dependencies that have not succeeded yet
    blocked_by: HashMap<JobId, HashSet<JobId>>,
    /// dependency -> jobs waiting on it
    dependents: HashMap<JobId, HashSet<JobId>>,
    next_seq: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn entry(&self, id: JobId) -> Option<&QueueEntry> {
        self.entries.get(&id)
    }

    pub fn state(&self, id: JobId) -> Option<EntryState> {
        self.entries.get(&id).map(|e| e.state)
    }

    pub fn running_len(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == EntryState::Running)
            .count()
    }

    pub fn pending_len(&self) -> usize {
        self.len() - self.running_len()
    }

    /// Dependencies of `id` that still block it.
    pub fn outstanding(&self, id: JobId) -> impl Iterator<Item = JobId> + '_ {
        self.blocked_by.get(&id).into_iter().flatten().copied()
    }

    /// Add a pending handle. `outstanding` lists the dependencies that have
    /// not succeeded yet; they need not be queued themselves (yet).
    pub fn push(&mut self, mut entry: QueueEntry, outstanding: impl IntoIterator<Item = JobId>) {
        entry.seq = self.next_seq;
        entry.state = EntryState::Pending;
        self.next_seq += 1;

        let id = entry.id;
        let blockers: HashSet<JobId> = outstanding.into_iter().filter(|d| *d != id).collect();
        if blockers.is_empty() {
            self.ready.insert(entry.key());
        } else {
            for dep in &blockers {
                self.dependents.entry(*dep).or_default().insert(id);
            }
            self.blocked_by.insert(id, blockers);
        }
        self.entries.insert(id, entry);
    }

    /// Take the highest-priority eligible handle and mark it running.
    pub fn take_next(&mut self, now: DateTime<Utc>, constraints: &ConstraintState) -> Option<Dispatch> {
        let key = self
            .ready
            .iter()
            .find(|key| {
                self.entries.get(&key.id).is_some_and(|e| {
                    e.job.is_some() && e.next_run_at <= now && constraints.allows(&e.constraints)
                })
            })
            .copied()?;

        self.ready.remove(&key);
        let entry = self.entries.get_mut(&key.id)?;
        let job = entry.job.take()?;
        entry.state = EntryState::Running;

        Some(Dispatch {
            id: entry.id,
            job,
            context: JobContext {
                id: entry.id,
                run_attempt: entry.run_attempt,
                cancellation: entry.cancellation.clone(),
            },
        })
    }

    /// Earliest future `next_run_at` among ready handles: when a sleeping
    /// scheduler has to look again.
    pub fn next_wakeup(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.ready
            .iter()
            .filter_map(|key| self.entries.get(&key.id))
            .map(|e| e.next_run_at)
            .filter(|at| *at > now)
            .min()
    }

    /// Put a running handle back after a retryable failure.
    pub fn requeue(
        &mut self,
        id: JobId,
        job: Box<dyn Job>,
        run_attempt: u32,
        next_run_at: DateTime<Utc>,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        entry.job = Some(job);
        entry.run_attempt = run_attempt;
        entry.next_run_at = next_run_at;
        entry.state = EntryState::Pending;
        if !self.blocked_by.contains_key(&id) {
            self.ready.insert(entry.key());
        }
        true
    }

    /// Drop a succeeded handle and release its dependents. Returns the jobs
    /// that became unblocked.
    pub fn complete(&mut self, id: JobId) -> Vec<JobId> {
        self.remove(id);

        let mut unblocked = Vec::new();
        for waiter in self.dependents.remove(&id).unwrap_or_default() {
            let Some(blockers) = self.blocked_by.get_mut(&waiter) else {
                continue;
            };
            blockers.remove(&id);
            if blockers.is_empty() {
                self.blocked_by.remove(&waiter);
                if let Some(entry) = self.entries.get(&waiter) {
                    if entry.state == EntryState::Pending && entry.job.is_some() {
                        self.ready.insert(entry.key());
                    }
                    unblocked.push(waiter);
                }
            }
        }
        unblocked.sort_by_key(|w| self.entries.get(w).map(QueueEntry::key));
        unblocked
    }

    /// Remove a handle without touching its dependents.
    pub fn remove(&mut self, id: JobId) -> Option<QueueEntry> {
        let entry = self.entries.remove(&id)?;
        self.ready.remove(&entry.key());
        if let Some(blockers) = self.blocked_by.remove(&id) {
            for dep in blockers {
                if let Some(waiters) = self.dependents.get_mut(&dep) {
                    waiters.remove(&id);
                    if waiters.is_empty() {
                        self.dependents.remove(&dep);
                    }
                }
            }
        }
        Some(entry)
    }

    /// Remove every handle that transitively depends on `id`, ordered so that
    /// a job always comes before the jobs it depends on (deepest first).
    pub fn remove_dependents_of(&mut self, id: JobId) -> Vec<QueueEntry> {
        // DFS post-order over the waiter graph: a job is emitted only after
        // every job waiting on it.
        let mut order = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut stack = vec![(id, self.waiters_of(id))];

        while let Some((node, waiters)) = stack.last_mut() {
            match waiters.pop() {
                Some(next) => {
                    if seen.insert(next) {
                        let next_waiters = self.waiters_of(next);
                        stack.push((next, next_waiters));
                    }
                }
                None => {
                    let done = *node;
                    stack.pop();
                    if done != id {
                        order.push(done);
                    }
                }
            }
        }

        let mut removed = Vec::with_capacity(order.len());
        for waiter in order {
            if let Some(entry) = self.remove(waiter) {
                removed.push(entry);
            }
            self.dependents.remove(&waiter);
        }
        self.dependents.remove(&id);
        removed
    }

    fn waiters_of(&self, id: JobId) -> Vec<JobId> {
        self.dependents
            .get(&id)
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Flag a running handle so its late result is discarded.
    pub fn request_cancel(&mut self, id: JobId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.cancel_requested = true;
                entry.cancellation.cancel();
                true
            }
            None => false,
        }
    }

    /// Clear the backoff of pending handles of one job type. Returns the ids
    /// and attempt counts that changed.
    pub fn reset_backoff(&mut self, factory_key: &str, now: DateTime<Utc>) -> Vec<(JobId, u32)> {
        let mut changed = Vec::new();
        for entry in self.entries.values_mut() {
            if entry.state == EntryState::Pending
                && entry.factory_key == factory_key
                && entry.next_run_at > now
            {
                entry.next_run_at = now;
                changed.push((entry.id, entry.run_attempt));
            }
        }
        changed
    }

    /// Check whether adding `edges` (job -> its dependencies) would close a
    /// cycle. Returns a job on the cycle.
    pub fn find_cycle(&self, edges: &HashMap<JobId, BTreeSet<JobId>>) -> Option<JobId> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Visiting,
            Done,
        }

        let deps_of = |id: JobId| -> Vec<JobId> {
            match edges.get(&id) {
                Some(deps) => deps.iter().copied().collect(),
                None => self.outstanding(id).collect(),
            }
        };

        let mut marks: HashMap<JobId, Mark> = HashMap::new();
        for &start in edges.keys() {
            if marks.contains_key(&start) {
                continue;
            }
            // Iterative DFS; each frame is (node, remaining deps).
            let mut stack = vec![(start, deps_of(start))];
            marks.insert(start, Mark::Visiting);

            while let Some((node, remaining)) = stack.last_mut() {
                match remaining.pop() {
                    Some(next) => match marks.get(&next) {
                        Some(Mark::Visiting) => return Some(next),
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(next, Mark::Visiting);
                            let deps = deps_of(next);
                            stack.push((next, deps));
                        }
                    },
                    None => {
                        marks.insert(*node, Mark::Done);
                        stack.pop();
                    }
                }
            }
        }
        None
    }
}
