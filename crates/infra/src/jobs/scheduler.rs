//! Scheduler thread and worker pool.
//!
//! The scheduler thread is the single authority over the queue. It admits new
//! jobs, hands eligible ones to workers, applies their outcomes and performs
//! every store write after a job was enqueued, so writes for one id are
//! strictly ordered. Workers only run jobs and report back on the scheduler's
//! command channel.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use courier_core::{
    Constraint, FactoryRegistry, Job, JobContext, JobId, JobSpec, JobStatus, Outcome,
};

use super::constraints::ConstraintState;
use super::manager::{
    CancelOutcome, JobCompletion, ManagerError, ManagerStats, QuarantinedJob, RecoveryReport,
};
use super::queue::{Dispatch, EntryState, JobQueue, QueueEntry};
use super::store::{JobStore, JobStoreError, PendingSnapshot};

/// Failure reason recorded for cancelled jobs.
pub const CANCELLED: &str = "cancelled";

const MIN_WAKEUP: Duration = Duration::from_millis(1);

/// A job ready for admission: its persisted form plus the live instance.
pub(crate) struct Prepared {
    pub spec: JobSpec,
    pub job: Box<dyn Job>,
}

pub(crate) enum Command {
    Submit {
        batch: Vec<Prepared>,
        reply: Sender<Result<Vec<JobId>, ManagerError>>,
    },
    Cancel {
        id: JobId,
        reply: Sender<Result<CancelOutcome, ManagerError>>,
    },
    SetCondition {
        name: String,
        satisfied: bool,
    },
    Resume {
        factory_key: String,
        reply: Sender<usize>,
    },
    Finished {
        id: JobId,
        job: Box<dyn Job>,
        outcome: Outcome,
    },
    Shutdown,
}

/// Status board shared with the manager. Written by the scheduler only;
/// subscribers register on it from any thread.
///
/// Only the most recent `retained` terminal statuses are kept; older ones are
/// forgotten in the order the jobs finished.
#[derive(Debug)]
pub(crate) struct Board {
    statuses: HashMap<JobId, JobStatus>,
    subscribers: HashMap<JobId, Vec<Sender<JobCompletion>>>,
    finished: VecDeque<JobId>,
    retained: usize,
    stats: ManagerStats,
}

pub(crate) type SharedBoard = Arc<Mutex<Board>>;

pub(crate) fn lock_board(board: &Mutex<Board>) -> MutexGuard<'_, Board> {
    board.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Board {
    pub fn new(retained: usize) -> Self {
        Self {
            statuses: HashMap::new(),
            subscribers: HashMap::new(),
            finished: VecDeque::new(),
            retained,
            stats: ManagerStats::default(),
        }
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.statuses.get(&id).cloned()
    }

    pub fn stats(&self) -> ManagerStats {
        self.stats.clone()
    }

    /// One-shot channel for the terminal status of `id`. `None` if the job
    /// was never seen.
    pub fn subscribe(&mut self, id: JobId) -> Option<Receiver<JobCompletion>> {
        let status = self.statuses.get(&id)?.clone();
        let (tx, rx) = mpsc::channel();
        if status.is_terminal() {
            let _ = tx.send(JobCompletion { id, status });
        } else {
            self.subscribers.entry(id).or_default().push(tx);
        }
        Some(rx)
    }

    fn set(&mut self, id: JobId, status: JobStatus) {
        match &status {
            JobStatus::Succeeded => self.stats.succeeded += 1,
            JobStatus::Failed { .. } => self.stats.failed += 1,
            JobStatus::Pending | JobStatus::Running => {}
        }
        let terminal = status.is_terminal();
        if terminal {
            for tx in self.subscribers.remove(&id).unwrap_or_default() {
                let _ = tx.send(JobCompletion {
                    id,
                    status: status.clone(),
                });
            }
        }
        let previous = self.statuses.insert(id, status);
        if terminal && !previous.is_some_and(|p| p.is_terminal()) {
            self.finished.push_back(id);
            while self.finished.len() > self.retained {
                if let Some(old) = self.finished.pop_front() {
                    self.statuses.remove(&old);
                }
            }
        }
    }
}

pub(crate) struct Scheduler {
    name: String,
    store: Arc<dyn JobStore>,
    queue: JobQueue,
    constraints: ConstraintState,
    /// Dispatched jobs and the constraints they hold.
    running: HashMap<JobId, Vec<Constraint>>,
    workers: usize,
    board: SharedBoard,
    dispatch_tx: Option<Sender<Dispatch>>,
    stopping: bool,
}

impl Scheduler {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
        workers: usize,
        constraints: ConstraintState,
        board: SharedBoard,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            queue: JobQueue::new(),
            constraints,
            running: HashMap::new(),
            workers: workers.max(1),
            board,
            dispatch_tx: None,
            stopping: false,
        }
    }

    fn board(&self) -> MutexGuard<'_, Board> {
        lock_board(&self.board)
    }

    /// Rebuild the queue from persisted records. Records that cannot be
    /// decoded or reconstructed are dead-lettered and their dependents fail.
    pub fn recover(&mut self, snapshot: PendingSnapshot, registry: &FactoryRegistry) -> RecoveryReport {
        let PendingSnapshot { specs, unreadable } = snapshot;
        let persisted: HashSet<JobId> = specs
            .iter()
            .map(|s| s.id)
            .chain(unreadable.iter().map(|r| r.id))
            .collect();

        let mut quarantined: Vec<QuarantinedJob> = unreadable
            .into_iter()
            .map(|record| {
                warn!(
                    scheduler = %self.name,
                    job_id = %record.id,
                    factory_key = %record.factory_key,
                    reason = %record.reason,
                    "quarantining undecodable job record"
                );
                QuarantinedJob {
                    id: record.id,
                    factory_key: record.factory_key,
                    reason: format!("unreadable job record: {}", record.reason),
                }
            })
            .collect();

        for spec in specs {
            match registry.instantiate(&spec.factory_key, &spec.data) {
                Ok(job) => {
                    // Dependencies without a record have already succeeded.
                    let outstanding: Vec<JobId> = spec
                        .depends_on
                        .iter()
                        .copied()
                        .filter(|dep| persisted.contains(dep))
                        .collect();
                    self.queue.push(QueueEntry::new(&spec, job), outstanding);
                    self.board().set(spec.id, JobStatus::Pending);
                }
                Err(err) => {
                    warn!(
                        scheduler = %self.name,
                        job_id = %spec.id,
                        factory_key = %spec.factory_key,
                        error = %err,
                        "quarantining unrecoverable job record"
                    );
                    quarantined.push(QuarantinedJob {
                        id: spec.id,
                        factory_key: spec.factory_key,
                        reason: err.to_string(),
                    });
                }
            }
        }

        for job in &quarantined {
            self.cascade_failure(job.id, &job.reason);
            if let Err(err) = self.store.dead_letter(job.id, &job.reason) {
                error!(
                    scheduler = %self.name,
                    job_id = %job.id,
                    error = %err,
                    "failed to dead-letter job record"
                );
            }
            let mut board = self.board();
            board.stats.quarantined += 1;
            board.set(
                job.id,
                JobStatus::Failed {
                    reason: job.reason.clone(),
                },
            );
        }

        let report = RecoveryReport {
            restored: self.queue.len(),
            quarantined,
        };
        info!(
            scheduler = %self.name,
            restored = report.restored,
            quarantined = report.quarantined.len(),
            "recovered persisted jobs"
        );
        report
    }

    /// Scheduler main loop. Returns once shutdown was requested and every
    /// running job has reported back.
    pub fn run(mut self, commands: Receiver<Command>, dispatch: Sender<Dispatch>) {
        self.dispatch_tx = Some(dispatch);
        info!(scheduler = %self.name, workers = self.workers, "job scheduler started");

        loop {
            if !self.stopping {
                self.dispatch_ready();
            }
            self.publish_stats();
            if self.stopping && self.running.is_empty() {
                break;
            }

            let command = match self.wakeup_in() {
                Some(timeout) => match commands.recv_timeout(timeout) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match commands.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };
            self.handle(command);
        }

        // Closing the dispatch channel stops the workers.
        self.dispatch_tx = None;
        info!(
            scheduler = %self.name,
            pending = self.queue.pending_len(),
            "job scheduler stopped"
        );
    }

    /// How long to sleep before backoff expiry makes a job eligible. `None`
    /// means only a command can change anything.
    fn wakeup_in(&self) -> Option<Duration> {
        if self.stopping || self.running.len() >= self.workers {
            return None;
        }
        let now = Utc::now();
        let at = self.queue.next_wakeup(now)?;
        Some((at - now).to_std().unwrap_or(Duration::ZERO).max(MIN_WAKEUP))
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit { batch, reply } => {
                let result = if self.stopping {
                    Err(ManagerError::ShutDown)
                } else {
                    self.admit(batch)
                };
                let _ = reply.send(result);
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            Command::SetCondition { name, satisfied } => {
                if self.constraints.set_condition(&name, satisfied) {
                    debug!(scheduler = %self.name, condition = %name, satisfied, "condition changed");
                }
            }
            Command::Resume { factory_key, reply } => {
                let _ = reply.send(self.resume(&factory_key));
            }
            Command::Finished { id, job, outcome } => self.finish(id, job, outcome),
            Command::Shutdown => {
                if !self.stopping {
                    info!(
                        scheduler = %self.name,
                        running = self.running.len(),
                        "job scheduler stopping"
                    );
                }
                self.stopping = true;
            }
        }
    }

    /// Validate, persist and queue a batch. Nothing is stored or queued
    /// unless every job in the batch is accepted.
    fn admit(&mut self, mut batch: Vec<Prepared>) -> Result<Vec<JobId>, ManagerError> {
        let mut edges: HashMap<JobId, BTreeSet<JobId>> = HashMap::with_capacity(batch.len());
        for prepared in &batch {
            let id = prepared.spec.id;
            if edges.contains_key(&id) || self.queue.contains(id) || self.board().status(id).is_some() {
                return Err(ManagerError::DuplicateJob(id));
            }
            edges.insert(id, prepared.spec.depends_on.clone());
        }

        {
            let board = self.board();
            for prepared in &batch {
                for dep in &prepared.spec.depends_on {
                    if let Some(JobStatus::Failed { .. }) = board.status(*dep) {
                        return Err(ManagerError::DependencyFailed {
                            job: prepared.spec.id,
                            dependency: *dep,
                        });
                    }
                }
            }
        }

        if let Some(id) = self.queue.find_cycle(&edges) {
            return Err(ManagerError::CyclicDependency(id));
        }

        // Dependencies that are neither queued nor in the batch count as
        // succeeded. The stored record keeps only the live edges, so a restart
        // sees the same graph the cycle check saw.
        for prepared in &mut batch {
            let queue = &self.queue;
            prepared
                .spec
                .depends_on
                .retain(|dep| queue.contains(*dep) || edges.contains_key(dep));
        }

        let specs: Vec<JobSpec> = batch.iter().map(|p| p.spec.clone()).collect();
        self.store.insert_all(&specs).map_err(|err| match err {
            JobStoreError::AlreadyExists(id) => ManagerError::DuplicateJob(id),
            other => ManagerError::Store(other),
        })?;

        let mut ids = Vec::with_capacity(batch.len());
        for Prepared { spec, job } in batch {
            let outstanding: Vec<JobId> = spec.depends_on.iter().copied().collect();
            debug!(
                scheduler = %self.name,
                job_id = %spec.id,
                factory_key = %spec.factory_key,
                priority = spec.priority,
                blocked_on = outstanding.len(),
                "job enqueued"
            );
            self.queue.push(QueueEntry::new(&spec, job), outstanding);
            self.board().set(spec.id, JobStatus::Pending);
            ids.push(spec.id);
        }
        Ok(ids)
    }

    fn dispatch_ready(&mut self) {
        while self.running.len() < self.workers {
            let Some(dispatch) = self.queue.take_next(Utc::now(), &self.constraints) else {
                break;
            };
            let id = dispatch.id;
            let attempt = dispatch.context.run_attempt;
            let constraints = self
                .queue
                .entry(id)
                .map(|e| e.constraints.clone())
                .unwrap_or_default();
            self.constraints.acquire(&constraints);
            self.running.insert(id, constraints);
            self.board().set(id, JobStatus::Running);
            debug!(scheduler = %self.name, job_id = %id, attempt, "dispatching job");

            let sent = match &self.dispatch_tx {
                Some(tx) => tx.send(dispatch),
                None => Err(mpsc::SendError(dispatch)),
            };
            if let Err(mpsc::SendError(dispatch)) = sent {
                error!(scheduler = %self.name, job_id = %id, "worker pool is gone");
                if let Some(constraints) = self.running.remove(&id) {
                    self.constraints.release(&constraints);
                }
                self.queue.requeue(id, dispatch.job, attempt, Utc::now());
                self.board().set(id, JobStatus::Pending);
                self.stopping = true;
                break;
            }
        }
    }

    fn finish(&mut self, id: JobId, job: Box<dyn Job>, outcome: Outcome) {
        if let Some(constraints) = self.running.remove(&id) {
            self.constraints.release(&constraints);
        }
        let Some(entry) = self.queue.entry(id) else {
            debug!(scheduler = %self.name, job_id = %id, "discarding result of untracked job");
            return;
        };
        if entry.cancel_requested {
            debug!(scheduler = %self.name, job_id = %id, ?outcome, "discarding result of cancelled job");
            self.fail(id, Some(job), CANCELLED.to_string());
            return;
        }

        let attempt = entry.run_attempt + 1;
        let exhausted = attempt >= entry.max_attempts;
        let delay = entry.retry_policy.delay_for_attempt(attempt);

        match outcome {
            Outcome::Success => {
                self.delete_record(id);
                let unblocked = self.queue.complete(id);
                debug!(
                    scheduler = %self.name,
                    job_id = %id,
                    attempt,
                    unblocked = unblocked.len(),
                    "job succeeded"
                );
                self.board().set(id, JobStatus::Succeeded);
            }
            Outcome::RetryableFailure(reason) if !exhausted => {
                let next_run_at = backoff_deadline(Utc::now(), delay);
                if let Err(err) = self.store.update_run_state(id, attempt, next_run_at) {
                    error!(
                        scheduler = %self.name,
                        job_id = %id,
                        error = %err,
                        "failed to persist retry state"
                    );
                }
                self.queue.requeue(id, job, attempt, next_run_at);
                let mut board = self.board();
                board.stats.retries += 1;
                board.set(id, JobStatus::Pending);
                debug!(
                    scheduler = %self.name,
                    job_id = %id,
                    attempt,
                    %next_run_at,
                    reason = %reason,
                    "job will be retried"
                );
            }
            Outcome::RetryableFailure(reason) => {
                warn!(
                    scheduler = %self.name,
                    job_id = %id,
                    attempts = attempt,
                    reason = %reason,
                    "job exhausted its attempts"
                );
                self.fail(id, Some(job), format!("gave up after {attempt} attempts: {reason}"));
            }
            Outcome::PermanentFailure(reason) => {
                warn!(scheduler = %self.name, job_id = %id, reason = %reason, "job failed permanently");
                self.fail(id, Some(job), reason);
            }
        }
    }

    fn cancel(&mut self, id: JobId) -> Result<CancelOutcome, ManagerError> {
        let Some((state, already_requested)) = self
            .queue
            .entry(id)
            .map(|entry| (entry.state(), entry.cancel_requested))
        else {
            return Err(ManagerError::NotFound(id));
        };
        match state {
            EntryState::Pending => {
                info!(scheduler = %self.name, job_id = %id, "job cancelled");
                self.fail(id, None, CANCELLED.to_string());
                Ok(CancelOutcome::Cancelled)
            }
            EntryState::Running if already_requested => Ok(CancelOutcome::CancelRequested),
            EntryState::Running => {
                info!(scheduler = %self.name, job_id = %id, "cancellation requested for running job");
                self.queue.request_cancel(id);
                self.cascade_failure(id, CANCELLED);
                self.delete_record(id);
                Ok(CancelOutcome::CancelRequested)
            }
        }
    }

    fn resume(&mut self, factory_key: &str) -> usize {
        let now = Utc::now();
        let resumed = self.queue.reset_backoff(factory_key, now);
        for (id, attempt) in &resumed {
            if let Err(err) = self.store.update_run_state(*id, *attempt, now) {
                error!(scheduler = %self.name, job_id = %id, error = %err, "failed to persist resumed job");
            }
        }
        if !resumed.is_empty() {
            info!(
                scheduler = %self.name,
                factory_key = %factory_key,
                resumed = resumed.len(),
                "resumed pending jobs"
            );
        }
        resumed.len()
    }

    /// Terminal failure of `id`: dependents go first, then the job itself.
    fn fail(&mut self, id: JobId, job: Option<Box<dyn Job>>, reason: String) {
        self.cascade_failure(id, &reason);
        self.delete_record(id);
        let held = self.queue.remove(id).and_then(|entry| entry.job);
        if let Some(mut job) = job.or(held) {
            job.on_failure(&reason);
        }
        self.board().set(id, JobStatus::Failed { reason });
    }

    fn cascade_failure(&mut self, id: JobId, reason: &str) {
        let removed = self.queue.remove_dependents_of(id);
        if removed.is_empty() {
            return;
        }
        warn!(
            scheduler = %self.name,
            job_id = %id,
            dependents = removed.len(),
            "failing dependents of failed job"
        );
        let why = format!("dependency {id} failed: {reason}");
        for mut entry in removed {
            self.delete_record(entry.id);
            if let Some(job) = entry.job.as_mut() {
                job.on_failure(&why);
            }
            self.board().set(entry.id, JobStatus::Failed { reason: why.clone() });
        }
    }

    fn delete_record(&self, id: JobId) {
        if let Err(err) = self.store.delete(id) {
            error!(scheduler = %self.name, job_id = %id, error = %err, "failed to delete job record");
        }
    }

    fn publish_stats(&self) {
        let mut board = self.board();
        board.stats.pending = self.queue.pending_len();
        board.stats.running = self.running.len();
    }
}

fn backoff_deadline(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(now)
}

/// Worker loop: run dispatched jobs until the dispatch channel closes.
pub(crate) fn worker_loop(name: String, dispatches: Arc<Mutex<Receiver<Dispatch>>>, results: Sender<Command>) {
    debug!(worker = %name, "job worker started");
    loop {
        let next = dispatches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        let Ok(Dispatch { id, mut job, context }) = next else {
            break;
        };
        let outcome = execute(job.as_mut(), &context);
        if results.send(Command::Finished { id, job, outcome }).is_err() {
            break;
        }
    }
    debug!(worker = %name, "job worker stopped");
}

/// Run one attempt. A panic is a permanent failure.
fn execute(job: &mut dyn Job, context: &JobContext) -> Outcome {
    match panic::catch_unwind(AssertUnwindSafe(|| job.run(context))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(job_id = %context.id, panic = %message, "job panicked");
            Outcome::PermanentFailure(format!("job panicked: {message}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::Data;

    struct Panics;

    impl Job for Panics {
        fn factory_key(&self) -> &str {
            "panics"
        }

        fn serialize(&self) -> Data {
            Data::empty()
        }

        fn run(&mut self, _ctx: &JobContext) -> Outcome {
            panic!("boom");
        }
    }

    #[test]
    fn panics_become_permanent_failures() {
        let ctx = JobContext::new(JobId::new(), 0);
        let outcome = execute(&mut Panics, &ctx);
        assert_eq!(outcome, Outcome::PermanentFailure("job panicked: boom".to_string()));
    }

    #[test]
    fn backoff_deadline_adds_delay() {
        let now = Utc::now();
        let at = backoff_deadline(now, Duration::from_secs(2));
        assert_eq!(at - now, chrono::Duration::seconds(2));
    }

    #[test]
    fn board_delivers_terminal_status_once() {
        let mut board = Board::new(16);
        let id = JobId::new();
        assert!(board.subscribe(id).is_none());

        board.set(id, JobStatus::Pending);
        let early = board.subscribe(id).unwrap();
        assert!(early.try_recv().is_err());

        board.set(id, JobStatus::Succeeded);
        assert_eq!(early.recv().unwrap().status, JobStatus::Succeeded);
        assert!(early.try_recv().is_err());

        let late = board.subscribe(id).unwrap();
        assert_eq!(late.recv().unwrap().status, JobStatus::Succeeded);
        assert_eq!(board.stats().succeeded, 1);
    }

    #[test]
    fn board_forgets_oldest_terminal_statuses() {
        let mut board = Board::new(2);
        let live = JobId::new();
        board.set(live, JobStatus::Pending);

        let done: Vec<JobId> = (0..3).map(|_| JobId::new()).collect();
        for id in &done {
            board.set(*id, JobStatus::Pending);
            board.set(*id, JobStatus::Succeeded);
        }

        assert_eq!(board.status(done[0]), None);
        assert!(board.subscribe(done[0]).is_none());
        assert_eq!(board.status(done[1]), Some(JobStatus::Succeeded));
        assert_eq!(board.status(done[2]), Some(JobStatus::Succeeded));
        assert_eq!(board.status(live), Some(JobStatus::Pending));
        assert_eq!(board.stats().succeeded, 3);
    }
}
