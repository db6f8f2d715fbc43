//! Job manager facade.
//!
//! ```text
//! let manager = JobManager::builder()
//!     .config(JobManagerConfig::from_env()?)
//!     .register("send_message", SendMessage::from_data)?
//!     .build(SqliteJobStore::open("jobs.db")?);
//! let report = manager.initialize()?;
//! let id = manager.enqueue(SendMessage::new(..))?;
//! ```
//!
//! `initialize` must run once before anything is enqueued: it restores the
//! persisted queue and starts the scheduler thread plus the worker pool.

use std::collections::BTreeSet;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use courier_core::{
    Data, DataError, FactoryError, FactoryRegistry, Job, JobId, JobSpec, JobStatus, Priority,
};

use super::config::JobManagerConfig;
use super::constraints::ConstraintState;
use super::scheduler::{
    Board, Command, Prepared, Scheduler, SharedBoard, lock_board, worker_loop,
};
use super::store::{DeadLetter, JobStore, JobStoreError};

/// Job manager error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManagerError {
    /// Accepting the job would close a dependency cycle.
    #[error("job {0} would create a dependency cycle")]
    CyclicDependency(JobId),
    #[error("job {0} already exists")]
    DuplicateJob(JobId),
    #[error("dependency {dependency} of job {job} has already failed")]
    DependencyFailed { job: JobId, dependency: JobId },
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job manager is not initialized")]
    NotInitialized,
    #[error("job manager is already initialized")]
    AlreadyInitialized,
    #[error("job manager is shut down")]
    ShutDown,
    #[error("failed to start job manager thread: {0}")]
    Spawn(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Factory(#[from] FactoryError),
}

/// Result of [`JobManager::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was pending and has been removed.
    Cancelled,
    /// The job is running; its result will be discarded.
    CancelRequested,
}

/// A persisted record that could not be turned back into a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuarantinedJob {
    pub id: JobId,
    pub factory_key: String,
    pub reason: String,
}

/// What [`JobManager::initialize`] found in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Jobs back in the queue.
    pub restored: usize,
    /// Records moved to the dead-letter area.
    pub quarantined: Vec<QuarantinedJob>,
}

/// Manager runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub pending: usize,
    pub running: usize,
    pub succeeded: u64,
    /// Terminal failures, including cascades, cancellations and quarantines.
    pub failed: u64,
    pub retries: u64,
    pub quarantined: u64,
}

/// Terminal status of a job, delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompletion {
    pub id: JobId,
    pub status: JobStatus,
}

/// A job plus its queueing options.
#[derive(Debug)]
pub struct JobRequest {
    job: Box<dyn Job>,
    id: Option<JobId>,
    priority: Priority,
    depends_on: BTreeSet<JobId>,
}

impl JobRequest {
    pub fn new(job: impl Job) -> Self {
        Self::boxed(Box::new(job))
    }

    pub fn boxed(job: Box<dyn Job>) -> Self {
        Self {
            job,
            id: None,
            priority: 0,
            depends_on: BTreeSet::new(),
        }
    }

    /// Use a caller-chosen id, e.g. to declare dependencies inside one
    /// [`JobManager::submit_all`] batch.
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    /// Higher runs first.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, deps: impl IntoIterator<Item = JobId>) -> Self {
        self.depends_on.extend(deps);
        self
    }
}

/// Builder collecting configuration and factories before the manager exists.
#[derive(Debug, Default)]
pub struct JobManagerBuilder {
    config: JobManagerConfig,
    registry: FactoryRegistry,
}

impl JobManagerBuilder {
    pub fn config(mut self, config: JobManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register<F>(mut self, factory_key: impl Into<String>, factory: F) -> Result<Self, FactoryError>
    where
        F: Fn(&Data) -> Result<Box<dyn Job>, DataError> + Send + Sync + 'static,
    {
        self.registry.register(factory_key, factory)?;
        Ok(self)
    }

    pub fn build(self, store: impl JobStore + 'static) -> JobManager {
        let retained_statuses = self.config.retained_statuses;
        JobManager {
            config: self.config,
            registry: self.registry,
            store: Arc::new(store),
            board: Arc::new(Mutex::new(Board::new(retained_statuses))),
            lifecycle: Mutex::new(Lifecycle::Built),
        }
    }
}

enum Lifecycle {
    Built,
    Running(Runtime),
    Stopped,
}

struct Runtime {
    commands: Sender<Command>,
    scheduler: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl Runtime {
    fn stop(self, name: &str) {
        let _ = self.commands.send(Command::Shutdown);
        if self.scheduler.join().is_err() {
            error!(manager = %name, "job scheduler panicked");
        }
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

/// Persisted, constraint-aware background job manager.
///
/// All methods take `&self`; share the manager across threads with an `Arc`.
/// Dropping the manager shuts it down.
pub struct JobManager {
    config: JobManagerConfig,
    registry: FactoryRegistry,
    store: Arc<dyn JobStore>,
    board: SharedBoard,
    lifecycle: Mutex<Lifecycle>,
}

impl JobManager {
    pub fn builder() -> JobManagerBuilder {
        JobManagerBuilder::default()
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.config
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Restore persisted jobs and start executing.
    ///
    /// Records whose factory is missing or whose data no longer decodes are
    /// moved to the dead-letter area and reported; their dependents fail.
    /// A store failure while loading is returned and the manager stays
    /// uninitialized.
    pub fn initialize(&self) -> Result<RecoveryReport, ManagerError> {
        let mut lifecycle = self.lifecycle();
        match *lifecycle {
            Lifecycle::Built => {}
            Lifecycle::Running(_) => return Err(ManagerError::AlreadyInitialized),
            Lifecycle::Stopped => return Err(ManagerError::ShutDown),
        }

        let snapshot = self.store.load_all_pending()?;
        let mut scheduler = Scheduler::new(
            self.config.name.clone(),
            Arc::clone(&self.store),
            self.config.worker_count(),
            ConstraintState::new(self.config.initial_conditions.iter().cloned()),
            Arc::clone(&self.board),
        );
        let report = scheduler.recover(snapshot, &self.registry);

        *lifecycle = Lifecycle::Running(self.spawn(scheduler)?);
        info!(
            manager = %self.config.name,
            workers = self.config.worker_count(),
            restored = report.restored,
            quarantined = report.quarantined.len(),
            "job manager initialized"
        );
        Ok(report)
    }

    fn spawn(&self, scheduler: Scheduler) -> Result<Runtime, ManagerError> {
        let (commands_tx, commands_rx) = mpsc::channel();
        let (dispatch_tx, dispatch_rx) = mpsc::channel();
        let dispatch_rx = Arc::new(Mutex::new(dispatch_rx));

        let count = self.config.worker_count();
        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let name = format!("{}-worker-{i}", self.config.name);
            let dispatches = Arc::clone(&dispatch_rx);
            let results = commands_tx.clone();
            let worker = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(name, dispatches, results))
                .map_err(|e| ManagerError::Spawn(e.to_string()))?;
            workers.push(worker);
        }

        let scheduler = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || scheduler.run(commands_rx, dispatch_tx))
            .map_err(|e| ManagerError::Spawn(e.to_string()))?;

        Ok(Runtime {
            commands: commands_tx,
            scheduler,
            workers,
        })
    }

    fn commands(&self) -> Result<Sender<Command>, ManagerError> {
        match &*self.lifecycle() {
            Lifecycle::Built => Err(ManagerError::NotInitialized),
            Lifecycle::Running(runtime) => Ok(runtime.commands.clone()),
            Lifecycle::Stopped => Err(ManagerError::ShutDown),
        }
    }

    /// Send a command and wait for the scheduler's reply.
    fn request<T>(&self, command: impl FnOnce(Sender<T>) -> Command) -> Result<T, ManagerError> {
        let commands = self.commands()?;
        let (reply_tx, reply_rx) = mpsc::channel();
        commands
            .send(command(reply_tx))
            .map_err(|_| ManagerError::ShutDown)?;
        reply_rx.recv().map_err(|_| ManagerError::ShutDown)
    }

    fn prepare(&self, request: JobRequest, now: DateTime<Utc>) -> Result<Prepared, ManagerError> {
        let JobRequest {
            job,
            id,
            priority,
            depends_on,
        } = request;

        let factory_key = job.factory_key().to_string();
        if !self.registry.contains(&factory_key) {
            return Err(FactoryError::MissingFactory(factory_key).into());
        }

        let mut spec = JobSpec::new(factory_key, job.serialize(), job.retry_policy().attempt_limit())
            .with_priority(priority)
            .with_created_at(now)
            .depending_on(depends_on);
        if let Some(id) = id {
            spec = spec.with_id(id);
        }
        Ok(Prepared { spec, job })
    }

    /// Persist and queue a job with default options.
    pub fn enqueue(&self, job: impl Job) -> Result<JobId, ManagerError> {
        self.submit(JobRequest::new(job))
    }

    /// Persist and queue one job. The job counts as queued only once its
    /// record is durable.
    pub fn submit(&self, request: JobRequest) -> Result<JobId, ManagerError> {
        let prepared = self.prepare(request, Utc::now())?;
        let id = prepared.spec.id;
        self.request(|reply| Command::Submit {
            batch: vec![prepared],
            reply,
        })??;
        Ok(id)
    }

    /// Persist and queue several jobs atomically. Jobs may depend on each
    /// other through ids chosen with [`JobRequest::with_id`]. If any job is
    /// rejected, nothing is stored or queued.
    pub fn submit_all(&self, requests: Vec<JobRequest>) -> Result<Vec<JobId>, ManagerError> {
        let now = Utc::now();
        let batch = requests
            .into_iter()
            .map(|request| self.prepare(request, now))
            .collect::<Result<Vec<_>, _>>()?;
        self.request(|reply| Command::Submit { batch, reply })?
    }

    /// Cancel a pending or running job. Dependents of the job fail.
    pub fn cancel(&self, id: JobId) -> Result<CancelOutcome, ManagerError> {
        self.request(|reply| Command::Cancel { id, reply })?
    }

    /// Last known status. `None` for ids this manager has never seen.
    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        lock_board(&self.board).status(id)
    }

    /// One-shot channel receiving the job's terminal status. Delivered
    /// immediately if the job has already finished.
    pub fn subscribe(&self, id: JobId) -> Result<Receiver<JobCompletion>, ManagerError> {
        lock_board(&self.board)
            .subscribe(id)
            .ok_or(ManagerError::NotFound(id))
    }

    /// Report a change of a named environmental condition.
    pub fn set_condition(&self, name: impl Into<String>, satisfied: bool) -> Result<(), ManagerError> {
        self.commands()?
            .send(Command::SetCondition {
                name: name.into(),
                satisfied,
            })
            .map_err(|_| ManagerError::ShutDown)
    }

    /// Make pending jobs of one type eligible now, skipping what remains of
    /// their backoff. Returns how many jobs were affected.
    pub fn resume_pending(&self, factory_key: impl Into<String>) -> Result<usize, ManagerError> {
        let factory_key = factory_key.into();
        self.request(|reply| Command::Resume { factory_key, reply })
    }

    pub fn stats(&self) -> ManagerStats {
        lock_board(&self.board).stats()
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, ManagerError> {
        Ok(self.store.list_dead_letters()?)
    }

    pub fn purge_dead_letter(&self, id: JobId) -> Result<(), ManagerError> {
        Ok(self.store.purge_dead_letter(id)?)
    }

    /// Stop dispatching, wait for running jobs to report back and join all
    /// threads. Pending jobs stay persisted. Idempotent.
    pub fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle(), Lifecycle::Stopped);
        if let Lifecycle::Running(runtime) = previous {
            runtime.stop(&self.config.name);
            info!(manager = %self.config.name, "job manager shut down");
        }
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
