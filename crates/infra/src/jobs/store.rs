//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{JobId, JobSpec};

/// Durable persistence of job records.
///
/// Every mutation must be durable before it returns: a crash right after a
/// successful `insert` leaves the job recoverable, a crash right after
/// `delete` guarantees it is not run again.
pub trait JobStore: Send + Sync {
    /// Persist a new record. Fails if the id already exists.
    fn insert(&self, spec: &JobSpec) -> Result<(), JobStoreError>;

    /// Persist several records atomically: either all are stored or none.
    fn insert_all(&self, specs: &[JobSpec]) -> Result<(), JobStoreError> {
        for (idx, spec) in specs.iter().enumerate() {
            if let Err(err) = self.insert(spec) {
                for inserted in &specs[..idx] {
                    let _ = self.delete(inserted.id);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Record a failed attempt. No-op if the record is gone (completion and
    /// retry scheduling may race).
    fn update_run_state(
        &self,
        id: JobId,
        run_attempt: u32,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// Remove a record. Idempotent.
    fn delete(&self, id: JobId) -> Result<(), JobStoreError>;

    /// Snapshot of all pending records, ordered by priority (highest first)
    /// then creation time (oldest first). Records that no longer decode are
    /// listed separately. Used at startup only.
    fn load_all_pending(&self) -> Result<PendingSnapshot, JobStoreError>;

    fn get(&self, id: JobId) -> Result<Option<JobSpec>, JobStoreError>;

    /// Move a record out of the pending set into the dead-letter area.
    /// Works for unreadable records too. No-op if the record is gone.
    fn dead_letter(&self, id: JobId, reason: &str) -> Result<(), JobStoreError>;

    fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, JobStoreError>;

    /// Permanently drop a dead-lettered record. Idempotent.
    fn purge_dead_letter(&self, id: JobId) -> Result<(), JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// The persistence layer failed; the operation did not happen.
    #[error("job store unavailable: {0}")]
    Unavailable(String),
    /// A stored record could not be decoded.
    #[error("corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl JobStoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

/// A stored record whose id is known but whose contents no longer decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableRecord {
    pub id: JobId,
    /// Empty if the column itself was unreadable.
    pub factory_key: String,
    pub reason: String,
}

/// Result of `load_all_pending`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSnapshot {
    /// Decoded records in recovery order.
    pub specs: Vec<JobSpec>,
    pub unreadable: Vec<UnreadableRecord>,
}

impl PendingSnapshot {
    pub fn len(&self) -> usize {
        self.specs.len() + self.unreadable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<JobSpec>> for PendingSnapshot {
    fn from(specs: Vec<JobSpec>) -> Self {
        Self {
            specs,
            unreadable: Vec::new(),
        }
    }
}

/// A quarantined record kept for operator inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: JobId,
    pub factory_key: String,
    /// `None` when the record was dead-lettered because it could not be decoded.
    pub spec: Option<JobSpec>,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(spec: JobSpec, reason: impl Into<String>) -> Self {
        Self {
            id: spec.id,
            factory_key: spec.factory_key.clone(),
            spec: Some(spec),
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }

    pub fn unreadable(id: JobId, factory_key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id,
            factory_key: factory_key.into(),
            spec: None,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Sort records into recovery order.
pub(crate) fn sort_pending(specs: &mut [JobSpec]) {
    specs.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}

/// In-memory job store for tests/dev.
///
/// Not durable across processes; a restart is simulated by building a new
/// manager over the same `Arc<InMemoryJobStore>`.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobSpec>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetter>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn jobs_read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, JobSpec>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::unavailable("job table lock poisoned"))
    }

    fn jobs_write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, JobSpec>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::unavailable("job table lock poisoned"))
    }

    fn dead_letters_write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<JobId, DeadLetter>>, JobStoreError> {
        self.dead_letters
            .write()
            .map_err(|_| JobStoreError::unavailable("dead letter lock poisoned"))
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, spec: &JobSpec) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs_write()?;
        if jobs.contains_key(&spec.id) {
            return Err(JobStoreError::AlreadyExists(spec.id));
        }
        jobs.insert(spec.id, spec.clone());
        Ok(())
    }

    fn insert_all(&self, specs: &[JobSpec]) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs_write()?;
        let mut seen = std::collections::HashSet::new();
        for spec in specs {
            if jobs.contains_key(&spec.id) || !seen.insert(spec.id) {
                return Err(JobStoreError::AlreadyExists(spec.id));
            }
        }
        for spec in specs {
            jobs.insert(spec.id, spec.clone());
        }
        Ok(())
    }

    fn update_run_state(
        &self,
        id: JobId,
        run_attempt: u32,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs_write()?;
        if let Some(spec) = jobs.get_mut(&id) {
            spec.run_attempt = run_attempt;
            spec.next_run_at = next_run_at;
        }
        Ok(())
    }

    fn delete(&self, id: JobId) -> Result<(), JobStoreError> {
        self.jobs_write()?.remove(&id);
        Ok(())
    }

    fn load_all_pending(&self) -> Result<PendingSnapshot, JobStoreError> {
        let mut specs: Vec<_> = self.jobs_read()?.values().cloned().collect();
        sort_pending(&mut specs);
        Ok(specs.into())
    }

    fn get(&self, id: JobId) -> Result<Option<JobSpec>, JobStoreError> {
        Ok(self.jobs_read()?.get(&id).cloned())
    }

    fn dead_letter(&self, id: JobId, reason: &str) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs_write()?;
        let mut dls = self.dead_letters_write()?;

        if let Some(spec) = jobs.remove(&id) {
            dls.insert(id, DeadLetter::new(spec, reason));
        }
        Ok(())
    }

    fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, JobStoreError> {
        let dls = self
            .dead_letters
            .read()
            .map_err(|_| JobStoreError::unavailable("dead letter lock poisoned"))?;

        let mut result: Vec<_> = dls.values().cloned().collect();
        result.sort_by_key(|e| e.dead_lettered_at);
        Ok(result)
    }

    fn purge_dead_letter(&self, id: JobId) -> Result<(), JobStoreError> {
        self.dead_letters_write()?.remove(&id);
        Ok(())
    }
}

impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    fn insert(&self, spec: &JobSpec) -> Result<(), JobStoreError> {
        (**self).insert(spec)
    }

    fn insert_all(&self, specs: &[JobSpec]) -> Result<(), JobStoreError> {
        (**self).insert_all(specs)
    }

    fn update_run_state(
        &self,
        id: JobId,
        run_attempt: u32,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        (**self).update_run_state(id, run_attempt, next_run_at)
    }

    fn delete(&self, id: JobId) -> Result<(), JobStoreError> {
        (**self).delete(id)
    }

    fn load_all_pending(&self) -> Result<PendingSnapshot, JobStoreError> {
        (**self).load_all_pending()
    }

    fn get(&self, id: JobId) -> Result<Option<JobSpec>, JobStoreError> {
        (**self).get(id)
    }

    fn dead_letter(&self, id: JobId, reason: &str) -> Result<(), JobStoreError> {
        (**self).dead_letter(id, reason)
    }

    fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, JobStoreError> {
        (**self).list_dead_letters()
    }

    fn purge_dead_letter(&self, id: JobId) -> Result<(), JobStoreError> {
        (**self).purge_dead_letter(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use courier_core::Data;

    fn spec(key: &str) -> JobSpec {
        JobSpec::new(key, Data::empty(), 3)
    }

    #[test]
    fn insert_rejects_duplicate_ids() {
        let store = InMemoryJobStore::new();
        let job = spec("send_message");

        store.insert(&job).unwrap();
        assert_eq!(store.insert(&job), Err(JobStoreError::AlreadyExists(job.id)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn insert_all_is_all_or_nothing() {
        let store = InMemoryJobStore::new();
        let existing = spec("a");
        store.insert(&existing).unwrap();

        let fresh = spec("b");
        let err = store.insert_all(&[fresh.clone(), existing.clone()]).unwrap_err();
        assert_eq!(err, JobStoreError::AlreadyExists(existing.id));
        assert!(store.get(fresh.id).unwrap().is_none());
    }

    #[test]
    fn update_run_state_ignores_missing_records() {
        let store = InMemoryJobStore::new();
        store
            .update_run_state(JobId::new(), 2, Utc::now())
            .unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn update_run_state_persists_attempt() {
        let store = InMemoryJobStore::new();
        let job = spec("upload");
        store.insert(&job).unwrap();

        let later = Utc::now() + Duration::seconds(30);
        store.update_run_state(job.id, 1, later).unwrap();

        let stored = store.get(job.id).unwrap().unwrap();
        assert_eq!(stored.run_attempt, 1);
        assert_eq!(stored.next_run_at, later);
    }

    #[test]
    fn delete_is_idempotent() {
        let store = InMemoryJobStore::new();
        let job = spec("upload");
        store.insert(&job).unwrap();

        store.delete(job.id).unwrap();
        store.delete(job.id).unwrap();
        assert!(store.get(job.id).unwrap().is_none());
    }

    #[test]
    fn pending_snapshot_orders_by_priority_then_age() {
        let store = InMemoryJobStore::new();
        let t0 = Utc::now();

        let old_low = spec("a").with_created_at(t0);
        let new_low = spec("b").with_created_at(t0 + Duration::milliseconds(5));
        let new_high = spec("c")
            .with_priority(5)
            .with_created_at(t0 + Duration::milliseconds(10));

        store.insert(&new_low).unwrap();
        store.insert(&new_high).unwrap();
        store.insert(&old_low).unwrap();

        let ids: Vec<_> = store
            .load_all_pending()
            .unwrap()
            .specs
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![new_high.id, old_low.id, new_low.id]);
    }

    #[test]
    fn dead_letter_moves_record_out_of_pending() {
        let store = InMemoryJobStore::new();
        let job = spec("upload_v1");
        store.insert(&job).unwrap();

        store.dead_letter(job.id, "no factory").unwrap();

        assert!(store.load_all_pending().unwrap().is_empty());
        let dls = store.list_dead_letters().unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].id, job.id);
        assert_eq!(dls[0].spec.as_ref(), Some(&job));
        assert_eq!(dls[0].reason, "no factory");

        store.purge_dead_letter(job.id).unwrap();
        assert!(store.list_dead_letters().unwrap().is_empty());
    }

    #[test]
    fn arc_store_delegates() {
        let store = InMemoryJobStore::arc();
        let shared: Arc<dyn JobStore> = store.clone();
        let job = spec("send_message");

        shared.insert(&job).unwrap();
        assert!(store.get(job.id).unwrap().is_some());
    }
}
