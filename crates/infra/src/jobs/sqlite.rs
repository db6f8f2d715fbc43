//! SQLite-backed job store.
//!
//! Records live in a `job_spec` table keyed by job id; quarantined records
//! move to `job_dead_letter`. A row that no longer decodes is reported by
//! `load_all_pending` and can still be dead-lettered; its columns are kept
//! as raw JSON. The database runs in WAL mode with
//! `synchronous = FULL`, so every committed mutation is on disk before the
//! call returns.
//!
//! ## Sync facade
//!
//! `JobStore` is synchronous (the scheduler is a plain thread), while SQLx is
//! async. The store owns a current-thread tokio runtime and `block_on`s each
//! operation. Do not call it from inside another tokio runtime; wrap calls in
//! `spawn_blocking` there.
//!
//! ## Schema compatibility
//!
//! `factory_key` and `serialized_data` alone drive recovery. Later schema
//! changes must keep both columns readable.

use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tokio::runtime::Runtime;
use tracing::{debug, error, warn};

use courier_core::{Data, JobId, JobSpec};

use super::store::{DeadLetter, JobStore, JobStoreError, PendingSnapshot, UnreadableRecord};

const SPEC_COLUMNS: &str = "id, factory_key, serialized_data, priority, created_at, \
                            run_attempt, max_attempts, next_run_at, depends_on";

/// Durable job store on a local SQLite database.
#[derive(Debug)]
pub struct SqliteJobStore {
    pool: SqlitePool,
    runtime: Runtime,
}

impl SqliteJobStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JobStoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    JobStoreError::unavailable(format!(
                        "failed to create job database directory {:?}: {e}",
                        parent
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        Self::connect(options, 4)
    }

    /// A private in-memory database. Nothing survives the store being dropped.
    pub fn open_in_memory() -> Result<Self, JobStoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| map_sqlx_error("open_in_memory", e))?;

        // Every pooled connection would otherwise get its own empty database.
        Self::connect(options, 1)
    }

    fn connect(options: SqliteConnectOptions, max_connections: u32) -> Result<Self, JobStoreError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| JobStoreError::unavailable(format!("failed to start store runtime: {e}")))?;

        let pool = runtime
            .block_on(async {
                let pool = SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(options)
                    .await
                    .context("failed to open job database")?;

                migrate(&pool).await.context("failed to create job tables")?;
                Ok::<SqlitePool, anyhow::Error>(pool)
            })
            .map_err(|e| JobStoreError::unavailable(format!("{e:#}")))?;

        debug!(max_connections, "sqlite job store ready");
        Ok(Self { pool, runtime })
    }

    async fn insert_specs(&self, specs: &[JobSpec]) -> Result<(), JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;

        for spec in specs {
            let existing = sqlx::query("SELECT 1 FROM job_spec WHERE id = ?1")
                .bind(spec.id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("insert", e))?;
            if existing.is_some() {
                // Dropping the transaction rolls back earlier rows of the batch.
                return Err(JobStoreError::AlreadyExists(spec.id));
            }

            let data = spec.data.to_json().map_err(|e| JobStoreError::Corrupt {
                id: spec.id.to_string(),
                reason: e.to_string(),
            })?;
            let depends_on = serde_json::to_string(&spec.depends_on).map_err(|e| {
                JobStoreError::Corrupt {
                    id: spec.id.to_string(),
                    reason: e.to_string(),
                }
            })?;

            sqlx::query(
                r#"
                INSERT INTO job_spec (
                    id,
                    factory_key,
                    serialized_data,
                    priority,
                    created_at,
                    run_attempt,
                    max_attempts,
                    next_run_at,
                    depends_on
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )
            .bind(spec.id.to_string())
            .bind(&spec.factory_key)
            .bind(data)
            .bind(spec.priority)
            .bind(format_ts(spec.created_at))
            .bind(i64::from(spec.run_attempt))
            .bind(i64::from(spec.max_attempts))
            .bind(format_ts(spec.next_run_at))
            .bind(depends_on)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error("insert", e))
    }

    async fn fetch_spec(&self, id: JobId) -> Result<Option<JobSpec>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {SPEC_COLUMNS} FROM job_spec WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(row_to_spec).transpose()
    }

    async fn move_to_dead_letters(&self, id: JobId, reason: &str) -> Result<(), JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("dead_letter", e))?;

        let row = sqlx::query(&format!("SELECT {SPEC_COLUMNS} FROM job_spec WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("dead_letter", e))?;

        let Some(row) = row else {
            return Ok(());
        };

        let (entry, record) = match row_to_spec(&row) {
            Ok(spec) => {
                let record = serde_json::to_string(&spec)
                    .map_err(|e| corrupt(&id.to_string(), e.to_string()))?;
                (DeadLetter::new(spec, reason), record)
            }
            Err(_) => {
                let factory_key = row.try_get::<String, _>("factory_key").unwrap_or_default();
                (DeadLetter::unreadable(id, factory_key, reason), raw_record(&row))
            }
        };

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO job_dead_letter (id, factory_key, record, reason, dead_lettered_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(id.to_string())
        .bind(&entry.factory_key)
        .bind(record)
        .bind(&entry.reason)
        .bind(format_ts(entry.dead_lettered_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("dead_letter", e))?;

        sqlx::query("DELETE FROM job_spec WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("dead_letter", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("dead_letter", e))
    }
}

impl JobStore for SqliteJobStore {
    fn insert(&self, spec: &JobSpec) -> Result<(), JobStoreError> {
        self.runtime.block_on(self.insert_specs(std::slice::from_ref(spec)))
    }

    fn insert_all(&self, specs: &[JobSpec]) -> Result<(), JobStoreError> {
        self.runtime.block_on(self.insert_specs(specs))
    }

    fn update_run_state(
        &self,
        id: JobId,
        run_attempt: u32,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        self.runtime.block_on(async {
            sqlx::query(
                r#"
                UPDATE job_spec
                SET run_attempt = ?2,
                    next_run_at = ?3
                WHERE id = ?1
                "#,
            )
            .bind(id.to_string())
            .bind(i64::from(run_attempt))
            .bind(format_ts(next_run_at))
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_run_state", e))?;
            Ok(())
        })
    }

    fn delete(&self, id: JobId) -> Result<(), JobStoreError> {
        self.runtime.block_on(async {
            sqlx::query("DELETE FROM job_spec WHERE id = ?1")
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("delete", e))?;
            Ok(())
        })
    }

    fn load_all_pending(&self) -> Result<PendingSnapshot, JobStoreError> {
        self.runtime.block_on(async {
            let rows = sqlx::query(&format!(
                "SELECT {SPEC_COLUMNS} FROM job_spec ORDER BY priority DESC, created_at ASC, id ASC"
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_all_pending", e))?;

            let mut snapshot = PendingSnapshot::default();
            for row in &rows {
                match row_to_spec(row) {
                    Ok(spec) => snapshot.specs.push(spec),
                    Err(err) => match unreadable_record(row, &err) {
                        Some(record) => {
                            warn!(job_id = %record.id, reason = %record.reason, "found unreadable job record");
                            snapshot.unreadable.push(record);
                        }
                        // No dependency can name a malformed id; the row stays for manual repair.
                        None => error!(error = %err, "skipping job record with unreadable id"),
                    },
                }
            }
            Ok(snapshot)
        })
    }

    fn get(&self, id: JobId) -> Result<Option<JobSpec>, JobStoreError> {
        self.runtime.block_on(self.fetch_spec(id))
    }

    fn dead_letter(&self, id: JobId, reason: &str) -> Result<(), JobStoreError> {
        self.runtime.block_on(self.move_to_dead_letters(id, reason))
    }

    fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, JobStoreError> {
        self.runtime.block_on(async {
            let rows = sqlx::query(
                r#"
                SELECT id, factory_key, record, reason, dead_lettered_at
                FROM job_dead_letter
                ORDER BY dead_lettered_at ASC
                "#,
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

            rows.into_iter().map(row_to_dead_letter).collect()
        })
    }

    fn purge_dead_letter(&self, id: JobId) -> Result<(), JobStoreError> {
        self.runtime.block_on(async {
            sqlx::query("DELETE FROM job_dead_letter WHERE id = ?1")
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("purge_dead_letter", e))?;
            Ok(())
        })
    }
}

async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_spec (
            id              TEXT PRIMARY KEY,
            factory_key     TEXT NOT NULL,
            serialized_data TEXT NOT NULL,
            priority        INTEGER NOT NULL,
            created_at      TEXT NOT NULL,
            run_attempt     INTEGER NOT NULL,
            max_attempts    INTEGER NOT NULL,
            next_run_at     TEXT NOT NULL,
            depends_on      TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS job_spec_queue_order ON job_spec (priority DESC, created_at ASC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_dead_letter (
            id               TEXT PRIMARY KEY,
            factory_key      TEXT NOT NULL DEFAULT '',
            record           TEXT NOT NULL,
            reason           TEXT NOT NULL,
            dead_lettered_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Fixed-width UTC timestamps so text order matches time order.
fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(id: &str, column: &str, value: &str) -> Result<DateTime<Utc>, JobStoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(id, format!("invalid {column}: {e}")))
}

fn corrupt(id: &str, reason: impl Into<String>) -> JobStoreError {
    JobStoreError::Corrupt {
        id: id.to_string(),
        reason: reason.into(),
    }
}

/// Map a database row into a `JobSpec`.
fn row_to_spec(row: &SqliteRow) -> Result<JobSpec, JobStoreError> {
    let get_str = |column: &str| -> Result<String, JobStoreError> {
        row.try_get::<String, _>(column)
            .map_err(|e| map_sqlx_error("decode", e))
    };
    let get_int = |column: &str| -> Result<i64, JobStoreError> {
        row.try_get::<i64, _>(column)
            .map_err(|e| map_sqlx_error("decode", e))
    };

    let id_str = get_str("id")?;
    let id = id_str
        .parse::<JobId>()
        .map_err(|e| corrupt(&id_str, format!("invalid id: {e}")))?;

    let data = Data::from_json(&get_str("serialized_data")?)
        .map_err(|e| corrupt(&id_str, format!("invalid serialized_data: {e}")))?;

    let priority = i32::try_from(get_int("priority")?)
        .map_err(|_| corrupt(&id_str, "priority out of range"))?;
    let run_attempt = u32::try_from(get_int("run_attempt")?)
        .map_err(|_| corrupt(&id_str, "run_attempt out of range"))?;
    let max_attempts = u32::try_from(get_int("max_attempts")?)
        .map_err(|_| corrupt(&id_str, "max_attempts out of range"))?;

    let depends_on = serde_json::from_str(&get_str("depends_on")?)
        .map_err(|e| corrupt(&id_str, format!("invalid depends_on: {e}")))?;

    Ok(JobSpec {
        id,
        factory_key: get_str("factory_key")?,
        data,
        priority,
        created_at: parse_ts(&id_str, "created_at", &get_str("created_at")?)?,
        run_attempt,
        max_attempts,
        next_run_at: parse_ts(&id_str, "next_run_at", &get_str("next_run_at")?)?,
        depends_on,
    })
}

/// The parts of an undecodable row recovery needs. `None` if even the id is unreadable.
fn unreadable_record(row: &SqliteRow, err: &JobStoreError) -> Option<UnreadableRecord> {
    let id = row.try_get::<String, _>("id").ok()?.parse::<JobId>().ok()?;
    let reason = match err {
        JobStoreError::Corrupt { reason, .. } => reason.clone(),
        other => other.to_string(),
    };
    Some(UnreadableRecord {
        id,
        factory_key: row.try_get::<String, _>("factory_key").unwrap_or_default(),
        reason,
    })
}

/// Whatever columns of a row still read, as a JSON object.
fn raw_record(row: &SqliteRow) -> String {
    let mut raw = serde_json::Map::new();
    for column in ["id", "factory_key", "serialized_data", "created_at", "next_run_at", "depends_on"] {
        if let Ok(value) = row.try_get::<String, _>(column) {
            raw.insert(column.to_string(), value.into());
        }
    }
    for column in ["priority", "run_attempt", "max_attempts"] {
        if let Ok(value) = row.try_get::<i64, _>(column) {
            raw.insert(column.to_string(), value.into());
        }
    }
    serde_json::Value::Object(raw).to_string()
}

fn row_to_dead_letter(row: SqliteRow) -> Result<DeadLetter, JobStoreError> {
    let id: String = row
        .try_get("id")
        .map_err(|e| map_sqlx_error("decode", e))?;
    let factory_key: String = row
        .try_get("factory_key")
        .map_err(|e| map_sqlx_error("decode", e))?;
    let record: String = row
        .try_get("record")
        .map_err(|e| map_sqlx_error("decode", e))?;
    let reason: String = row
        .try_get("reason")
        .map_err(|e| map_sqlx_error("decode", e))?;
    let at: String = row
        .try_get("dead_lettered_at")
        .map_err(|e| map_sqlx_error("decode", e))?;

    let job_id = id
        .parse::<JobId>()
        .map_err(|e| corrupt(&id, format!("invalid id: {e}")))?;
    // Raw rows of unreadable records do not parse as a spec.
    let spec = serde_json::from_str::<JobSpec>(&record).ok();

    Ok(DeadLetter {
        id: job_id,
        factory_key,
        spec,
        reason,
        dead_lettered_at: parse_ts(&id, "dead_lettered_at", &at)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::unavailable(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::unavailable(format!("connection pool closed in {operation}"))
        }
        other => JobStoreError::unavailable(format!("{operation} failed: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, SubsecRound};
    use std::path::PathBuf;

    /// Database file removed (with its WAL side files) on drop.
    struct TempDb(PathBuf);

    impl TempDb {
        fn new() -> Self {
            Self(std::env::temp_dir().join(format!("courier-jobs-{}.db", uuid::Uuid::now_v7())))
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let mut path = self.0.clone().into_os_string();
                path.push(suffix);
                let _ = std::fs::remove_file(path);
            }
        }
    }

    fn spec(key: &str) -> JobSpec {
        let now = Utc::now().trunc_subsecs(6);
        let mut spec = JobSpec::new(
            key,
            Data::builder()
                .put_string("thread_id", "t-7")
                .put_bytes("digest", vec![1, 2, 3])
                .build(),
            4,
        );
        // Stored timestamps carry microsecond precision.
        spec.created_at = now;
        spec.next_run_at = now;
        spec
    }

    #[test]
    fn insert_and_get_round_trip() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let dep = JobId::new();
        let job = spec("attachment_upload").with_priority(3).depending_on([dep]);

        store.insert(&job).unwrap();
        assert_eq!(store.get(job.id).unwrap(), Some(job.clone()));
        assert_eq!(store.insert(&job), Err(JobStoreError::AlreadyExists(job.id)));
    }

    #[test]
    fn insert_all_rolls_back_on_conflict() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let existing = spec("a");
        store.insert(&existing).unwrap();

        let fresh = spec("b");
        let err = store.insert_all(&[fresh.clone(), existing.clone()]).unwrap_err();

        assert_eq!(err, JobStoreError::AlreadyExists(existing.id));
        assert!(store.get(fresh.id).unwrap().is_none());
    }

    #[test]
    fn records_survive_reopen() {
        let db = TempDb::new();
        let t0 = Utc::now().trunc_subsecs(6);
        let first = spec("send_message").with_created_at(t0);
        let second = spec("send_message").with_created_at(t0 + Duration::milliseconds(1));
        let urgent = spec("send_message")
            .with_priority(9)
            .with_created_at(t0 + Duration::milliseconds(2));

        {
            let store = SqliteJobStore::open(&db.0).unwrap();
            store.insert(&second).unwrap();
            store.insert(&first).unwrap();
            store.insert(&urgent).unwrap();
            store
                .update_run_state(first.id, 2, t0 + Duration::seconds(5))
                .unwrap();
        }

        let store = SqliteJobStore::open(&db.0).unwrap();
        let pending = store.load_all_pending().unwrap().specs;
        let ids: Vec<_> = pending.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![urgent.id, first.id, second.id]);

        let restored = &pending[1];
        assert_eq!(restored.run_attempt, 2);
        assert_eq!(restored.next_run_at, t0 + Duration::seconds(5));
        assert_eq!(restored.data, first.data);
    }

    #[test]
    fn deleted_records_stay_deleted_after_reopen() {
        let db = TempDb::new();
        let job = spec("send_message");

        {
            let store = SqliteJobStore::open(&db.0).unwrap();
            store.insert(&job).unwrap();
            store.delete(job.id).unwrap();
            store.delete(job.id).unwrap();
        }

        let store = SqliteJobStore::open(&db.0).unwrap();
        assert!(store.load_all_pending().unwrap().is_empty());
    }

    #[test]
    fn dead_letters_hold_the_full_record() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let job = spec("upload_v1");
        store.insert(&job).unwrap();

        store.dead_letter(job.id, "no factory registered").unwrap();
        store.dead_letter(JobId::new(), "absent ids are ignored").unwrap();

        assert!(store.get(job.id).unwrap().is_none());
        let dls = store.list_dead_letters().unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].factory_key, "upload_v1");
        assert_eq!(dls[0].spec.as_ref(), Some(&job));
        assert_eq!(dls[0].reason, "no factory registered");

        store.purge_dead_letter(job.id).unwrap();
        assert!(store.list_dead_letters().unwrap().is_empty());
    }

    #[test]
    fn undecodable_rows_are_reported_and_can_be_dead_lettered() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let broken = spec("attachment_upload");
        let fine = spec("send_message");
        store.insert(&broken).unwrap();
        store.insert(&fine).unwrap();

        store
            .runtime
            .block_on(
                sqlx::query("UPDATE job_spec SET serialized_data = 'not json' WHERE id = ?1")
                    .bind(broken.id.to_string())
                    .execute(&store.pool),
            )
            .unwrap();

        let snapshot = store.load_all_pending().unwrap();
        assert_eq!(snapshot.specs, vec![fine.clone()]);
        assert_eq!(snapshot.unreadable.len(), 1);
        assert_eq!(snapshot.unreadable[0].id, broken.id);
        assert_eq!(snapshot.unreadable[0].factory_key, "attachment_upload");
        assert!(snapshot.unreadable[0].reason.contains("serialized_data"));

        store.dead_letter(broken.id, "undecodable").unwrap();
        assert_eq!(store.load_all_pending().unwrap().len(), 1);

        let dls = store.list_dead_letters().unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].id, broken.id);
        assert_eq!(dls[0].factory_key, "attachment_upload");
        assert_eq!(dls[0].spec, None);
    }
}
