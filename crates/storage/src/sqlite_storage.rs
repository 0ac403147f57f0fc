//! SQLite storage backend.
//!
//! Each job is kept as a JSON document in `jobs.data`, next to the columns
//! the scheduler filters and orders on. Dependency edges live in
//! `job_dependencies` and the execution trace in `job_logs`. State changes go
//! through `UPDATE ... WHERE id = ? AND status = ?` (plus the attempt counter
//! when the caller pins one), so two engines sharing a database file can
//! never both admit the same job.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::SecondsFormat;
use smartq_core::{Expected, Job, JobFilter, JobId, JobLogEntry, JobStatus, JobUpdate, Time};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use super::trait_::{InsertOutcome, Result, Storage, StorageError};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        run_at TEXT,
        current_attempt INTEGER NOT NULL DEFAULT 0,
        idempotency_key TEXT UNIQUE,
        data TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS job_dependencies (
        job_id TEXT NOT NULL,
        depends_on_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        PRIMARY KEY (job_id, depends_on_id)
    )",
    "CREATE TABLE IF NOT EXISTS job_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        message TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_jobs_selection ON jobs(status, priority DESC, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs(job_id)",
];

/// Fixed-width UTC timestamps so that text comparison follows time order.
fn ts(at: Time) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<Time> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| StorageError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
    /// Database connection pool
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if needed) the database at `url`, e.g. `sqlite://smartq.db`.
    pub async fn new(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::with_pool(pool).await
    }

    /// Create an in-memory SQLite storage for testing.
    ///
    /// A single connection is used since every `:memory:` connection is its
    /// own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("SQLite schema ready");
        Ok(())
    }

    fn decode(row: &SqliteRow) -> Result<Job> {
        let data: String = row.try_get("data")?;
        Ok(serde_json::from_str(&data)?)
    }

    fn decode_all(rows: &[SqliteRow]) -> Result<Vec<Job>> {
        rows.iter().map(Self::decode).collect()
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn insert_job(&self, job: &Job) -> Result<InsertOutcome> {
        let data = serde_json::to_string(job)?;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO jobs (id, status, priority, created_at, run_at, current_attempt, idempotency_key, data)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(idempotency_key) DO NOTHING",
        )
        .bind(job.id.to_string())
        .bind(job.status.as_str())
        .bind(job.priority.rank())
        .bind(ts(job.created_at))
        .bind(job.run_at.map(ts))
        .bind(i64::from(job.current_attempt))
        .bind(job.idempotency_key.as_deref())
        .bind(&data)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            let key = job.idempotency_key.as_deref().unwrap_or_default();
            let row = sqlx::query("SELECT data FROM jobs WHERE idempotency_key = ?")
                .bind(key)
                .fetch_one(&mut *tx)
                .await?;
            tx.rollback().await?;
            return Ok(InsertOutcome::Existing(Self::decode(&row)?));
        }

        for (position, dep) in job.depends_on.iter().enumerate() {
            sqlx::query(
                "INSERT OR IGNORE INTO job_dependencies (job_id, depends_on_id, position)
                 VALUES (?, ?, ?)",
            )
            .bind(job.id.to_string())
            .bind(dep.to_string())
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(InsertOutcome::Inserted(job.clone()))
    }

    async fn load_job(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT data FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT data FROM jobs WHERE idempotency_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT data FROM jobs");
        if let Some(statuses) = &filter.statuses {
            if statuses.is_empty() {
                return Ok(Vec::new());
            }
            query.push(" WHERE status IN (");
            let mut separated = query.separated(", ");
            for status in statuses {
                separated.push_bind(status.as_str());
            }
            separated.push_unseparated(")");
        }
        query.push(" ORDER BY created_at ASC, rowid ASC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        Self::decode_all(&rows)
    }

    async fn list_pending(&self, now: Time, limit: usize) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT data FROM jobs
             WHERE status = ? AND (run_at IS NULL OR run_at <= ?)
             ORDER BY priority DESC, created_at ASC, rowid ASC
             LIMIT ?",
        )
        .bind(JobStatus::Pending.as_str())
        .bind(ts(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Self::decode_all(&rows)
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT data FROM jobs WHERE status = ? ORDER BY rowid ASC")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        Self::decode_all(&rows)
    }

    async fn dependency_states(&self, id: JobId) -> Result<Vec<(JobId, Option<JobStatus>)>> {
        let rows = sqlx::query(
            "SELECT d.depends_on_id AS dep, j.status AS status
             FROM job_dependencies d
             LEFT JOIN jobs j ON j.id = d.depends_on_id
             WHERE d.job_id = ?
             ORDER BY d.position ASC",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let dep: String = row.try_get("dep")?;
                let status: Option<String> = row.try_get("status")?;
                let dep = dep
                    .parse::<JobId>()
                    .map_err(|e| StorageError::Corrupt(format!("dependency id {dep:?}: {e}")))?;
                let status = status
                    .map(|s| s.parse::<JobStatus>())
                    .transpose()
                    .map_err(|e| StorageError::Corrupt(e.to_string()))?;
                Ok((dep, status))
            })
            .collect()
    }

    async fn transition(&self, id: JobId, expected: Expected, update: &JobUpdate) -> Result<bool> {
        let Some(mut job) = self.load_job(id).await? else {
            return Ok(false);
        };
        if !expected.matches(&job) {
            return Ok(false);
        }
        let attempt = expected.attempt.map(i64::from);
        job.apply(update);
        let data = serde_json::to_string(&job)?;

        // The status and attempt guards make the write a compare-and-set
        let affected = sqlx::query(
            "UPDATE jobs SET status = ?, run_at = ?, current_attempt = ?, data = ?
             WHERE id = ? AND status = ? AND (? IS NULL OR current_attempt = ?)",
        )
        .bind(job.status.as_str())
        .bind(job.run_at.map(ts))
        .bind(i64::from(job.current_attempt))
        .bind(data)
        .bind(id.to_string())
        .bind(expected.status.as_str())
        .bind(attempt)
        .bind(attempt)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected == 1)
    }

    async fn append_log(&self, id: JobId, message: &str, timestamp: Time) -> Result<()> {
        sqlx::query("INSERT INTO job_logs (job_id, timestamp, message) VALUES (?, ?, ?)")
            .bind(id.to_string())
            .bind(ts(timestamp))
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_logs(&self, id: JobId) -> Result<Vec<JobLogEntry>> {
        let rows = sqlx::query("SELECT timestamp, message FROM job_logs WHERE job_id = ? ORDER BY id ASC")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let timestamp: String = row.try_get("timestamp")?;
                Ok(JobLogEntry {
                    timestamp: parse_ts(&timestamp)?,
                    message: row.try_get("message")?,
                })
            })
            .collect()
    }
}
