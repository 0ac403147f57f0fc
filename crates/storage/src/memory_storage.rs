//! In-process storage backend.
//!
//! Keeps every record in a single map behind a `tokio::sync::Mutex`, so each
//! trait call is atomic with respect to every other. Used by tests and by
//! `database.url = "memory"`.

use std::collections::HashMap;

use async_trait::async_trait;
use smartq_core::{Expected, Job, JobFilter, JobId, JobLogEntry, JobStatus, JobUpdate, Time};
use tokio::sync::Mutex;

use super::trait_::{candidate_order, InsertOutcome, Result, Storage};

#[derive(Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    /// Insertion order, tie-breaker for equal creation times
    sequence: Vec<JobId>,
    idempotency: HashMap<String, JobId>,
    logs: HashMap<JobId, Vec<JobLogEntry>>,
}

impl Tables {
    fn ordered(&self) -> impl Iterator<Item = &Job> {
        self.sequence.iter().filter_map(|id| self.jobs.get(id))
    }
}

/// In-memory storage implementation.
#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn insert_job(&self, job: &Job) -> Result<InsertOutcome> {
        let mut tables = self.tables.lock().await;

        if let Some(key) = &job.idempotency_key {
            if let Some(existing) = tables.idempotency.get(key).and_then(|id| tables.jobs.get(id)) {
                return Ok(InsertOutcome::Existing(existing.clone()));
            }
            tables.idempotency.insert(key.clone(), job.id);
        }

        tables.sequence.push(job.id);
        tables.jobs.insert(job.id, job.clone());
        Ok(InsertOutcome::Inserted(job.clone()))
    }

    async fn load_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.tables.lock().await.jobs.get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .idempotency
            .get(key)
            .and_then(|id| tables.jobs.get(id))
            .cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let tables = self.tables.lock().await;
        let mut jobs: Vec<Job> = tables.ordered().filter(|j| filter.matches(j)).cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn list_pending(&self, now: Time, limit: usize) -> Result<Vec<Job>> {
        let tables = self.tables.lock().await;
        let mut pending: Vec<Job> = tables
            .ordered()
            .filter(|j| j.status == JobStatus::Pending && j.is_due(now))
            .cloned()
            .collect();
        // Stable sort keeps insertion order within equal keys
        pending.sort_by(candidate_order);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let tables = self.tables.lock().await;
        Ok(tables.ordered().filter(|j| j.status == status).cloned().collect())
    }

    async fn dependency_states(&self, id: JobId) -> Result<Vec<(JobId, Option<JobStatus>)>> {
        let tables = self.tables.lock().await;
        let Some(job) = tables.jobs.get(&id) else {
            return Ok(Vec::new());
        };
        Ok(job
            .depends_on
            .iter()
            .map(|dep| (*dep, tables.jobs.get(dep).map(|d| d.status)))
            .collect())
    }

    async fn transition(&self, id: JobId, expected: Expected, update: &JobUpdate) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.jobs.get_mut(&id) {
            Some(job) if expected.matches(job) => {
                job.apply(update);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_log(&self, id: JobId, message: &str, timestamp: Time) -> Result<()> {
        self.tables
            .lock()
            .await
            .logs
            .entry(id)
            .or_default()
            .push(JobLogEntry {
                timestamp,
                message: message.to_string(),
            });
        Ok(())
    }

    async fn list_logs(&self, id: JobId) -> Result<Vec<JobLogEntry>> {
        Ok(self.tables.lock().await.logs.get(&id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use smartq_core::{JobSpec, Priority};

    fn job(job_type: &str, priority: Priority) -> Job {
        Job::from_spec(JobSpec::new(job_type).with_priority(priority))
    }

    #[tokio::test]
    async fn test_pending_order_priority_then_age() {
        let storage = MemoryStorage::new();
        let low = job("low", Priority::Low);
        let first_normal = job("n1", Priority::Normal);
        let critical = job("crit", Priority::Critical);
        let second_normal = job("n2", Priority::Normal);
        for j in [&low, &first_normal, &critical, &second_normal] {
            storage.insert_job(j).await.unwrap();
        }

        let pending = storage.list_pending(Utc::now(), 10).await.unwrap();
        let order: Vec<_> = pending.iter().map(|j| j.job_type.as_str()).collect();
        assert_eq!(order, vec!["crit", "n1", "n2", "low"]);

        let short = storage.list_pending(Utc::now(), 2).await.unwrap();
        assert_eq!(short.len(), 2);
    }

    #[tokio::test]
    async fn test_pending_skips_future_run_at() {
        let storage = MemoryStorage::new();
        let mut delayed = job("delayed", Priority::Critical);
        delayed.run_at = Some(Utc::now() + Duration::seconds(60));
        storage.insert_job(&delayed).await.unwrap();

        assert!(storage.list_pending(Utc::now(), 10).await.unwrap().is_empty());
        let later = Utc::now() + Duration::seconds(61);
        assert_eq!(storage.list_pending(later, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_idempotency_key_returns_existing() {
        let storage = MemoryStorage::new();
        let mut first = job("export", Priority::Normal);
        first.idempotency_key = Some("k-1".into());
        let mut second = job("export", Priority::High);
        second.idempotency_key = Some("k-1".into());

        assert!(storage.insert_job(&first).await.unwrap().is_new());
        let outcome = storage.insert_job(&second).await.unwrap();
        assert!(!outcome.is_new());
        assert_eq!(outcome.job().id, first.id);
        assert_eq!(storage.list_jobs(&JobFilter::default()).await.unwrap().len(), 1);
        assert_eq!(
            storage.find_by_idempotency_key("k-1").await.unwrap().map(|j| j.id),
            Some(first.id)
        );
    }

    #[tokio::test]
    async fn test_transition_is_conditional() {
        let storage = MemoryStorage::new();
        let j = job("t", Priority::Normal);
        storage.insert_job(&j).await.unwrap();

        let update = JobUpdate::running(Utc::now(), 1);
        assert!(storage.transition(j.id, JobStatus::Pending.into(), &update).await.unwrap());
        assert!(!storage.transition(j.id, JobStatus::Pending.into(), &update).await.unwrap());
        assert!(!storage.transition(JobId::new(), JobStatus::Pending.into(), &update).await.unwrap());

        let stored = storage.load_job(j.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.current_attempt, 1);
    }

    #[tokio::test]
    async fn test_transition_rejects_stale_attempt() {
        let storage = MemoryStorage::new();
        let j = job("t", Priority::Normal);
        storage.insert_job(&j).await.unwrap();

        let start = JobUpdate::running(Utc::now(), 1);
        assert!(storage.transition(j.id, Expected::at_attempt(JobStatus::Pending, 0), &start).await.unwrap());
        let back = JobUpdate::to(JobStatus::Pending);
        assert!(storage.transition(j.id, Expected::at_attempt(JobStatus::Running, 1), &back).await.unwrap());

        // Pending again, but a copy read at attempt 0 must not claim it
        assert!(!storage.transition(j.id, Expected::at_attempt(JobStatus::Pending, 0), &start).await.unwrap());
        let stored = storage.load_job(j.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.current_attempt, 1);
    }

    #[tokio::test]
    async fn test_dependency_states_reports_missing() {
        let storage = MemoryStorage::new();
        let parent = job("parent", Priority::Normal);
        storage.insert_job(&parent).await.unwrap();
        let ghost = JobId::new();
        let child = Job::from_spec(JobSpec::new("child").depends_on(parent.id).depends_on(ghost));
        storage.insert_job(&child).await.unwrap();

        let states = storage.dependency_states(child.id).await.unwrap();
        assert_eq!(states, vec![(parent.id, Some(JobStatus::Pending)), (ghost, None)]);
    }

    #[tokio::test]
    async fn test_logs_keep_append_order() {
        let storage = MemoryStorage::new();
        let id = JobId::new();
        storage.append_log(id, "started", Utc::now()).await.unwrap();
        storage.append_log(id, "finished", Utc::now()).await.unwrap();
        let logs = storage.list_logs(id).await.unwrap();
        let messages: Vec<_> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["started", "finished"]);
        assert!(storage.list_logs(JobId::new()).await.unwrap().is_empty());
    }
}
