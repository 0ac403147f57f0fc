//! Dependency resolution for jobs.

use smartq_core::{Job, JobId, JobStatus};
use smartq_storage::Storage;

use crate::error::Result;

/// Result of dependency resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every dependency succeeded (or there are none)
    Ready,
    /// Still waiting on these jobs
    Waiting(Vec<JobId>),
    /// These dependencies failed, were cancelled or no longer exist
    Unsatisfiable(Vec<JobId>),
}

impl Readiness {
    /// Whether the job may run.
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Resolves job dependencies against the store.
///
/// State is read fresh on every call; nothing is cached between cycles.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    /// Create a new resolver.
    pub fn new() -> Self {
        Self
    }

    /// Check whether a job's dependencies are satisfied.
    pub async fn check(&self, storage: &dyn Storage, job: &Job) -> Result<Readiness> {
        if job.depends_on.is_empty() {
            return Ok(Readiness::Ready);
        }

        let mut waiting = Vec::new();
        let mut dead = Vec::new();
        for (dep, state) in storage.dependency_states(job.id).await? {
            match state {
                Some(JobStatus::Success) => {}
                Some(status) if !status.is_terminal() => waiting.push(dep),
                _ => dead.push(dep),
            }
        }

        Ok(if !dead.is_empty() {
            Readiness::Unsatisfiable(dead)
        } else if !waiting.is_empty() {
            Readiness::Waiting(waiting)
        } else {
            Readiness::Ready
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartq_core::{JobSpec, JobUpdate};
    use smartq_storage::MemoryStorage;

    async fn insert(storage: &MemoryStorage, spec: JobSpec) -> Job {
        let job = Job::from_spec(spec);
        storage.insert_job(&job).await.unwrap();
        job
    }

    async fn set_status(storage: &MemoryStorage, id: JobId, from: JobStatus, to: JobStatus) {
        assert!(storage.transition(id, from.into(), &JobUpdate::to(to)).await.unwrap());
    }

    #[tokio::test]
    async fn test_no_dependencies_is_ready() {
        let storage = MemoryStorage::new();
        let job = insert(&storage, JobSpec::new("solo")).await;
        let readiness = DependencyResolver::new().check(&storage, &job).await.unwrap();
        assert!(readiness.is_ready());
    }

    #[tokio::test]
    async fn test_waits_until_dependency_succeeds() {
        let storage = MemoryStorage::new();
        let parent = insert(&storage, JobSpec::new("parent")).await;
        let child = insert(&storage, JobSpec::new("child").depends_on(parent.id)).await;
        let resolver = DependencyResolver::new();

        assert_eq!(
            resolver.check(&storage, &child).await.unwrap(),
            Readiness::Waiting(vec![parent.id])
        );

        set_status(&storage, parent.id, JobStatus::Pending, JobStatus::Running).await;
        assert_eq!(
            resolver.check(&storage, &child).await.unwrap(),
            Readiness::Waiting(vec![parent.id])
        );

        set_status(&storage, parent.id, JobStatus::Running, JobStatus::Success).await;
        assert!(resolver.check(&storage, &child).await.unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_failed_dependency_is_unsatisfiable() {
        let storage = MemoryStorage::new();
        let good = insert(&storage, JobSpec::new("good")).await;
        let bad = insert(&storage, JobSpec::new("bad")).await;
        let child = insert(&storage, JobSpec::new("child").depends_on(good.id).depends_on(bad.id)).await;

        set_status(&storage, bad.id, JobStatus::Pending, JobStatus::Cancelled).await;
        assert_eq!(
            DependencyResolver::new().check(&storage, &child).await.unwrap(),
            Readiness::Unsatisfiable(vec![bad.id])
        );
    }
}
