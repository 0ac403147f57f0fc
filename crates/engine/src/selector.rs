//! Candidate selection strategies.

use std::sync::Arc;

use async_trait::async_trait;
use smartq_core::{Job, JobId, Time};
use smartq_storage::Storage;
use tracing::debug;

use crate::dependency::{DependencyResolver, Readiness};
use crate::error::Result;
use crate::ledger::{Reservation, ResourceLedger};

/// A job picked for execution together with the resources held for it.
#[derive(Debug)]
pub struct Admission {
    /// The selected job, as read from the store
    pub job: Job,
    /// Capacity reserved on its behalf
    pub reservation: Reservation,
}

/// Outcome of one selection pass.
#[derive(Debug, Default)]
pub struct Selection {
    /// The admitted job, if any candidate qualified
    pub admission: Option<Admission>,
    /// Candidates seen during the scan whose dependencies can never succeed
    pub unsatisfiable: Vec<(JobId, Vec<JobId>)>,
}

/// Strategy for selecting the next job to execute.
///
/// Implementations must reserve capacity as part of the scan: a returned
/// [`Admission`] already holds its resources.
#[async_trait]
pub trait CandidateSelector: Send + Sync {
    /// Select the next runnable job at `now`.
    async fn select_next(
        &self,
        storage: &dyn Storage,
        ledger: &Arc<ResourceLedger>,
        now: Time,
    ) -> Result<Selection>;
}

/// Priority-then-age selector over a bounded short list.
#[derive(Debug, Clone)]
pub struct PrioritySelector {
    /// How many pending jobs are considered per pass
    scan_limit: usize,
    resolver: DependencyResolver,
}

impl PrioritySelector {
    /// Create a selector scanning at most `scan_limit` candidates.
    pub fn new(scan_limit: usize) -> Self {
        Self {
            scan_limit,
            resolver: DependencyResolver::new(),
        }
    }
}

impl Default for PrioritySelector {
    fn default() -> Self {
        Self::new(10)
    }
}

#[async_trait]
impl CandidateSelector for PrioritySelector {
    async fn select_next(
        &self,
        storage: &dyn Storage,
        ledger: &Arc<ResourceLedger>,
        now: Time,
    ) -> Result<Selection> {
        let candidates = storage.list_pending(now, self.scan_limit).await?;
        let mut selection = Selection::default();

        for job in candidates {
            match self.resolver.check(storage, &job).await? {
                Readiness::Ready => {}
                Readiness::Waiting(deps) => {
                    debug!(job_id = %job.id, ?deps, "Waiting on dependencies");
                    continue;
                }
                Readiness::Unsatisfiable(deps) => {
                    debug!(job_id = %job.id, ?deps, "Dependencies can no longer succeed");
                    selection.unsatisfiable.push((job.id, deps));
                    continue;
                }
            }

            let Some(reservation) = ledger.reserve(&job.resources) else {
                debug!(job_id = %job.id, "Insufficient resources, deferring");
                continue;
            };

            debug!(job_id = %job.id, priority = %job.priority, "Selected job");
            selection.admission = Some(Admission { job, reservation });
            break;
        }

        Ok(selection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartq_core::{JobSpec, Priority, ResourceRequirements, CPU_UNITS, MEMORY_MB};
    use smartq_storage::MemoryStorage;
    use std::collections::BTreeMap;

    fn ledger(cpu: u64, mem: u64) -> Arc<ResourceLedger> {
        Arc::new(ResourceLedger::new(BTreeMap::from([
            (CPU_UNITS.to_string(), cpu),
            (MEMORY_MB.to_string(), mem),
        ])))
    }

    async fn insert(storage: &MemoryStorage, spec: JobSpec) -> Job {
        let job = Job::from_spec(spec);
        storage.insert_job(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_selects_highest_priority_and_reserves() {
        let storage = MemoryStorage::new();
        let ledger = ledger(8, 4096);
        insert(&storage, JobSpec::new("low").with_priority(Priority::Low)).await;
        let critical = insert(
            &storage,
            JobSpec::new("critical")
                .with_priority(Priority::Critical)
                .with_resources(ResourceRequirements::cpu_mem(2, 256)),
        )
        .await;

        let selection = PrioritySelector::default()
            .select_next(&storage, &ledger, chrono::Utc::now())
            .await
            .unwrap();
        let admission = selection.admission.unwrap();
        assert_eq!(admission.job.id, critical.id);
        assert_eq!(ledger.used(CPU_UNITS), 2);

        drop(admission);
        assert_eq!(ledger.used(CPU_UNITS), 0);
    }

    #[tokio::test]
    async fn test_skips_jobs_that_do_not_fit() {
        let storage = MemoryStorage::new();
        let ledger = ledger(8, 4096);
        insert(
            &storage,
            JobSpec::new("big")
                .with_priority(Priority::High)
                .with_resources(ResourceRequirements::cpu_mem(8, 4096)),
        )
        .await;
        let small = insert(&storage, JobSpec::new("small").with_resources(ResourceRequirements::cpu_mem(1, 64))).await;

        assert!(ledger.try_allocate(&ResourceRequirements::cpu_mem(4, 0)));
        let selection = PrioritySelector::default()
            .select_next(&storage, &ledger, chrono::Utc::now())
            .await
            .unwrap();
        assert_eq!(selection.admission.map(|a| a.job.id), Some(small.id));
    }

    #[tokio::test]
    async fn test_short_list_bounds_the_scan() {
        let storage = MemoryStorage::new();
        let ledger = ledger(8, 4096);
        let parent = insert(&storage, JobSpec::new("parent").with_priority(Priority::Low)).await;
        insert(
            &storage,
            JobSpec::new("blocked")
                .with_priority(Priority::Critical)
                .depends_on(parent.id),
        )
        .await;

        let narrow = PrioritySelector::new(1)
            .select_next(&storage, &ledger, chrono::Utc::now())
            .await
            .unwrap();
        assert!(narrow.admission.is_none());
        assert_eq!(ledger.used(CPU_UNITS), 0);

        let wide = PrioritySelector::new(10)
            .select_next(&storage, &ledger, chrono::Utc::now())
            .await
            .unwrap();
        assert_eq!(wide.admission.map(|a| a.job.id), Some(parent.id));
    }
}
