use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, WaystationError};
use crate::scheduler::job::{Job, JobState};
use crate::scheduler::queue::put_job;
use crate::scheduler::scope;
use crate::state::memdb::{Tables, Topic};
use crate::state::StateStore;

/// At most one eligible QUEUED job per class: targeted at `runner_id`, then targeted at any runner.
fn candidates(tables: &Tables, runner_id: &str) -> Vec<Job> {
    let targeted_from = (runner_id.to_string(), [0u8; 8], String::new());
    let targeted = tables
        .queued_targeted
        .range(targeted_from..)
        .take_while(|(target, _, _)| target == runner_id)
        .filter_map(|(_, _, id)| tables.jobs.get(id))
        .find(|job| !scope::is_blocked(tables, job));

    let any = tables
        .queued_any
        .iter()
        .filter_map(|(_, id)| tables.jobs.get(id))
        .find(|job| !scope::is_blocked(tables, job));

    let mut found: Vec<Job> = targeted.into_iter().chain(any).cloned().collect();
    found.sort_by(|a, b| a.queue_time.cmp(&b.queue_time).then_with(|| a.id.cmp(&b.id)));
    found
}

impl StateStore {
    /// Block until a job can be assigned to `runner_id`, then move it to WAITING and return it.
    ///
    /// Fails with [`WaystationError::Cancelled`] once `cancel` fires.
    pub async fn job_assign_for_runner(
        &self,
        cancel: &CancellationToken,
        runner_id: &str,
    ) -> Result<Job> {
        loop {
            // Subscribe first so a commit between the snapshot and the wait still wakes us.
            let mut queued = self.mem.subscribe(Topic::QueuedJobs);
            let mut locks = self.mem.subscribe(Topic::ScopeLocks);
            let snapshot = self.mem.snapshot();

            let found = candidates(&snapshot, runner_id);
            drop(snapshot);
            if found.is_empty() {
                tracing::debug!(runner_id, "No eligible job, waiting");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(WaystationError::Cancelled),
                    _ = queued.changed() => {}
                    _ = locks.changed() => {}
                }
                continue;
            }

            let mut txn = self.mem.write();
            let valid = found.iter().find_map(|candidate| {
                txn.tables
                    .jobs
                    .get(&candidate.id)
                    .filter(|job| job.state == JobState::Queued)
                    .filter(|job| !scope::is_blocked(&txn.tables, job))
                    .cloned()
            });
            let Some(previous) = valid else {
                tracing::debug!(runner_id, "Candidates claimed concurrently, retrying");
                drop(txn);
                continue;
            };

            let mut job = previous.clone();
            job.transition(JobState::Waiting)?;
            job.assign_time = Some(Utc::now());
            job.assigned_runner = Some(runner_id.to_string());
            scope::acquire(&mut txn, &job);
            put_job(&mut txn, Some(&previous), job.clone());
            txn.commit();

            tracing::info!(job_id = %job.id, runner_id, "Job assigned");
            return Ok(job);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ApplicationRef;
    use crate::scheduler::job::{JobOperation, JobTarget};
    use std::time::Duration;

    fn store() -> StateStore {
        StateStore::in_memory().unwrap()
    }

    fn queue(store: &StateStore, app: &str, op: JobOperation, target: JobTarget) -> Job {
        store
            .job_create(Job::new(ApplicationRef::new("p", app), "default", op, target))
            .unwrap()
    }

    #[tokio::test]
    async fn earliest_candidate_wins() {
        let store = store();
        let first = queue(&store, "a", JobOperation::Up, JobTarget::Any);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let _second = queue(&store, "b", JobOperation::Up, JobTarget::Runner("r1".into()));

        let token = CancellationToken::new();
        let job = store.job_assign_for_runner(&token, "r1").await.unwrap();
        assert_eq!(job.id, first.id);
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.assigned_runner.as_deref(), Some("r1"));
        assert!(job.assign_time.is_some());
    }

    #[tokio::test]
    async fn targeted_job_is_invisible_to_other_runners() {
        let store = store();
        queue(&store, "a", JobOperation::Noop, JobTarget::Runner("r1".into()));

        let token = CancellationToken::new();
        let waiting = store.job_assign_for_runner(&token, "r2");
        let result = tokio::time::timeout(Duration::from_millis(100), waiting).await;
        assert!(result.is_err(), "r2 must not receive a job targeted at r1");
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiter() {
        let store = store();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = store.job_assign_for_runner(&token, "r1").await.unwrap_err();
        assert!(matches!(err, WaystationError::Cancelled));
    }

    #[tokio::test]
    async fn locked_scope_does_not_block_parallel_job() {
        let store = store();
        let held = queue(&store, "a", JobOperation::Up, JobTarget::Any);
        let token = CancellationToken::new();
        store.job_assign_for_runner(&token, "r1").await.unwrap();

        let _blocked = queue(&store, "a", JobOperation::Up, JobTarget::Any);
        let parallel = queue(&store, "a", JobOperation::Validate, JobTarget::Any);

        let job = store.job_assign_for_runner(&token, "r2").await.unwrap();
        assert_eq!(job.id, parallel.id);
        assert_ne!(job.id, held.id);
    }
}
