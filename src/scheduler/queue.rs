//! The in-memory job table: creation, ack/nack, completion, cancellation and pruning.
//!
//! Every mutation goes through [`put_job`], which keeps the QUEUED indexes in step with the job's
//! state and marks the watch topics the change affects.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{Result, WaystationError};
use crate::ops::generate_id;
use crate::scheduler::job::{Job, JobError, JobState, JobTarget};
use crate::scheduler::scope;
use crate::state::memdb::{Topic, WriteTxn};
use crate::state::timeindex;
use crate::state::StateStore;

/// Store `job`, replacing `previous` (the row as it was read in this transaction).
pub(crate) fn put_job(txn: &mut WriteTxn<'_>, previous: Option<&Job>, job: Job) {
    let was_queued = previous.is_some_and(|p| p.state == JobState::Queued);
    let is_queued = job.state == JobState::Queued;

    if let Some(previous) = previous.filter(|_| was_queued) {
        unindex_queued(txn, previous);
    }
    if is_queued {
        let key = timeindex::ascending(job.queue_time);
        match &job.target {
            JobTarget::Any => {
                Arc::make_mut(&mut txn.tables.queued_any).insert((key, job.id.clone()));
            }
            JobTarget::Runner(runner_id) => {
                Arc::make_mut(&mut txn.tables.queued_targeted).insert((
                    runner_id.clone(),
                    key,
                    job.id.clone(),
                ));
            }
        }
    }
    if was_queued || is_queued {
        txn.touch(Topic::QueuedJobs);
    }

    Arc::make_mut(&mut txn.tables.jobs).insert(job.id.clone(), job);
    txn.touch(Topic::Jobs);
}

fn unindex_queued(txn: &mut WriteTxn<'_>, job: &Job) {
    let key = timeindex::ascending(job.queue_time);
    match &job.target {
        JobTarget::Any => {
            Arc::make_mut(&mut txn.tables.queued_any).remove(&(key, job.id.clone()));
        }
        JobTarget::Runner(runner_id) => {
            Arc::make_mut(&mut txn.tables.queued_targeted).remove(&(
                runner_id.clone(),
                key,
                job.id.clone(),
            ));
        }
    }
}

fn lookup(txn: &WriteTxn<'_>, id: &str) -> Result<Job> {
    txn.tables
        .jobs
        .get(id)
        .cloned()
        .ok_or_else(|| WaystationError::not_found(format!("job {:?}", id)))
}

/// Finish `job` in ERROR because it was cancelled.
fn fail_cancelled(job: &mut Job, now: DateTime<Utc>, message: &str) -> Result<()> {
    job.transition(JobState::Error)?;
    job.cancel_time.get_or_insert(now);
    job.complete_time = Some(now);
    job.error = Some(JobError::new(message));
    Ok(())
}

impl StateStore {
    /// Queue a new job. The caller must leave `id` empty; the stored job is returned.
    pub fn job_create(&self, mut job: Job) -> Result<Job> {
        if !job.id.is_empty() {
            return Err(WaystationError::precondition(
                "job id must not be set, it is assigned on queue",
            ));
        }
        if job.application.project.is_empty() || job.application.application.is_empty() {
            return Err(WaystationError::precondition("job application must be set"));
        }
        if let JobTarget::Runner(runner_id) = &job.target {
            if runner_id.is_empty() {
                return Err(WaystationError::precondition("job target runner id is empty"));
            }
        }

        job.id = generate_id();
        job.state = JobState::Queued;
        job.queue_time = Utc::now();
        job.assign_time = None;
        job.ack_time = None;
        job.complete_time = None;
        job.cancel_time = None;
        job.assigned_runner = None;
        job.error = None;

        let mut txn = self.mem.write();
        put_job(&mut txn, None, job.clone());
        txn.commit();

        tracing::info!(
            job_id = %job.id,
            application = %job.application,
            operation = job.operation.kind(),
            "Job queued"
        );
        Ok(job)
    }

    pub fn job_get(&self, id: &str) -> Result<Job> {
        self.mem
            .snapshot()
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| WaystationError::not_found(format!("job {:?}", id)))
    }

    /// Every job, oldest queue time first.
    pub fn job_list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.mem.snapshot().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.queue_time.cmp(&b.queue_time).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Accept (WAITING → RUNNING) or reject an assignment.
    ///
    /// A rejected job goes back to QUEUED, unless its cancellation was requested while it was
    /// waiting, in which case it finishes in ERROR.
    pub fn job_ack(&self, id: &str, accept: bool) -> Result<Job> {
        let mut txn = self.mem.write();
        let previous = lookup(&txn, id)?;
        let mut job = previous.clone();
        let now = Utc::now();

        if accept {
            job.transition(JobState::Running)?;
            job.ack_time = Some(now);
        } else if job.cancel_time.is_some() {
            fail_cancelled(&mut job, now, "job cancelled")?;
            scope::release(&mut txn, &job);
        } else {
            job.transition(JobState::Queued)?;
            scope::release(&mut txn, &job);
            job.assign_time = None;
            job.assigned_runner = None;
        }

        put_job(&mut txn, Some(&previous), job.clone());
        txn.commit();

        tracing::info!(job_id = %id, accept, state = %job.state, "Job acknowledged");
        Ok(job)
    }

    /// Finish a RUNNING job: `Ok` completes it in SUCCESS, `Err` in ERROR with that detail.
    pub fn job_complete(&self, id: &str, outcome: std::result::Result<(), JobError>) -> Result<Job> {
        let mut txn = self.mem.write();
        let previous = lookup(&txn, id)?;
        let mut job = previous.clone();

        match outcome {
            Ok(()) => job.transition(JobState::Success)?,
            Err(error) => {
                job.transition(JobState::Error)?;
                job.error = Some(error);
            }
        }
        job.complete_time = Some(Utc::now());
        scope::release(&mut txn, &job);

        put_job(&mut txn, Some(&previous), job.clone());
        txn.commit();

        match &job.error {
            Some(error) => tracing::info!(job_id = %id, error = %error, "Job failed"),
            None => tracing::info!(job_id = %id, "Job succeeded"),
        }
        Ok(job)
    }

    /// Request cancellation. Idempotent; a terminal job is returned unchanged.
    ///
    /// A QUEUED job fails immediately. A WAITING or RUNNING job only records `cancel_time`
    /// (its runner is told and may still finish), unless `force` is set, in which case it fails
    /// now and releases its scope.
    pub fn job_cancel(&self, id: &str, force: bool) -> Result<Job> {
        let mut txn = self.mem.write();
        let previous = lookup(&txn, id)?;
        if previous.state.is_terminal() {
            return Ok(previous);
        }
        let mut job = previous.clone();
        let now = Utc::now();

        match job.state {
            JobState::Queued => fail_cancelled(&mut job, now, "job cancelled")?,
            JobState::Waiting | JobState::Running if force => {
                fail_cancelled(&mut job, now, "job force cancelled")?;
                scope::release(&mut txn, &job);
            }
            JobState::Waiting | JobState::Running => {
                if job.cancel_time.is_some() {
                    return Ok(job);
                }
                job.cancel_time = Some(now);
            }
            JobState::Success | JobState::Error => return Ok(job),
        }

        put_job(&mut txn, Some(&previous), job.clone());
        txn.commit();

        tracing::info!(job_id = %id, force, state = %job.state, "Job cancel requested");
        Ok(job)
    }

    /// Record the data source revision the runner resolved for a job.
    pub fn job_update_data_source(&self, id: &str, data_source_ref: &str) -> Result<()> {
        let mut txn = self.mem.write();
        let previous = lookup(&txn, id)?;
        if previous.state.is_terminal() {
            return Err(WaystationError::precondition(format!(
                "job {:?} is {}, cannot record data source",
                id, previous.state
            )));
        }
        let mut job = previous.clone();
        job.data_source_ref = Some(data_source_ref.to_string());
        put_job(&mut txn, Some(&previous), job);
        txn.commit();
        tracing::debug!(job_id = %id, data_source_ref, "Job data source recorded");
        Ok(())
    }

    /// Remove terminal jobs completed before `cutoff`, then the oldest terminal jobs beyond
    /// `max_finished`. Returns the removed ids.
    pub fn job_prune(&self, cutoff: DateTime<Utc>, max_finished: usize) -> Vec<String> {
        let mut txn = self.mem.write();

        let mut finished: Vec<(DateTime<Utc>, String)> = txn
            .tables
            .jobs
            .values()
            .filter(|job| job.state.is_terminal())
            .map(|job| (job.complete_time.unwrap_or(job.queue_time), job.id.clone()))
            .collect();
        finished.sort();

        let expired = finished.iter().take_while(|(time, _)| *time < cutoff).count();
        let over = finished.len().saturating_sub(max_finished);
        let remove = expired.max(over);
        if remove == 0 {
            return Vec::new();
        }

        let removed: Vec<String> = finished.into_iter().take(remove).map(|(_, id)| id).collect();
        let jobs = Arc::make_mut(&mut txn.tables.jobs);
        for id in &removed {
            jobs.remove(id);
        }
        txn.touch(Topic::Jobs);
        txn.commit();

        tracing::info!(removed = removed.len(), "Pruned finished jobs");
        removed
    }
}
