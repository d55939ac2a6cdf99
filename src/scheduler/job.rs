use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::{Result, WaystationError};
use crate::ops::ApplicationRef;
use crate::scheduler::scope::ScopeKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Waiting,
    Running,
    Success,
    Error,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Error)
    }

    /// Whether a job in this state holds its scope lock (if it takes one at all).
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "QUEUED"),
            JobState::Waiting => write!(f, "WAITING"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Success => write!(f, "SUCCESS"),
            JobState::Error => write!(f, "ERROR"),
        }
    }
}

/// Which runners may pick up a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTarget {
    Any,
    Runner(String),
}

/// The lifecycle action a job performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOperation {
    Noop,
    Validate,
    Auth,
    Build { disable_push: bool },
    Push { build_id: String },
    Deploy { artifact_id: String },
    Release { deployment_id: String, prune: bool },
    Destroy { deployment_id: String },
    StatusReport { target_id: String },
    Up,
}

impl JobOperation {
    /// Parallelizable operations never take a scope lock.
    pub fn is_parallelizable(&self) -> bool {
        match self {
            JobOperation::Noop | JobOperation::Validate | JobOperation::Auth => true,
            JobOperation::Build { .. }
            | JobOperation::Push { .. }
            | JobOperation::Deploy { .. }
            | JobOperation::Release { .. }
            | JobOperation::Destroy { .. }
            | JobOperation::StatusReport { .. }
            | JobOperation::Up => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobOperation::Noop => "noop",
            JobOperation::Validate => "validate",
            JobOperation::Auth => "auth",
            JobOperation::Build { .. } => "build",
            JobOperation::Push { .. } => "push",
            JobOperation::Deploy { .. } => "deploy",
            JobOperation::Release { .. } => "release",
            JobOperation::Destroy { .. } => "destroy",
            JobOperation::StatusReport { .. } => "status_report",
            JobOperation::Up => "up",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub message: String,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub application: ApplicationRef,
    pub workspace: String,
    pub operation: JobOperation,
    pub target: JobTarget,
    pub labels: BTreeMap<String, String>,
    pub state: JobState,
    pub queue_time: DateTime<Utc>,
    pub assign_time: Option<DateTime<Utc>>,
    pub ack_time: Option<DateTime<Utc>>,
    pub complete_time: Option<DateTime<Utc>>,
    pub cancel_time: Option<DateTime<Utc>>,
    pub assigned_runner: Option<String>,
    pub error: Option<JobError>,
    pub data_source_ref: Option<String>,
}

impl Job {
    /// A job ready to be queued. The id is assigned by `job_create`.
    pub fn new(
        application: ApplicationRef,
        workspace: impl Into<String>,
        operation: JobOperation,
        target: JobTarget,
    ) -> Self {
        Self {
            id: String::new(),
            application,
            workspace: workspace.into(),
            operation,
            target,
            labels: BTreeMap::new(),
            state: JobState::Queued,
            queue_time: Utc::now(),
            assign_time: None,
            ack_time: None,
            complete_time: None,
            cancel_time: None,
            assigned_runner: None,
            error: None,
            data_source_ref: None,
        }
    }

    pub fn scope(&self) -> ScopeKey {
        ScopeKey::new(&self.application, &self.workspace)
    }

    /// Move to `next`, failing if the state machine does not allow it.
    pub(crate) fn transition(&mut self, next: JobState) -> Result<()> {
        use JobState::*;

        let allowed = matches!(
            (self.state, next),
            (Queued, Waiting)
                | (Waiting, Running)
                | (Waiting, Queued)
                | (Running, Success)
                | (Running, Error)
                // Cancellation shortcuts.
                | (Queued, Error)
                | (Waiting, Error)
        );
        if !allowed {
            return Err(WaystationError::precondition(format!(
                "job {:?} is {}, cannot move to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            ApplicationRef::new("p", "app"),
            "default",
            JobOperation::Build {
                disable_push: false,
            },
            JobTarget::Any,
        )
    }

    #[test]
    fn new_job_is_queued_without_id() {
        let job = job();
        assert_eq!(job.state, JobState::Queued);
        assert!(job.id.is_empty());
        assert!(job.assigned_runner.is_none());
    }

    #[test]
    fn happy_path_transitions() {
        let mut job = job();
        job.transition(JobState::Waiting).unwrap();
        job.transition(JobState::Queued).unwrap();
        job.transition(JobState::Waiting).unwrap();
        job.transition(JobState::Running).unwrap();
        job.transition(JobState::Success).unwrap();
        assert!(job.state.is_terminal());
    }

    #[test]
    fn illegal_transition_names_source_state() {
        let mut job = job();
        let err = job.transition(JobState::Running).unwrap_err();
        assert!(err.to_string().contains("QUEUED"));
        assert_eq!(job.state, JobState::Queued);

        job.state = JobState::Success;
        assert!(job.transition(JobState::Error).is_err());
        assert!(job.transition(JobState::Queued).is_err());
    }

    #[test]
    fn parallelizable_operations() {
        assert!(JobOperation::Noop.is_parallelizable());
        assert!(JobOperation::Validate.is_parallelizable());
        assert!(JobOperation::Auth.is_parallelizable());
        assert!(!JobOperation::Up.is_parallelizable());
        assert!(!JobOperation::Deploy {
            artifact_id: "a".into()
        }
        .is_parallelizable());
    }
}
