//! Conversions between wire messages and domain types.
//!
//! Times are unix milliseconds on the wire. Incoming messages are validated here; anything
//! missing that the domain requires is a `FailedPrecondition`.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::error::{Result, WaystationError};
use crate::ops::{
    ApplicationRef, Artifact, Build, Deployment, Health, Operation, OperationKind, OperationState,
    Release, Status, StatusReport,
};
use crate::output::{LogLine, OutputLine, OutputStream};
use crate::proto;
use crate::proto::operation_record::Record;
use crate::scheduler::{Job, JobError, JobOperation, JobState, JobTarget};
use crate::state::{OperationOrder, OrderBy, StatusFilter};

pub fn to_ms(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn labels_to_proto(labels: &BTreeMap<String, String>) -> HashMap<String, String> {
    labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn labels_from_proto(labels: HashMap<String, String>) -> BTreeMap<String, String> {
    labels.into_iter().collect()
}

pub fn app_to_proto(app: &ApplicationRef) -> proto::ApplicationRef {
    proto::ApplicationRef {
        project: app.project.clone(),
        application: app.application.clone(),
    }
}

pub fn app_from_proto(app: Option<proto::ApplicationRef>) -> Result<ApplicationRef> {
    match app {
        Some(app) if !app.project.is_empty() && !app.application.is_empty() => {
            Ok(ApplicationRef::new(app.project, app.application))
        }
        _ => Err(WaystationError::precondition("application must be set")),
    }
}

// =============================================================================
// Jobs
// =============================================================================

pub fn job_state_to_proto(state: JobState) -> proto::JobState {
    match state {
        JobState::Queued => proto::JobState::Queued,
        JobState::Waiting => proto::JobState::Waiting,
        JobState::Running => proto::JobState::Running,
        JobState::Success => proto::JobState::Success,
        JobState::Error => proto::JobState::Error,
    }
}

pub fn job_state_from_proto(state: i32) -> Option<JobState> {
    match proto::JobState::try_from(state).ok()? {
        proto::JobState::Unknown => None,
        proto::JobState::Queued => Some(JobState::Queued),
        proto::JobState::Waiting => Some(JobState::Waiting),
        proto::JobState::Running => Some(JobState::Running),
        proto::JobState::Success => Some(JobState::Success),
        proto::JobState::Error => Some(JobState::Error),
    }
}

pub fn job_error_to_proto(error: &JobError) -> proto::JobError {
    proto::JobError {
        message: error.message.clone(),
    }
}

fn operation_to_proto(op: &JobOperation) -> proto::job::Operation {
    use proto::job::Operation as Op;
    match op {
        JobOperation::Noop => Op::Noop(proto::NoopOp {}),
        JobOperation::Validate => Op::Validate(proto::ValidateOp {}),
        JobOperation::Auth => Op::Auth(proto::AuthOp {}),
        JobOperation::Build { disable_push } => Op::Build(proto::BuildOp {
            disable_push: *disable_push,
        }),
        JobOperation::Push { build_id } => Op::Push(proto::PushOp {
            build_id: build_id.clone(),
        }),
        JobOperation::Deploy { artifact_id } => Op::Deploy(proto::DeployOp {
            artifact_id: artifact_id.clone(),
        }),
        JobOperation::Release {
            deployment_id,
            prune,
        } => Op::Release(proto::ReleaseOp {
            deployment_id: deployment_id.clone(),
            prune: *prune,
        }),
        JobOperation::Destroy { deployment_id } => Op::Destroy(proto::DestroyOp {
            deployment_id: deployment_id.clone(),
        }),
        JobOperation::StatusReport { target_id } => Op::StatusReport(proto::StatusReportOp {
            target_id: target_id.clone(),
        }),
        JobOperation::Up => Op::Up(proto::UpOp {}),
    }
}

fn operation_from_proto(op: proto::job::Operation) -> JobOperation {
    use proto::job::Operation as Op;
    match op {
        Op::Noop(_) => JobOperation::Noop,
        Op::Validate(_) => JobOperation::Validate,
        Op::Auth(_) => JobOperation::Auth,
        Op::Build(b) => JobOperation::Build {
            disable_push: b.disable_push,
        },
        Op::Push(p) => JobOperation::Push {
            build_id: p.build_id,
        },
        Op::Deploy(d) => JobOperation::Deploy {
            artifact_id: d.artifact_id,
        },
        Op::Release(r) => JobOperation::Release {
            deployment_id: r.deployment_id,
            prune: r.prune,
        },
        Op::Destroy(d) => JobOperation::Destroy {
            deployment_id: d.deployment_id,
        },
        Op::StatusReport(s) => JobOperation::StatusReport {
            target_id: s.target_id,
        },
        Op::Up(_) => JobOperation::Up,
    }
}

pub fn job_to_proto(job: &Job) -> proto::Job {
    proto::Job {
        id: job.id.clone(),
        application: Some(app_to_proto(&job.application)),
        workspace: job.workspace.clone(),
        labels: labels_to_proto(&job.labels),
        state: job_state_to_proto(job.state) as i32,
        assigned_runner: job.assigned_runner.clone().unwrap_or_default(),
        queue_time_ms: to_ms(job.queue_time),
        assign_time_ms: job.assign_time.map(to_ms),
        ack_time_ms: job.ack_time.map(to_ms),
        complete_time_ms: job.complete_time.map(to_ms),
        cancel_time_ms: job.cancel_time.map(to_ms),
        error: job.error.as_ref().map(job_error_to_proto),
        data_source_ref: job.data_source_ref.clone().unwrap_or_default(),
        target: Some(match &job.target {
            JobTarget::Any => proto::job::Target::Any(proto::TargetAny {}),
            JobTarget::Runner(id) => proto::job::Target::RunnerId(id.clone()),
        }),
        operation: Some(operation_to_proto(&job.operation)),
    }
}

/// A job submitted for queueing. Server-managed fields are ignored; the id is carried through
/// so the store can reject a pre-set one.
pub fn job_from_proto(job: proto::Job) -> Result<Job> {
    let target = match job.target {
        Some(proto::job::Target::Any(_)) => JobTarget::Any,
        Some(proto::job::Target::RunnerId(id)) => JobTarget::Runner(id),
        None => return Err(WaystationError::precondition("job target must be set")),
    };
    let operation = job
        .operation
        .map(operation_from_proto)
        .ok_or_else(|| WaystationError::precondition("job operation must be set"))?;
    let workspace = if job.workspace.is_empty() {
        "default".to_string()
    } else {
        job.workspace
    };

    let mut domain = Job::new(app_from_proto(job.application)?, workspace, operation, target);
    domain.id = job.id;
    domain.labels = labels_from_proto(job.labels);
    Ok(domain)
}

/// Domain view of a job received by a runner.
pub fn assigned_job_from_proto(job: proto::Job) -> Result<Job> {
    let state = job_state_from_proto(job.state).unwrap_or(JobState::Waiting);
    let queue_time = from_ms(job.queue_time_ms);
    let assign_time = job.assign_time_ms.map(from_ms);
    let assigned_runner = Some(job.assigned_runner.clone()).filter(|r| !r.is_empty());
    let data_source_ref = Some(job.data_source_ref.clone()).filter(|r| !r.is_empty());

    let mut domain = job_from_proto(job)?;
    domain.state = state;
    domain.queue_time = queue_time;
    domain.assign_time = assign_time;
    domain.assigned_runner = assigned_runner;
    domain.data_source_ref = data_source_ref;
    Ok(domain)
}

// =============================================================================
// Output and logs
// =============================================================================

pub fn output_line_to_proto(line: &OutputLine) -> proto::TerminalLine {
    let stream = match line.stream {
        OutputStream::Stdout => proto::OutputStream::Stdout,
        OutputStream::Stderr => proto::OutputStream::Stderr,
        OutputStream::Status => proto::OutputStream::Status,
    };
    proto::TerminalLine {
        timestamp_ms: to_ms(line.timestamp),
        stream: stream as i32,
        text: line.text.clone(),
    }
}

pub fn output_line_from_proto(line: proto::TerminalLine) -> OutputLine {
    let stream = match proto::OutputStream::try_from(line.stream) {
        Ok(proto::OutputStream::Stderr) => OutputStream::Stderr,
        Ok(proto::OutputStream::Status) => OutputStream::Status,
        _ => OutputStream::Stdout,
    };
    OutputLine {
        timestamp: from_ms(line.timestamp_ms),
        stream,
        text: line.text,
    }
}

pub fn log_line_to_proto(line: &LogLine) -> proto::LogLine {
    proto::LogLine {
        timestamp_ms: to_ms(line.timestamp),
        line: line.line.clone(),
        instance_id: line.instance_id.clone(),
    }
}

pub fn log_line_from_proto(instance_id: &str, line: proto::LogLine) -> LogLine {
    LogLine {
        timestamp: from_ms(line.timestamp_ms),
        instance_id: instance_id.to_string(),
        line: line.line,
    }
}

// =============================================================================
// Operation records
// =============================================================================

pub fn kind_from_proto(kind: i32) -> Result<OperationKind> {
    match proto::OperationKind::try_from(kind) {
        Ok(proto::OperationKind::Build) => Ok(OperationKind::Build),
        Ok(proto::OperationKind::Artifact) => Ok(OperationKind::Artifact),
        Ok(proto::OperationKind::Deployment) => Ok(OperationKind::Deployment),
        Ok(proto::OperationKind::Release) => Ok(OperationKind::Release),
        Ok(proto::OperationKind::StatusReport) => Ok(OperationKind::StatusReport),
        Ok(proto::OperationKind::Unspecified) | Err(_) => Err(WaystationError::precondition(
            format!("unknown operation kind {}", kind),
        )),
    }
}

pub fn operation_state_to_proto(state: OperationState) -> proto::OperationState {
    match state {
        OperationState::Unknown => proto::OperationState::Unknown,
        OperationState::Running => proto::OperationState::Running,
        OperationState::Success => proto::OperationState::Success,
        OperationState::Error => proto::OperationState::Error,
    }
}

fn operation_state_from_proto(state: i32) -> OperationState {
    match proto::OperationState::try_from(state) {
        Ok(proto::OperationState::Running) => OperationState::Running,
        Ok(proto::OperationState::Success) => OperationState::Success,
        Ok(proto::OperationState::Error) => OperationState::Error,
        Ok(proto::OperationState::Unknown) | Err(_) => OperationState::Unknown,
    }
}

fn status_to_proto(status: &Status) -> proto::OperationStatus {
    proto::OperationStatus {
        state: operation_state_to_proto(status.state) as i32,
        details: status.details.clone(),
        start_time_ms: to_ms(status.start_time),
        complete_time_ms: status.complete_time.map(to_ms),
    }
}

fn status_from_proto(status: Option<proto::OperationStatus>) -> Result<Status> {
    let status = status.ok_or_else(|| WaystationError::precondition("status must be set"))?;
    Ok(Status {
        state: operation_state_from_proto(status.state),
        details: status.details,
        start_time: from_ms(status.start_time_ms),
        complete_time: status.complete_time_ms.map(from_ms),
    })
}

pub fn filters_from_proto(filters: Vec<proto::StatusFilter>) -> StatusFilter {
    StatusFilter {
        groups: filters
            .into_iter()
            .map(|f| f.states.into_iter().map(operation_state_from_proto).collect())
            .collect(),
    }
}

pub fn order_from_proto(order: Option<proto::OperationOrder>) -> OperationOrder {
    let Some(order) = order else {
        return OperationOrder::default();
    };
    OperationOrder {
        by: match proto::OrderBy::try_from(order.by) {
            Ok(proto::OrderBy::CompleteTime) => OrderBy::CompleteTime,
            _ => OrderBy::StartTime,
        },
        ascending: order.ascending,
        limit: (order.limit > 0).then_some(order.limit as usize),
    }
}

/// An operation kind with a wire representation.
pub trait WireOperation: Operation {
    fn to_record(&self) -> proto::OperationRecord;
}

fn record(record: Record) -> proto::OperationRecord {
    proto::OperationRecord {
        record: Some(record),
    }
}

impl WireOperation for Build {
    fn to_record(&self) -> proto::OperationRecord {
        record(Record::Build(proto::Build {
            id: self.id.clone(),
            application: Some(app_to_proto(&self.application)),
            workspace: self.workspace.clone(),
            status: Some(status_to_proto(&self.status)),
            component: self.component.clone(),
            labels: labels_to_proto(&self.labels),
        }))
    }
}

impl WireOperation for Artifact {
    fn to_record(&self) -> proto::OperationRecord {
        record(Record::Artifact(proto::Artifact {
            id: self.id.clone(),
            application: Some(app_to_proto(&self.application)),
            workspace: self.workspace.clone(),
            status: Some(status_to_proto(&self.status)),
            build_id: self.build_id.clone(),
            component: self.component.clone(),
            artifact_uri: self.artifact_uri.clone(),
            labels: labels_to_proto(&self.labels),
        }))
    }
}

impl WireOperation for Deployment {
    fn to_record(&self) -> proto::OperationRecord {
        record(Record::Deployment(proto::Deployment {
            id: self.id.clone(),
            application: Some(app_to_proto(&self.application)),
            workspace: self.workspace.clone(),
            status: Some(status_to_proto(&self.status)),
            artifact_id: self.artifact_id.clone(),
            component: self.component.clone(),
            labels: labels_to_proto(&self.labels),
        }))
    }
}

impl WireOperation for Release {
    fn to_record(&self) -> proto::OperationRecord {
        record(Record::Release(proto::Release {
            id: self.id.clone(),
            application: Some(app_to_proto(&self.application)),
            workspace: self.workspace.clone(),
            status: Some(status_to_proto(&self.status)),
            deployment_id: self.deployment_id.clone(),
            url: self.url.clone(),
            labels: labels_to_proto(&self.labels),
        }))
    }
}

impl WireOperation for StatusReport {
    fn to_record(&self) -> proto::OperationRecord {
        let health = match self.health {
            Health::Unknown => proto::Health::Unknown,
            Health::Alive => proto::Health::Alive,
            Health::Ready => proto::Health::Ready,
            Health::Down => proto::Health::Down,
            Health::Partial => proto::Health::Partial,
        };
        record(Record::StatusReport(proto::StatusReport {
            id: self.id.clone(),
            application: Some(app_to_proto(&self.application)),
            workspace: self.workspace.clone(),
            status: Some(status_to_proto(&self.status)),
            target_id: self.target_id.clone(),
            health: health as i32,
            health_message: self.health_message.clone(),
        }))
    }
}

pub fn build_from_proto(b: proto::Build) -> Result<Build> {
    Ok(Build {
        id: b.id,
        application: app_from_proto(b.application)?,
        workspace: b.workspace,
        status: status_from_proto(b.status)?,
        component: b.component,
        labels: labels_from_proto(b.labels),
    })
}

pub fn artifact_from_proto(a: proto::Artifact) -> Result<Artifact> {
    Ok(Artifact {
        id: a.id,
        application: app_from_proto(a.application)?,
        workspace: a.workspace,
        status: status_from_proto(a.status)?,
        build_id: a.build_id,
        component: a.component,
        artifact_uri: a.artifact_uri,
        labels: labels_from_proto(a.labels),
    })
}

pub fn deployment_from_proto(d: proto::Deployment) -> Result<Deployment> {
    Ok(Deployment {
        id: d.id,
        application: app_from_proto(d.application)?,
        workspace: d.workspace,
        status: status_from_proto(d.status)?,
        artifact_id: d.artifact_id,
        component: d.component,
        labels: labels_from_proto(d.labels),
    })
}

pub fn release_from_proto(r: proto::Release) -> Result<Release> {
    Ok(Release {
        id: r.id,
        application: app_from_proto(r.application)?,
        workspace: r.workspace,
        status: status_from_proto(r.status)?,
        deployment_id: r.deployment_id,
        url: r.url,
        labels: labels_from_proto(r.labels),
    })
}

pub fn status_report_from_proto(s: proto::StatusReport) -> Result<StatusReport> {
    let health = match proto::Health::try_from(s.health) {
        Ok(proto::Health::Alive) => Health::Alive,
        Ok(proto::Health::Ready) => Health::Ready,
        Ok(proto::Health::Down) => Health::Down,
        Ok(proto::Health::Partial) => Health::Partial,
        Ok(proto::Health::Unknown) | Err(_) => Health::Unknown,
    };
    Ok(StatusReport {
        id: s.id,
        application: app_from_proto(s.application)?,
        workspace: s.workspace,
        status: status_from_proto(s.status)?,
        target_id: s.target_id,
        health,
        health_message: s.health_message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_build() -> proto::Job {
        proto::Job {
            application: Some(proto::ApplicationRef {
                project: "p".into(),
                application: "web".into(),
            }),
            target: Some(proto::job::Target::RunnerId("r1".into())),
            operation: Some(proto::job::Operation::Build(proto::BuildOp { disable_push: true })),
            ..Default::default()
        }
    }

    #[test]
    fn job_from_proto_fills_defaults() {
        let job = job_from_proto(queued_build()).unwrap();
        assert_eq!(job.workspace, "default");
        assert_eq!(job.target, JobTarget::Runner("r1".into()));
        assert_eq!(job.operation, JobOperation::Build { disable_push: true });
        assert!(job.id.is_empty());
    }

    #[test]
    fn job_without_target_or_operation_is_rejected() {
        let mut no_target = queued_build();
        no_target.target = None;
        assert!(matches!(
            job_from_proto(no_target),
            Err(WaystationError::FailedPrecondition(_))
        ));

        let mut no_op = queued_build();
        no_op.operation = None;
        assert!(job_from_proto(no_op).is_err());

        let mut no_app = queued_build();
        no_app.application = None;
        assert!(job_from_proto(no_app).is_err());
    }

    #[test]
    fn unspecified_kind_is_rejected() {
        assert!(kind_from_proto(proto::OperationKind::Unspecified as i32).is_err());
        assert!(kind_from_proto(99).is_err());
        assert_eq!(
            kind_from_proto(proto::OperationKind::Release as i32).unwrap(),
            OperationKind::Release
        );
    }

    #[test]
    fn zero_limit_means_unbounded() {
        let order = order_from_proto(Some(proto::OperationOrder {
            by: proto::OrderBy::CompleteTime as i32,
            ascending: true,
            limit: 0,
        }));
        assert_eq!(order.by, OrderBy::CompleteTime);
        assert!(order.ascending);
        assert!(order.limit.is_none());
    }
}
