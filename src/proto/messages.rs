//! Wire messages for `waystation.v1.Orchestrator`.
//!
//! Times travel as unix milliseconds, matching the rest of the API surface.

use std::collections::HashMap;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationRef {
    #[prost(string, tag = "1")]
    pub project: String,
    #[prost(string, tag = "2")]
    pub application: String,
}

// =============================================================================
// Jobs
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum JobState {
    Unknown = 0,
    Queued = 1,
    Waiting = 2,
    Running = 3,
    Success = 4,
    Error = 5,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobError {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Job {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, optional, tag = "2")]
    pub application: Option<ApplicationRef>,
    #[prost(string, tag = "3")]
    pub workspace: String,
    #[prost(map = "string, string", tag = "4")]
    pub labels: HashMap<String, String>,
    #[prost(enumeration = "JobState", tag = "5")]
    pub state: i32,
    #[prost(string, tag = "6")]
    pub assigned_runner: String,
    #[prost(int64, tag = "7")]
    pub queue_time_ms: i64,
    #[prost(int64, optional, tag = "8")]
    pub assign_time_ms: Option<i64>,
    #[prost(int64, optional, tag = "9")]
    pub ack_time_ms: Option<i64>,
    #[prost(int64, optional, tag = "10")]
    pub complete_time_ms: Option<i64>,
    #[prost(int64, optional, tag = "11")]
    pub cancel_time_ms: Option<i64>,
    #[prost(message, optional, tag = "12")]
    pub error: Option<JobError>,
    #[prost(string, tag = "13")]
    pub data_source_ref: String,
    #[prost(oneof = "job::Target", tags = "20, 21")]
    pub target: Option<job::Target>,
    #[prost(oneof = "job::Operation", tags = "30, 31, 32, 33, 34, 35, 36, 37, 38, 39")]
    pub operation: Option<job::Operation>,
}

pub mod job {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Target {
        #[prost(message, tag = "20")]
        Any(super::TargetAny),
        #[prost(string, tag = "21")]
        RunnerId(String),
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Operation {
        #[prost(message, tag = "30")]
        Noop(super::NoopOp),
        #[prost(message, tag = "31")]
        Validate(super::ValidateOp),
        #[prost(message, tag = "32")]
        Auth(super::AuthOp),
        #[prost(message, tag = "33")]
        Build(super::BuildOp),
        #[prost(message, tag = "34")]
        Push(super::PushOp),
        #[prost(message, tag = "35")]
        Deploy(super::DeployOp),
        #[prost(message, tag = "36")]
        Release(super::ReleaseOp),
        #[prost(message, tag = "37")]
        Destroy(super::DestroyOp),
        #[prost(message, tag = "38")]
        StatusReport(super::StatusReportOp),
        #[prost(message, tag = "39")]
        Up(super::UpOp),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TargetAny {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NoopOp {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ValidateOp {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthOp {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BuildOp {
    #[prost(bool, tag = "1")]
    pub disable_push: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushOp {
    #[prost(string, tag = "1")]
    pub build_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeployOp {
    #[prost(string, tag = "1")]
    pub artifact_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReleaseOp {
    #[prost(string, tag = "1")]
    pub deployment_id: String,
    #[prost(bool, tag = "2")]
    pub prune: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DestroyOp {
    #[prost(string, tag = "1")]
    pub deployment_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusReportOp {
    #[prost(string, tag = "1")]
    pub target_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpOp {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueueJobRequest {
    #[prost(message, optional, tag = "1")]
    pub job: Option<Job>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueueJobResponse {
    #[prost(string, tag = "1")]
    pub job_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelJobRequest {
    #[prost(string, tag = "1")]
    pub job_id: String,
    #[prost(bool, tag = "2")]
    pub force: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetJobRequest {
    #[prost(string, tag = "1")]
    pub job_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListJobsRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListJobsResponse {
    #[prost(message, repeated, tag = "1")]
    pub jobs: Vec<Job>,
}

// =============================================================================
// Terminal output
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum OutputStream {
    Stdout = 0,
    Stderr = 1,
    Status = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TerminalLine {
    #[prost(int64, tag = "1")]
    pub timestamp_ms: i64,
    #[prost(enumeration = "OutputStream", tag = "2")]
    pub stream: i32,
    #[prost(string, tag = "3")]
    pub text: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetJobStreamRequest {
    #[prost(string, tag = "1")]
    pub job_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetJobStreamResponse {
    #[prost(oneof = "get_job_stream_response::Event", tags = "1, 2, 3, 4")]
    pub event: Option<get_job_stream_response::Event>,
}

pub mod get_job_stream_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Event {
        #[prost(message, tag = "1")]
        Open(Open),
        #[prost(message, tag = "2")]
        State(State),
        #[prost(message, tag = "3")]
        Terminal(Terminal),
        #[prost(message, tag = "4")]
        Complete(Complete),
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Open {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct State {
        #[prost(enumeration = "super::JobState", tag = "1")]
        pub previous: i32,
        #[prost(enumeration = "super::JobState", tag = "2")]
        pub current: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Terminal {
        #[prost(bool, tag = "1")]
        pub buffered: bool,
        #[prost(message, repeated, tag = "2")]
        pub lines: Vec<super::TerminalLine>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Complete {
        #[prost(message, optional, tag = "1")]
        pub error: Option<super::JobError>,
    }
}

// =============================================================================
// Runners
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Runner {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(map = "string, string", tag = "2")]
    pub labels: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunnerConfigRequest {
    #[prost(message, optional, tag = "1")]
    pub runner: Option<Runner>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunnerConfigResponse {
    #[prost(map = "string, string", tag = "1")]
    pub variables: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunnerJobStreamRequest {
    #[prost(oneof = "runner_job_stream_request::Event", tags = "1, 2, 3, 4, 5, 6")]
    pub event: Option<runner_job_stream_request::Event>,
}

pub mod runner_job_stream_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Event {
        #[prost(message, tag = "1")]
        Request(Request),
        #[prost(message, tag = "2")]
        Ack(Ack),
        #[prost(message, tag = "3")]
        Terminal(Terminal),
        #[prost(message, tag = "4")]
        Download(Download),
        #[prost(message, tag = "5")]
        Complete(Complete),
        #[prost(message, tag = "6")]
        Error(Error),
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Request {
        #[prost(string, tag = "1")]
        pub runner_id: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Ack {
        #[prost(bool, tag = "1")]
        pub accept: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Terminal {
        #[prost(message, repeated, tag = "1")]
        pub lines: Vec<super::TerminalLine>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Download {
        #[prost(string, tag = "1")]
        pub data_source_ref: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Complete {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Error {
        #[prost(message, optional, tag = "1")]
        pub error: Option<super::JobError>,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunnerJobStreamResponse {
    #[prost(oneof = "runner_job_stream_response::Event", tags = "1, 2")]
    pub event: Option<runner_job_stream_response::Event>,
}

pub mod runner_job_stream_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Event {
        #[prost(message, tag = "1")]
        Assignment(Assignment),
        #[prost(message, tag = "2")]
        Cancel(Cancel),
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Assignment {
        #[prost(message, optional, tag = "1")]
        pub job: Option<super::Job>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Cancel {}
}

// =============================================================================
// Config variables
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetConfigRequest {
    #[prost(map = "string, string", tag = "1")]
    pub variables: HashMap<String, String>,
    #[prost(string, repeated, tag = "2")]
    pub unset: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetConfigRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetConfigResponse {
    #[prost(map = "string, string", tag = "1")]
    pub variables: HashMap<String, String>,
}

// =============================================================================
// Operation records
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum OperationKind {
    Unspecified = 0,
    Build = 1,
    Artifact = 2,
    Deployment = 3,
    Release = 4,
    StatusReport = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum OperationState {
    Unknown = 0,
    Running = 1,
    Success = 2,
    Error = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Health {
    Unknown = 0,
    Alive = 1,
    Ready = 2,
    Down = 3,
    Partial = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OperationStatus {
    #[prost(enumeration = "OperationState", tag = "1")]
    pub state: i32,
    #[prost(string, tag = "2")]
    pub details: String,
    #[prost(int64, tag = "3")]
    pub start_time_ms: i64,
    #[prost(int64, optional, tag = "4")]
    pub complete_time_ms: Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Build {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, optional, tag = "2")]
    pub application: Option<ApplicationRef>,
    #[prost(string, tag = "3")]
    pub workspace: String,
    #[prost(message, optional, tag = "4")]
    pub status: Option<OperationStatus>,
    #[prost(string, tag = "5")]
    pub component: String,
    #[prost(map = "string, string", tag = "6")]
    pub labels: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Artifact {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, optional, tag = "2")]
    pub application: Option<ApplicationRef>,
    #[prost(string, tag = "3")]
    pub workspace: String,
    #[prost(message, optional, tag = "4")]
    pub status: Option<OperationStatus>,
    #[prost(string, tag = "5")]
    pub build_id: String,
    #[prost(string, tag = "6")]
    pub component: String,
    #[prost(string, tag = "7")]
    pub artifact_uri: String,
    #[prost(map = "string, string", tag = "8")]
    pub labels: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Deployment {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, optional, tag = "2")]
    pub application: Option<ApplicationRef>,
    #[prost(string, tag = "3")]
    pub workspace: String,
    #[prost(message, optional, tag = "4")]
    pub status: Option<OperationStatus>,
    #[prost(string, tag = "5")]
    pub artifact_id: String,
    #[prost(string, tag = "6")]
    pub component: String,
    #[prost(map = "string, string", tag = "7")]
    pub labels: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Release {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, optional, tag = "2")]
    pub application: Option<ApplicationRef>,
    #[prost(string, tag = "3")]
    pub workspace: String,
    #[prost(message, optional, tag = "4")]
    pub status: Option<OperationStatus>,
    #[prost(string, tag = "5")]
    pub deployment_id: String,
    #[prost(string, tag = "6")]
    pub url: String,
    #[prost(map = "string, string", tag = "7")]
    pub labels: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusReport {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, optional, tag = "2")]
    pub application: Option<ApplicationRef>,
    #[prost(string, tag = "3")]
    pub workspace: String,
    #[prost(message, optional, tag = "4")]
    pub status: Option<OperationStatus>,
    #[prost(string, tag = "5")]
    pub target_id: String,
    #[prost(enumeration = "Health", tag = "6")]
    pub health: i32,
    #[prost(string, tag = "7")]
    pub health_message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OperationRecord {
    #[prost(oneof = "operation_record::Record", tags = "1, 2, 3, 4, 5")]
    pub record: Option<operation_record::Record>,
}

pub mod operation_record {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Record {
        #[prost(message, tag = "1")]
        Build(super::Build),
        #[prost(message, tag = "2")]
        Artifact(super::Artifact),
        #[prost(message, tag = "3")]
        Deployment(super::Deployment),
        #[prost(message, tag = "4")]
        Release(super::Release),
        #[prost(message, tag = "5")]
        StatusReport(super::StatusReport),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpsertOperationRequest {
    #[prost(message, optional, tag = "1")]
    pub record: Option<OperationRecord>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetOperationRequest {
    #[prost(enumeration = "OperationKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub id: String,
}

/// A group of states that must all match; groups are OR'd together.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusFilter {
    #[prost(enumeration = "OperationState", repeated, tag = "1")]
    pub states: Vec<i32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum OrderBy {
    StartTime = 0,
    CompleteTime = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OperationOrder {
    #[prost(enumeration = "OrderBy", tag = "1")]
    pub by: i32,
    #[prost(bool, tag = "2")]
    pub ascending: bool,
    #[prost(uint32, tag = "3")]
    pub limit: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListOperationsRequest {
    #[prost(enumeration = "OperationKind", tag = "1")]
    pub kind: i32,
    #[prost(message, optional, tag = "2")]
    pub application: Option<ApplicationRef>,
    #[prost(message, repeated, tag = "3")]
    pub filters: Vec<StatusFilter>,
    #[prost(message, optional, tag = "4")]
    pub order: Option<OperationOrder>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListOperationsResponse {
    #[prost(message, repeated, tag = "1")]
    pub records: Vec<OperationRecord>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetLatestOperationRequest {
    #[prost(enumeration = "OperationKind", tag = "1")]
    pub kind: i32,
    #[prost(message, optional, tag = "2")]
    pub application: Option<ApplicationRef>,
}

// =============================================================================
// Instance logs
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogLine {
    #[prost(int64, tag = "1")]
    pub timestamp_ms: i64,
    #[prost(string, tag = "2")]
    pub line: String,
    #[prost(string, tag = "3")]
    pub instance_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EntrypointLogBatch {
    #[prost(string, tag = "1")]
    pub instance_id: String,
    #[prost(string, tag = "2")]
    pub deployment_id: String,
    #[prost(message, repeated, tag = "3")]
    pub lines: Vec<LogLine>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetLogStreamRequest {
    #[prost(string, tag = "1")]
    pub deployment_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogBatch {
    #[prost(string, tag = "1")]
    pub deployment_id: String,
    #[prost(message, repeated, tag = "2")]
    pub lines: Vec<LogLine>,
}
