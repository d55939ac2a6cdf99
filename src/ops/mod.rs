//! Operation records: the durable history of builds, artifacts, deployments, releases and
//! status reports.
//!
//! Every kind shares the same envelope (id, application, workspace, status) and is accessed by
//! the store through [`Identifiable`], [`Stated`] and [`Scoped`]; the kind-specific payload is
//! opaque to it.

pub mod records;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use records::{Artifact, Build, Deployment, Health, Release, StatusReport};

/// The project/application pair every operation and job is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicationRef {
    pub project: String,
    pub application: String,
}

impl ApplicationRef {
    pub fn new(project: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            application: application.into(),
        }
    }
}

impl fmt::Display for ApplicationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.application)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationState {
    Unknown,
    Running,
    Success,
    Error,
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationState::Unknown => write!(f, "UNKNOWN"),
            OperationState::Running => write!(f, "RUNNING"),
            OperationState::Success => write!(f, "SUCCESS"),
            OperationState::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub state: OperationState,
    #[serde(default)]
    pub details: String,
    pub start_time: DateTime<Utc>,
    pub complete_time: Option<DateTime<Utc>>,
}

impl Status {
    pub fn running() -> Self {
        Self {
            state: OperationState::Running,
            details: String::new(),
            start_time: Utc::now(),
            complete_time: None,
        }
    }

    pub fn succeeded(start_time: DateTime<Utc>, complete_time: DateTime<Utc>) -> Self {
        Self {
            state: OperationState::Success,
            details: String::new(),
            start_time,
            complete_time: Some(complete_time),
        }
    }

    pub fn failed(
        start_time: DateTime<Utc>,
        complete_time: DateTime<Utc>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            state: OperationState::Error,
            details: details.into(),
            start_time,
            complete_time: Some(complete_time),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationKind {
    Build,
    Artifact,
    Deployment,
    Release,
    StatusReport,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::Build,
        OperationKind::Artifact,
        OperationKind::Deployment,
        OperationKind::Release,
        OperationKind::StatusReport,
    ];

    /// Name of the durable table holding records of this kind.
    pub fn table_name(&self) -> &'static str {
        match self {
            OperationKind::Build => "builds",
            OperationKind::Artifact => "artifacts",
            OperationKind::Deployment => "deployments",
            OperationKind::Release => "releases",
            OperationKind::StatusReport => "status_reports",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

pub trait Identifiable {
    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
}

pub trait Stated {
    fn status(&self) -> &Status;
}

pub trait Scoped {
    fn application(&self) -> &ApplicationRef;
    fn workspace(&self) -> &str;
}

/// A record kind the operation store can persist and index.
pub trait Operation:
    Identifiable + Stated + Scoped + Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    const KIND: OperationKind;
}

/// Generate a fresh operation id.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
