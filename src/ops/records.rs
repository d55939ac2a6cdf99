use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ApplicationRef, Identifiable, Operation, OperationKind, Scoped, Stated, Status};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    pub application: ApplicationRef,
    pub workspace: String,
    pub status: Status,
    pub component: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// The result of pushing a build to a registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub application: ApplicationRef,
    pub workspace: String,
    pub status: Status,
    pub build_id: String,
    pub component: String,
    pub artifact_uri: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub application: ApplicationRef,
    pub workspace: String,
    pub status: Status,
    pub artifact_id: String,
    pub component: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: String,
    pub application: ApplicationRef,
    pub workspace: String,
    pub status: Status,
    pub deployment_id: String,
    pub url: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    Unknown,
    Alive,
    Ready,
    Down,
    Partial,
}

/// Health of a deployment or release as observed by a status-report job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub id: String,
    pub application: ApplicationRef,
    pub workspace: String,
    pub status: Status,
    pub target_id: String,
    pub health: Health,
    #[serde(default)]
    pub health_message: String,
}

macro_rules! impl_operation {
    ($($ty:ident => $kind:expr),* $(,)?) => {
        $(
            impl Identifiable for $ty {
                fn id(&self) -> &str {
                    &self.id
                }

                fn set_id(&mut self, id: String) {
                    self.id = id;
                }
            }

            impl Stated for $ty {
                fn status(&self) -> &Status {
                    &self.status
                }
            }

            impl Scoped for $ty {
                fn application(&self) -> &ApplicationRef {
                    &self.application
                }

                fn workspace(&self) -> &str {
                    &self.workspace
                }
            }

            impl Operation for $ty {
                const KIND: OperationKind = $kind;
            }
        )*
    };
}

impl_operation!(
    Build => OperationKind::Build,
    Artifact => OperationKind::Artifact,
    Deployment => OperationKind::Deployment,
    Release => OperationKind::Release,
    StatusReport => OperationKind::StatusReport,
);
