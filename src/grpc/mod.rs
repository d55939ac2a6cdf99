//! The `waystation.v1.Orchestrator` gRPC surface.

pub mod convert;
pub mod job_stream;
pub mod log_stream;
pub mod operation;
pub mod runner_stream;
pub mod server;
pub mod service;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::output::{InstanceRegistry, OutputRegistry};
use crate::state::StateStore;

pub use server::GrpcServer;
pub use service::OrchestratorService;

/// Everything a handler needs, owned by one server instance.
#[derive(Clone)]
pub struct ServiceContext {
    pub state: Arc<StateStore>,
    pub outputs: Arc<OutputRegistry>,
    pub instances: Arc<InstanceRegistry>,
    /// Cancelled when the server shuts down; long-lived streams end with it.
    pub shutdown: CancellationToken,
}
