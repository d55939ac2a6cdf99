use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use crate::grpc::{OrchestratorService, ServiceContext};
use crate::proto::orchestrator_server::OrchestratorServer;

pub struct GrpcServer {
    ctx: ServiceContext,
}

impl GrpcServer {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    /// Serve on `listener` until the context's shutdown token is cancelled.
    pub async fn run(self, listener: TcpListener) -> Result<(), tonic::transport::Error> {
        let shutdown = self.ctx.shutdown.clone();
        let service = OrchestratorService::new(self.ctx);

        match listener.local_addr() {
            Ok(addr) => tracing::info!(addr = %addr, "Starting gRPC server"),
            Err(e) => tracing::warn!(error = %e, "Starting gRPC server on unknown address"),
        }

        Server::builder()
            .add_service(OrchestratorServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await
            })
            .await
    }
}
