use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::grpc::{GrpcServer, ServiceContext};
use crate::output::{InstanceRegistry, OutputRegistry};
use crate::state::StateStore;

/// A server instance: the state store, the output registries and the gRPC surface over them.
pub struct Node {
    pub config: ServerConfig,
    pub state: Arc<StateStore>,
    pub outputs: Arc<OutputRegistry>,
    pub instances: Arc<InstanceRegistry>,
}

impl Node {
    /// Open the state store described by `config` and rebuild its indexes.
    pub fn open(config: ServerConfig) -> Result<Self> {
        let state = match config.db_path() {
            Some(path) => StateStore::open(path)?,
            None => {
                tracing::warn!("No data directory configured, operation history is not durable");
                StateStore::in_memory()?
            }
        };
        Ok(Self {
            outputs: Arc::new(OutputRegistry::new(config.output_buffer_capacity)),
            instances: Arc::new(InstanceRegistry::new(config.instance_buffer_capacity)),
            state: Arc::new(state),
            config,
        })
    }

    pub fn context(&self, shutdown: CancellationToken) -> ServiceContext {
        ServiceContext {
            state: self.state.clone(),
            outputs: self.outputs.clone(),
            instances: self.instances.clone(),
            shutdown,
        }
    }

    /// Bind the configured address and serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` is cancelled.
    ///
    /// Spawns the maintenance loop, then runs the gRPC server (blocking).
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let maintenance_state = self.state.clone();
        let maintenance_outputs = self.outputs.clone();
        let maintenance_config = self.config.clone();
        let maintenance_shutdown = shutdown.clone();
        tokio::spawn(async move {
            Self::maintenance_loop(
                maintenance_state,
                maintenance_outputs,
                maintenance_config,
                maintenance_shutdown,
            )
            .await;
        });

        let server = GrpcServer::new(self.context(shutdown));
        server.run(listener).await?;
        tracing::info!("gRPC server stopped");
        Ok(())
    }

    /// Periodically prune finished jobs and drop their output buffers.
    async fn maintenance_loop(
        state: Arc<StateStore>,
        outputs: Arc<OutputRegistry>,
        config: ServerConfig,
        shutdown: CancellationToken,
    ) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(config.prune_interval_ms.max(1)));
        let retention = chrono::Duration::from_std(Duration::from_secs(config.job_retention_secs))
            .unwrap_or_else(|_| chrono::Duration::days(36_500));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let cutoff = Utc::now()
                        .checked_sub_signed(retention)
                        .unwrap_or(DateTime::<Utc>::MIN_UTC);
                    for job_id in state.job_prune(cutoff, config.max_finished_jobs) {
                        outputs.remove(&job_id);
                    }
                }
            }
        }
        tracing::debug!("Maintenance loop stopped");
    }
}
