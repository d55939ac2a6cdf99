//! Test harness for waystation integration tests.
//!
//! Starts an in-process server on an ephemeral port and provides client, runner and job helpers.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use waystation::config::{RunnerConfig, ServerConfig};
use waystation::node::Node;
use waystation::ops::ApplicationRef;
use waystation::output::{InstanceRegistry, OutputRegistry};
use waystation::proto::orchestrator_client::OrchestratorClient;
use waystation::runner::{JobExecutor, RunnerAgent};
use waystation::scheduler::{Job, JobOperation, JobTarget};
use waystation::state::StateStore;

/// A server running in this process.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<StateStore>,
    pub outputs: Arc<OutputRegistry>,
    pub instances: Arc<InstanceRegistry>,
    pub shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Start an in-memory server.
    pub async fn start() -> Self {
        Self::start_with(ServerConfig::default()).await
    }

    pub async fn start_with(config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let node = Node::open(ServerConfig {
            listen_addr: addr,
            ..config
        })
        .unwrap();

        let state = node.state.clone();
        let outputs = node.outputs.clone();
        let instances = node.instances.clone();
        let shutdown = CancellationToken::new();
        let server_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = node.run_with_listener(listener, server_shutdown).await {
                eprintln!("test server failed: {}", e);
            }
        });

        Self {
            addr,
            state,
            outputs,
            instances,
            shutdown,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Connect a client, retrying while the server comes up.
    pub async fn client(&self) -> OrchestratorClient<Channel> {
        for _ in 0..50 {
            if let Ok(client) = OrchestratorClient::connect(self.url()).await {
                return client;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("could not connect to test server at {}", self.url());
    }

    /// Start a runner agent against this server.
    pub fn start_runner<E: JobExecutor>(&self, runner_id: &str, executor: E) -> TestRunner {
        let mut config = RunnerConfig::new(self.url(), runner_id);
        config.reconnect_delay_ms = 50;
        let agent = RunnerAgent::new(config, executor);
        let shutdown = CancellationToken::new();
        let runner_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move { agent.run(runner_shutdown).await });
        TestRunner { shutdown, handle }
    }

    /// Wait until `runner_id` is registered.
    pub async fn wait_for_runner(&self, runner_id: &str) {
        let state = self.state.clone();
        let id = runner_id.to_string();
        assert_eventually(
            || {
                let state = state.clone();
                let id = id.clone();
                async move { state.runner_get(&id).is_ok() }
            },
            Duration::from_secs(5),
            "runner should register",
        )
        .await;
    }

    /// Wait until a job reaches a terminal state and return it.
    pub async fn wait_for_terminal(&self, job_id: &str) -> Job {
        let state = self.state.clone();
        let id = job_id.to_string();
        assert_eventually(
            || {
                let state = state.clone();
                let id = id.clone();
                async move {
                    state
                        .job_get(&id)
                        .map(|job| job.state.is_terminal())
                        .unwrap_or(false)
                }
            },
            Duration::from_secs(10),
            "job should finish",
        )
        .await;
        self.state.job_get(job_id).unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.handle.abort();
    }
}

/// Handle to a running runner agent.
pub struct TestRunner {
    pub shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestRunner {
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut self.handle).await;
    }
}

impl Drop for TestRunner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn app() -> ApplicationRef {
    ApplicationRef::new("acme", "web")
}

/// An unqueued job for the `acme/web` application.
pub fn job(workspace: &str, operation: JobOperation) -> Job {
    Job::new(app(), workspace, operation, JobTarget::Any)
}

pub fn deploy_job(workspace: &str) -> Job {
    job(
        workspace,
        JobOperation::Deploy {
            artifact_id: "artifact-1".to_string(),
        },
    )
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
