use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Streaming;

use crate::config::RunnerConfig;
use crate::error::{Result, WaystationError};
use crate::grpc::convert;
use crate::output::{OutputLine, OutputStream};
use crate::proto::orchestrator_client::OrchestratorClient;
use crate::proto::runner_job_stream_request::{self, Event as RunnerEvent};
use crate::proto::runner_job_stream_response::Event as ServerEvent;
use crate::proto::{self, RunnerConfigRequest, RunnerJobStreamRequest, RunnerJobStreamResponse};
use crate::runner::executor::JobExecutor;
use crate::scheduler::{Job, JobError};

const OUTBOUND_CHANNEL_SIZE: usize = 32;
const LINE_CHANNEL_SIZE: usize = 256;
const MAX_LINES_PER_EVENT: usize = 64;

/// A runner: registers with the server, then takes one job at a time off `RunnerJobStream` and
/// hands it to its executor.
pub struct RunnerAgent<E> {
    config: RunnerConfig,
    executor: Arc<E>,
}

impl<E: JobExecutor> RunnerAgent<E> {
    pub fn new(config: RunnerConfig, executor: E) -> Self {
        Self {
            config,
            executor: Arc::new(executor),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.runner_id
    }

    /// Run until `shutdown` is cancelled, reconnecting after failures.
    pub async fn run(&self, shutdown: CancellationToken) {
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        while !shutdown.is_cancelled() {
            match self.serve(&shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(
                        runner_id = %self.config.runner_id,
                        error = %e,
                        "Runner session failed, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        tracing::info!(runner_id = %self.config.runner_id, "Runner stopped");
    }

    /// Connect, register and process jobs. Returns `Ok` only on shutdown.
    async fn serve(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut client = OrchestratorClient::connect(self.config.server_addr.clone()).await?;
        let (variables, config_task) = self.register(&mut client).await?;
        tracing::info!(
            runner_id = %self.config.runner_id,
            server = %self.config.server_addr,
            "Runner registered"
        );

        let result = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }
            if config_task.is_finished() {
                break Err(WaystationError::Aborted(
                    "runner config stream ended".to_string(),
                ));
            }
            if let Err(e) = self.run_one(&mut client, &variables, shutdown).await {
                break Err(e);
            }
        };
        config_task.abort();
        result
    }

    /// Open the config stream and wait for the first variables, which confirm registration.
    async fn register(
        &self,
        client: &mut OrchestratorClient<Channel>,
    ) -> Result<(watch::Receiver<BTreeMap<String, String>>, JoinHandle<()>)> {
        let request = RunnerConfigRequest {
            runner: Some(proto::Runner {
                id: self.config.runner_id.clone(),
                labels: self
                    .config
                    .labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            }),
        };
        let mut stream = client.runner_config(request).await?.into_inner();
        let first = stream.message().await?.ok_or_else(|| {
            WaystationError::Aborted("config stream closed before registration".to_string())
        })?;

        let (tx, rx) = watch::channel(first.variables.into_iter().collect());
        let runner_id = self.config.runner_id.clone();
        let task = tokio::spawn(async move {
            loop {
                match stream.message().await {
                    Ok(Some(update)) => {
                        tracing::debug!(runner_id, "Config variables updated");
                        tx.send_replace(update.variables.into_iter().collect());
                    }
                    Ok(None) => break,
                    Err(status) => {
                        tracing::debug!(runner_id, error = %status, "Config stream failed");
                        break;
                    }
                }
            }
        });
        Ok((rx, task))
    }

    /// Request one job and run it to completion. Returns `Ok` without a job on shutdown.
    async fn run_one(
        &self,
        client: &mut OrchestratorClient<Channel>,
        variables: &watch::Receiver<BTreeMap<String, String>>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);
        send(
            &out_tx,
            RunnerEvent::Request(runner_job_stream_request::Request {
                runner_id: self.config.runner_id.clone(),
            }),
        )
        .await?;
        let mut inbound = client
            .runner_job_stream(ReceiverStream::new(out_rx))
            .await?
            .into_inner();

        let first = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            message = inbound.message() => message?,
        };
        let job = match first {
            Some(RunnerJobStreamResponse {
                event: Some(ServerEvent::Assignment(assignment)),
            }) => assignment
                .job
                .ok_or_else(|| WaystationError::precondition("assignment without a job"))?,
            Some(_) => {
                return Err(WaystationError::precondition(
                    "expected a job assignment from the server",
                ))
            }
            None => {
                return Err(WaystationError::Aborted(
                    "job stream closed before assignment".to_string(),
                ))
            }
        };
        let job = match convert::assigned_job_from_proto(job) {
            Ok(job) => job,
            Err(e) => {
                send_error(&out_tx, &JobError::new(e.to_string())).await?;
                return Err(e);
            }
        };

        send(
            &out_tx,
            RunnerEvent::Ack(runner_job_stream_request::Ack { accept: true }),
        )
        .await?;
        tracing::info!(
            runner_id = %self.config.runner_id,
            job_id = %job.id,
            operation = job.operation.kind(),
            "Accepted job"
        );

        let (result, server_open) = self
            .execute(&job, variables, &out_tx, &mut inbound, shutdown)
            .await?;
        match &result {
            Ok(()) => {
                send(
                    &out_tx,
                    RunnerEvent::Complete(runner_job_stream_request::Complete {}),
                )
                .await?
            }
            Err(error) => send_error(&out_tx, error).await?,
        }
        tracing::info!(
            job_id = %job.id,
            success = result.is_ok(),
            "Reported job result"
        );

        drop(out_tx);
        if !server_open {
            return Err(WaystationError::Aborted(
                "server closed the job stream".to_string(),
            ));
        }
        // The server ends the stream once it has recorded the result.
        while let Ok(Some(_)) = inbound.message().await {}
        Ok(())
    }

    /// Run the executor while forwarding its output and watching for a server cancel. Returns
    /// the job result and whether the server stream is still open.
    async fn execute(
        &self,
        job: &Job,
        variables: &watch::Receiver<BTreeMap<String, String>>,
        out_tx: &mpsc::Sender<RunnerJobStreamRequest>,
        inbound: &mut Streaming<RunnerJobStreamResponse>,
        shutdown: &CancellationToken,
    ) -> Result<(std::result::Result<(), JobError>, bool)> {
        let env = variables.borrow().clone();
        let cancel = shutdown.child_token();
        let (lines_tx, mut lines_rx) = mpsc::channel(LINE_CHANNEL_SIZE);

        let status = OutputLine::new(
            OutputStream::Status,
            format!("Executing {} on runner {}", job.operation.kind(), self.config.runner_id),
        );
        send_lines(out_tx, vec![status]).await?;

        let execution = self.executor.execute(job, &env, lines_tx, cancel.clone());
        tokio::pin!(execution);

        let mut server_open = true;
        let result = loop {
            tokio::select! {
                result = &mut execution => break result,
                Some(line) = lines_rx.recv() => {
                    let mut lines = vec![line];
                    while lines.len() < MAX_LINES_PER_EVENT {
                        match lines_rx.try_recv() {
                            Ok(line) => lines.push(line),
                            Err(_) => break,
                        }
                    }
                    send_lines(out_tx, lines).await?;
                }
                message = inbound.message(), if server_open => match message {
                    Ok(Some(RunnerJobStreamResponse { event: Some(ServerEvent::Cancel(_)) })) => {
                        tracing::info!(job_id = %job.id, "Server cancelled job");
                        cancel.cancel();
                    }
                    Ok(Some(_)) => {
                        tracing::warn!(job_id = %job.id, "Ignoring unexpected server event");
                    }
                    Ok(None) | Err(_) => {
                        tracing::warn!(job_id = %job.id, "Server closed the job stream, stopping job");
                        server_open = false;
                        cancel.cancel();
                    }
                },
            }
        };

        let mut rest = Vec::new();
        while let Ok(line) = lines_rx.try_recv() {
            rest.push(line);
        }
        for chunk in rest.chunks(MAX_LINES_PER_EVENT) {
            send_lines(out_tx, chunk.to_vec()).await?;
        }
        Ok((result, server_open))
    }
}

async fn send(out_tx: &mpsc::Sender<RunnerJobStreamRequest>, event: RunnerEvent) -> Result<()> {
    out_tx
        .send(RunnerJobStreamRequest { event: Some(event) })
        .await
        .map_err(|_| WaystationError::Aborted("job stream closed".to_string()))
}

async fn send_lines(out_tx: &mpsc::Sender<RunnerJobStreamRequest>, lines: Vec<OutputLine>) -> Result<()> {
    send(
        out_tx,
        RunnerEvent::Terminal(runner_job_stream_request::Terminal {
            lines: lines.iter().map(convert::output_line_to_proto).collect(),
        }),
    )
    .await
}

async fn send_error(out_tx: &mpsc::Sender<RunnerJobStreamRequest>, error: &JobError) -> Result<()> {
    send(
        out_tx,
        RunnerEvent::Error(runner_job_stream_request::Error {
            error: Some(convert::job_error_to_proto(error)),
        }),
    )
    .await
}
