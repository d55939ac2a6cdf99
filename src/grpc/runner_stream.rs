//! Server side of `RunnerJobStream`: one job per stream.
//!
//! A receive task forwards inbound runner events into a channel; the session loop selects over
//! those events, job-table changes (to deliver cancellation), the outbound stream closing and
//! server shutdown.

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tonic::Status;

use crate::error::{Result, WaystationError};
use crate::grpc::convert;
use crate::grpc::ServiceContext;
use crate::proto::runner_job_stream_request::Event as RunnerEvent;
use crate::proto::runner_job_stream_response::{self, Event as ServerEvent};
use crate::proto::{RunnerJobStreamRequest, RunnerJobStreamResponse};
use crate::scheduler::{Job, JobError};
use crate::state::memdb::Topic;

pub type ResponseSender = mpsc::Sender<std::result::Result<RunnerJobStreamResponse, Status>>;

const EVENT_CHANNEL_SIZE: usize = 32;

/// Run one runner session to completion. Protocol violations are reported on the stream.
pub async fn serve<S>(ctx: ServiceContext, inbound: S, tx: ResponseSender)
where
    S: Stream<Item = std::result::Result<RunnerJobStreamRequest, Status>> + Send + Unpin + 'static,
{
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
    let receiver = tokio::spawn(receive_loop(inbound, events_tx));

    let mut session = Session {
        ctx,
        events: events_rx,
        tx,
        cancel_sent: false,
    };
    if let Err(e) = session.run().await {
        match e {
            WaystationError::Cancelled => tracing::debug!("Runner session ended by shutdown"),
            e => {
                tracing::warn!(error = %e, "Runner session failed");
                let _ = session.tx.send(Err(Status::from(e))).await;
            }
        }
    }
    receiver.abort();
}

async fn receive_loop<S>(mut inbound: S, events: mpsc::Sender<RunnerEvent>)
where
    S: Stream<Item = std::result::Result<RunnerJobStreamRequest, Status>> + Unpin,
{
    while let Some(message) = inbound.next().await {
        match message {
            Ok(RunnerJobStreamRequest { event: Some(event) }) => {
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Ok(RunnerJobStreamRequest { event: None }) => {
                tracing::warn!("Runner sent an empty event");
            }
            Err(status) => {
                tracing::debug!(error = %status, "Runner stream receive failed");
                break;
            }
        }
    }
}

struct Session {
    ctx: ServiceContext,
    events: mpsc::Receiver<RunnerEvent>,
    tx: ResponseSender,
    cancel_sent: bool,
}

impl Session {
    async fn run(&mut self) -> Result<()> {
        let runner_id = self.open().await?;
        let Some(job) = self.assign(&runner_id).await? else {
            return Ok(());
        };

        let assignment = ServerEvent::Assignment(runner_job_stream_response::Assignment {
            job: Some(convert::job_to_proto(&job)),
        });
        if !self.send(assignment).await {
            tracing::warn!(job_id = %job.id, runner_id, "Runner left before assignment was sent");
            self.ctx.state.job_ack(&job.id, false)?;
            return Ok(());
        }

        if !self.await_ack(&job).await? {
            return Ok(());
        }
        self.run_job(&job).await
    }

    /// The first event must be a `Request` from a registered runner.
    async fn open(&mut self) -> Result<String> {
        let first = tokio::select! {
            event = self.events.recv() => event,
            _ = self.ctx.shutdown.cancelled() => return Err(WaystationError::Cancelled),
        };
        let runner_id = match first {
            Some(RunnerEvent::Request(request)) => request.runner_id,
            Some(_) => {
                return Err(WaystationError::precondition(
                    "first runner event must be a job request",
                ))
            }
            None => return Err(WaystationError::Cancelled),
        };
        if self.ctx.state.runner_get(&runner_id).is_err() {
            return Err(WaystationError::precondition(format!(
                "runner {:?} is not registered",
                runner_id
            )));
        }
        tracing::debug!(runner_id, "Runner requested a job");
        Ok(runner_id)
    }

    /// Block until a job is assigned. `None` if the runner went away first.
    async fn assign(&mut self, runner_id: &str) -> Result<Option<Job>> {
        let cancel = self.ctx.shutdown.child_token();
        loop {
            tokio::select! {
                assigned = self.ctx.state.job_assign_for_runner(&cancel, runner_id) => {
                    return assigned.map(Some);
                }
                event = self.events.recv() => match event {
                    None => {
                        tracing::debug!(runner_id, "Runner left while waiting for a job");
                        return Ok(None);
                    }
                    Some(_) => {
                        tracing::warn!(runner_id, "Ignoring runner event sent before assignment");
                    }
                },
                _ = self.tx.closed() => return Ok(None),
            }
        }
    }

    /// Wait for the runner's ack. Returns whether the job is now RUNNING on this stream.
    async fn await_ack(&mut self, job: &Job) -> Result<bool> {
        let mut jobs = self.ctx.state.subscribe(Topic::Jobs);
        loop {
            let _ = jobs.borrow_and_update();
            if self.deliver_cancel(&job.id).await? {
                // Force-cancelled while waiting for the ack.
                return Ok(false);
            }

            let event = tokio::select! {
                event = self.events.recv() => event,
                _ = jobs.changed() => continue,
                _ = self.ctx.shutdown.cancelled() => {
                    self.ctx.state.job_ack(&job.id, false)?;
                    return Err(WaystationError::Cancelled);
                }
            };

            match event {
                Some(RunnerEvent::Ack(ack)) if ack.accept => {
                    self.ctx.state.job_ack(&job.id, true)?;
                    return Ok(true);
                }
                Some(RunnerEvent::Ack(_)) => {
                    self.ctx.state.job_ack(&job.id, false)?;
                    return Ok(false);
                }
                Some(RunnerEvent::Error(error)) => {
                    let message = error.error.map(|e| e.message).unwrap_or_default();
                    tracing::info!(job_id = %job.id, error = %message, "Runner failed before ack, requeueing");
                    self.ctx.state.job_ack(&job.id, false)?;
                    return Ok(false);
                }
                None => {
                    tracing::warn!(job_id = %job.id, "Runner disconnected before ack, requeueing");
                    self.ctx.state.job_ack(&job.id, false)?;
                    return Ok(false);
                }
                Some(_) => {
                    self.ctx.state.job_ack(&job.id, false)?;
                    return Err(WaystationError::precondition(
                        "expected an ack for the assigned job",
                    ));
                }
            }
        }
    }

    async fn run_job(&mut self, job: &Job) -> Result<()> {
        let output = self.ctx.outputs.get_or_create(&job.id);
        let mut jobs = self.ctx.state.subscribe(Topic::Jobs);

        let outcome = loop {
            let _ = jobs.borrow_and_update();
            if self.deliver_cancel(&job.id).await? {
                tracing::info!(job_id = %job.id, "Job force-cancelled while running");
                break None;
            }

            let event = tokio::select! {
                event = self.events.recv() => event,
                _ = jobs.changed() => continue,
                _ = self.ctx.shutdown.cancelled() => {
                    break Some(Err(JobError::new("server shutting down")));
                }
            };

            match event {
                Some(RunnerEvent::Terminal(terminal)) => {
                    output.write_all(terminal.lines.into_iter().map(convert::output_line_from_proto));
                }
                Some(RunnerEvent::Download(download)) => {
                    self.ctx
                        .state
                        .job_update_data_source(&job.id, &download.data_source_ref)?;
                }
                Some(RunnerEvent::Complete(_)) => break Some(Ok(())),
                Some(RunnerEvent::Error(error)) => {
                    let message = error
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "runner reported an error".to_string());
                    break Some(Err(JobError::new(message)));
                }
                Some(RunnerEvent::Request(_) | RunnerEvent::Ack(_)) => {
                    tracing::warn!(job_id = %job.id, "Ignoring out-of-order runner event");
                }
                None => {
                    tracing::warn!(job_id = %job.id, "Runner disconnected while running job");
                    break Some(Err(JobError::new("runner disconnected")));
                }
            }
        };

        let result = match outcome {
            Some(outcome) => self.ctx.state.job_complete(&job.id, outcome).map(|_| ()),
            None => Ok(()),
        };
        output.close();
        result
    }

    /// Send `Cancel` once if the job's cancellation was requested. Returns true when the job is
    /// already terminal (force cancel) and the session should stop.
    async fn deliver_cancel(&mut self, job_id: &str) -> Result<bool> {
        let job = self.ctx.state.job_get(job_id)?;
        if job.cancel_time.is_some() && !self.cancel_sent {
            self.cancel_sent = true;
            tracing::info!(job_id, "Delivering cancel to runner");
            self.send(ServerEvent::Cancel(runner_job_stream_response::Cancel {}))
                .await;
        }
        Ok(job.state.is_terminal())
    }

    async fn send(&self, event: ServerEvent) -> bool {
        self.tx
            .send(Ok(RunnerJobStreamResponse { event: Some(event) }))
            .await
            .is_ok()
    }
}
