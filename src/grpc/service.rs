use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};

use crate::grpc::convert;
use crate::grpc::{job_stream, log_stream, operation, runner_stream, ServiceContext};
use crate::proto::orchestrator_server::Orchestrator;
use crate::proto::{
    CancelJobRequest, Empty, EntrypointLogBatch, GetConfigRequest, GetConfigResponse,
    GetJobRequest, GetJobStreamRequest, GetJobStreamResponse, GetLatestOperationRequest,
    GetLogStreamRequest, GetOperationRequest, Job, ListJobsRequest, ListJobsResponse,
    ListOperationsRequest, ListOperationsResponse, LogBatch, OperationRecord, QueueJobRequest,
    QueueJobResponse, RunnerConfigRequest, RunnerConfigResponse, RunnerJobStreamRequest,
    RunnerJobStreamResponse, SetConfigRequest, UpsertOperationRequest,
};
use crate::state::memdb::Topic;
use crate::state::Runner;

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

const STREAM_CHANNEL_SIZE: usize = 32;

/// gRPC service for runners and clients.
pub struct OrchestratorService {
    ctx: ServiceContext,
}

impl OrchestratorService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }
}

#[tonic::async_trait]
impl Orchestrator for OrchestratorService {
    type GetJobStreamStream = ResponseStream<GetJobStreamResponse>;
    type RunnerConfigStream = ResponseStream<RunnerConfigResponse>;
    type RunnerJobStreamStream = ResponseStream<RunnerJobStreamResponse>;
    type GetLogStreamStream = ResponseStream<LogBatch>;

    async fn queue_job(
        &self,
        request: Request<QueueJobRequest>,
    ) -> Result<Response<QueueJobResponse>, Status> {
        let job = request
            .into_inner()
            .job
            .ok_or_else(|| Status::failed_precondition("job must be set"))?;
        let job = convert::job_from_proto(job)?;
        let job = self.ctx.state.job_create(job)?;
        Ok(Response::new(QueueJobResponse { job_id: job.id }))
    }

    async fn cancel_job(&self, request: Request<CancelJobRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.ctx.state.job_cancel(&req.job_id, req.force)?;
        Ok(Response::new(Empty {}))
    }

    async fn get_job(&self, request: Request<GetJobRequest>) -> Result<Response<Job>, Status> {
        let job = self.ctx.state.job_get(&request.into_inner().job_id)?;
        Ok(Response::new(convert::job_to_proto(&job)))
    }

    async fn list_jobs(
        &self,
        _request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        let jobs = self
            .ctx
            .state
            .job_list()
            .iter()
            .map(convert::job_to_proto)
            .collect();
        Ok(Response::new(ListJobsResponse { jobs }))
    }

    async fn get_job_stream(
        &self,
        request: Request<GetJobStreamRequest>,
    ) -> Result<Response<Self::GetJobStreamStream>, Status> {
        let job_id = request.into_inner().job_id;
        // Unknown ids fail the call itself rather than the stream.
        self.ctx.state.job_get(&job_id)?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_SIZE);
        tokio::spawn(job_stream::serve(self.ctx.clone(), job_id, tx));
        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::GetJobStreamStream
        ))
    }

    async fn runner_config(
        &self,
        request: Request<RunnerConfigRequest>,
    ) -> Result<Response<Self::RunnerConfigStream>, Status> {
        let runner = request
            .into_inner()
            .runner
            .ok_or_else(|| Status::failed_precondition("runner must be set"))?;
        let runner = Runner::new(runner.id, runner.labels.into_iter().collect());
        let runner_id = runner.id.clone();
        self.ctx.state.runner_create(runner)?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_SIZE);
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            loop {
                let mut changes = ctx.state.subscribe(Topic::ConfigVariables);
                let variables = match ctx.state.config_get_all() {
                    Ok(vars) => vars.into_iter().collect(),
                    Err(e) => {
                        let _ = tx.send(Err(Status::from(e))).await;
                        break;
                    }
                };
                if tx.send(Ok(RunnerConfigResponse { variables })).await.is_err() {
                    break;
                }
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ctx.shutdown.cancelled() => break,
                    _ = changes.changed() => {}
                }
            }
            ctx.state.runner_delete(&runner_id);
        });

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::RunnerConfigStream
        ))
    }

    async fn runner_job_stream(
        &self,
        request: Request<Streaming<RunnerJobStreamRequest>>,
    ) -> Result<Response<Self::RunnerJobStreamStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_SIZE);
        tokio::spawn(runner_stream::serve(self.ctx.clone(), inbound, tx));
        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::RunnerJobStreamStream
        ))
    }

    async fn set_config(&self, request: Request<SetConfigRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        let variables = req.variables.into_iter().collect();
        self.ctx.state.config_set(&variables, &req.unset)?;
        Ok(Response::new(Empty {}))
    }

    async fn get_config(
        &self,
        _request: Request<GetConfigRequest>,
    ) -> Result<Response<GetConfigResponse>, Status> {
        let variables = self.ctx.state.config_get_all()?.into_iter().collect();
        Ok(Response::new(GetConfigResponse { variables }))
    }

    async fn upsert_operation(
        &self,
        request: Request<UpsertOperationRequest>,
    ) -> Result<Response<OperationRecord>, Status> {
        let record = operation::upsert_operation(&self.ctx.state, request.into_inner())?;
        Ok(Response::new(record))
    }

    async fn get_operation(
        &self,
        request: Request<GetOperationRequest>,
    ) -> Result<Response<OperationRecord>, Status> {
        let record = operation::get_operation(&self.ctx.state, request.into_inner())?;
        Ok(Response::new(record))
    }

    async fn list_operations(
        &self,
        request: Request<ListOperationsRequest>,
    ) -> Result<Response<ListOperationsResponse>, Status> {
        let response = operation::list_operations(&self.ctx.state, request.into_inner())?;
        Ok(Response::new(response))
    }

    async fn get_latest_operation(
        &self,
        request: Request<GetLatestOperationRequest>,
    ) -> Result<Response<OperationRecord>, Status> {
        let record = operation::get_latest_operation(&self.ctx.state, request.into_inner())?;
        Ok(Response::new(record))
    }

    async fn entrypoint_log_stream(
        &self,
        request: Request<Streaming<EntrypointLogBatch>>,
    ) -> Result<Response<Empty>, Status> {
        log_stream::ingest(&self.ctx, request.into_inner()).await?;
        Ok(Response::new(Empty {}))
    }

    async fn get_log_stream(
        &self,
        request: Request<GetLogStreamRequest>,
    ) -> Result<Response<Self::GetLogStreamStream>, Status> {
        let deployment_id = request.into_inner().deployment_id;
        if deployment_id.is_empty() {
            return Err(Status::failed_precondition("deployment id must be set"));
        }
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_SIZE);
        tokio::spawn(log_stream::serve(self.ctx.clone(), deployment_id, tx));
        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::GetLogStreamStream
        ))
    }
}
