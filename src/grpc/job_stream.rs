//! `GetJobStream`: a read-only view of one job's state changes and terminal output.

use tokio::sync::mpsc;
use tonic::Status;

use crate::grpc::convert;
use crate::grpc::ServiceContext;
use crate::proto::get_job_stream_response::{self, Event};
use crate::proto::{GetJobStreamResponse, JobState as ProtoJobState};
use crate::state::memdb::Topic;

pub type ResponseSender = mpsc::Sender<Result<GetJobStreamResponse, Status>>;

/// Lines per `Terminal` event.
const TERMINAL_BATCH: usize = 64;

async fn send(tx: &ResponseSender, event: Event) -> bool {
    tx.send(Ok(GetJobStreamResponse { event: Some(event) }))
        .await
        .is_ok()
}

/// Stream `Open`, then state changes and terminal batches, then `Complete` once the job is
/// terminal. A job that disappears (pruned) ends the stream with `NotFound` and drops its buffer.
pub async fn serve(ctx: ServiceContext, job_id: String, tx: ResponseSender) {
    if !send(&tx, Event::Open(get_job_stream_response::Open {})).await {
        return;
    }

    let mut jobs = ctx.state.subscribe(Topic::Jobs);
    let mut reader = ctx.outputs.get_or_create(&job_id).reader();
    let mut last_state: Option<crate::scheduler::JobState> = None;

    loop {
        let _ = jobs.borrow_and_update();
        let job = match ctx.state.job_get(&job_id) {
            Ok(job) => job,
            Err(e) => {
                tracing::debug!(job_id, error = %e, "Observed job is gone");
                // A prune may have run before the reader above recreated the buffer.
                ctx.outputs.remove(&job_id);
                let _ = tx.send(Err(Status::from(e))).await;
                return;
            }
        };

        if last_state != Some(job.state) {
            let previous = last_state
                .map(convert::job_state_to_proto)
                .unwrap_or(ProtoJobState::Unknown);
            let state = get_job_stream_response::State {
                previous: previous as i32,
                current: convert::job_state_to_proto(job.state) as i32,
            };
            if !send(&tx, Event::State(state)).await {
                return;
            }
            last_state = Some(job.state);
        }

        while let Some(batch) = reader.try_read(TERMINAL_BATCH) {
            let terminal = get_job_stream_response::Terminal {
                buffered: batch.buffered,
                lines: batch.entries.iter().map(convert::output_line_to_proto).collect(),
            };
            if !send(&tx, Event::Terminal(terminal)).await {
                return;
            }
        }

        if job.state.is_terminal() {
            let complete = get_job_stream_response::Complete {
                error: job.error.as_ref().map(convert::job_error_to_proto),
            };
            send(&tx, Event::Complete(complete)).await;
            tracing::debug!(job_id, "Job stream complete");
            return;
        }

        let output_open = !reader.is_finished();
        tokio::select! {
            _ = tx.closed() => return,
            _ = ctx.shutdown.cancelled() => return,
            _ = jobs.changed() => {}
            _ = reader.wait(), if output_open => {}
        }
    }
}
