//! Instance log ingestion and the merged per-deployment log stream.

use std::collections::BTreeMap;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tonic::Status;

use crate::error::{Result, WaystationError};
use crate::grpc::convert;
use crate::grpc::ServiceContext;
use crate::output::{merge_sorted, LogLine, Reader};
use crate::proto::{EntrypointLogBatch, LogBatch};

pub type ResponseSender = mpsc::Sender<std::result::Result<LogBatch, Status>>;

const READ_BATCH: usize = 256;

/// Write every inbound batch into its instance's buffer. The instance is deregistered when the
/// stream ends.
pub async fn ingest<S>(ctx: &ServiceContext, mut inbound: S) -> Result<()>
where
    S: Stream<Item = std::result::Result<EntrypointLogBatch, Status>> + Unpin,
{
    let mut instance: Option<String> = None;
    let result = loop {
        let batch = match inbound.next().await {
            Some(Ok(batch)) => batch,
            Some(Err(status)) => {
                tracing::debug!(error = %status, "Entrypoint log stream receive failed");
                break Ok(());
            }
            None => break Ok(()),
        };
        if batch.instance_id.is_empty() || batch.deployment_id.is_empty() {
            break Err(WaystationError::precondition(
                "log batch must name its instance and deployment",
            ));
        }
        match &instance {
            Some(id) if *id != batch.instance_id => {
                break Err(WaystationError::precondition(
                    "a log stream carries a single instance",
                ));
            }
            Some(_) => {}
            None => {
                tracing::info!(
                    instance_id = %batch.instance_id,
                    deployment_id = %batch.deployment_id,
                    "Instance log stream opened"
                );
                instance = Some(batch.instance_id.clone());
            }
        }

        let buffer = ctx
            .instances
            .register(&batch.instance_id, &batch.deployment_id);
        let instance_id = batch.instance_id;
        buffer.write_all(
            batch
                .lines
                .into_iter()
                .map(|line| convert::log_line_from_proto(&instance_id, line)),
        );
    };

    if let Some(id) = instance {
        ctx.instances.deregister(&id);
        tracing::info!(instance_id = %id, "Instance log stream closed");
    }
    result
}

fn drain(reader: &mut Reader<LogLine>) -> Vec<LogLine> {
    let mut lines = Vec::new();
    while let Some(batch) = reader.try_read(READ_BATCH) {
        lines.extend(batch.entries);
    }
    lines
}

async fn wait_any(readers: &mut BTreeMap<String, Reader<LogLine>>) {
    if readers.is_empty() {
        return std::future::pending().await;
    }
    let waits = readers.values_mut().map(|reader| Box::pin(reader.wait()));
    futures::future::select_all(waits).await;
}

/// Stream the logs of every instance of `deployment_id`, merged by timestamp, until the client
/// goes away or the server shuts down. Instances that appear later are picked up as they
/// register.
pub async fn serve(ctx: ServiceContext, deployment_id: String, tx: ResponseSender) {
    let mut readers: BTreeMap<String, Reader<LogLine>> = BTreeMap::new();
    let mut changes = ctx.instances.subscribe();

    loop {
        let _ = changes.borrow_and_update();
        for (instance_id, buffer) in ctx.instances.for_deployment(&deployment_id) {
            readers
                .entry(instance_id)
                .or_insert_with(|| buffer.reader());
        }

        let sources: Vec<String> = readers.keys().cloned().collect();
        let inputs: Vec<Vec<LogLine>> = readers.values_mut().map(drain).collect();
        let merged = merge_sorted(inputs);
        if !merged.is_empty() {
            let lines = merged
                .into_iter()
                .map(|tagged| {
                    let mut line = convert::log_line_to_proto(&tagged.entry);
                    line.instance_id = sources[tagged.source].clone();
                    line
                })
                .collect();
            let batch = LogBatch {
                deployment_id: deployment_id.clone(),
                lines,
            };
            if tx.send(Ok(batch)).await.is_err() {
                return;
            }
        }

        let before = readers.len();
        readers.retain(|_, reader| !reader.is_finished());
        if readers.len() != before {
            // A finished instance may already have been replaced by a new buffer.
            continue;
        }

        tokio::select! {
            _ = tx.closed() => return,
            _ = ctx.shutdown.cancelled() => return,
            _ = changes.changed() => {}
            _ = wait_any(&mut readers) => {}
        }
    }
}
