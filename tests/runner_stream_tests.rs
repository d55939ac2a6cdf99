//! Runner job sessions and job/log streams, driven in-process without a network listener.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};

use waystation::config::ServerConfig;
use waystation::grpc::{job_stream, log_stream, runner_stream, ServiceContext};
use waystation::node::Node;
use waystation::ops::ApplicationRef;
use waystation::proto::get_job_stream_response::Event as JobEvent;
use waystation::proto::runner_job_stream_request::{self, Event as RunnerEvent};
use waystation::proto::runner_job_stream_response::Event as ServerEvent;
use waystation::proto::{
    self, EntrypointLogBatch, GetJobStreamResponse, LogBatch, RunnerJobStreamRequest,
    RunnerJobStreamResponse, TerminalLine,
};
use waystation::scheduler::{Job, JobOperation, JobState, JobTarget};
use waystation::state::Runner;

const TIMEOUT: Duration = Duration::from_secs(3);

fn context() -> ServiceContext {
    let node = Node::open(ServerConfig::default()).unwrap();
    node.context(CancellationToken::new())
}

fn register(ctx: &ServiceContext, runner_id: &str) {
    ctx.state
        .runner_create(Runner::new(runner_id, BTreeMap::new()))
        .unwrap();
}

fn queue_deploy(ctx: &ServiceContext) -> Job {
    ctx.state
        .job_create(Job::new(
            ApplicationRef::new("acme", "web"),
            "default",
            JobOperation::Deploy {
                artifact_id: "artifact-1".to_string(),
            },
            JobTarget::Any,
        ))
        .unwrap()
}

/// The runner's end of one `RunnerJobStream`.
struct RunnerSession {
    to_server: Option<mpsc::Sender<Result<RunnerJobStreamRequest, Status>>>,
    from_server: mpsc::Receiver<Result<RunnerJobStreamResponse, Status>>,
    handle: JoinHandle<()>,
}

impl RunnerSession {
    async fn open(ctx: &ServiceContext, runner_id: &str) -> Self {
        let (to_server, inbound) = mpsc::channel(16);
        let (tx, from_server) = mpsc::channel(16);
        let handle = tokio::spawn(runner_stream::serve(
            ctx.clone(),
            ReceiverStream::new(inbound),
            tx,
        ));
        let session = Self {
            to_server: Some(to_server),
            from_server,
            handle,
        };
        session
            .send(RunnerEvent::Request(runner_job_stream_request::Request {
                runner_id: runner_id.to_string(),
            }))
            .await;
        session
    }

    async fn send(&self, event: RunnerEvent) {
        self.to_server
            .as_ref()
            .unwrap()
            .send(Ok(RunnerJobStreamRequest { event: Some(event) }))
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Option<Result<RunnerJobStreamResponse, Status>> {
        tokio::time::timeout(TIMEOUT, self.from_server.recv())
            .await
            .expect("server should respond")
    }

    async fn expect_assignment(&mut self) -> proto::Job {
        match self.recv().await {
            Some(Ok(RunnerJobStreamResponse {
                event: Some(ServerEvent::Assignment(assignment)),
            })) => assignment.job.unwrap(),
            other => panic!("expected an assignment, got {:?}", other),
        }
    }

    async fn ack(&self, accept: bool) {
        self.send(RunnerEvent::Ack(runner_job_stream_request::Ack { accept }))
            .await;
    }

    async fn error(&self, message: &str) {
        self.send(RunnerEvent::Error(runner_job_stream_request::Error {
            error: Some(proto::JobError {
                message: message.to_string(),
            }),
        }))
        .await;
    }

    async fn complete(&self) {
        self.send(RunnerEvent::Complete(runner_job_stream_request::Complete {}))
            .await;
    }

    /// Drop the request side, as a disconnecting runner would.
    fn disconnect(&mut self) {
        self.to_server = None;
    }

    /// Wait for the server to end the session.
    async fn finished(self) {
        tokio::time::timeout(TIMEOUT, self.handle)
            .await
            .expect("session should end")
            .unwrap();
    }
}

async fn wait_for_state(ctx: &ServiceContext, job_id: &str, state: JobState) -> Job {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let job = ctx.state.job_get(job_id).unwrap();
        if job.state == state {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {}, expected {}",
            job_id,
            job.state,
            state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn line(text: &str) -> TerminalLine {
    TerminalLine {
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
        stream: proto::OutputStream::Stdout as i32,
        text: text.to_string(),
    }
}

// =============================================================================
// Runner job stream
// =============================================================================

#[tokio::test]
async fn test_unregistered_runner_is_rejected() {
    let ctx = context();
    queue_deploy(&ctx);

    let mut session = RunnerSession::open(&ctx, "stranger").await;
    match session.recv().await {
        Some(Err(status)) => assert_eq!(status.code(), Code::FailedPrecondition),
        other => panic!("expected a precondition failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_first_event_must_be_request() {
    let ctx = context();
    let (to_server, inbound) = mpsc::channel(4);
    let (tx, mut from_server) = mpsc::channel(4);
    tokio::spawn(runner_stream::serve(
        ctx.clone(),
        ReceiverStream::new(inbound),
        tx,
    ));
    to_server
        .send(Ok(RunnerJobStreamRequest {
            event: Some(RunnerEvent::Complete(
                runner_job_stream_request::Complete {},
            )),
        }))
        .await
        .unwrap();

    let response = tokio::time::timeout(TIMEOUT, from_server.recv()).await.unwrap();
    assert_eq!(response.unwrap().unwrap_err().code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn test_successful_job_records_output() {
    let ctx = context();
    register(&ctx, "r1");
    let job = queue_deploy(&ctx);

    let mut session = RunnerSession::open(&ctx, "r1").await;
    let assigned = session.expect_assignment().await;
    assert_eq!(assigned.id, job.id);
    assert_eq!(assigned.assigned_runner, "r1");

    session.ack(true).await;
    wait_for_state(&ctx, &job.id, JobState::Running).await;

    session
        .send(RunnerEvent::Download(runner_job_stream_request::Download {
            data_source_ref: "git:abc123".to_string(),
        }))
        .await;
    session
        .send(RunnerEvent::Terminal(runner_job_stream_request::Terminal {
            lines: vec![line("pulling image"), line("deployed")],
        }))
        .await;
    session.complete().await;
    session.finished().await;

    let done = ctx.state.job_get(&job.id).unwrap();
    assert_eq!(done.state, JobState::Success);
    assert_eq!(done.data_source_ref.as_deref(), Some("git:abc123"));

    let output = ctx.outputs.get(&job.id).unwrap();
    assert!(output.is_closed());
    let texts: Vec<String> = output.contents().into_iter().map(|l| l.text).collect();
    assert_eq!(texts, vec!["pulling image", "deployed"]);
}

#[tokio::test]
async fn test_nack_requeues_job() {
    let ctx = context();
    register(&ctx, "r1");
    let job = queue_deploy(&ctx);

    let mut session = RunnerSession::open(&ctx, "r1").await;
    session.expect_assignment().await;
    session.ack(false).await;
    session.finished().await;

    let requeued = ctx.state.job_get(&job.id).unwrap();
    assert_eq!(requeued.state, JobState::Queued);
    assert!(requeued.assigned_runner.is_none());
}

#[tokio::test]
async fn test_error_before_ack_requeues_job() {
    let ctx = context();
    register(&ctx, "r1");
    let job = queue_deploy(&ctx);

    let mut session = RunnerSession::open(&ctx, "r1").await;
    session.expect_assignment().await;
    session.error("could not decode job").await;
    session.finished().await;

    assert_eq!(ctx.state.job_get(&job.id).unwrap().state, JobState::Queued);
}

#[tokio::test]
async fn test_disconnect_before_ack_requeues_job() {
    let ctx = context();
    register(&ctx, "r1");
    let job = queue_deploy(&ctx);

    let mut session = RunnerSession::open(&ctx, "r1").await;
    session.expect_assignment().await;
    session.disconnect();
    session.finished().await;

    assert_eq!(ctx.state.job_get(&job.id).unwrap().state, JobState::Queued);
}

#[tokio::test]
async fn test_error_after_ack_fails_job() {
    let ctx = context();
    register(&ctx, "r1");
    let job = queue_deploy(&ctx);

    let mut session = RunnerSession::open(&ctx, "r1").await;
    session.expect_assignment().await;
    session.ack(true).await;
    session.error("exit code: Some(2)").await;
    session.finished().await;

    let failed = ctx.state.job_get(&job.id).unwrap();
    assert_eq!(failed.state, JobState::Error);
    assert_eq!(failed.error.unwrap().message, "exit code: Some(2)");
}

#[tokio::test]
async fn test_disconnect_while_running_fails_job() {
    let ctx = context();
    register(&ctx, "r1");
    let job = queue_deploy(&ctx);

    let mut session = RunnerSession::open(&ctx, "r1").await;
    session.expect_assignment().await;
    session.ack(true).await;
    wait_for_state(&ctx, &job.id, JobState::Running).await;
    session.disconnect();
    session.finished().await;

    let failed = ctx.state.job_get(&job.id).unwrap();
    assert_eq!(failed.state, JobState::Error);
    assert_eq!(failed.error.unwrap().message, "runner disconnected");
}

#[tokio::test]
async fn test_cancel_is_delivered_and_runner_may_finish() {
    let ctx = context();
    register(&ctx, "r1");
    let job = queue_deploy(&ctx);

    let mut session = RunnerSession::open(&ctx, "r1").await;
    session.expect_assignment().await;
    session.ack(true).await;
    wait_for_state(&ctx, &job.id, JobState::Running).await;

    ctx.state.job_cancel(&job.id, false).unwrap();
    match session.recv().await {
        Some(Ok(RunnerJobStreamResponse {
            event: Some(ServerEvent::Cancel(_)),
        })) => {}
        other => panic!("expected a cancel, got {:?}", other),
    }

    session.complete().await;
    session.finished().await;

    let done = ctx.state.job_get(&job.id).unwrap();
    assert_eq!(done.state, JobState::Success);
    assert!(done.cancel_time.is_some());
}

#[tokio::test]
async fn test_force_cancel_ends_session() {
    let ctx = context();
    register(&ctx, "r1");
    let job = queue_deploy(&ctx);

    let mut session = RunnerSession::open(&ctx, "r1").await;
    session.expect_assignment().await;
    session.ack(true).await;
    wait_for_state(&ctx, &job.id, JobState::Running).await;

    ctx.state.job_cancel(&job.id, true).unwrap();
    // The runner is told to stop, then the session ends without waiting for it.
    match session.recv().await {
        Some(Ok(RunnerJobStreamResponse {
            event: Some(ServerEvent::Cancel(_)),
        })) => {}
        other => panic!("expected a cancel, got {:?}", other),
    }
    session.finished().await;

    let cancelled = ctx.state.job_get(&job.id).unwrap();
    assert_eq!(cancelled.state, JobState::Error);
    assert_eq!(cancelled.error.unwrap().message, "job force cancelled");
}

#[tokio::test]
async fn test_shutdown_unblocks_waiting_runner() {
    let node = Node::open(ServerConfig::default()).unwrap();
    let shutdown = CancellationToken::new();
    let ctx = node.context(shutdown.clone());
    register(&ctx, "r1");

    let session = RunnerSession::open(&ctx, "r1").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();
    session.finished().await;
}

// =============================================================================
// Job stream
// =============================================================================

async fn next_job_event(rx: &mut mpsc::Receiver<Result<GetJobStreamResponse, Status>>) -> JobEvent {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("job stream should send an event")
        .expect("job stream should stay open")
        .unwrap()
        .event
        .unwrap()
}

#[tokio::test]
async fn test_job_stream_follows_job_to_completion() {
    let ctx = context();
    register(&ctx, "r1");
    let job = queue_deploy(&ctx);

    let (tx, mut rx) = mpsc::channel(32);
    tokio::spawn(job_stream::serve(ctx.clone(), job.id.clone(), tx));

    assert!(matches!(next_job_event(&mut rx).await, JobEvent::Open(_)));
    match next_job_event(&mut rx).await {
        JobEvent::State(state) => {
            assert_eq!(state.previous, proto::JobState::Unknown as i32);
            assert_eq!(state.current, proto::JobState::Queued as i32);
        }
        other => panic!("expected a state event, got {:?}", other),
    }

    let mut session = RunnerSession::open(&ctx, "r1").await;
    session.expect_assignment().await;
    session.ack(true).await;
    session
        .send(RunnerEvent::Terminal(runner_job_stream_request::Terminal {
            lines: vec![line("hello")],
        }))
        .await;
    session.complete().await;
    session.finished().await;

    let mut states = Vec::new();
    let mut lines = Vec::new();
    loop {
        match next_job_event(&mut rx).await {
            JobEvent::State(state) => states.push(state.current),
            JobEvent::Terminal(terminal) => {
                lines.extend(terminal.lines.into_iter().map(|l| l.text))
            }
            JobEvent::Complete(complete) => {
                assert!(complete.error.is_none());
                break;
            }
            JobEvent::Open(_) => panic!("open sent twice"),
        }
    }
    assert_eq!(lines, vec!["hello"]);
    assert_eq!(states.last(), Some(&(proto::JobState::Success as i32)));
}

#[tokio::test]
async fn test_job_stream_of_finished_job_replays_output() {
    let ctx = context();
    let job = queue_deploy(&ctx);
    let output = ctx.outputs.get_or_create(&job.id);
    output.write(waystation::output::OutputLine::new(
        waystation::output::OutputStream::Stdout,
        "earlier",
    ));
    ctx.state.job_cancel(&job.id, false).unwrap();

    let (tx, mut rx) = mpsc::channel(32);
    tokio::spawn(job_stream::serve(ctx.clone(), job.id.clone(), tx));

    assert!(matches!(next_job_event(&mut rx).await, JobEvent::Open(_)));
    assert!(matches!(next_job_event(&mut rx).await, JobEvent::State(_)));
    match next_job_event(&mut rx).await {
        JobEvent::Terminal(terminal) => {
            assert!(terminal.buffered);
            assert_eq!(terminal.lines[0].text, "earlier");
        }
        other => panic!("expected buffered output, got {:?}", other),
    }
    match next_job_event(&mut rx).await {
        JobEvent::Complete(complete) => {
            assert_eq!(complete.error.unwrap().message, "job cancelled")
        }
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_job_stream_of_pruned_job_leaves_no_buffer() {
    let ctx = context();
    let job = queue_deploy(&ctx);
    ctx.state.job_cancel(&job.id, false).unwrap();
    // Prune between the existence check in the RPC and the stream task starting.
    let removed = ctx.state.job_prune(chrono::Utc::now() + chrono::Duration::seconds(1), 0);
    assert_eq!(removed, vec![job.id.clone()]);
    ctx.outputs.remove(&job.id);

    let (tx, mut rx) = mpsc::channel(32);
    let handle = tokio::spawn(job_stream::serve(ctx.clone(), job.id.clone(), tx));

    assert!(matches!(next_job_event(&mut rx).await, JobEvent::Open(_)));
    let status = tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("stream should end")
        .expect("stream should report the missing job")
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap();
    assert!(ctx.outputs.get(&job.id).is_none());
}

// =============================================================================
// Log stream
// =============================================================================

fn log_batch(instance_id: &str, deployment_id: &str, entries: &[(i64, &str)]) -> EntrypointLogBatch {
    EntrypointLogBatch {
        instance_id: instance_id.to_string(),
        deployment_id: deployment_id.to_string(),
        lines: entries
            .iter()
            .map(|(ms, text)| proto::LogLine {
                timestamp_ms: *ms,
                line: text.to_string(),
                instance_id: String::new(),
            })
            .collect(),
    }
}

async fn collect_log_lines(
    rx: &mut mpsc::Receiver<Result<LogBatch, Status>>,
    want: usize,
) -> Vec<proto::LogLine> {
    let mut lines = Vec::new();
    while lines.len() < want {
        let batch = tokio::time::timeout(TIMEOUT, rx.recv())
            .await
            .expect("log stream should send a batch")
            .unwrap()
            .unwrap();
        lines.extend(batch.lines);
    }
    lines
}

#[tokio::test]
async fn test_log_stream_merges_instances_by_time() {
    let ctx = context();

    let (a_tx, a_rx) = mpsc::channel(4);
    let (b_tx, b_rx) = mpsc::channel(4);
    a_tx.send(Ok(log_batch("inst-a", "dep-1", &[(1000, "a1"), (3000, "a3")])))
        .await
        .unwrap();
    b_tx.send(Ok(log_batch("inst-b", "dep-1", &[(2000, "b2")])))
        .await
        .unwrap();
    // Another deployment's logs stay out of the stream.
    let (c_tx, c_rx) = mpsc::channel(4);
    c_tx.send(Ok(log_batch("inst-c", "dep-2", &[(1500, "c")])))
        .await
        .unwrap();

    for rx in [a_rx, b_rx, c_rx] {
        let ctx = ctx.clone();
        tokio::spawn(async move { log_stream::ingest(&ctx, ReceiverStream::new(rx)).await });
    }
    // Wait until all three instances have registered.
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while ctx.instances.for_deployment("dep-1").len() < 2
        || ctx.instances.for_deployment("dep-2").is_empty()
    {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (tx, mut rx) = mpsc::channel(16);
    tokio::spawn(log_stream::serve(ctx.clone(), "dep-1".to_string(), tx));

    let lines = collect_log_lines(&mut rx, 3).await;
    let texts: Vec<&str> = lines.iter().map(|l| l.line.as_str()).collect();
    assert_eq!(texts, vec!["a1", "b2", "a3"]);
    assert_eq!(lines[1].instance_id, "inst-b");

    // Lines written after the stream opened are delivered live.
    b_tx.send(Ok(log_batch("inst-b", "dep-1", &[(4000, "b4")])))
        .await
        .unwrap();
    let live = collect_log_lines(&mut rx, 1).await;
    assert_eq!(live[0].line, "b4");
    drop((a_tx, b_tx, c_tx));
}

#[tokio::test]
async fn test_log_ingest_rejects_second_instance() {
    let ctx = context();
    let (tx, rx) = mpsc::channel(4);
    tx.send(Ok(log_batch("inst-a", "dep-1", &[(1, "x")])))
        .await
        .unwrap();
    tx.send(Ok(log_batch("inst-b", "dep-1", &[(2, "y")])))
        .await
        .unwrap();
    drop(tx);

    let err = log_stream::ingest(&ctx, ReceiverStream::new(rx))
        .await
        .unwrap_err();
    assert_eq!(Status::from(err).code(), Code::FailedPrecondition);
    // The instance is deregistered when its stream ends.
    assert!(ctx.instances.for_deployment("dep-1").is_empty());
}
