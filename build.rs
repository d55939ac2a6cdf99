//! Generates the tonic client and server for `waystation.v1.Orchestrator`.
//!
//! Message types are written by hand in `src/proto/messages.rs` with prost derives, so the
//! service is described with the manual builder and no protoc invocation is needed.

use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic::codec::ProstCodec";

/// (method name, route name, input type, output type, client streaming, server streaming)
const METHODS: &[(&str, &str, &str, &str, bool, bool)] = &[
    ("queue_job", "QueueJob", "QueueJobRequest", "QueueJobResponse", false, false),
    ("cancel_job", "CancelJob", "CancelJobRequest", "Empty", false, false),
    ("get_job", "GetJob", "GetJobRequest", "Job", false, false),
    ("list_jobs", "ListJobs", "ListJobsRequest", "ListJobsResponse", false, false),
    ("get_job_stream", "GetJobStream", "GetJobStreamRequest", "GetJobStreamResponse", false, true),
    ("runner_config", "RunnerConfig", "RunnerConfigRequest", "RunnerConfigResponse", false, true),
    ("runner_job_stream", "RunnerJobStream", "RunnerJobStreamRequest", "RunnerJobStreamResponse", true, true),
    ("set_config", "SetConfig", "SetConfigRequest", "Empty", false, false),
    ("get_config", "GetConfig", "GetConfigRequest", "GetConfigResponse", false, false),
    ("upsert_operation", "UpsertOperation", "UpsertOperationRequest", "OperationRecord", false, false),
    ("get_operation", "GetOperation", "GetOperationRequest", "OperationRecord", false, false),
    ("list_operations", "ListOperations", "ListOperationsRequest", "ListOperationsResponse", false, false),
    ("get_latest_operation", "GetLatestOperation", "GetLatestOperationRequest", "OperationRecord", false, false),
    ("entrypoint_log_stream", "EntrypointLogStream", "EntrypointLogBatch", "Empty", true, false),
    ("get_log_stream", "GetLogStream", "GetLogStreamRequest", "LogBatch", false, true),
];

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let mut service = Service::builder()
        .name("Orchestrator")
        .package("waystation.v1");

    for (name, route, input, output, client_streaming, server_streaming) in METHODS {
        let mut method = Method::builder()
            .name(*name)
            .route_name(*route)
            .input_type(format!("crate::proto::{}", input))
            .output_type(format!("crate::proto::{}", output))
            .codec_path(CODEC);
        if *client_streaming {
            method = method.client_streaming();
        }
        if *server_streaming {
            method = method.server_streaming();
        }
        service = service.method(method.build());
    }

    Builder::new().compile(&[service.build()]);
}
