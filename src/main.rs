use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_stream::StreamExt;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use waystation::config::{RunnerConfig, ServerConfig, DEFAULT_PORT};
use waystation::grpc::convert;
use waystation::node::Node;
use waystation::ops::ApplicationRef;
use waystation::proto::get_job_stream_response::Event as JobEvent;
use waystation::proto::orchestrator_client::OrchestratorClient;
use waystation::proto::{
    CancelJobRequest, GetConfigRequest, GetJobRequest, GetJobStreamRequest, ListJobsRequest,
    OutputStream, QueueJobRequest, SetConfigRequest,
};
use waystation::runner::{CommandExecutor, RunnerAgent};
use waystation::scheduler::{Job, JobOperation, JobTarget};
use waystation::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "waystation")]
#[command(version)]
#[command(about = "Deployment orchestration server: job queue, runners and operation history")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a waystation server
    Server(ServerArgs),

    /// Start a runner that executes jobs from a server
    Runner(RunnerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Runner configuration variables
    Config {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ConfigCommands,
    },
}

// =============================================================================
// Server and Runner Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port to listen on for gRPC
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Directory for the state database. Without it, state is kept in memory only.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Lines of terminal output retained per job
    #[arg(long, default_value = "1000")]
    output_buffer: usize,

    /// Seconds a finished job is kept before pruning
    #[arg(long, default_value = "3600")]
    job_retention_secs: u64,

    /// Maximum number of finished jobs kept
    #[arg(long, default_value = "1000")]
    max_finished_jobs: usize,
}

#[derive(Parser, Debug)]
struct RunnerArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:9701")]
    addr: String,

    /// Runner ID (random if not set)
    #[arg(long)]
    id: Option<String>,

    /// Runner labels (format: "key=value", repeatable)
    #[arg(long = "label", value_parser = parse_key_value)]
    labels: Vec<(String, String)>,

    /// Command per operation kind (format: "deploy=./deploy.sh", repeatable)
    #[arg(long = "command", value_parser = parse_key_value)]
    commands: Vec<(String, String)>,

    /// Milliseconds to wait before reconnecting after a failure
    #[arg(long, default_value = "1000")]
    reconnect_delay_ms: u64,
}

// =============================================================================
// Client Arguments (shared by job and config commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:9701")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OperationArg {
    Noop,
    Validate,
    Auth,
    Build,
    Push,
    Deploy,
    Release,
    Destroy,
    StatusReport,
    Up,
}

// =============================================================================
// Job and Config Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Queue a job
    Queue {
        /// Operation to run
        operation: OperationArg,

        /// Project name
        #[arg(long, short = 'p')]
        project: String,

        /// Application name
        #[arg(long)]
        app: String,

        /// Workspace
        #[arg(long, short = 'w', default_value = "default")]
        workspace: String,

        /// Run only on this runner
        #[arg(long)]
        runner: Option<String>,

        /// Record the operation refers to: build ID (push), artifact ID (deploy),
        /// deployment ID (release, destroy) or target ID (status-report)
        #[arg(long = "ref", default_value = "")]
        reference: String,

        /// Skip pushing after build
        #[arg(long)]
        disable_push: bool,

        /// Prune old deployments after release
        #[arg(long)]
        prune: bool,

        /// Job labels (format: "key=value", repeatable)
        #[arg(long = "label", value_parser = parse_key_value)]
        labels: Vec<(String, String)>,

        /// Stream the job's output until it finishes
        #[arg(long)]
        watch: bool,
    },
    /// Cancel a job
    Cancel {
        /// The job ID
        job_id: String,

        /// Mark the job failed immediately instead of waiting for the runner
        #[arg(long)]
        force: bool,
    },
    /// Get status of a specific job
    Status {
        /// The job ID
        job_id: String,
    },
    /// List all jobs
    List,
    /// Stream a job's state changes and output
    Watch {
        /// The job ID
        job_id: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigCommands {
    /// Set variables (format: "key=value") or unset them with --unset
    Set {
        #[arg(value_parser = parse_key_value)]
        variables: Vec<(String, String)>,

        #[arg(long)]
        unset: Vec<String>,
    },
    /// Show all variables
    Get,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobQueueOutput {
    job_id: String,
}

#[derive(Serialize)]
struct JobOutput {
    job_id: String,
    project: String,
    application: String,
    workspace: String,
    operation: String,
    state: String,
    assigned_runner: Option<String>,
    error: Option<String>,
    queue_time: String,
    complete_time: Option<String>,
    cancel_time: Option<String>,
}

impl From<&Job> for JobOutput {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            project: job.application.project.clone(),
            application: job.application.application.clone(),
            workspace: job.workspace.clone(),
            operation: job.operation.kind().to_string(),
            state: job.state.to_string(),
            assigned_runner: job.assigned_runner.clone(),
            error: job.error.as_ref().map(|e| e.message.clone()),
            queue_time: job.queue_time.to_rfc3339(),
            complete_time: job.complete_time.map(|t| t.to_rfc3339()),
            cancel_time: job.cancel_time.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Serialize)]
struct JobListOutput {
    jobs: Vec<JobOutput>,
    total_count: usize,
}

// =============================================================================
// Helper Functions
// =============================================================================

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {:?}", s)),
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("waystation=info")),
        )
        .init();
}

fn job_operation(operation: OperationArg, reference: String, disable_push: bool, prune: bool) -> JobOperation {
    match operation {
        OperationArg::Noop => JobOperation::Noop,
        OperationArg::Validate => JobOperation::Validate,
        OperationArg::Auth => JobOperation::Auth,
        OperationArg::Build => JobOperation::Build { disable_push },
        OperationArg::Push => JobOperation::Push { build_id: reference },
        OperationArg::Deploy => JobOperation::Deploy {
            artifact_id: reference,
        },
        OperationArg::Release => JobOperation::Release {
            deployment_id: reference,
            prune,
        },
        OperationArg::Destroy => JobOperation::Destroy {
            deployment_id: reference,
        },
        OperationArg::StatusReport => JobOperation::StatusReport { target_id: reference },
        OperationArg::Up => JobOperation::Up,
    }
}

async fn connect(addr: &str) -> CliResult<OrchestratorClient<Channel>> {
    let channel = Channel::from_shared(addr.to_string())?.connect().await?;
    Ok(OrchestratorClient::new(channel))
}

// =============================================================================
// Server and Runner
// =============================================================================

async fn run_server(args: ServerArgs) -> CliResult<()> {
    let listen_addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let config = ServerConfig {
        data_dir: args.data_dir,
        output_buffer_capacity: args.output_buffer,
        job_retention_secs: args.job_retention_secs,
        max_finished_jobs: args.max_finished_jobs,
        ..ServerConfig::new(listen_addr)
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        data_dir = ?config.data_dir,
        "Starting waystation server"
    );

    let shutdown = install_shutdown_handler()?;
    let node = Node::open(config)?;
    node.run(shutdown).await?;
    Ok(())
}

async fn run_runner(args: RunnerArgs) -> CliResult<()> {
    let mut config = RunnerConfig::new(
        args.addr,
        args.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    );
    config.labels = args.labels.into_iter().collect();
    config.operation_commands = args.commands.into_iter().collect();
    config.reconnect_delay_ms = args.reconnect_delay_ms;

    tracing::info!(
        runner_id = %config.runner_id,
        server = %config.server_addr,
        operations = ?config.operation_commands.keys().collect::<Vec<_>>(),
        "Starting waystation runner"
    );

    let shutdown = install_shutdown_handler()?;
    let executor = CommandExecutor::new(config.operation_commands.clone());
    RunnerAgent::new(config, executor).run(shutdown).await;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

fn print_job(job: &Job, output_format: &OutputFormat) -> CliResult<()> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&JobOutput::from(job))?);
        }
        OutputFormat::Table => {
            println!("Job ID:      {}", job.id);
            println!("Scope:       {}/{}/{}", job.application.project, job.application.application, job.workspace);
            println!("Operation:   {}", job.operation.kind());
            println!("State:       {}", job.state);
            if let Some(runner) = &job.assigned_runner {
                println!("Runner:      {}", runner);
            }
            println!("Queued:      {}", job.queue_time.to_rfc3339());
            if let Some(time) = job.complete_time {
                println!("Completed:   {}", time.to_rfc3339());
            }
            if let Some(time) = job.cancel_time {
                println!("Cancelled:   {}", time.to_rfc3339());
            }
            if let Some(error) = &job.error {
                println!("Error:       {}", error.message);
            }
        }
    }
    Ok(())
}

async fn handle_job_watch(client: &mut OrchestratorClient<Channel>, job_id: String) -> CliResult<()> {
    let mut stream = client
        .get_job_stream(GetJobStreamRequest { job_id })
        .await?
        .into_inner();

    while let Some(message) = stream.next().await {
        match message?.event {
            Some(JobEvent::State(state)) => {
                if let Some(current) = convert::job_state_from_proto(state.current) {
                    eprintln!("==> {}", current);
                }
            }
            Some(JobEvent::Terminal(terminal)) => {
                for line in terminal.lines {
                    match OutputStream::try_from(line.stream) {
                        Ok(OutputStream::Stderr) => eprintln!("{}", line.text),
                        Ok(OutputStream::Status) => eprintln!("--> {}", line.text),
                        _ => println!("{}", line.text),
                    }
                }
            }
            Some(JobEvent::Complete(complete)) => {
                if let Some(error) = complete.error {
                    return Err(format!("job failed: {}", error.message).into());
                }
                break;
            }
            Some(JobEvent::Open(_)) | None => {}
        }
    }
    Ok(())
}

async fn handle_job(
    client: &mut OrchestratorClient<Channel>,
    command: JobCommands,
    output_format: &OutputFormat,
) -> CliResult<()> {
    match command {
        JobCommands::Queue {
            operation,
            project,
            app,
            workspace,
            runner,
            reference,
            disable_push,
            prune,
            labels,
            watch,
        } => {
            let target = runner.map(JobTarget::Runner).unwrap_or(JobTarget::Any);
            let mut job = Job::new(
                ApplicationRef::new(project, app),
                workspace,
                job_operation(operation, reference, disable_push, prune),
                target,
            );
            job.labels = labels.into_iter().collect::<BTreeMap<_, _>>();

            let job_id = client
                .queue_job(QueueJobRequest {
                    job: Some(convert::job_to_proto(&job)),
                })
                .await?
                .into_inner()
                .job_id;
            match output_format {
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&JobQueueOutput {
                            job_id: job_id.clone()
                        })?
                    );
                }
                OutputFormat::Table => println!("Job ID: {}", job_id),
            }
            if watch {
                handle_job_watch(client, job_id).await?;
            }
        }
        JobCommands::Cancel { job_id, force } => {
            client
                .cancel_job(CancelJobRequest {
                    job_id: job_id.clone(),
                    force,
                })
                .await?;
            let job = client.get_job(GetJobRequest { job_id }).await?.into_inner();
            print_job(&convert::assigned_job_from_proto(job)?, output_format)?;
        }
        JobCommands::Status { job_id } => {
            let job = client.get_job(GetJobRequest { job_id }).await?.into_inner();
            print_job(&convert::assigned_job_from_proto(job)?, output_format)?;
        }
        JobCommands::List => {
            let jobs = client
                .list_jobs(ListJobsRequest {})
                .await?
                .into_inner()
                .jobs
                .into_iter()
                .map(convert::assigned_job_from_proto)
                .collect::<Result<Vec<_>, _>>()?;
            match output_format {
                OutputFormat::Json => {
                    let output = JobListOutput {
                        total_count: jobs.len(),
                        jobs: jobs.iter().map(JobOutput::from).collect(),
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!("{:<38} {:<9} {:<14} SCOPE", "JOB ID", "STATE", "OPERATION");
                        println!("{}", "-".repeat(80));
                        for job in &jobs {
                            println!(
                                "{:<38} {:<9} {:<14} {}/{}/{}",
                                job.id,
                                job.state.to_string(),
                                job.operation.kind(),
                                job.application.project,
                                job.application.application,
                                job.workspace
                            );
                        }
                        println!();
                        println!("{} jobs", jobs.len());
                    }
                }
            }
        }
        JobCommands::Watch { job_id } => handle_job_watch(client, job_id).await?,
    }
    Ok(())
}

async fn handle_config(
    client: &mut OrchestratorClient<Channel>,
    command: ConfigCommands,
    output_format: &OutputFormat,
) -> CliResult<()> {
    match command {
        ConfigCommands::Set { variables, unset } => {
            client
                .set_config(SetConfigRequest {
                    variables: variables.into_iter().collect(),
                    unset,
                })
                .await?;
            if let OutputFormat::Table = output_format {
                println!("Configuration updated.");
            }
        }
        ConfigCommands::Get => {
            let variables: BTreeMap<String, String> = client
                .get_config(GetConfigRequest {})
                .await?
                .into_inner()
                .variables
                .into_iter()
                .collect();
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&variables)?),
                OutputFormat::Table => {
                    for (key, value) in &variables {
                        println!("{}={}", key, value);
                    }
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> CliResult<()> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            init_logging();
            run_server(server_args).await?;
        }
        Commands::Runner(runner_args) => {
            init_logging();
            run_runner(runner_args).await?;
        }
        Commands::Job { client, command } => {
            let mut grpc_client = connect(&client.addr).await?;
            handle_job(&mut grpc_client, command, &client.output).await?;
        }
        Commands::Config { client, command } => {
            let mut grpc_client = connect(&client.addr).await?;
            handle_config(&mut grpc_client, command, &client.output).await?;
        }
    }

    Ok(())
}
