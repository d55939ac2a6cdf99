use std::collections::BTreeMap;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::output::{OutputLine, OutputStream};
use crate::scheduler::{Job, JobError, JobOperation};

/// Runs the work of one job, streaming its output.
#[tonic::async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    /// Execute `job` with `env` exported. Output lines go to `output`; `cancel` asks the
    /// execution to stop early.
    async fn execute(
        &self,
        job: &Job,
        env: &BTreeMap<String, String>,
        output: mpsc::Sender<OutputLine>,
        cancel: CancellationToken,
    ) -> Result<(), JobError>;
}

/// Executes jobs as `sh -c <command>`, with one configured command per operation kind.
///
/// Noop jobs succeed without running anything.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    commands: BTreeMap<String, String>,
}

impl CommandExecutor {
    pub fn new(commands: BTreeMap<String, String>) -> Self {
        Self { commands }
    }

    /// Environment describing the job to its command.
    fn job_env(job: &Job) -> Vec<(String, String)> {
        let mut env = vec![
            ("WAYSTATION_JOB_ID".to_string(), job.id.clone()),
            ("WAYSTATION_PROJECT".to_string(), job.application.project.clone()),
            (
                "WAYSTATION_APPLICATION".to_string(),
                job.application.application.clone(),
            ),
            ("WAYSTATION_WORKSPACE".to_string(), job.workspace.clone()),
            (
                "WAYSTATION_OPERATION".to_string(),
                job.operation.kind().to_string(),
            ),
        ];
        let extra = match &job.operation {
            JobOperation::Build { disable_push } => {
                Some(("WAYSTATION_DISABLE_PUSH", disable_push.to_string()))
            }
            JobOperation::Push { build_id } => Some(("WAYSTATION_BUILD_ID", build_id.clone())),
            JobOperation::Deploy { artifact_id } => {
                Some(("WAYSTATION_ARTIFACT_ID", artifact_id.clone()))
            }
            JobOperation::Release { deployment_id, .. } | JobOperation::Destroy { deployment_id } => {
                Some(("WAYSTATION_DEPLOYMENT_ID", deployment_id.clone()))
            }
            JobOperation::StatusReport { target_id } => {
                Some(("WAYSTATION_TARGET_ID", target_id.clone()))
            }
            JobOperation::Noop | JobOperation::Validate | JobOperation::Auth | JobOperation::Up => {
                None
            }
        };
        if let Some((name, value)) = extra {
            env.push((name.to_string(), value));
        }
        if let JobOperation::Release { prune, .. } = &job.operation {
            env.push(("WAYSTATION_PRUNE".to_string(), prune.to_string()));
        }
        env
    }
}

async fn forward_lines<R>(reader: R, stream: OutputStream, output: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(text)) => {
                if output.send(OutputLine::new(stream, text)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Stopped reading job output");
                break;
            }
        }
    }
}

#[tonic::async_trait]
impl JobExecutor for CommandExecutor {
    async fn execute(
        &self,
        job: &Job,
        env: &BTreeMap<String, String>,
        output: mpsc::Sender<OutputLine>,
        cancel: CancellationToken,
    ) -> Result<(), JobError> {
        if job.operation == JobOperation::Noop {
            return Ok(());
        }
        let kind = job.operation.kind();
        let command = self
            .commands
            .get(kind)
            .ok_or_else(|| JobError::new(format!("no command configured for {} jobs", kind)))?;

        tracing::info!(job_id = %job.id, command, "Executing job");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .envs(env)
            .envs(Self::job_env(job))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| JobError::new(format!("failed to start command: {}", e)))?;

        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(tokio::spawn(forward_lines(
                stdout,
                OutputStream::Stdout,
                output.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(tokio::spawn(forward_lines(
                stderr,
                OutputStream::Stderr,
                output.clone(),
            )));
        }

        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                tracing::info!(job_id = %job.id, "Cancelling job, stopping command");
                if let Err(e) = child.kill().await {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to stop command");
                }
                for forwarder in forwarders {
                    let _ = forwarder.await;
                }
                return Err(JobError::new("job cancelled"));
            }
        };
        for forwarder in forwarders {
            let _ = forwarder.await;
        }

        match status {
            Ok(status) if status.success() => {
                tracing::info!(job_id = %job.id, "Job command succeeded");
                Ok(())
            }
            Ok(status) => {
                tracing::info!(job_id = %job.id, exit_code = ?status.code(), "Job command failed");
                Err(JobError::new(format!("exit code: {:?}", status.code())))
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Job execution failed");
                Err(JobError::new(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ApplicationRef;
    use crate::scheduler::JobTarget;

    fn job(operation: JobOperation) -> Job {
        let mut job = Job::new(
            ApplicationRef::new("p", "web"),
            "default",
            operation,
            JobTarget::Any,
        );
        job.id = "job-1".to_string();
        job
    }

    async fn run(
        executor: &CommandExecutor,
        job: &Job,
        env: BTreeMap<String, String>,
    ) -> (Result<(), JobError>, Vec<OutputLine>) {
        let (tx, mut rx) = mpsc::channel(64);
        let result = executor
            .execute(job, &env, tx, CancellationToken::new())
            .await;
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        (result, lines)
    }

    #[tokio::test]
    async fn noop_succeeds_without_command() {
        let executor = CommandExecutor::default();
        let (result, lines) = run(&executor, &job(JobOperation::Noop), BTreeMap::new()).await;
        assert!(result.is_ok());
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn missing_command_fails() {
        let executor = CommandExecutor::default();
        let (result, _) = run(&executor, &job(JobOperation::Up), BTreeMap::new()).await;
        assert!(result.unwrap_err().message.contains("up"));
    }

    #[tokio::test]
    async fn command_output_and_env_are_streamed() {
        let mut commands = BTreeMap::new();
        commands.insert(
            "deploy".to_string(),
            "echo $WAYSTATION_ARTIFACT_ID $GREETING; echo oops >&2".to_string(),
        );
        let executor = CommandExecutor::new(commands);
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hello".to_string());

        let (result, lines) = run(
            &executor,
            &job(JobOperation::Deploy {
                artifact_id: "a-1".into(),
            }),
            env,
        )
        .await;
        assert!(result.is_ok());
        assert!(lines
            .iter()
            .any(|l| l.stream == OutputStream::Stdout && l.text == "a-1 hello"));
        assert!(lines
            .iter()
            .any(|l| l.stream == OutputStream::Stderr && l.text == "oops"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let mut commands = BTreeMap::new();
        commands.insert("up".to_string(), "exit 3".to_string());
        let executor = CommandExecutor::new(commands);
        let (result, _) = run(&executor, &job(JobOperation::Up), BTreeMap::new()).await;
        assert!(result.unwrap_err().message.contains('3'));
    }

    #[tokio::test]
    async fn cancel_stops_command() {
        let mut commands = BTreeMap::new();
        commands.insert("up".to_string(), "sleep 30".to_string());
        let executor = CommandExecutor::new(commands);
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(8);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = executor
            .execute(&job(JobOperation::Up), &BTreeMap::new(), tx, cancel)
            .await;
        assert_eq!(result.unwrap_err().message, "job cancelled");
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
