use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 9701;

/// Configuration for a waystation server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Directory holding the state database. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Lines retained per job output buffer.
    pub output_buffer_capacity: usize,
    /// Lines retained per deployment instance log buffer.
    pub instance_buffer_capacity: usize,
    pub prune_interval_ms: u64,
    /// Terminal jobs older than this are pruned.
    pub job_retention_secs: u64,
    /// Upper bound on retained terminal jobs.
    pub max_finished_jobs: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            data_dir: None,
            output_buffer_capacity: 1000,
            instance_buffer_capacity: 500,
            prune_interval_ms: 60_000,
            job_retention_secs: 3600,
            max_finished_jobs: 1000,
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Path of the state database, if the server is durable.
    pub fn db_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("state.redb"))
    }
}

/// Configuration for a runner agent.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Server URL, e.g. `http://127.0.0.1:9701`.
    pub server_addr: String,
    pub runner_id: String,
    pub labels: BTreeMap<String, String>,
    /// Shell command per job operation kind (`build`, `deploy`, ...). Kinds without a command
    /// fail, except `noop`, which always succeeds.
    pub operation_commands: BTreeMap<String, String>,
    /// Pause before reopening a job stream after a failure.
    pub reconnect_delay_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            server_addr: format!("http://127.0.0.1:{}", DEFAULT_PORT),
            runner_id: uuid::Uuid::new_v4().to_string(),
            labels: BTreeMap::new(),
            operation_commands: BTreeMap::new(),
            reconnect_delay_ms: 1000,
        }
    }
}

impl RunnerConfig {
    pub fn new(server_addr: impl Into<String>, runner_id: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            runner_id: runner_id.into(),
            ..Default::default()
        }
    }

    pub fn with_command(mut self, kind: impl Into<String>, command: impl Into<String>) -> Self {
        self.operation_commands.insert(kind.into(), command.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_default() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:9701");
        assert!(cfg.data_dir.is_none());
        assert!(cfg.db_path().is_none());
        assert_eq!(cfg.output_buffer_capacity, 1000);
        assert_eq!(cfg.max_finished_jobs, 1000);
    }

    #[test]
    fn server_config_db_path() {
        let cfg = ServerConfig::default().with_data_dir("/var/lib/waystation");
        assert_eq!(
            cfg.db_path(),
            Some(PathBuf::from("/var/lib/waystation/state.redb"))
        );
    }

    #[test]
    fn runner_config_default_has_unique_id() {
        let a = RunnerConfig::default();
        let b = RunnerConfig::default();
        assert_ne!(a.runner_id, b.runner_id);
        assert_eq!(a.server_addr, "http://127.0.0.1:9701");
    }

    #[test]
    fn runner_config_with_command() {
        let cfg = RunnerConfig::new("http://10.0.0.1:9701", "r1")
            .with_command("build", "make")
            .with_command("deploy", "./deploy.sh");
        assert_eq!(cfg.runner_id, "r1");
        assert_eq!(cfg.operation_commands.len(), 2);
        assert_eq!(cfg.operation_commands["build"], "make");
    }
}
