//! The runner side: an agent that takes jobs from a server and an executor that runs them.
//!
//! Commands run via `sh -c` without sandboxing.

pub mod agent;
pub mod executor;

pub use agent::RunnerAgent;
pub use executor::{CommandExecutor, JobExecutor};
