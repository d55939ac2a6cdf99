//! Job table, assignment engine and scope serialization.

pub mod assigner;
pub mod job;
pub mod queue;
pub mod scope;

pub use job::{Job, JobError, JobOperation, JobState, JobTarget};
pub use scope::ScopeKey;
