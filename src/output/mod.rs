//! Job terminal output and instance logs: ring buffers, the registries that own them, and
//! timestamp merging across sources.

pub mod buffer;
pub mod merge;
pub mod registry;

use chrono::{DateTime, Utc};

pub use buffer::{Batch, OutputBuffer, Reader};
pub use merge::{merge_sorted, Tagged, Timestamped};
pub use registry::{InstanceRegistry, OutputRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// Progress messages from the runner itself rather than the job's process.
    Status,
}

/// One line of a job's terminal output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputLine {
    pub timestamp: DateTime<Utc>,
    pub stream: OutputStream,
    pub text: String,
}

impl OutputLine {
    pub fn new(stream: OutputStream, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            text: text.into(),
        }
    }
}

impl Timestamped for OutputLine {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// One log line of a deployment instance.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub instance_id: String,
    pub line: String,
}

impl Timestamped for LogLine {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
