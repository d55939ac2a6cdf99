use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{Result, WaystationError};
use crate::state::memdb::Topic;
use crate::state::StateStore;

/// A connected runner. Lives only as long as its config stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Runner {
    pub id: String,
    pub labels: BTreeMap<String, String>,
    pub first_seen: DateTime<Utc>,
}

impl Runner {
    pub fn new(id: impl Into<String>, labels: BTreeMap<String, String>) -> Self {
        Self {
            id: id.into(),
            labels,
            first_seen: Utc::now(),
        }
    }
}

impl StateStore {
    /// Register a runner. Re-registering an id replaces its labels.
    pub fn runner_create(&self, runner: Runner) -> Result<()> {
        if runner.id.is_empty() {
            return Err(WaystationError::precondition("runner id must be set"));
        }

        let mut txn = self.mem.write();
        tracing::info!(runner_id = %runner.id, "Runner registered");
        Arc::make_mut(&mut txn.tables.runners).insert(runner.id.clone(), runner);
        txn.touch(Topic::Runners);
        txn.commit();
        Ok(())
    }

    pub fn runner_delete(&self, id: &str) {
        let mut txn = self.mem.write();
        if Arc::make_mut(&mut txn.tables.runners).remove(id).is_some() {
            txn.touch(Topic::Runners);
            txn.commit();
            tracing::info!(runner_id = %id, "Runner deregistered");
        }
    }

    pub fn runner_get(&self, id: &str) -> Result<Runner> {
        self.mem
            .snapshot()
            .runners
            .get(id)
            .cloned()
            .ok_or_else(|| WaystationError::not_found(format!("runner {:?}", id)))
    }

    pub fn runner_list(&self) -> Vec<Runner> {
        self.mem.snapshot().runners.values().cloned().collect()
    }
}
