//! Per-scope serialization of non-parallel jobs.
//!
//! A scope is (project, application, workspace). While a non-parallelizable job of a scope is
//! WAITING or RUNNING it owns the scope's lock row, and other non-parallelizable jobs of that
//! scope are not eligible for assignment. Lock rows are written in the same in-memory
//! transaction as the job transition that takes or releases them.

use std::fmt;
use std::sync::Arc;

use crate::ops::ApplicationRef;
use crate::scheduler::job::Job;
use crate::state::memdb::{Tables, Topic, WriteTxn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeKey {
    pub project: String,
    pub application: String,
    pub workspace: String,
}

impl ScopeKey {
    pub fn new(app: &ApplicationRef, workspace: &str) -> Self {
        Self {
            project: app.project.clone(),
            application: app.application.clone(),
            workspace: workspace.to_string(),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.application, self.workspace)
    }
}

/// Whether `job` may not be assigned right now because another job holds its scope.
pub fn is_blocked(tables: &Tables, job: &Job) -> bool {
    if job.operation.is_parallelizable() {
        return false;
    }
    match tables.scope_locks.get(&job.scope()) {
        Some(owner) => *owner != job.id,
        None => false,
    }
}

/// Take the scope lock for `job`. No-op for parallelizable operations.
pub(crate) fn acquire(txn: &mut WriteTxn<'_>, job: &Job) {
    if job.operation.is_parallelizable() {
        return;
    }
    Arc::make_mut(&mut txn.tables.scope_locks).insert(job.scope(), job.id.clone());
    txn.touch(Topic::ScopeLocks);
    tracing::debug!(job_id = %job.id, scope = %job.scope(), "Scope locked");
}

/// Release the scope lock if `job` holds it.
pub(crate) fn release(txn: &mut WriteTxn<'_>, job: &Job) {
    if job.operation.is_parallelizable() {
        return;
    }
    let scope = job.scope();
    if txn.tables.scope_locks.get(&scope) != Some(&job.id) {
        return;
    }
    Arc::make_mut(&mut txn.tables.scope_locks).remove(&scope);
    txn.touch(Topic::ScopeLocks);
    tracing::debug!(job_id = %job.id, scope = %scope, "Scope unlocked");
}
