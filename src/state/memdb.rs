//! In-memory tables with snapshot reads and serialized writes.
//!
//! Readers take an `Arc` of the last committed [`Tables`] and never wait on writers. Writers
//! serialize on a mutex, mutate a private copy (each table is behind its own `Arc`, so only
//! touched tables are cloned), and publish it atomically on [`WriteTxn::commit`]. Dropping a
//! `WriteTxn` discards it.
//!
//! Blocking readers wait on per-[`Topic`] watch channels carrying a generation counter that is
//! bumped when a committed transaction touched the topic.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::sync::watch;

use crate::ops::OperationKind;
use crate::scheduler::job::Job;
use crate::scheduler::scope::ScopeKey;
use crate::state::operation::OperationIndex;
use crate::state::runner::Runner;
use crate::state::timeindex::TimeKey;

/// Data a blocking reader can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    /// Any job row changed.
    Jobs,
    /// A job entered or left the QUEUED state.
    QueuedJobs,
    ScopeLocks,
    Runners,
    ConfigVariables,
    Operations,
}

const TOPIC_COUNT: usize = 6;

impl Topic {
    fn slot(self) -> usize {
        match self {
            Topic::Jobs => 0,
            Topic::QueuedJobs => 1,
            Topic::ScopeLocks => 2,
            Topic::Runners => 3,
            Topic::ConfigVariables => 4,
            Topic::Operations => 5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub jobs: Arc<BTreeMap<String, Job>>,
    /// QUEUED jobs targeting any runner, by (queue time, id).
    pub queued_any: Arc<BTreeSet<(TimeKey, String)>>,
    /// QUEUED jobs targeting one runner, by (runner id, queue time, id).
    pub queued_targeted: Arc<BTreeSet<(String, TimeKey, String)>>,
    /// Scope lock → owning job id.
    pub scope_locks: Arc<BTreeMap<ScopeKey, String>>,
    pub runners: Arc<BTreeMap<String, Runner>>,
    pub operations: Arc<BTreeMap<OperationKind, OperationIndex>>,
}

pub struct MemDb {
    committed: RwLock<Arc<Tables>>,
    writer: Mutex<()>,
    topics: [watch::Sender<u64>; TOPIC_COUNT],
}

impl Default for MemDb {
    fn default() -> Self {
        Self::new()
    }
}

impl MemDb {
    pub fn new() -> Self {
        Self {
            committed: RwLock::new(Arc::new(Tables::default())),
            writer: Mutex::new(()),
            topics: std::array::from_fn(|_| watch::channel(0).0),
        }
    }

    /// Point-in-time view of every table.
    pub fn snapshot(&self) -> Arc<Tables> {
        self.committed.read().clone()
    }

    /// Begin a write transaction, waiting for any other writer to finish.
    pub fn write(&self) -> WriteTxn<'_> {
        let guard = self.writer.lock();
        let tables = (**self.committed.read()).clone();
        WriteTxn {
            db: self,
            _guard: guard,
            tables,
            touched: [false; TOPIC_COUNT],
        }
    }

    /// Receiver that resolves `changed()` on the next commit touching `topic`.
    ///
    /// Subscribe before taking the snapshot you intend to inspect so no commit is missed.
    pub fn subscribe(&self, topic: Topic) -> watch::Receiver<u64> {
        self.topics[topic.slot()].subscribe()
    }

    /// Wake watchers of `topic` for a change that lives outside the in-memory tables.
    pub fn notify(&self, topic: Topic) {
        self.topics[topic.slot()].send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

pub struct WriteTxn<'a> {
    db: &'a MemDb,
    _guard: MutexGuard<'a, ()>,
    pub tables: Tables,
    touched: [bool; TOPIC_COUNT],
}

impl WriteTxn<'_> {
    /// Record that this transaction changes `topic`; watchers fire on commit.
    pub fn touch(&mut self, topic: Topic) {
        self.touched[topic.slot()] = true;
    }

    pub fn commit(self) {
        let WriteTxn {
            db,
            _guard,
            tables,
            touched,
        } = self;
        *db.committed.write() = Arc::new(tables);
        // Publish before releasing the writer so watchers see this commit's snapshot.
        for (slot, changed) in touched.iter().enumerate() {
            if *changed {
                db.topics[slot].send_modify(|generation| *generation = generation.wrapping_add(1));
            }
        }
        drop(_guard);
    }
}
