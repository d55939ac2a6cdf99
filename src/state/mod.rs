//! The state engine: durable operation history in redb plus in-memory job, runner and index
//! tables.
//!
//! # Layout
//!
//! - One redb table per [`OperationKind`] (key: record id, value: JSON record).
//! - `config_variables` (key: variable name, value: JSON).
//! - Jobs, runners, scope locks and the operation index live only in [`memdb::MemDb`]; the
//!   index is rebuilt from the durable tables on open and after a snapshot restore.

pub mod config_vars;
pub mod memdb;
pub mod operation;
pub mod runner;
pub mod snapshot;
pub mod timeindex;

use std::path::Path;

use redb::{Database, TableDefinition};
use tokio::sync::watch;

use crate::error::Result;
use crate::ops::OperationKind;
use crate::state::memdb::{MemDb, Topic};

pub use operation::{IndexRecord, OperationOrder, OrderBy, StatusFilter};
pub use runner::Runner;

pub(crate) type DurableTable = TableDefinition<'static, &'static str, &'static [u8]>;

pub(crate) const CONFIG_TABLE: DurableTable = TableDefinition::new("config_variables");

/// Durable table holding records of `kind`.
pub(crate) fn operation_table(kind: OperationKind) -> DurableTable {
    TableDefinition::new(kind.table_name())
}

pub struct StateStore {
    pub(crate) db: Database,
    pub(crate) mem: MemDb,
}

impl StateStore {
    /// Open (or create) the database file at `path` and rebuild the in-memory index.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        tracing::info!(path = %path.display(), "Opened state database");
        Self::init(db)
    }

    /// A store whose durable tables live in memory. Nothing survives the process.
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        let txn = db.begin_write()?;
        for kind in OperationKind::ALL {
            txn.open_table(operation_table(kind))?;
        }
        txn.open_table(CONFIG_TABLE)?;
        txn.commit()?;

        let store = Self {
            db,
            mem: MemDb::new(),
        };
        store.index_init()?;
        Ok(store)
    }

    /// Watch `topic`; see [`MemDb::subscribe`].
    pub fn subscribe(&self, topic: Topic) -> watch::Receiver<u64> {
        self.mem.subscribe(topic)
    }
}
