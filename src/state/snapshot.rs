//! Export and import of the durable tables as JSON lines.
//!
//! Jobs and runners are in-memory only and never appear in a snapshot.

use std::io::{BufRead, Write};

use redb::{ReadableTable, TableHandle};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WaystationError};
use crate::ops::OperationKind;
use crate::state::memdb::Topic;
use crate::state::{operation_table, DurableTable, StateStore, CONFIG_TABLE};

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    table: String,
    key: String,
    value: serde_json::Value,
}

fn durable_tables() -> Vec<DurableTable> {
    OperationKind::ALL
        .iter()
        .map(|kind| operation_table(*kind))
        .chain(std::iter::once(CONFIG_TABLE))
        .collect()
}

impl StateStore {
    /// Write every durable record to `out`, one JSON object per line. Returns the record count.
    pub fn snapshot_to<W: Write>(&self, mut out: W) -> Result<usize> {
        let read = self.db.begin_read()?;
        let mut count = 0;
        for def in durable_tables() {
            let table = read.open_table(def)?;
            for entry in table.iter()? {
                let (key, value) = entry?;
                let line = SnapshotEntry {
                    table: def.name().to_string(),
                    key: key.value().to_string(),
                    value: serde_json::from_slice(value.value())?,
                };
                serde_json::to_writer(&mut out, &line)?;
                out.write_all(b"\n")?;
                count += 1;
            }
        }
        out.flush()?;
        tracing::info!(records = count, "Snapshot written");
        Ok(count)
    }

    /// Replace every durable table with the contents of a snapshot and rebuild the operation
    /// index. The input is fully parsed before the database is touched.
    pub fn restore_from<R: BufRead>(&self, input: R) -> Result<usize> {
        let tables = durable_tables();
        let mut entries = Vec::new();
        for line in input.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: SnapshotEntry = serde_json::from_str(&line)?;
            if !tables.iter().any(|def| def.name() == entry.table) {
                return Err(WaystationError::precondition(format!(
                    "snapshot references unknown table {:?}",
                    entry.table
                )));
            }
            entries.push(entry);
        }

        let write = self.db.begin_write()?;
        for def in &tables {
            write.delete_table(*def)?;
            let mut table = write.open_table(*def)?;
            for entry in entries.iter().filter(|e| e.table == def.name()) {
                let encoded = serde_json::to_vec(&entry.value)?;
                table.insert(entry.key.as_str(), encoded.as_slice())?;
            }
        }
        write.commit()?;

        self.index_init()?;
        let mut txn = self.mem.write();
        txn.touch(Topic::ConfigVariables);
        txn.commit();

        tracing::info!(records = entries.len(), "Snapshot restored");
        Ok(entries.len())
    }
}
