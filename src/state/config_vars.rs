use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WaystationError};
use crate::state::memdb::Topic;
use crate::state::{StateStore, CONFIG_TABLE};

/// Stored form of a config variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigVariable {
    value: String,
    updated_at: DateTime<Utc>,
}

impl StateStore {
    /// Set and remove config variables in one durable transaction, then wake runner config
    /// streams.
    pub fn config_set(&self, set: &BTreeMap<String, String>, unset: &[String]) -> Result<()> {
        if set.keys().chain(unset.iter()).any(|name| name.is_empty()) {
            return Err(WaystationError::precondition("config variable name must be set"));
        }

        let now = Utc::now();
        let write = self.db.begin_write()?;
        {
            let mut table = write.open_table(CONFIG_TABLE)?;
            for (name, value) in set {
                let encoded = serde_json::to_vec(&ConfigVariable {
                    value: value.clone(),
                    updated_at: now,
                })?;
                table.insert(name.as_str(), encoded.as_slice())?;
            }
            for name in unset {
                table.remove(name.as_str())?;
            }
        }
        write.commit()?;

        tracing::info!(set = set.len(), unset = unset.len(), "Config variables updated");
        self.mem.notify(Topic::ConfigVariables);
        Ok(())
    }

    pub fn config_get_all(&self) -> Result<BTreeMap<String, String>> {
        let read = self.db.begin_read()?;
        let table = read.open_table(CONFIG_TABLE)?;
        let mut vars = BTreeMap::new();
        for entry in table.iter()? {
            let (name, value) = entry?;
            let var: ConfigVariable = serde_json::from_slice(value.value())?;
            vars.insert(name.value().to_string(), var.value);
        }
        Ok(vars)
    }
}
