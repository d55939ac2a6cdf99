//! Generic CRUD and time-ordered listing for operation records.
//!
//! The durable write and the index update are two separate transactions. The in-memory writer is
//! taken before the redb commit and published after it, so the index sees writes in the same
//! order redb does.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::ReadableTable;

use crate::error::{Result, WaystationError};
use crate::ops::{
    ApplicationRef, Artifact, Build, Deployment, Operation, OperationKind, OperationState,
    Release, StatusReport,
};
use crate::state::memdb::Topic;
use crate::state::timeindex::{self, TimeKey};
use crate::state::{operation_table, StateStore};

/// (project, application, time key, id)
type IndexKey = (String, String, TimeKey, String);

/// In-memory projection of one durable record.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub id: String,
    pub project: String,
    pub application: String,
    pub state: OperationState,
    pub start_time: DateTime<Utc>,
    pub complete_time: Option<DateTime<Utc>>,
}

impl IndexRecord {
    pub fn from_operation<T: Operation>(op: &T) -> Self {
        let app = op.application();
        let status = op.status();
        Self {
            id: op.id().to_string(),
            project: app.project.clone(),
            application: app.application.clone(),
            state: status.state,
            start_time: status.start_time,
            complete_time: status.complete_time,
        }
    }

    fn start_key(&self) -> IndexKey {
        (
            self.project.clone(),
            self.application.clone(),
            timeindex::descending(self.start_time),
            self.id.clone(),
        )
    }

    fn complete_key(&self) -> IndexKey {
        (
            self.project.clone(),
            self.application.clone(),
            timeindex::descending_opt(self.complete_time),
            self.id.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderBy {
    #[default]
    StartTime,
    CompleteTime,
}

#[derive(Debug, Clone, Default)]
pub struct OperationOrder {
    pub by: OrderBy,
    /// Oldest first instead of the default newest first.
    pub ascending: bool,
    pub limit: Option<usize>,
}

/// Groups of required states. A record passes if every state in at least one group matches;
/// no groups means no filtering.
#[derive(Debug, Clone, Default)]
pub struct StatusFilter {
    pub groups: Vec<Vec<OperationState>>,
}

impl StatusFilter {
    pub fn any_of(states: &[OperationState]) -> Self {
        Self {
            groups: states.iter().map(|s| vec![*s]).collect(),
        }
    }

    pub fn matches(&self, state: OperationState) -> bool {
        self.groups.is_empty()
            || self
                .groups
                .iter()
                .any(|group| group.iter().all(|wanted| *wanted == state))
    }
}

/// Start-time and complete-time indexes for one operation kind.
#[derive(Debug, Clone, Default)]
pub struct OperationIndex {
    records: HashMap<String, IndexRecord>,
    by_start: BTreeSet<IndexKey>,
    by_complete: BTreeSet<IndexKey>,
}

impl OperationIndex {
    pub fn insert(&mut self, record: IndexRecord) {
        if let Some(old) = self.records.remove(&record.id) {
            self.by_start.remove(&old.start_key());
            self.by_complete.remove(&old.complete_key());
        }
        self.by_start.insert(record.start_key());
        self.by_complete.insert(record.complete_key());
        self.records.insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<&IndexRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records of `app`, newest first by `by`.
    pub fn scan<'a>(
        &'a self,
        by: OrderBy,
        app: &'a ApplicationRef,
    ) -> impl Iterator<Item = &'a IndexRecord> + 'a {
        let index = match by {
            OrderBy::StartTime => &self.by_start,
            OrderBy::CompleteTime => &self.by_complete,
        };
        // The smallest descending key is the latest time.
        let lower: IndexKey = (
            app.project.clone(),
            app.application.clone(),
            [0u8; 8],
            String::new(),
        );
        index
            .range(lower..)
            // Lower-bound scans run past the app; the set is sorted so the first miss ends it.
            .take_while(move |(project, application, _, _)| {
                *project == app.project && *application == app.application
            })
            .filter_map(move |(_, _, _, id)| self.records.get(id))
    }
}

impl StateStore {
    /// Insert (`update == false`) or replace (`update == true`) a record.
    ///
    /// The id must already be set; new ids come from [`crate::ops::generate_id`].
    pub fn operation_put<T: Operation>(&self, update: bool, record: &T) -> Result<()> {
        let id = record.id();
        if id.is_empty() {
            return Err(WaystationError::precondition(format!(
                "{} id must be set before it is stored",
                T::KIND
            )));
        }
        let encoded = serde_json::to_vec(record)?;
        let table_def = operation_table(T::KIND);

        let write = self.db.begin_write()?;
        let exists = {
            let table = write.open_table(table_def)?;
            let found = table.get(id)?.is_some();
            found
        };
        if update && !exists {
            write.abort()?;
            return Err(WaystationError::not_found(format!("{} {:?}", T::KIND, id)));
        }
        if !update && exists {
            write.abort()?;
            return Err(WaystationError::precondition(format!(
                "{} {:?} already exists",
                T::KIND,
                id
            )));
        }
        {
            let mut table = write.open_table(table_def)?;
            table.insert(id, encoded.as_slice())?;
        }
        // Index writes must land in durable commit order; a failed commit drops `txn` unpublished.
        let mut txn = self.mem.write();
        write.commit()?;

        Arc::make_mut(&mut txn.tables.operations)
            .entry(T::KIND)
            .or_default()
            .insert(IndexRecord::from_operation(record));
        txn.touch(Topic::Operations);
        txn.commit();

        tracing::debug!(kind = %T::KIND, id, update, "Operation stored");
        Ok(())
    }

    pub fn operation_get<T: Operation>(&self, id: &str) -> Result<T> {
        let read = self.db.begin_read()?;
        let table = read.open_table(operation_table(T::KIND))?;
        match table.get(id)? {
            Some(value) => Ok(serde_json::from_slice(value.value())?),
            None => Err(WaystationError::not_found(format!("{} {:?}", T::KIND, id))),
        }
    }

    /// Records of `app` passing `filter`, ordered by the requested time field.
    pub fn operation_list<T: Operation>(
        &self,
        app: &ApplicationRef,
        filter: &StatusFilter,
        order: &OperationOrder,
    ) -> Result<Vec<T>> {
        let snapshot = self.mem.snapshot();
        let Some(index) = snapshot.operations.get(&T::KIND) else {
            return Ok(Vec::new());
        };
        let limit = order.limit.unwrap_or(usize::MAX);

        let matching = index
            .scan(order.by, app)
            .filter(|record| filter.matches(record.state))
            .map(|record| record.id.as_str());
        let ids: Vec<&str> = if order.ascending {
            let mut all: Vec<&str> = matching.collect();
            all.reverse();
            all.truncate(limit);
            all
        } else {
            matching.take(limit).collect()
        };

        self.fetch_many(&ids)
    }

    /// The SUCCESS record of `app` with the latest complete time, if any.
    pub fn operation_latest<T: Operation>(&self, app: &ApplicationRef) -> Result<Option<T>> {
        let snapshot = self.mem.snapshot();
        let Some(index) = snapshot.operations.get(&T::KIND) else {
            return Ok(None);
        };
        let found = index
            .scan(OrderBy::CompleteTime, app)
            .find(|record| record.state == OperationState::Success)
            .map(|record| record.id.clone());
        match found {
            Some(id) => self.operation_get(&id).map(Some),
            None => Ok(None),
        }
    }

    fn fetch_many<T: Operation>(&self, ids: &[&str]) -> Result<Vec<T>> {
        let read = self.db.begin_read()?;
        let table = read.open_table(operation_table(T::KIND))?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match table.get(*id)? {
                Some(value) => records.push(serde_json::from_slice(value.value())?),
                None => tracing::warn!(kind = %T::KIND, id, "Indexed operation missing from store"),
            }
        }
        Ok(records)
    }

    /// Rebuild every operation index from the durable tables.
    pub(crate) fn index_init(&self) -> Result<()> {
        // Held across the reads so no put can commit between the scan and the publish.
        let mut txn = self.mem.write();
        let mut indexes = BTreeMap::new();
        indexes.insert(OperationKind::Build, self.build_index::<Build>()?);
        indexes.insert(OperationKind::Artifact, self.build_index::<Artifact>()?);
        indexes.insert(OperationKind::Deployment, self.build_index::<Deployment>()?);
        indexes.insert(OperationKind::Release, self.build_index::<Release>()?);
        indexes.insert(OperationKind::StatusReport, self.build_index::<StatusReport>()?);

        let total: usize = indexes.values().map(OperationIndex::len).sum();
        txn.tables.operations = Arc::new(indexes);
        txn.touch(Topic::Operations);
        txn.commit();

        tracing::info!(records = total, "Operation index rebuilt");
        Ok(())
    }

    fn build_index<T: Operation>(&self) -> Result<OperationIndex> {
        let read = self.db.begin_read()?;
        let table = read.open_table(operation_table(T::KIND))?;
        let mut index = OperationIndex::default();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record: T = serde_json::from_slice(value.value())?;
            index.insert(IndexRecord::from_operation(&record));
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str, app: &str, start: i64, state: OperationState) -> IndexRecord {
        IndexRecord {
            id: id.to_string(),
            project: "p".to_string(),
            application: app.to_string(),
            state,
            start_time: Utc.timestamp_opt(start, 0).unwrap(),
            complete_time: None,
        }
    }

    #[test]
    fn scan_stays_inside_application() {
        let mut index = OperationIndex::default();
        index.insert(record("a1", "a", 10, OperationState::Success));
        index.insert(record("b1", "b", 20, OperationState::Success));
        index.insert(record("a2", "a", 30, OperationState::Success));
        index.insert(record("ab", "ab", 40, OperationState::Success));

        let app = ApplicationRef::new("p", "a");
        let ids: Vec<&str> = index
            .scan(OrderBy::StartTime, &app)
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a2", "a1"]);
    }

    #[test]
    fn reinsert_replaces_keys() {
        let mut index = OperationIndex::default();
        index.insert(record("a1", "a", 10, OperationState::Running));
        index.insert(record("a1", "a", 50, OperationState::Success));

        assert_eq!(index.len(), 1);
        let app = ApplicationRef::new("p", "a");
        let found: Vec<&IndexRecord> = index.scan(OrderBy::StartTime, &app).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].state, OperationState::Success);
    }

    #[test]
    fn status_filter_groups() {
        let none = StatusFilter::default();
        assert!(none.matches(OperationState::Error));

        let either = StatusFilter::any_of(&[OperationState::Success, OperationState::Error]);
        assert!(either.matches(OperationState::Error));
        assert!(!either.matches(OperationState::Running));

        let impossible = StatusFilter {
            groups: vec![vec![OperationState::Success, OperationState::Error]],
        };
        assert!(!impossible.matches(OperationState::Success));
    }
}
