//! Transfer record store.
//!
//! A keyed table of [`TransferRecord`]s with change notification. Every
//! mutation a worker makes goes through [`TransferStore::modify`], which
//! re-reads, checks and writes the row under one lock, so a controller's
//! pause or cancel can never be overwritten by a stale progress update.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use driftbox_transfer::{
    Direction, TransferDraft, TransferError, TransferId, TransferRecord, TransferStatus,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Capacity of the change broadcast. Slow subscribers observe `Lagged`.
const CHANGE_CAPACITY: usize = 256;

/// A change to the record table.
#[derive(Debug, Clone)]
pub enum RecordChange {
    Created(TransferRecord),
    Updated(TransferRecord),
    Deleted(TransferId),
}

impl RecordChange {
    pub fn id(&self) -> TransferId {
        match self {
            RecordChange::Created(r) | RecordChange::Updated(r) => r.id,
            RecordChange::Deleted(id) => *id,
        }
    }
}

/// Read-modify-write closure passed to [`TransferStore::modify`].
///
/// Returns `Ok(true)` to persist the change, `Ok(false)` to leave the row
/// untouched. An error also leaves the row untouched.
pub type Mutation<'a> = &'a mut dyn FnMut(&mut TransferRecord) -> Result<bool, TransferError>;

/// Durable table of transfer records.
pub trait TransferStore: Send + Sync {
    /// Inserts a record built from `draft` and returns its id.
    fn create(&self, draft: TransferDraft) -> Result<TransferId, StoreError>;

    fn get(&self, id: TransferId) -> Result<Option<TransferRecord>, StoreError>;

    /// Overwrites an existing record.
    fn update(&self, record: &TransferRecord) -> Result<(), StoreError>;

    /// Deletes a record. Returns `false` if it did not exist.
    fn delete(&self, id: TransferId) -> Result<bool, StoreError>;

    /// Atomically applies `f` to the current row.
    ///
    /// Returns `Ok(None)` if the record no longer exists, otherwise the row
    /// as stored once the call returns.
    fn modify(&self, id: TransferId, f: Mutation<'_>) -> Result<Option<TransferRecord>, StoreError>;

    /// Records of one direction, oldest first.
    fn list_by_direction(&self, direction: Direction) -> Result<Vec<TransferRecord>, StoreError>;

    /// Records in exactly `status`. The status carries its direction.
    fn list_by_status(&self, status: TransferStatus) -> Result<Vec<TransferRecord>, StoreError>;

    /// Every record, oldest first.
    fn list_all(&self) -> Result<Vec<TransferRecord>, StoreError>;

    /// Subscribes to record changes.
    fn subscribe(&self) -> broadcast::Receiver<RecordChange>;
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Table {
    next_id: u64,
    records: BTreeMap<TransferId, TransferRecord>,
}

/// In-memory record table, optionally persisted to a JSON file.
///
/// Ids are assigned sequentially and never reused.
pub struct JsonTransferStore {
    table: Mutex<Table>,
    path: Option<PathBuf>,
    changes: broadcast::Sender<RecordChange>,
}

impl JsonTransferStore {
    /// Creates a store that lives only in memory.
    pub fn in_memory() -> Self {
        Self::with_table(Table::default(), None)
    }

    /// Opens (or creates) a store persisted at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let table = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            let table: Table = serde_json::from_str(&data)?;
            debug!(records = table.records.len(), "loaded transfer records from {:?}", path);
            table
        } else {
            Table::default()
        };
        Ok(Self::with_table(table, Some(path)))
    }

    fn with_table(table: Table, path: Option<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            table: Mutex::new(table),
            path,
            changes,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        // Rows are replaced whole, so a poisoned table is still consistent.
        self.table.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Writes the table to disk. Called with the lock held so writes land
    /// in mutation order.
    fn persist(&self, table: &Table) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(table)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn notify(&self, change: RecordChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    fn filtered(&self, keep: impl Fn(&TransferRecord) -> bool) -> Vec<TransferRecord> {
        self.lock()
            .records
            .values()
            .filter(|r| keep(r))
            .cloned()
            .collect()
    }
}

impl TransferStore for JsonTransferStore {
    fn create(&self, draft: TransferDraft) -> Result<TransferId, StoreError> {
        let record = {
            let mut table = self.lock();
            table.next_id += 1;
            let id = TransferId(table.next_id);
            let record = TransferRecord::from_draft(id, draft);
            table.records.insert(id, record.clone());
            if let Err(e) = self.persist(&table) {
                table.records.remove(&id);
                table.next_id -= 1;
                return Err(e);
            }
            record
        };
        debug!(id = %record.id, name = %record.name, status = %record.status(), "record created");
        let id = record.id;
        self.notify(RecordChange::Created(record));
        Ok(id)
    }

    fn get(&self, id: TransferId) -> Result<Option<TransferRecord>, StoreError> {
        Ok(self.lock().records.get(&id).cloned())
    }

    fn update(&self, record: &TransferRecord) -> Result<(), StoreError> {
        {
            let mut table = self.lock();
            let Some(slot) = table.records.get_mut(&record.id) else {
                return Err(StoreError::NotFound(record.id));
            };
            let previous = std::mem::replace(slot, record.clone());
            if let Err(e) = self.persist(&table) {
                table.records.insert(record.id, previous);
                return Err(e);
            }
        }
        self.notify(RecordChange::Updated(record.clone()));
        Ok(())
    }

    fn delete(&self, id: TransferId) -> Result<bool, StoreError> {
        let removed = {
            let mut table = self.lock();
            let removed = table.records.remove(&id);
            if let Some(previous) = removed.as_ref()
                && let Err(e) = self.persist(&table)
            {
                table.records.insert(id, previous.clone());
                return Err(e);
            }
            removed.is_some()
        };
        if removed {
            debug!(%id, "record deleted");
            self.notify(RecordChange::Deleted(id));
        }
        Ok(removed)
    }

    fn modify(&self, id: TransferId, f: Mutation<'_>) -> Result<Option<TransferRecord>, StoreError> {
        let record = {
            let mut table = self.lock();
            let Some(current) = table.records.get(&id).cloned() else {
                return Ok(None);
            };
            let mut next = current.clone();
            if !f(&mut next)? {
                return Ok(Some(current));
            }
            table.records.insert(id, next.clone());
            if let Err(e) = self.persist(&table) {
                warn!(%id, error = %e, "failed to persist record change");
                table.records.insert(id, current);
                return Err(e);
            }
            next
        };
        self.notify(RecordChange::Updated(record.clone()));
        Ok(Some(record))
    }

    fn list_by_direction(&self, direction: Direction) -> Result<Vec<TransferRecord>, StoreError> {
        Ok(self.filtered(|r| r.direction() == direction))
    }

    fn list_by_status(&self, status: TransferStatus) -> Result<Vec<TransferRecord>, StoreError> {
        Ok(self.filtered(|r| r.status() == status))
    }

    fn list_all(&self) -> Result<Vec<TransferRecord>, StoreError> {
        Ok(self.filtered(|_| true))
    }

    fn subscribe(&self) -> broadcast::Receiver<RecordChange> {
        self.changes.subscribe()
    }
}
