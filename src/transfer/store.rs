//! Record store seam.
//!
//! Durable storage of transfer records belongs to the embedding application.
//! The engine only needs the four CRUD-style operations below. Implementations
//! are the single writer of durable state and must serialize writes to the
//! same record id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::error::{ProtocolError, Result};
use crate::transfer::record::{TransferRecord, TransferStatus};

pub trait RecordStore: Send + Sync {
    fn create(&self, record: &TransferRecord) -> Result<()>;

    fn update(&self, record: &TransferRecord) -> Result<()>;

    fn find(&self, id: &str) -> Result<Option<TransferRecord>>;

    fn query(&self, predicate: &dyn Fn(&TransferRecord) -> bool) -> Result<Vec<TransferRecord>>;
}

/// Finished transfers, most recently finished first.
pub fn history(store: &dyn RecordStore) -> Result<Vec<TransferRecord>> {
    let mut records = store.query(&|r| {
        matches!(r.status, TransferStatus::Completed | TransferStatus::Failed)
    })?;
    records.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
    Ok(records)
}

/// Transfers that were still moving when they were last persisted.
pub fn resume_candidates(store: &dyn RecordStore) -> Result<Vec<TransferRecord>> {
    store.query(&|r| r.status == TransferStatus::Transferring)
}

/// In-process store keyed by record id.
///
/// Each record sits behind its own mutex, so concurrent updates to one record
/// are applied one at a time while different records never contend.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, Arc<Mutex<TransferRecord>>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, id: &str) -> Option<Arc<Mutex<TransferRecord>>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

fn lock(slot: &Mutex<TransferRecord>) -> MutexGuard<'_, TransferRecord> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RecordStore for MemoryRecordStore {
    fn create(&self, record: &TransferRecord) -> Result<()> {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if records.contains_key(&record.id) {
            return Err(ProtocolError::Custom(format!(
                "Record {} already exists",
                record.id
            )));
        }
        records.insert(record.id.clone(), Arc::new(Mutex::new(record.clone())));
        Ok(())
    }

    fn update(&self, record: &TransferRecord) -> Result<()> {
        let slot = self
            .slot(&record.id)
            .ok_or_else(|| ProtocolError::RecordNotFound(record.id.clone()))?;
        *lock(&slot) = record.clone();
        Ok(())
    }

    fn find(&self, id: &str) -> Result<Option<TransferRecord>> {
        Ok(self.slot(id).map(|slot| lock(&slot).clone()))
    }

    fn query(&self, predicate: &dyn Fn(&TransferRecord) -> bool) -> Result<Vec<TransferRecord>> {
        let slots: Vec<_> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        Ok(slots
            .iter()
            .map(|slot| lock(slot).clone())
            .filter(|record| predicate(record))
            .collect())
    }
}
