//! Volatile audit store.

use std::sync::{Mutex, PoisonError};

use super::{AuditEntry, AuditFilter, AuditRecord, AuditStore};
use crate::error::Result;

#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditStore for MemoryAuditStore {
    fn insert(&self, entry: AuditEntry) -> Result<AuditRecord> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = AuditRecord::new(records.len() as u64 + 1, entry);
        records.push(record.clone());
        Ok(record)
    }

    fn head(&self) -> Result<u64> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.last().map_or(0, |r| r.sequence))
    }

    fn count(&self) -> Result<u64> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.len() as u64)
    }

    fn page(
        &self,
        filter: &AuditFilter,
        after: u64,
        upto: u64,
        limit: usize,
    ) -> Result<Vec<AuditRecord>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .iter()
            .filter(|r| r.sequence > after && r.sequence <= upto && filter.matches(r))
            .take(limit)
            .cloned()
            .collect())
    }

    fn records_for(&self, message_id: &str) -> Result<Vec<AuditRecord>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .iter()
            .filter(|r| r.entry.message_id.as_deref() == Some(message_id))
            .cloned()
            .collect())
    }
}
