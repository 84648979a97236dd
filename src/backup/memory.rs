//! In-memory snapshot store for dry runs and tests

use super::{SnapshotIter, SnapshotRecord, SnapshotStore};
use crate::error::{KeelError, Result};
use crate::spec::Spec;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Snapshot store that keeps records in process memory
#[derive(Default)]
pub struct MemorySnapshotStore {
    records: RwLock<Vec<SnapshotRecord>>,
    sequence: AtomicU64,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn snapshot(&self, spec: &Spec, reason: Option<&str>) -> Result<SnapshotRecord> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let record = SnapshotRecord::new(spec, reason, sequence)?;

        let mut records = self
            .records
            .write()
            .map_err(|_| KeelError::Lock("Failed to acquire write lock".to_string()))?;
        records.push(record.clone());
        Ok(record)
    }

    fn restore(&self, id: &str) -> Result<Spec> {
        let records = self
            .records
            .read()
            .map_err(|_| KeelError::Lock("Failed to acquire read lock".to_string()))?;

        records
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.spec.clone())
            .ok_or_else(|| KeelError::SnapshotNotFound(id.to_string()))
    }

    fn list(&self, since: Option<DateTime<Utc>>) -> Result<SnapshotIter> {
        let records = self
            .records
            .read()
            .map_err(|_| KeelError::Lock("Failed to acquire read lock".to_string()))?;

        let selected: Vec<SnapshotRecord> = records
            .iter()
            .filter(|r| since.map_or(true, |since| r.created_at >= since))
            .cloned()
            .collect();
        Ok(Box::new(selected.into_iter().map(Ok)))
    }

    fn prune(&self, keep: usize) -> Result<usize> {
        let mut records = self
            .records
            .write()
            .map_err(|_| KeelError::Lock("Failed to acquire write lock".to_string()))?;

        let excess = records.len().saturating_sub(keep);
        records.drain(..excess);
        Ok(excess)
    }
}
