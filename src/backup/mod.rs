//! Backup store
//!
//! Snapshots of previously applied specs. A snapshot is taken before every
//! apply that would discard the running spec, and is never mutated after it
//! is written. Records live until they are pruned explicitly.

pub mod file;
pub mod memory;

pub use file::FileSnapshotStore;
pub use memory::MemorySnapshotStore;

use crate::error::Result;
use crate::spec::Spec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Timestamp format used in snapshot identifiers
pub const ID_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Lazy sequence of snapshot records, oldest first
pub type SnapshotIter = Box<dyn Iterator<Item = Result<SnapshotRecord>> + Send>;

/// A stored snapshot of a spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// `<timestamp>-<sequence>-<hash12>`
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Monotonic per-store counter
    pub sequence: u64,
    /// SHA-256 of the canonical JSON spec, hex encoded
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub spec: Spec,
}

impl SnapshotRecord {
    /// Build a record for `spec`
    pub fn new(spec: &Spec, reason: Option<&str>, sequence: u64) -> Result<Self> {
        let created_at = Utc::now();
        let content_hash = content_hash(spec)?;
        let id = format!(
            "{}-{:06}-{}",
            created_at.format(ID_TIMESTAMP_FORMAT),
            sequence,
            &content_hash[..12]
        );

        Ok(Self {
            id,
            created_at,
            sequence,
            content_hash,
            reason: reason.map(str::to_string),
            spec: spec.clone(),
        })
    }

    /// Whether the stored hash still matches the stored spec
    pub fn verify(&self) -> Result<bool> {
        Ok(content_hash(&self.spec)? == self.content_hash)
    }
}

/// Hex SHA-256 over the canonical JSON encoding of a spec
pub fn content_hash(spec: &Spec) -> Result<String> {
    let canonical = serde_json::to_vec(spec)?;
    Ok(format!("{:x}", Sha256::digest(&canonical)))
}

/// Storage for spec snapshots
pub trait SnapshotStore: Send + Sync {
    /// Persist a snapshot of `spec`
    fn snapshot(&self, spec: &Spec, reason: Option<&str>) -> Result<SnapshotRecord>;

    /// Load the spec preserved by snapshot `id`
    fn restore(&self, id: &str) -> Result<Spec>;

    /// Records created at or after `since`, oldest first.
    ///
    /// Each call starts a fresh pass over the store.
    fn list(&self, since: Option<DateTime<Utc>>) -> Result<SnapshotIter>;

    /// Newest record, if any
    fn latest(&self) -> Result<Option<SnapshotRecord>> {
        let mut newest = None;
        for record in self.list(None)? {
            newest = Some(record?);
        }
        Ok(newest)
    }

    /// Delete all but the newest `keep` records, returning how many went
    fn prune(&self, keep: usize) -> Result<usize>;
}
