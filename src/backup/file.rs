//! Filesystem snapshot store

use super::{SnapshotIter, SnapshotRecord, SnapshotStore, ID_TIMESTAMP_FORMAT};
use crate::error::{KeelError, Result};
use crate::spec::Spec;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

const MAX_WRITE_ATTEMPTS: usize = 16;

/// Append-only snapshot store rooted at a directory.
///
/// Each snapshot is one JSON document named after its id. Documents are
/// written to a temporary file and hard-linked into place so an existing
/// snapshot is never overwritten.
pub struct FileSnapshotStore {
    root: PathBuf,
    sequence: AtomicU64,
}

impl FileSnapshotStore {
    /// Open (creating if needed) a store at `root`
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        let highest = scan(&root)?
            .iter()
            .map(|entry| entry.sequence)
            .max()
            .unwrap_or(0);

        tracing::debug!(
            "Opened snapshot store at {} (sequence {})",
            root.display(),
            highest
        );
        Ok(Self {
            root,
            sequence: AtomicU64::new(highest),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains('/') || id.contains('\\') || id.contains("..") {
            return Err(KeelError::SnapshotNotFound(id.to_string()));
        }
        Ok(self.root.join(format!("{}.json", id)))
    }

    fn write_new(&self, record: &SnapshotRecord) -> Result<bool> {
        let target = self.record_path(&record.id)?;
        let tmp = self.root.join(format!(".tmp-{}", Uuid::new_v4()));

        let body = serde_json::to_vec_pretty(record)?;
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
        drop(file);

        let linked = std::fs::hard_link(&tmp, &target);
        std::fs::remove_file(&tmp)?;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn snapshot(&self, spec: &Spec, reason: Option<&str>) -> Result<SnapshotRecord> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            let record = SnapshotRecord::new(spec, reason, sequence)?;

            if self.write_new(&record)? {
                tracing::info!("Created snapshot {}", record.id);
                return Ok(record);
            }
            tracing::debug!("Snapshot id {} already taken, retrying", record.id);
        }

        Err(KeelError::Backup(format!(
            "could not allocate a unique snapshot id in {}",
            self.root.display()
        )))
    }

    fn restore(&self, id: &str) -> Result<Spec> {
        let path = self.record_path(id)?;
        let record = match read_record(&path) {
            Err(KeelError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(KeelError::SnapshotNotFound(id.to_string()));
            }
            other => other?,
        };

        if record.id != id || !record.verify()? {
            return Err(KeelError::SnapshotCorrupt(id.to_string()));
        }
        Ok(record.spec)
    }

    fn list(&self, since: Option<DateTime<Utc>>) -> Result<SnapshotIter> {
        let entries = scan(&self.root)?;
        let since_floor = since.map(|s| s.format(ID_TIMESTAMP_FORMAT).to_string());

        let iter = entries
            .into_iter()
            .filter(move |entry| match since_floor {
                Some(ref floor) => entry.timestamp.as_str() >= floor.as_str(),
                None => true,
            })
            .map(|entry| read_record(&entry.path))
            .filter(move |record| match (record, since) {
                (Ok(record), Some(since)) => record.created_at >= since,
                _ => true,
            });

        Ok(Box::new(iter))
    }

    fn prune(&self, keep: usize) -> Result<usize> {
        let entries = scan(&self.root)?;
        let excess = entries.len().saturating_sub(keep);

        for entry in &entries[..excess] {
            std::fs::remove_file(&entry.path)?;
            tracing::info!("Pruned snapshot {}", entry.id);
        }
        Ok(excess)
    }
}

/// A snapshot file found on disk, identified from its name alone
struct Entry {
    id: String,
    timestamp: String,
    sequence: u64,
    path: PathBuf,
}

/// Parse `<timestamp>-<sequence>-<hash12>`
fn parse_id(id: &str) -> Option<(String, u64)> {
    let mut parts = id.splitn(3, '-');
    let timestamp = parts.next()?;
    let sequence = parts.next()?.parse().ok()?;
    let hash = parts.next()?;

    NaiveDateTime::parse_from_str(timestamp, ID_TIMESTAMP_FORMAT).ok()?;
    if hash.len() != 12 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some((timestamp.to_string(), sequence))
}

/// Snapshot files in `root`, oldest first
fn scan(root: &Path) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for dirent in std::fs::read_dir(root)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
            continue;
        };
        let Some((timestamp, sequence)) = parse_id(id) else {
            tracing::debug!("Ignoring unrecognized file in snapshot store: {:?}", name);
            continue;
        };
        entries.push(Entry {
            id: id.to_string(),
            timestamp,
            sequence,
            path: dirent.path(),
        });
    }

    entries.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.id.cmp(&b.id)));
    Ok(entries)
}

fn read_record(path: &Path) -> Result<SnapshotRecord> {
    let body = std::fs::read(path)?;
    serde_json::from_slice(&body).map_err(|e| {
        KeelError::SnapshotCorrupt(format!("{}: {}", path.display(), e))
    })
}
