//! Persisted record storage.
//!
//! Every completed row is written durably before the crawler advances, keyed
//! by the row's global sequence number. Reruns consult the same key to skip
//! rows that are already captured, which is the whole resumability contract.
//! The store is a small key-value abstraction so tests can swap the
//! filesystem backend for an in-memory map.

use crate::error::Result;
use crate::metrics::MetricRecord;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Key-value storage of completed rows: `sequence number -> MetricRecord`.
pub trait RecordStore {
    /// Whether a record is already persisted for this sequence number
    fn contains(&self, sequence: u64) -> bool;

    /// Persist a record under its sequence number
    fn put(&self, sequence: u64, record: &MetricRecord) -> Result<()>;

    /// Load every persisted record, ordered by sequence number
    fn load_all(&self) -> Result<Vec<(u64, MetricRecord)>>;
}

/// Filesystem-backed store: one JSON document per row under
/// `<work>/tmp/pickles/<sequence>.json`.
pub struct FsRecordStore {
    dir: PathBuf,
}

impl FsRecordStore {
    /// Open (and create if needed) a store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory holding the per-row files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("{}.json", sequence))
    }
}

impl RecordStore for FsRecordStore {
    fn contains(&self, sequence: u64) -> bool {
        self.record_path(sequence).exists()
    }

    fn put(&self, sequence: u64, record: &MetricRecord) -> Result<()> {
        let content = serde_json::to_string(record)?;
        std::fs::write(self.record_path(sequence), content)?;
        debug!(sequence = sequence, doi = %record.doi, "Persisted record");
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<(u64, MetricRecord)>> {
        let mut records: Vec<(u64, MetricRecord)> = Vec::new();

        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(sequence) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };

            // A torn or hand-edited file must not sink the whole export.
            let record = match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<MetricRecord>(&content) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(path = ?path, error = %e, "Skipping unreadable record");
                        continue;
                    }
                },
                Err(e) => {
                    warn!(path = ?path, error = %e, "Skipping unreadable record");
                    continue;
                }
            };

            if record.doi.is_empty() {
                warn!(sequence = sequence, "Skipping record without DOI");
                continue;
            }

            records.push((sequence, record));
        }

        records.sort_by_key(|(sequence, _)| *sequence);
        Ok(records)
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<BTreeMap<u64, MetricRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted records
    pub fn len(&self) -> usize {
        self.inner.lock().expect("store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordStore for MemoryRecordStore {
    fn contains(&self, sequence: u64) -> bool {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .contains_key(&sequence)
    }

    fn put(&self, sequence: u64, record: &MetricRecord) -> Result<()> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .insert(sequence, record.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<(u64, MetricRecord)>> {
        Ok(self
            .inner
            .lock()
            .expect("store mutex poisoned")
            .iter()
            .map(|(sequence, record)| (*sequence, record.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_record(doi: &str) -> MetricRecord {
        MetricRecord::new(doi, "Sample title")
    }

    #[test]
    fn test_fs_store_put_contains_load() -> Result<()> {
        let temp = TempDir::new()?;
        let store = FsRecordStore::new(temp.path().join("pickles"))?;

        assert!(!store.contains(7));
        store.put(7, &sample_record("10.1/a"))?;
        assert!(store.contains(7));

        store.put(3, &sample_record("10.1/b"))?;
        let all = store.load_all()?;
        assert_eq!(all.len(), 2);
        // Ordered by sequence
        assert_eq!(all[0].0, 3);
        assert_eq!(all[1].0, 7);
        assert_eq!(all[1].1.doi, "10.1/a");
        Ok(())
    }

    #[test]
    fn test_fs_store_skips_unreadable_and_doiless_files() -> Result<()> {
        let temp = TempDir::new()?;
        let store = FsRecordStore::new(temp.path().join("pickles"))?;

        store.put(0, &sample_record("10.1/ok"))?;
        std::fs::write(store.dir().join("1.json"), "not json at all")?;
        std::fs::write(
            store.dir().join("2.json"),
            r#"{"doi": "", "paper_title": "no key", "categories": {}}"#,
        )?;
        std::fs::write(store.dir().join("notes.txt"), "ignored")?;

        let all = store.load_all()?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].1.doi, "10.1/ok");
        Ok(())
    }

    #[test]
    fn test_memory_store_round_trip() -> Result<()> {
        let store = MemoryRecordStore::new();
        assert!(store.is_empty());

        store.put(5, &sample_record("10.1/m"))?;
        assert!(store.contains(5));
        assert_eq!(store.load_all()?.len(), 1);
        Ok(())
    }
}
