pub mod changelog;

use std::path::{Path, PathBuf};

use ahash::AHashMap;

use crate::fingerprint::Fingerprint;

pub use changelog::{ChangeLog, ChangeLogError, ChangeLogReader, ChangeLogRecord};

pub const CHANGELOG_FILE_NAME: &str = "changelog.log";

#[derive(Debug, Clone)]
pub struct DedupStoreConfig {
    /// Base directory; each partition keeps its change log in its own
    /// subdirectory underneath.
    pub path: PathBuf,
}

/// The latest fingerprint recorded for a key, with the source position of
/// the record that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredEntry {
    pub fingerprint: Fingerprint,
    pub last_seen_offset: i64,
}

/// Durable key store for one partition: the current fingerprint per key,
/// materialized in memory from the partition's append-only change log.
///
/// The change log is the source of truth. `put` appends and syncs the log
/// before the in-memory view changes, so an update is only observable once
/// it would survive a crash. A freshly opened store is empty until the
/// recovery coordinator replays the log into it; partitions never share key
/// spaces or files.
pub struct DedupStore {
    partition: i32,
    entries: AHashMap<String, StoredEntry>,
    changelog: ChangeLog,
}

impl DedupStore {
    pub fn open(config: &DedupStoreConfig, partition: i32) -> Result<Self, ChangeLogError> {
        let dir = partition_dir(&config.path, partition);
        std::fs::create_dir_all(&dir)?;
        let changelog = ChangeLog::open(&dir.join(CHANGELOG_FILE_NAME))?;

        Ok(Self {
            partition,
            entries: AHashMap::new(),
            changelog,
        })
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn get(&self, key: &str) -> Option<&StoredEntry> {
        self.entries.get(key)
    }

    /// Records a new fingerprint for `key`. The change log append is
    /// synchronously durable; on failure the in-memory view is untouched and
    /// the caller must not act as if the update happened.
    pub fn put(
        &mut self,
        key: &str,
        fingerprint: Fingerprint,
        source_offset: i64,
    ) -> Result<(), ChangeLogError> {
        let record = ChangeLogRecord {
            key: key.to_string(),
            fingerprint,
            source_offset,
        };
        self.changelog.append(&record)?;
        self.entries.insert(
            record.key,
            StoredEntry {
                fingerprint,
                last_seen_offset: source_offset,
            },
        );
        Ok(())
    }

    /// Applies one replayed change log record. Idempotent, last-write-wins
    /// by source offset, so replaying a prefix and then the full log
    /// converges to the same map as replaying once.
    pub fn apply_replayed(&mut self, record: ChangeLogRecord) {
        match self.entries.get(&record.key) {
            Some(existing) if existing.last_seen_offset > record.source_offset => {}
            _ => {
                self.entries.insert(
                    record.key,
                    StoredEntry {
                        fingerprint: record.fingerprint,
                        last_seen_offset: record.source_offset,
                    },
                );
            }
        }
    }

    pub fn replay_reader(&self) -> Result<ChangeLogReader, ChangeLogError> {
        ChangeLogReader::open(self.changelog.path())
    }

    pub(crate) fn truncate_changelog(&mut self, valid_end: u64) -> Result<(), ChangeLogError> {
        self.changelog.truncate_to(valid_end)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current end of the change log, the watermark a replay must reach.
    pub fn changelog_end(&self) -> u64 {
        self.changelog.end_offset()
    }

    /// Key-sorted copy of the current entries, for inspection and tests.
    pub fn snapshot(&self) -> Vec<(String, StoredEntry)> {
        let mut entries: Vec<(String, StoredEntry)> = self
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), *entry))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Rewrites the change log keeping only the current record per key.
    /// Maintenance only; callers must keep this away from a replay of the
    /// same partition, which is reading the file being rewritten.
    pub fn compact(&mut self) -> Result<u64, ChangeLogError> {
        let mut records: Vec<ChangeLogRecord> = self
            .entries
            .iter()
            .map(|(key, entry)| ChangeLogRecord {
                key: key.clone(),
                fingerprint: entry.fingerprint,
                source_offset: entry.last_seen_offset,
            })
            .collect();
        // Deterministic replay order: ascending source position, key as the
        // tie-breaker for records from the same position.
        records.sort_by(|a, b| {
            a.source_offset
                .cmp(&b.source_offset)
                .then_with(|| a.key.cmp(&b.key))
        });

        let before = self.changelog.end_offset();
        self.changelog = ChangeLog::rewrite(self.changelog.path().to_path_buf(), &records)?;
        Ok(before.saturating_sub(self.changelog.end_offset()))
    }

    pub fn flush(&mut self) -> Result<(), ChangeLogError> {
        self.changelog.sync_all()
    }
}

pub fn partition_dir(base: &Path, partition: i32) -> PathBuf {
    base.join(partition.to_string())
}
