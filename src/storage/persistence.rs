//! Write-ahead journal and snapshot files for the file backend

use crate::core::{Column, EntityId, Identity, Record, Result, StashError};
use crate::storage::table::Table;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const JOURNAL_FILE_NAME: &str = "stashdb.wal";
pub const SNAPSHOT_FILE_NAME: &str = "stashdb.snapshot";
const SNAPSHOT_VERSION: u32 = 1;

// ============================================================================
// Journal Entry Types
// ============================================================================

/// One row-level mutation, replayed in order on recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JournalEntry {
    EnsureTable {
        table: String,
        columns: Vec<Column>,
    },
    Insert {
        table: String,
        id: EntityId,
        record: Record,
    },
    Update {
        table: String,
        id: EntityId,
        record: Record,
    },
    Delete {
        table: String,
        id: EntityId,
    },
    DropRows {
        table: String,
    },
    Link {
        owner: Identity,
        field: String,
        target: Identity,
    },
    Unlink {
        owner: Identity,
        field: String,
    },
}

// ============================================================================
// Store Snapshot
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub tables: HashMap<String, Table>,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: DateTime<Utc>,
    pub row_count: usize,
    pub table_count: usize,
}

impl StoreSnapshot {
    pub fn new(tables: HashMap<String, Table>) -> Self {
        let row_count = tables.values().map(|t| t.row_count()).sum();
        let table_count = tables.len();

        Self {
            version: SNAPSHOT_VERSION,
            tables,
            metadata: SnapshotMetadata {
                created_at: Utc::now(),
                row_count,
                table_count,
            },
        }
    }
}

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// Every journal entry is fsynced before the write returns.
    Sync,
    /// Journal entries are flushed to the OS; fsync happens at commit.
    #[default]
    Async,
    /// No journal. State reaches disk only through checkpoints.
    None,
}

impl std::str::FromStr for DurabilityMode {
    type Err = StashError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            "none" => Ok(Self::None),
            other => Err(StashError::ConfigError(format!(
                "unknown durability mode '{}' (expected sync, async or none)",
                other
            ))),
        }
    }
}

// ============================================================================
// Journal
// ============================================================================

pub struct Journal {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    durability_mode: DurabilityMode,
    entries_since_checkpoint: usize,
    checkpoint_threshold: usize,
}

impl Journal {
    pub fn new<P: AsRef<Path>>(path: P, durability_mode: DurabilityMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StashError::IoError(format!("Failed to create journal directory: {}", e))
            })?;
        }

        let writer = if durability_mode != DurabilityMode::None {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| StashError::IoError(format!("Failed to open journal: {}", e)))?;
            Some(BufWriter::new(file))
        } else {
            None
        };

        Ok(Self {
            path,
            writer,
            durability_mode,
            entries_since_checkpoint: 0,
            checkpoint_threshold: 1000,
        })
    }

    pub fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| StashError::IoError("Journal is not open".to_string()))?;
        let serialized = rmp_serde::to_vec(entry).map_err(|e| {
            StashError::Serialization(format!("Failed to serialize journal entry: {}", e))
        })?;
        let len = serialized.len() as u32;
        writer
            .write_all(&len.to_le_bytes())
            .and_then(|_| writer.write_all(&serialized))
            .and_then(|_| writer.flush())
            .map_err(|e| StashError::IoError(format!("Failed to write journal: {}", e)))?;
        if self.durability_mode == DurabilityMode::Sync {
            writer
                .get_mut()
                .sync_all()
                .map_err(|e| StashError::IoError(format!("Failed to sync journal: {}", e)))?;
        }
        self.entries_since_checkpoint += 1;
        Ok(())
    }

    /// Reads every complete entry. A torn entry at the tail (crash while
    /// appending) ends the read instead of failing it.
    pub fn read_all(&self) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)
            .map_err(|e| StashError::IoError(format!("Failed to open journal for reading: {}", e)))?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    return Err(StashError::IoError(format!(
                        "Failed to read journal entry length: {}",
                        e
                    )));
                }
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut data = vec![0u8; len];
            match reader.read_exact(&mut data) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    warn!(path = %self.path.display(), "ignoring torn journal tail");
                    break;
                }
                Err(e) => {
                    return Err(StashError::IoError(format!(
                        "Failed to read journal entry: {}",
                        e
                    )));
                }
            }
            let entry: JournalEntry = rmp_serde::from_slice(&data).map_err(|e| {
                StashError::Serialization(format!("Failed to deserialize journal entry: {}", e))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Forces buffered entries to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer
                .flush()
                .and_then(|_| writer.get_mut().sync_all())
                .map_err(|e| StashError::IoError(format!("Failed to sync journal: {}", e)))?;
        }
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        self.writer = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| StashError::IoError(format!("Failed to truncate journal: {}", e)))?;
        self.writer = Some(BufWriter::new(file));
        self.entries_since_checkpoint = 0;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.entries_since_checkpoint >= self.checkpoint_threshold
    }

    pub fn entries_since_checkpoint(&self) -> usize {
        self.entries_since_checkpoint
    }

    pub fn set_checkpoint_threshold(&mut self, threshold: usize) {
        self.checkpoint_threshold = threshold;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    /// Writes the snapshot to a temp file in the same directory and renames
    /// it into place.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let dir = self
            .snapshot_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&dir).map_err(|e| {
            StashError::IoError(format!("Failed to create snapshot directory: {}", e))
        })?;

        let serialized = rmp_serde::to_vec(snapshot).map_err(|e| {
            StashError::Serialization(format!("Failed to serialize snapshot: {}", e))
        })?;
        let mut temp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| StashError::IoError(format!("Failed to create temp file: {}", e)))?;
        temp.write_all(&serialized)
            .and_then(|_| temp.flush())
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| StashError::IoError(format!("Failed to write snapshot: {}", e)))?;
        temp.persist(&self.snapshot_path)
            .map_err(|e| StashError::IoError(format!("Failed to rename snapshot: {}", e)))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.snapshot_path)
            .map_err(|e| StashError::IoError(format!("Failed to open snapshot: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| StashError::IoError(format!("Failed to read snapshot: {}", e)))?;
        let snapshot: StoreSnapshot = rmp_serde::from_slice(&data).map_err(|e| {
            StashError::Serialization(format!("Failed to deserialize snapshot: {}", e))
        })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StashError::Serialization(format!(
                "Unsupported snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        Ok(Some(snapshot))
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }

    pub fn path(&self) -> &Path {
        &self.snapshot_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataType, Value};
    use crate::storage::table::TableSchema;
    use tempfile::TempDir;

    fn insert_entry(id: EntityId, name: &str) -> JournalEntry {
        let mut record = Record::new();
        record.insert("name".into(), Value::from(name));
        JournalEntry::Insert {
            table: "users".to_string(),
            id,
            record,
        }
    }

    #[test]
    fn test_journal_append_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.wal");
        let mut journal = Journal::new(&path, DurabilityMode::Sync).unwrap();
        journal
            .append(&JournalEntry::EnsureTable {
                table: "users".to_string(),
                columns: vec![Column::new("name", DataType::Text)],
            })
            .unwrap();
        journal.append(&insert_entry(1, "Alice")).unwrap();
        let entries = journal.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(journal.entries_since_checkpoint(), 2);
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.wal");
        {
            let mut journal = Journal::new(&path, DurabilityMode::Sync).unwrap();
            journal.append(&insert_entry(1, "Alice")).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();

        let journal = Journal::new(&path, DurabilityMode::Sync).unwrap();
        assert_eq!(journal.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_journal_disabled_in_none_mode() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.wal");
        let mut journal = Journal::new(&path, DurabilityMode::None).unwrap();
        journal.append(&insert_entry(1, "Alice")).unwrap();
        assert!(!path.exists());
        assert!(journal.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_clear_resets_counter() {
        let temp_dir = TempDir::new().unwrap();
        let mut journal =
            Journal::new(temp_dir.path().join("test.wal"), DurabilityMode::Async).unwrap();
        journal.set_checkpoint_threshold(2);
        journal.append(&insert_entry(1, "a")).unwrap();
        journal.append(&insert_entry(2, "b")).unwrap();
        assert!(journal.needs_checkpoint());
        journal.clear().unwrap();
        assert!(!journal.needs_checkpoint());
        assert!(journal.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(temp_dir.path().join("test.snapshot"));
        let mut tables = HashMap::new();
        let schema = TableSchema::new("users", vec![Column::new("name", DataType::Text)]);
        tables.insert("users".to_string(), Table::new(schema));

        manager.save(&StoreSnapshot::new(tables)).unwrap();
        assert!(manager.exists());

        let loaded = manager.load().unwrap().unwrap();
        assert_eq!(loaded.metadata.table_count, 1);
        assert!(loaded.tables.contains_key("users"));
    }

    #[test]
    fn test_durability_mode_parsing() {
        assert_eq!("SYNC".parse::<DurabilityMode>().unwrap(), DurabilityMode::Sync);
        assert_eq!("none".parse::<DurabilityMode>().unwrap(), DurabilityMode::None);
        assert!("later".parse::<DurabilityMode>().is_err());
    }
}
