use super::persistence::{
    DurabilityMode, JOURNAL_FILE_NAME, Journal, JournalEntry, SNAPSHOT_FILE_NAME,
    SnapshotManager, StoreSnapshot,
};
use super::{Backend, MemoryBackend};
use crate::core::{Column, EntityId, Identity, Record, Result, StashError};
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span};

/// Backend persisted to a data directory as a snapshot plus a journal.
///
/// Every mutation is applied in memory and appended to the journal. On open
/// the snapshot is loaded and the journal replayed; on close (and whenever
/// the journal grows past the checkpoint threshold) a new snapshot is written
/// and the journal truncated.
pub struct FileBackend {
    data_dir: PathBuf,
    durability_mode: DurabilityMode,
    checkpoint_threshold: usize,
    memory: MemoryBackend,
    journal: Option<Journal>,
    snapshots: SnapshotManager,
}

impl FileBackend {
    pub fn new<P: AsRef<Path>>(data_dir: P, durability_mode: DurabilityMode) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        let snapshots = SnapshotManager::new(data_dir.join(SNAPSHOT_FILE_NAME));
        Self {
            data_dir,
            durability_mode,
            checkpoint_threshold: 1000,
            memory: MemoryBackend::new(),
            journal: None,
            snapshots,
        }
    }

    pub fn with_checkpoint_threshold(mut self, threshold: usize) -> Self {
        self.checkpoint_threshold = threshold;
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn durability_mode(&self) -> DurabilityMode {
        self.durability_mode
    }

    pub fn is_open(&self) -> bool {
        self.journal.is_some()
    }

    /// Writes a snapshot of the current state and truncates the journal.
    pub fn checkpoint(&mut self) -> Result<()> {
        let journal = self.journal.as_mut().ok_or(StashError::NotOpen)?;
        let snapshot = StoreSnapshot::new(self.memory.tables().clone());
        self.snapshots.save(&snapshot)?;
        journal.clear()?;
        info!(
            tables = snapshot.metadata.table_count,
            rows = snapshot.metadata.row_count,
            "checkpoint written"
        );
        Ok(())
    }

    fn recover(&mut self) -> Result<usize> {
        let span = info_span!("stashdb.recover", data_dir = %self.data_dir.display());
        let _enter = span.enter();

        let tables = match self.snapshots.load()? {
            Some(snapshot) => snapshot.tables,
            None => Default::default(),
        };
        self.memory = MemoryBackend::from_tables(tables);

        let entries = match self.journal.as_ref() {
            Some(journal) => journal.read_all()?,
            None => Vec::new(),
        };
        let replayed = entries.len();
        for entry in entries {
            replay(&mut self.memory, entry)?;
        }
        debug!(replayed, "journal replayed");
        Ok(replayed)
    }

    fn require_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StashError::NotOpen)
        }
    }

    fn log(&mut self, entry: JournalEntry) -> Result<()> {
        let journal = self.journal.as_mut().ok_or(StashError::NotOpen)?;
        journal.append(&entry)
    }
}

fn replay(memory: &mut MemoryBackend, entry: JournalEntry) -> Result<()> {
    match entry {
        JournalEntry::EnsureTable { table, columns } => memory.ensure_table(&table, &columns),
        // A crash between snapshot rename and journal truncation replays
        // inserts the snapshot already holds.
        JournalEntry::Insert { table, id, record } => {
            if memory.read_row(&table, id)?.is_some() {
                memory.update_row(&table, id, &record).map(|_| ())
            } else {
                memory.insert_row(&table, id, &record)
            }
        }
        JournalEntry::Update { table, id, record } => {
            memory.update_row(&table, id, &record).map(|_| ())
        }
        JournalEntry::Delete { table, id } => memory.delete_row(&table, id).map(|_| ()),
        JournalEntry::DropRows { table } => memory.drop_rows(&table),
        JournalEntry::Link {
            owner,
            field,
            target,
        } => memory.set_link(&owner, &field, &target),
        JournalEntry::Unlink { owner, field } => memory.remove_link(&owner, &field).map(|_| ()),
    }
}

impl Backend for FileBackend {
    fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let mut journal = Journal::new(self.data_dir.join(JOURNAL_FILE_NAME), self.durability_mode)?;
        journal.set_checkpoint_threshold(self.checkpoint_threshold);
        self.journal = Some(journal);
        if let Err(err) = self.recover() {
            self.journal = None;
            return Err(err);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.checkpoint()?;
        self.journal = None;
        self.memory.clear();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let journal = self.journal.as_mut().ok_or(StashError::NotOpen)?;
        journal.sync()?;
        if journal.needs_checkpoint() {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn ensure_table(&mut self, table: &str, columns: &[Column]) -> Result<()> {
        self.require_open()?;
        let known = self.memory.columns(table).ok();
        let changed = match &known {
            Some(existing) => columns
                .iter()
                .any(|c| !existing.iter().any(|e| e.name == c.name)),
            None => true,
        };
        self.memory.ensure_table(table, columns)?;
        if changed {
            self.log(JournalEntry::EnsureTable {
                table: table.to_string(),
                columns: columns.to_vec(),
            })?;
        }
        Ok(())
    }

    fn table_exists(&self, table: &str) -> bool {
        self.memory.table_exists(table)
    }

    fn table_names(&self) -> Vec<String> {
        self.memory.table_names()
    }

    fn columns(&self, table: &str) -> Result<Vec<Column>> {
        self.memory.columns(table)
    }

    fn insert_row(&mut self, table: &str, id: EntityId, record: &Record) -> Result<()> {
        self.require_open()?;
        self.memory.insert_row(table, id, record)?;
        self.log(JournalEntry::Insert {
            table: table.to_string(),
            id,
            record: record.clone(),
        })
    }

    fn read_row(&self, table: &str, id: EntityId) -> Result<Option<Record>> {
        self.memory.read_row(table, id)
    }

    fn update_row(&mut self, table: &str, id: EntityId, record: &Record) -> Result<bool> {
        self.require_open()?;
        let updated = self.memory.update_row(table, id, record)?;
        if updated {
            self.log(JournalEntry::Update {
                table: table.to_string(),
                id,
                record: record.clone(),
            })?;
        }
        Ok(updated)
    }

    fn delete_row(&mut self, table: &str, id: EntityId) -> Result<bool> {
        self.require_open()?;
        let deleted = self.memory.delete_row(table, id)?;
        if deleted {
            self.log(JournalEntry::Delete {
                table: table.to_string(),
                id,
            })?;
        }
        Ok(deleted)
    }

    fn scan(&self, table: &str) -> Result<Vec<(EntityId, Record)>> {
        self.memory.scan(table)
    }

    fn row_count(&self, table: &str) -> Result<usize> {
        self.memory.row_count(table)
    }

    fn drop_rows(&mut self, table: &str) -> Result<()> {
        self.require_open()?;
        self.memory.drop_rows(table)?;
        self.log(JournalEntry::DropRows {
            table: table.to_string(),
        })
    }

    fn last_id(&self, table: &str) -> Result<EntityId> {
        self.memory.last_id(table)
    }

    fn set_link(&mut self, owner: &Identity, field: &str, target: &Identity) -> Result<()> {
        self.require_open()?;
        self.memory.set_link(owner, field, target)?;
        self.log(JournalEntry::Link {
            owner: owner.clone(),
            field: field.to_string(),
            target: target.clone(),
        })
    }

    fn remove_link(&mut self, owner: &Identity, field: &str) -> Result<Option<Identity>> {
        self.require_open()?;
        let removed = self.memory.remove_link(owner, field)?;
        if removed.is_some() {
            self.log(JournalEntry::Unlink {
                owner: owner.clone(),
                field: field.to_string(),
            })?;
        }
        Ok(removed)
    }

    fn link(&self, owner: &Identity, field: &str) -> Result<Option<Identity>> {
        self.memory.link(owner, field)
    }

    fn links(&self, owner: &Identity) -> Result<Vec<(String, Identity)>> {
        self.memory.links(owner)
    }
}
