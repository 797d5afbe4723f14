use super::{Backend, Table, TableSchema};
use crate::core::{Column, EntityId, Identity, Record, Result, StashError};
use std::collections::HashMap;

/// Backend holding every table in process memory.
///
/// State survives `close`/`open` of the owning store, so one instance can
/// serve several sessions of the same `DataStore`.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: HashMap<String, Table>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
        }
    }

    pub(crate) fn from_tables(tables: HashMap<String, Table>) -> Self {
        Self { tables }
    }

    pub(crate) fn tables(&self) -> &HashMap<String, Table> {
        &self.tables
    }

    pub(crate) fn clear(&mut self) {
        self.tables.clear();
    }

    pub fn total_rows(&self) -> usize {
        self.tables.values().map(Table::row_count).sum()
    }

    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| StashError::TableNotFound(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StashError::TableNotFound(name.to_string()))
    }
}

impl Backend for MemoryBackend {
    fn ensure_table(&mut self, table: &str, columns: &[Column]) -> Result<()> {
        match self.tables.get_mut(table) {
            Some(existing) => {
                existing.add_missing_columns(columns)?;
            }
            None => {
                let schema = TableSchema::new(table, columns.to_vec());
                self.tables.insert(table.to_string(), Table::new(schema));
            }
        }
        Ok(())
    }

    fn table_exists(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    fn columns(&self, table: &str) -> Result<Vec<Column>> {
        Ok(self.table(table)?.schema().columns().to_vec())
    }

    fn insert_row(&mut self, table: &str, id: EntityId, record: &Record) -> Result<()> {
        self.table_mut(table)?.insert(id, record)
    }

    fn read_row(&self, table: &str, id: EntityId) -> Result<Option<Record>> {
        Ok(self.tables.get(table).and_then(|t| t.get(id)))
    }

    fn update_row(&mut self, table: &str, id: EntityId, record: &Record) -> Result<bool> {
        match self.tables.get_mut(table) {
            Some(t) => t.update(id, record),
            None => Ok(false),
        }
    }

    fn delete_row(&mut self, table: &str, id: EntityId) -> Result<bool> {
        Ok(self
            .tables
            .get_mut(table)
            .map(|t| t.delete(id))
            .unwrap_or(false))
    }

    fn scan(&self, table: &str) -> Result<Vec<(EntityId, Record)>> {
        Ok(self.table(table)?.scan())
    }

    fn row_count(&self, table: &str) -> Result<usize> {
        Ok(self.table(table)?.row_count())
    }

    fn drop_rows(&mut self, table: &str) -> Result<()> {
        self.table_mut(table)?.clear();
        Ok(())
    }

    fn last_id(&self, table: &str) -> Result<EntityId> {
        Ok(self.tables.get(table).map(Table::last_id).unwrap_or(0))
    }

    fn set_link(&mut self, owner: &Identity, field: &str, target: &Identity) -> Result<()> {
        self.table_mut(&owner.table)?
            .set_link(owner.id, field, target.clone());
        Ok(())
    }

    fn remove_link(&mut self, owner: &Identity, field: &str) -> Result<Option<Identity>> {
        Ok(self
            .tables
            .get_mut(&owner.table)
            .and_then(|t| t.remove_link(owner.id, field)))
    }

    fn link(&self, owner: &Identity, field: &str) -> Result<Option<Identity>> {
        Ok(self
            .tables
            .get(&owner.table)
            .and_then(|t| t.link(owner.id, field)))
    }

    fn links(&self, owner: &Identity) -> Result<Vec<(String, Identity)>> {
        Ok(self
            .tables
            .get(&owner.table)
            .map(|t| t.links(owner.id))
            .unwrap_or_default())
    }
}
