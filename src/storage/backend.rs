use crate::core::{Column, EntityId, Identity, Record, Result};

/// Row-level storage the persistence manager writes committed state into.
///
/// Implementations follow these rules:
/// - Reading or deleting in a missing table behaves like a missing row.
/// - `scan` and `row_count` on a missing table return `TableNotFound`; the
///   manager turns that into an empty result.
/// - Links are keyed by (owner identity, field) and live with the owner's
///   table. They are independent of whether either row exists.
pub trait Backend: Send {
    /// Loads durable state. Called when a store session opens.
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Makes state durable and releases resources. Called on session close.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once at the end of every commit.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Creates the table, or adds the columns it is missing.
    fn ensure_table(&mut self, table: &str, columns: &[Column]) -> Result<()>;

    fn table_exists(&self, table: &str) -> bool;

    fn table_names(&self) -> Vec<String>;

    fn columns(&self, table: &str) -> Result<Vec<Column>>;

    fn insert_row(&mut self, table: &str, id: EntityId, record: &Record) -> Result<()>;

    fn read_row(&self, table: &str, id: EntityId) -> Result<Option<Record>>;

    /// Returns false when no row with this id exists.
    fn update_row(&mut self, table: &str, id: EntityId, record: &Record) -> Result<bool>;

    /// Returns false when no row with this id exists.
    fn delete_row(&mut self, table: &str, id: EntityId) -> Result<bool>;

    fn scan(&self, table: &str) -> Result<Vec<(EntityId, Record)>>;

    fn row_count(&self, table: &str) -> Result<usize>;

    /// Removes every row and link of the table.
    fn drop_rows(&mut self, table: &str) -> Result<()>;

    /// Highest id ever inserted into the table, 0 if none.
    fn last_id(&self, table: &str) -> Result<EntityId>;

    fn set_link(&mut self, owner: &Identity, field: &str, target: &Identity) -> Result<()>;

    fn remove_link(&mut self, owner: &Identity, field: &str) -> Result<Option<Identity>>;

    fn link(&self, owner: &Identity, field: &str) -> Result<Option<Identity>>;

    fn links(&self, owner: &Identity) -> Result<Vec<(String, Identity)>>;
}
