use crate::core::{Column, EntityId, Identity, Record, Result, StashError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stored row values, positionally aligned with the table's columns.
///
/// A row written before a column was added is shorter than the schema.
pub type Row = Vec<Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    name: String,
    columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn find_column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|col| col.name == name)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    schema: TableSchema,
    rows: BTreeMap<EntityId, Row>,
    /// Highest id ever inserted; survives deletes and drops.
    last_id: EntityId,
    links: BTreeMap<EntityId, BTreeMap<String, Identity>>,
}

impl Table {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: BTreeMap::new(),
            last_id: 0,
            links: BTreeMap::new(),
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn last_id(&self) -> EntityId {
        self.last_id
    }

    /// Appends columns the schema does not know yet. Existing rows are left
    /// untouched, so they read back without the new columns.
    pub fn add_missing_columns(&mut self, columns: &[Column]) -> Result<Vec<Column>> {
        let mut added = Vec::new();
        for column in columns {
            match self.schema.find_column_index(&column.name) {
                Some(idx) => {
                    let existing = &self.schema.columns[idx];
                    if existing.data_type != column.data_type {
                        return Err(StashError::TypeMismatch(format!(
                            "Column '{}' of table '{}' is stored as {}, entity declares {}",
                            column.name,
                            self.schema.name,
                            existing.data_type,
                            column.data_type
                        )));
                    }
                }
                None => {
                    // Rows written before this column exist without it.
                    let mut column = column.clone();
                    column.nullable = true;
                    self.schema.columns.push(column.clone());
                    added.push(column);
                }
            }
        }
        Ok(added)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.rows.contains_key(&id)
    }

    pub fn insert(&mut self, id: EntityId, record: &Record) -> Result<()> {
        if self.rows.contains_key(&id) {
            return Err(StashError::ConstraintViolation(format!(
                "Row {} already exists in table '{}'",
                id, self.schema.name
            )));
        }
        let row = self.to_row(record)?;
        self.rows.insert(id, row);
        self.last_id = self.last_id.max(id);
        Ok(())
    }

    pub fn update(&mut self, id: EntityId, record: &Record) -> Result<bool> {
        if !self.rows.contains_key(&id) {
            return Ok(false);
        }
        let row = self.to_row(record)?;
        self.rows.insert(id, row);
        Ok(true)
    }

    pub fn delete(&mut self, id: EntityId) -> bool {
        self.rows.remove(&id).is_some()
    }

    pub fn get(&self, id: EntityId) -> Option<Record> {
        self.rows.get(&id).map(|row| self.to_record(row))
    }

    pub fn scan(&self) -> Vec<(EntityId, Record)> {
        self.rows
            .iter()
            .map(|(id, row)| (*id, self.to_record(row)))
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Removes every row and link. The id sequence keeps its position.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.links.clear();
    }

    pub fn set_link(&mut self, owner: EntityId, field: &str, target: Identity) {
        self.links
            .entry(owner)
            .or_default()
            .insert(field.to_string(), target);
    }

    pub fn remove_link(&mut self, owner: EntityId, field: &str) -> Option<Identity> {
        let fields = self.links.get_mut(&owner)?;
        let removed = fields.remove(field);
        if fields.is_empty() {
            self.links.remove(&owner);
        }
        removed
    }

    pub fn link(&self, owner: EntityId, field: &str) -> Option<Identity> {
        self.links
            .get(&owner)
            .and_then(|fields| fields.get(field))
            .cloned()
    }

    pub fn links(&self, owner: EntityId) -> Vec<(String, Identity)> {
        self.links
            .get(&owner)
            .map(|fields| {
                fields
                    .iter()
                    .map(|(field, target)| (field.clone(), target.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn to_row(&self, record: &Record) -> Result<Row> {
        for name in record.keys() {
            if self.schema.find_column_index(name).is_none() {
                return Err(StashError::ColumnNotFound(
                    name.clone(),
                    self.schema.name.clone(),
                ));
            }
        }

        // Columns the record does not carry belong to fields the entity no
        // longer declares; they are stored as NULL.
        let mut row = Vec::with_capacity(self.schema.column_count());
        for column in self.schema.columns() {
            let value = match record.get(&column.name) {
                Some(value) => {
                    column.validate(value)?;
                    value.clone()
                }
                None => Value::Null,
            };
            row.push(value);
        }
        Ok(row)
    }

    fn to_record(&self, row: &Row) -> Record {
        self.schema
            .columns()
            .iter()
            .zip(row.iter())
            .map(|(column, value)| (column.name.clone(), value.clone()))
            .collect()
    }
}
