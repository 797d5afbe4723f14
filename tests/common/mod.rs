//! Entities and backend helpers shared by the integration tests.

#![allow(dead_code)]

use stashdb::{Backend, Column, Entity, EntityId, Identity, MemoryBackend, Record, Result};

#[derive(Debug, Clone, PartialEq, Default, Entity)]
#[entity(table = "foo")]
pub struct Foo {
    pub id: Option<EntityId>,
    pub label: String,
    pub count: i64,
}

impl Foo {
    pub fn new(label: &str, count: i64) -> Self {
        Self {
            id: None,
            label: label.to_string(),
            count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Entity)]
pub struct Geo {
    pub id: Option<EntityId>,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Entity)]
pub struct Address {
    pub id: Option<EntityId>,
    pub street: String,
    #[entity(reference)]
    pub geo: Option<Geo>,
}

impl Address {
    pub fn new(street: &str) -> Self {
        Self {
            id: None,
            street: street.to_string(),
            geo: None,
        }
    }

    pub fn with_geo(street: &str, lat: f64, lon: f64) -> Self {
        Self {
            geo: Some(Geo { id: None, lat, lon }),
            ..Self::new(street)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Entity)]
#[entity(table = "people")]
pub struct Person {
    #[entity(id)]
    pub key: Option<EntityId>,
    pub name: String,
    #[entity(column = "years")]
    pub age: i64,
    pub nickname: Option<String>,
    #[entity(reference)]
    pub home: Option<Address>,
    #[entity(reference)]
    pub work: Option<Address>,
    #[entity(skip)]
    pub session_token: String,
}

impl Person {
    pub fn new(name: &str, age: i64) -> Self {
        Self {
            name: name.to_string(),
            age,
            ..Self::default()
        }
    }
}

/// Memory backend that logs every mutating call, in call order.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    inner: MemoryBackend,
    pub log: Vec<String>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log entries, skipping schema maintenance.
    pub fn writes(&self) -> Vec<&str> {
        self.log
            .iter()
            .map(String::as_str)
            .filter(|entry| !entry.starts_with("ensure"))
            .collect()
    }
}

impl Backend for RecordingBackend {
    fn flush(&mut self) -> Result<()> {
        self.log.push("flush".to_string());
        Ok(())
    }

    fn ensure_table(&mut self, table: &str, columns: &[Column]) -> Result<()> {
        self.log.push(format!("ensure {}", table));
        self.inner.ensure_table(table, columns)
    }

    fn table_exists(&self, table: &str) -> bool {
        self.inner.table_exists(table)
    }

    fn table_names(&self) -> Vec<String> {
        self.inner.table_names()
    }

    fn columns(&self, table: &str) -> Result<Vec<Column>> {
        self.inner.columns(table)
    }

    fn insert_row(&mut self, table: &str, id: EntityId, record: &Record) -> Result<()> {
        self.log.push(format!("insert {}#{}", table, id));
        self.inner.insert_row(table, id, record)
    }

    fn read_row(&self, table: &str, id: EntityId) -> Result<Option<Record>> {
        self.inner.read_row(table, id)
    }

    fn update_row(&mut self, table: &str, id: EntityId, record: &Record) -> Result<bool> {
        self.log.push(format!("update {}#{}", table, id));
        self.inner.update_row(table, id, record)
    }

    fn delete_row(&mut self, table: &str, id: EntityId) -> Result<bool> {
        self.log.push(format!("delete {}#{}", table, id));
        self.inner.delete_row(table, id)
    }

    fn scan(&self, table: &str) -> Result<Vec<(EntityId, Record)>> {
        self.inner.scan(table)
    }

    fn row_count(&self, table: &str) -> Result<usize> {
        self.inner.row_count(table)
    }

    fn drop_rows(&mut self, table: &str) -> Result<()> {
        self.log.push(format!("drop {}", table));
        self.inner.drop_rows(table)
    }

    fn last_id(&self, table: &str) -> Result<EntityId> {
        self.inner.last_id(table)
    }

    fn set_link(&mut self, owner: &Identity, field: &str, target: &Identity) -> Result<()> {
        self.log.push(format!("link {}.{} -> {}", owner, field, target));
        self.inner.set_link(owner, field, target)
    }

    fn remove_link(&mut self, owner: &Identity, field: &str) -> Result<Option<Identity>> {
        self.log.push(format!("unlink {}.{}", owner, field));
        self.inner.remove_link(owner, field)
    }

    fn link(&self, owner: &Identity, field: &str) -> Result<Option<Identity>> {
        self.inner.link(owner, field)
    }

    fn links(&self, owner: &Identity) -> Result<Vec<(String, Identity)>> {
        self.inner.links(owner)
    }
}
