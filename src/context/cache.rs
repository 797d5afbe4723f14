use crate::core::{EntityId, Identity, Result, StashError};
use crate::entity::{AnyEntity, Entity};
use std::collections::{BTreeMap, HashMap};

/// Live in-memory instances keyed by (table, id).
///
/// The cache holds at most one instance per identity and knows nothing about
/// which entries still have to be written; that is the directive log's job.
#[derive(Debug, Default)]
pub struct Cache {
    entries: HashMap<String, BTreeMap<EntityId, Box<dyn AnyEntity>>>,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn get<T: Entity>(&self, id: EntityId) -> Option<&T> {
        let entry = self.entries.get(T::TABLE)?.get(&id)?;
        (**entry).as_any().downcast_ref::<T>()
    }

    pub fn get_dyn(&self, identity: &Identity) -> Option<&dyn AnyEntity> {
        self.entries
            .get(&identity.table)?
            .get(&identity.id)
            .map(|entry| &**entry)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.get_dyn(identity).is_some()
    }

    /// Inserts or replaces the entry for the entity's identity.
    pub fn put(&mut self, entity: Box<dyn AnyEntity>) -> Result<()> {
        let id = entity.entity_id().ok_or_else(|| {
            StashError::InvalidArgument(format!(
                "cannot cache a '{}' entity without an id",
                entity.table()
            ))
        })?;
        self.entries
            .entry(entity.table().to_string())
            .or_default()
            .insert(id, entity);
        Ok(())
    }

    /// Returns true if an entry existed.
    pub fn remove(&mut self, table: &str, id: EntityId) -> bool {
        let Some(by_id) = self.entries.get_mut(table) else {
            return false;
        };
        let removed = by_id.remove(&id).is_some();
        if by_id.is_empty() {
            self.entries.remove(table);
        }
        removed
    }

    pub fn all_cached<T: Entity>(&self) -> Vec<&T> {
        self.entries
            .get(T::TABLE)
            .map(|by_id| {
                by_id
                    .values()
                    .filter_map(|entry| (**entry).as_any().downcast_ref::<T>())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all_cached_dyn(&self) -> Vec<&dyn AnyEntity> {
        self.entries
            .values()
            .flat_map(|by_id| by_id.values().map(|entry| &**entry))
            .collect()
    }

    /// Drops every cached instance of a table, returning how many there were.
    pub fn evict_table(&mut self, table: &str) -> usize {
        self.entries.remove(table).map(|by_id| by_id.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
