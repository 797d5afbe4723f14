//! Persistence manager: turns directives into backend operations and reads
//! committed state back as entities.

use crate::context::{Directive, EntityImage};
use crate::core::{EntityId, Identity, Result, StashError};
use crate::entity::{Entity, materialize};
use crate::storage::Backend;
use std::collections::HashMap;
use tracing::{Level, debug, event, info};

pub struct PersistenceManager<B: Backend> {
    backend: B,
    default_upgrade_value: i64,
    /// Highest id handed out per table in the current session.
    reserved: HashMap<String, EntityId>,
}

impl<B: Backend> PersistenceManager<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            default_upgrade_value: 0,
            reserved: HashMap::new(),
        }
    }

    pub fn open(&mut self) -> Result<()> {
        self.reserved.clear();
        self.backend.open()
    }

    pub fn close(&mut self) -> Result<()> {
        self.reserved.clear();
        self.backend.close()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.backend.flush()
    }

    /// Hands out the next id for `table`.
    ///
    /// Ids are never reused within a session, even when the reserving
    /// directive is never committed.
    pub fn reserve_id(&mut self, table: &str) -> Result<EntityId> {
        let stored = self.backend.last_id(table)?;
        let next = match self.reserved.get(table) {
            Some(&reserved) => reserved.max(stored) + 1,
            None => stored + 1,
        };
        self.reserved.insert(table.to_string(), next);
        Ok(next)
    }

    pub fn apply(&mut self, directive: &Directive) -> Result<()> {
        event!(Level::DEBUG, directive = %directive, "applying directive");
        match directive {
            Directive::Create(image) => self.create(image),
            Directive::Update(image) => self.update(image),
            Directive::Delete(identity) => self.delete(identity),
            Directive::CreateReference {
                owner,
                field,
                target,
            } => self.create_reference(owner, field, target),
            Directive::DeleteReference {
                owner,
                field,
                target,
            } => self.delete_reference(owner, field, target),
        }
    }

    fn create(&mut self, image: &EntityImage) -> Result<()> {
        let identity = &image.identity;
        self.backend.ensure_table(&identity.table, &image.columns)?;
        if self.backend.read_row(&identity.table, identity.id)?.is_some() {
            return Err(StashError::StoreAnomaly(format!(
                "cannot create {}: a row with this id is already stored",
                identity
            )));
        }
        self.backend
            .insert_row(&identity.table, identity.id, &image.record)
    }

    fn update(&mut self, image: &EntityImage) -> Result<()> {
        let identity = &image.identity;
        self.backend.ensure_table(&identity.table, &image.columns)?;
        if !self
            .backend
            .update_row(&identity.table, identity.id, &image.record)?
        {
            return Err(StashError::StoreAnomaly(format!(
                "cannot update {}: no stored row",
                identity
            )));
        }
        Ok(())
    }

    fn delete(&mut self, identity: &Identity) -> Result<()> {
        if !self.backend.delete_row(&identity.table, identity.id)? {
            debug!(identity = %identity, "delete of a row that is not stored");
        }
        Ok(())
    }

    fn create_reference(
        &mut self,
        owner: &Identity,
        field: &str,
        target: &EntityImage,
    ) -> Result<()> {
        if self.backend.read_row(&owner.table, owner.id)?.is_none() {
            return Err(StashError::StoreAnomaly(format!(
                "cannot link {}.{}: owner row is not stored",
                owner, field
            )));
        }
        let identity = &target.identity;
        self.backend.ensure_table(&identity.table, &target.columns)?;
        let stored = self.backend.read_row(&identity.table, identity.id)?.is_some();
        if stored {
            self.backend
                .update_row(&identity.table, identity.id, &target.record)?;
        } else {
            self.backend
                .insert_row(&identity.table, identity.id, &target.record)?;
        }
        self.backend.set_link(owner, field, identity)
    }

    fn delete_reference(&mut self, owner: &Identity, field: &str, target: &Identity) -> Result<()> {
        if let Some(linked) = self.backend.remove_link(owner, field)? {
            if &linked != target {
                debug!(owner = %owner, field, linked = %linked, expected = %target, "link pointed elsewhere");
            }
        }
        self.backend.delete_row(&target.table, target.id)?;
        Ok(())
    }

    /// Reads one committed entity.
    pub fn fetch<T: Entity>(&self, id: EntityId) -> Result<Option<T>> {
        match self.backend.read_row(T::TABLE, id)? {
            Some(record) => {
                materialize(&self.backend, id, record, self.default_upgrade_value).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Reads every committed entity of `T` whose id passes `keep`.
    ///
    /// A table that was never created reads as empty.
    pub fn fetch_all_filtered<T, F>(&self, keep: F) -> Result<Vec<T>>
    where
        T: Entity,
        F: Fn(EntityId) -> bool,
    {
        let rows = match self.backend.scan(T::TABLE) {
            Ok(rows) => rows,
            Err(StashError::TableNotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        rows.into_iter()
            .filter(|(id, _)| keep(*id))
            .map(|(id, record)| materialize(&self.backend, id, record, self.default_upgrade_value))
            .collect()
    }

    pub fn fetch_all<T: Entity>(&self) -> Result<Vec<T>> {
        self.fetch_all_filtered(|_| true)
    }

    pub fn exists(&self, identity: &Identity) -> Result<bool> {
        Ok(self
            .backend
            .read_row(&identity.table, identity.id)?
            .is_some())
    }

    /// Committed reference links of a row, by field.
    pub fn links(&self, owner: &Identity) -> Result<Vec<(String, Identity)>> {
        self.backend.links(owner)
    }

    /// Committed row count of a table; 0 if it was never created.
    pub fn size(&self, table: &str) -> Result<usize> {
        match self.backend.row_count(table) {
            Ok(count) => Ok(count),
            Err(StashError::TableNotFound(_)) => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Removes every committed row of a table, keeping the table itself.
    pub fn drop_records(&mut self, table: &str) -> Result<()> {
        match self.backend.drop_rows(table) {
            Ok(()) => {
                info!(table, "records dropped");
                Ok(())
            }
            Err(StashError::TableNotFound(_)) => {
                debug!(table, "drop of a table that does not exist");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub fn set_default_upgrade_value(&mut self, value: i64) {
        self.default_upgrade_value = value;
    }

    pub fn default_upgrade_value(&self) -> i64 {
        self.default_upgrade_value
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataType, Record, Value};
    use crate::entity::fixtures::{Folder, Note};
    use crate::storage::MemoryBackend;

    fn note_image(id: EntityId, title: &str) -> EntityImage {
        let mut note = Note::new(title, 3);
        note.id = Some(id);
        EntityImage::capture(&note).unwrap()
    }

    fn folder_image(id: EntityId) -> EntityImage {
        let folder = Folder {
            id: Some(id),
            name: "inbox".into(),
            pinned: None,
        };
        EntityImage::capture(&folder).unwrap()
    }

    fn manager() -> PersistenceManager<MemoryBackend> {
        PersistenceManager::new(MemoryBackend::new())
    }

    #[test]
    fn test_reserve_id_is_monotonic() {
        let mut manager = manager();
        assert_eq!(manager.reserve_id("note").unwrap(), 1);
        assert_eq!(manager.reserve_id("note").unwrap(), 2);
        assert_eq!(manager.reserve_id("folder").unwrap(), 1);

        manager
            .apply(&Directive::Create(note_image(5, "late")))
            .unwrap();
        assert_eq!(manager.reserve_id("note").unwrap(), 6);
    }

    #[test]
    fn test_create_and_fetch() {
        let mut manager = manager();
        manager
            .apply(&Directive::Create(note_image(1, "hello")))
            .unwrap();
        let note: Note = manager.fetch(1).unwrap().unwrap();
        assert_eq!(note.title, "hello");
        assert_eq!(note.id, Some(1));
        assert!(manager.fetch::<Note>(2).unwrap().is_none());
    }

    #[test]
    fn test_create_existing_row_is_anomaly() {
        let mut manager = manager();
        manager.apply(&Directive::Create(note_image(1, "a"))).unwrap();
        let err = manager
            .apply(&Directive::Create(note_image(1, "b")))
            .unwrap_err();
        assert!(err.is_store_anomaly());
    }

    #[test]
    fn test_update_missing_row_is_anomaly() {
        let mut manager = manager();
        let err = manager
            .apply(&Directive::Update(note_image(1, "a")))
            .unwrap_err();
        assert!(err.is_store_anomaly());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let mut manager = manager();
        manager.apply(&Directive::Create(note_image(1, "a"))).unwrap();
        let delete = Directive::Delete(Identity::new("note", 1));
        manager.apply(&delete).unwrap();
        manager.apply(&delete).unwrap();
        assert_eq!(manager.size("note").unwrap(), 0);
    }

    #[test]
    fn test_reference_lifecycle() {
        let mut manager = manager();
        let owner = Identity::new("folder", 1);
        manager.apply(&Directive::Create(folder_image(1))).unwrap();
        manager
            .apply(&Directive::CreateReference {
                owner: owner.clone(),
                field: "pinned".into(),
                target: note_image(1, "pinned"),
            })
            .unwrap();

        let folder: Folder = manager.fetch(1).unwrap().unwrap();
        assert_eq!(folder.pinned.unwrap().title, "pinned");
        assert_eq!(
            manager.links(&owner).unwrap(),
            vec![("pinned".to_string(), Identity::new("note", 1))]
        );

        let unlink = Directive::DeleteReference {
            owner: owner.clone(),
            field: "pinned".into(),
            target: Identity::new("note", 1),
        };
        manager.apply(&unlink).unwrap();
        manager.apply(&unlink).unwrap();

        let folder: Folder = manager.fetch(1).unwrap().unwrap();
        assert!(folder.pinned.is_none());
        assert_eq!(manager.size("note").unwrap(), 0);
    }

    #[test]
    fn test_reference_without_owner_is_anomaly() {
        let mut manager = manager();
        let err = manager
            .apply(&Directive::CreateReference {
                owner: Identity::new("folder", 7),
                field: "pinned".into(),
                target: note_image(1, "orphan"),
            })
            .unwrap_err();
        assert!(err.is_store_anomaly());
        assert_eq!(manager.size("note").unwrap(), 0);
    }

    #[test]
    fn test_missing_table_reads_empty() {
        let mut manager = manager();
        assert_eq!(manager.size("note").unwrap(), 0);
        assert!(manager.fetch_all::<Note>().unwrap().is_empty());
        manager.drop_records("note").unwrap();
    }

    #[test]
    fn test_fetch_applies_upgrade_default() {
        let mut manager = manager();
        let backend = manager.backend_mut();
        backend
            .ensure_table("note", &[crate::core::Column::new("title", DataType::Text)])
            .unwrap();
        let mut record = Record::new();
        record.insert("title".into(), Value::from("old"));
        backend.insert_row("note", 1, &record).unwrap();

        manager.set_default_upgrade_value(-1);
        let note: Note = manager.fetch(1).unwrap().unwrap();
        assert_eq!(note.stars, -1);
    }

    #[test]
    fn test_fetch_all_filtered() {
        let mut manager = manager();
        for id in 1..=3 {
            manager
                .apply(&Directive::Create(note_image(id, "n")))
                .unwrap();
        }
        let notes: Vec<Note> = manager.fetch_all_filtered(|id| id != 2).unwrap();
        let ids: Vec<_> = notes.iter().filter_map(|n| n.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
