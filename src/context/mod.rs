//! Persistence context: the session cache plus the ordered log of directives
//! waiting for the next commit.
//!
//! Every mutating call records its directives at call time, in the order the
//! backend must see them. Nothing here reorders or coalesces the log.

mod cache;
mod directive;

pub use cache::Cache;
pub use directive::{Directive, DirectiveKind, EntityImage};

use crate::core::{EntityId, Identity, Result, StashError};
use crate::entity::{AnyEntity, Entity, reference_targets};
use crate::manager::PersistenceManager;
use crate::storage::Backend;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct PersistenceContext {
    cache: Cache,
    directives: VecDeque<Directive>,
    /// Identities deleted since the last successful commit.
    pending_deletes: HashSet<Identity>,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns ids to `instance` and any new children, records a Create plus
    /// one CreateReference per populated reference field, and caches the
    /// whole graph.
    pub fn create<T: Entity, B: Backend>(
        &mut self,
        manager: &mut PersistenceManager<B>,
        instance: &mut T,
    ) -> Result<EntityId> {
        if let Some(identity) = instance.identity() {
            return Err(StashError::InvalidArgument(format!(
                "{} already has an id; use update instead",
                identity
            )));
        }

        assign_identities(manager, instance)?;
        let image = EntityImage::capture(&*instance)?;
        let identity = image.identity.clone();

        self.pending_deletes.remove(&identity);
        self.directives.push_back(Directive::Create(image));
        self.stage_reference_creates(&*instance)?;
        self.cache.put(instance.clone_boxed())?;

        debug!(identity = %identity, "create staged");
        Ok(identity.id)
    }

    /// Records an Update for `instance` and reconciles its reference fields
    /// against the targets previously known for it:
    ///
    /// - same target: the child is updated in turn
    /// - cleared: DeleteReference, which also deletes the child
    /// - newly set: CreateReference
    /// - reassigned: DeleteReference for the old target, then CreateReference
    pub fn update<T: Entity, B: Backend>(
        &mut self,
        manager: &mut PersistenceManager<B>,
        instance: &mut T,
    ) -> Result<()> {
        let identity = instance.identity().ok_or_else(|| {
            StashError::InvalidArgument(format!(
                "cannot update a '{}' instance that was never added or loaded",
                T::TABLE
            ))
        })?;
        if self.pending_deletes.contains(&identity) {
            return Err(StashError::InvalidArgument(format!(
                "{} was deleted in this session",
                identity
            )));
        }
        if !self.cache.contains(&identity) && !manager.exists(&identity)? {
            return Err(StashError::InvalidArgument(format!(
                "{} is not known to the store",
                identity
            )));
        }

        self.check_linked_children(manager, &*instance)?;
        assign_identities(manager, instance)?;
        self.stage_update(manager, &*instance)?;
        debug!(identity = %identity, "update staged");
        Ok(())
    }

    /// Records a Delete for `table#id`, cascading a DeleteReference to every
    /// reference previously known for it. Deleting an identity that was never
    /// stored is allowed and applies as a no-op.
    pub fn delete<T: Entity, B: Backend>(
        &mut self,
        manager: &PersistenceManager<B>,
        id: EntityId,
    ) -> Result<()> {
        let identity = Identity::new(T::TABLE, id);
        let children = if self.pending_deletes.contains(&identity) {
            Vec::new()
        } else {
            self.known_references(manager, &identity)?
        };

        self.directives.push_back(Directive::Delete(identity.clone()));
        self.cache.remove(T::TABLE, id);
        self.pending_deletes.insert(identity.clone());

        for (field, target) in children {
            self.stage_reference_delete(manager, &identity, &field, target)?;
        }
        debug!(identity = %identity, "delete staged");
        Ok(())
    }

    /// Cache-only lookup. Embedded references are refreshed from the cache so
    /// the copy reflects every staged change.
    pub fn get_from_cache<T: Entity>(&self, id: EntityId) -> Result<Option<T>> {
        let Some(cached) = self.cache.get::<T>(id) else {
            return Ok(None);
        };
        let mut entity = cached.clone();
        self.refresh_references(&mut entity)?;
        Ok(Some(entity))
    }

    /// Loads a committed row into the cache. Identities deleted in this
    /// session read as absent.
    pub fn fetch_to_cache<T: Entity, B: Backend>(
        &mut self,
        manager: &PersistenceManager<B>,
        id: EntityId,
    ) -> Result<Option<T>> {
        if self.is_pending_delete(&Identity::new(T::TABLE, id)) {
            return Ok(None);
        }
        match manager.fetch::<T>(id)? {
            Some(entity) => self.admit(entity).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_all_from_cache<T: Entity>(&self) -> Result<Vec<T>> {
        self.cache
            .all_cached::<T>()
            .into_iter()
            .map(|cached| -> Result<T> {
                let mut entity = cached.clone();
                self.refresh_references(&mut entity)?;
                Ok(entity)
            })
            .collect()
    }

    /// Caches a freshly loaded entity and its children without overwriting
    /// anything already cached, then returns the cached view of it.
    pub(crate) fn admit<T: Entity>(&mut self, mut entity: T) -> Result<T> {
        self.admit_children(&entity)?;
        self.refresh_references(&mut entity)?;
        self.cache.put(entity.clone_boxed())?;
        Ok(entity)
    }

    pub fn is_cached(&self, identity: &Identity) -> bool {
        self.cache.contains(identity)
    }

    pub fn is_pending_delete(&self, identity: &Identity) -> bool {
        self.pending_deletes.contains(identity)
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Drops cached instances of `table`. Returns how many were evicted.
    pub fn evict_table(&mut self, table: &str) -> usize {
        self.cache.evict_table(table)
    }

    pub fn pending_directives(&self) -> &VecDeque<Directive> {
        &self.directives
    }

    /// Mutable access for the commit driver.
    pub fn pending_directives_mut(&mut self) -> &mut VecDeque<Directive> {
        &mut self.directives
    }

    pub fn clear_pending_directives(&mut self) {
        self.directives.clear();
    }

    /// Applies pending directives front to back.
    ///
    /// On failure the failing directive goes back to the front of the log and
    /// the error is returned; directives already applied stay applied.
    pub fn drain_into<B: Backend>(&mut self, manager: &mut PersistenceManager<B>) -> Result<usize> {
        let mut applied = 0;
        while let Some(directive) = self.directives.pop_front() {
            if let Err(err) = manager.apply(&directive) {
                warn!(
                    directive = %directive,
                    applied,
                    remaining = self.directives.len() + 1,
                    error = %err,
                    "directive failed, commit halted"
                );
                self.directives.push_front(directive);
                return Err(err);
            }
            applied += 1;
        }
        self.pending_deletes.clear();
        Ok(applied)
    }

    fn stage_update<B: Backend>(
        &mut self,
        manager: &PersistenceManager<B>,
        entity: &dyn AnyEntity,
    ) -> Result<()> {
        let identity = require_identity(entity)?;
        let previous = self.known_references(manager, &identity)?;
        self.directives
            .push_back(Directive::Update(EntityImage::capture(entity)?));

        let mut current = Vec::new();
        entity.for_each_reference(&mut |field, child| {
            current.push((field, child.map(|c| c.clone_boxed())));
        });

        // Unlinks go first so a child moved between fields ends up linked.
        let mut unlinks = Vec::new();
        let mut updates = Vec::new();
        let mut links = Vec::new();
        for (field, child) in current {
            let old = previous
                .iter()
                .find(|(name, _)| name.as_str() == field)
                .map(|(_, target)| target.clone());
            let child_identity = child.as_ref().and_then(|c| c.entity_identity());
            match (old, child) {
                (None, None) => {}
                (Some(old), None) => unlinks.push((field, old)),
                (None, Some(child)) => links.push((field, child)),
                (Some(old), Some(child)) if child_identity.as_ref() == Some(&old) => {
                    updates.push(child)
                }
                (Some(old), Some(child)) => {
                    unlinks.push((field, old));
                    links.push((field, child));
                }
            }
        }

        for (field, old) in unlinks {
            self.stage_reference_delete(manager, &identity, field, old)?;
        }
        for child in updates {
            self.stage_update(manager, &*child)?;
        }
        for (field, child) in links {
            self.stage_reference_create(&identity, field, child)?;
        }

        self.cache.put(entity.clone_boxed())
    }

    /// Rejects an update whose embedded child is still the linked target of
    /// its field but has been deleted. Only children that stage_update would
    /// update in place are checked.
    fn check_linked_children<B: Backend>(
        &self,
        manager: &PersistenceManager<B>,
        entity: &dyn AnyEntity,
    ) -> Result<()> {
        let identity = require_identity(entity)?;
        let previous = self.known_references(manager, &identity)?;
        for (field, child) in owned_children(entity) {
            let Some(child_identity) = child.entity_identity() else {
                continue;
            };
            let linked = previous
                .iter()
                .any(|(name, target)| name.as_str() == field && target == &child_identity);
            if !linked {
                continue;
            }
            let deleted = self.pending_deletes.contains(&child_identity)
                || (!self.cache.contains(&child_identity) && !manager.exists(&child_identity)?);
            if deleted {
                return Err(StashError::InvalidArgument(format!(
                    "{}.{} refers to {}, which has been deleted; reload {} first",
                    identity, field, child_identity, identity
                )));
            }
            self.check_linked_children(manager, &*child)?;
        }
        Ok(())
    }

    fn stage_reference_creates(&mut self, owner: &dyn AnyEntity) -> Result<()> {
        let identity = require_identity(owner)?;
        for (field, child) in owned_children(owner) {
            self.stage_reference_create(&identity, field, child)?;
        }
        Ok(())
    }

    fn stage_reference_create(
        &mut self,
        owner: &Identity,
        field: &str,
        child: Box<dyn AnyEntity>,
    ) -> Result<()> {
        let target = EntityImage::capture(&*child)?;
        self.pending_deletes.remove(&target.identity);
        self.directives.push_back(Directive::CreateReference {
            owner: owner.clone(),
            field: field.to_string(),
            target,
        });
        self.stage_reference_creates(&*child)?;
        self.cache.put(child)
    }

    fn stage_reference_delete<B: Backend>(
        &mut self,
        manager: &PersistenceManager<B>,
        owner: &Identity,
        field: &str,
        target: Identity,
    ) -> Result<()> {
        self.directives.push_back(Directive::DeleteReference {
            owner: owner.clone(),
            field: field.to_string(),
            target: target.clone(),
        });

        // Already tombstoned targets were cascaded when they were deleted.
        if self.pending_deletes.contains(&target) {
            return Ok(());
        }
        let children = self.known_references(manager, &target)?;
        self.cache.remove(&target.table, target.id);
        self.pending_deletes.insert(target.clone());
        for (child_field, child) in children {
            self.stage_reference_delete(manager, &target, &child_field, child)?;
        }
        Ok(())
    }

    /// Populated reference fields of `identity`: from the cached instance when
    /// there is one, otherwise from the committed links.
    fn known_references<B: Backend>(
        &self,
        manager: &PersistenceManager<B>,
        identity: &Identity,
    ) -> Result<Vec<(String, Identity)>> {
        if let Some(cached) = self.cache.get_dyn(identity) {
            return Ok(reference_targets(cached)
                .into_iter()
                .filter_map(|(field, target)| target.map(|t| (field.to_string(), t)))
                .collect());
        }
        if self.pending_deletes.contains(identity) {
            return Ok(Vec::new());
        }
        manager.links(identity)
    }

    /// Replaces embedded children with their cached versions and detaches
    /// children deleted in this session.
    fn refresh_references(&self, entity: &mut dyn AnyEntity) -> Result<()> {
        let mut detached = Vec::new();
        entity.for_each_reference_mut(&mut |field, child| {
            if let Some(identity) = child.entity_identity() {
                if self.pending_deletes.contains(&identity) {
                    detached.push(field);
                    return Ok(());
                }
                if let Some(cached) = self.cache.get_dyn(&identity) {
                    child.replace_from(cached);
                }
            }
            self.refresh_references(child)
        })?;
        for field in detached {
            entity.detach_reference(field);
        }
        Ok(())
    }

    fn admit_children(&mut self, entity: &dyn AnyEntity) -> Result<()> {
        for (_, child) in owned_children(entity) {
            let Some(identity) = child.entity_identity() else {
                continue;
            };
            if self.cache.contains(&identity) || self.pending_deletes.contains(&identity) {
                continue;
            }
            self.admit_children(&*child)?;
            self.cache.put(child)?;
        }
        Ok(())
    }
}

/// Gives every id-less entity in the graph rooted at `entity` a fresh id.
fn assign_identities<B: Backend>(
    manager: &mut PersistenceManager<B>,
    entity: &mut dyn AnyEntity,
) -> Result<()> {
    if entity.entity_id().is_none() {
        let id = manager.reserve_id(entity.table())?;
        entity.assign_id(id);
    }
    entity.for_each_reference_mut(&mut |_, child| assign_identities(&mut *manager, child))
}

fn owned_children(entity: &dyn AnyEntity) -> Vec<(&'static str, Box<dyn AnyEntity>)> {
    let mut children = Vec::new();
    entity.for_each_reference(&mut |field, child| {
        if let Some(child) = child {
            children.push((field, child.clone_boxed()));
        }
    });
    children
}

fn require_identity(entity: &dyn AnyEntity) -> Result<Identity> {
    entity.entity_identity().ok_or_else(|| {
        StashError::InvalidArgument(format!("'{}' entity has no id", entity.table()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::fixtures::{Folder, Note};
    use crate::storage::MemoryBackend;

    fn setup() -> (PersistenceContext, PersistenceManager<MemoryBackend>) {
        (
            PersistenceContext::new(),
            PersistenceManager::new(MemoryBackend::new()),
        )
    }

    fn commit(
        context: &mut PersistenceContext,
        manager: &mut PersistenceManager<MemoryBackend>,
    ) -> Result<usize> {
        context.drain_into(manager)
    }

    fn kinds(context: &PersistenceContext) -> Vec<DirectiveKind> {
        context
            .pending_directives()
            .iter()
            .map(Directive::kind)
            .collect()
    }

    fn folder_with_note(title: &str) -> Folder {
        Folder {
            id: None,
            name: "inbox".into(),
            pinned: Some(Note::new(title, 1)),
        }
    }

    #[test]
    fn test_create_caches_and_enqueues() {
        let (mut context, mut manager) = setup();
        let mut note = Note::new("hello", 2);
        let id = context.create(&mut manager, &mut note).unwrap();

        assert_eq!(id, 1);
        assert_eq!(note.id, Some(1));
        assert_eq!(kinds(&context), vec![DirectiveKind::Create]);
        assert_eq!(context.get_from_cache::<Note>(1).unwrap(), Some(note));
        assert_eq!(manager.size("note").unwrap(), 0);
    }

    #[test]
    fn test_create_twice_is_rejected() {
        let (mut context, mut manager) = setup();
        let mut note = Note::new("hello", 2);
        context.create(&mut manager, &mut note).unwrap();
        let err = context.create(&mut manager, &mut note).unwrap_err();
        assert!(matches!(err, StashError::InvalidArgument(_)));
        assert_eq!(context.pending_directives().len(), 1);
    }

    #[test]
    fn test_create_with_reference() {
        let (mut context, mut manager) = setup();
        let mut folder = folder_with_note("pinned");
        context.create(&mut manager, &mut folder).unwrap();

        assert_eq!(
            kinds(&context),
            vec![DirectiveKind::Create, DirectiveKind::CreateReference]
        );
        let pinned_id = folder.pinned.as_ref().and_then(|n| n.id).unwrap();
        assert!(context.get_from_cache::<Note>(pinned_id).unwrap().is_some());

        commit(&mut context, &mut manager).unwrap();
        let loaded: Folder = manager.fetch(folder.id.unwrap()).unwrap().unwrap();
        assert_eq!(loaded, folder);
    }

    #[test]
    fn test_update_requires_identity() {
        let (mut context, mut manager) = setup();
        let mut note = Note::new("loose", 0);
        let err = context.update(&mut manager, &mut note).unwrap_err();
        assert!(matches!(err, StashError::InvalidArgument(_)));

        note.id = Some(42);
        let err = context.update(&mut manager, &mut note).unwrap_err();
        assert!(matches!(err, StashError::InvalidArgument(_)));
        assert!(context.pending_directives().is_empty());
    }

    #[test]
    fn test_update_after_create_keeps_both_directives() {
        let (mut context, mut manager) = setup();
        let mut note = Note::new("v1", 0);
        context.create(&mut manager, &mut note).unwrap();
        note.title = "v2".into();
        context.update(&mut manager, &mut note).unwrap();

        assert_eq!(
            kinds(&context),
            vec![DirectiveKind::Create, DirectiveKind::Update]
        );
        assert_eq!(
            context.get_from_cache::<Note>(1).unwrap().unwrap().title,
            "v2"
        );
    }

    #[test]
    fn test_delete_hides_instance_and_cascades() {
        let (mut context, mut manager) = setup();
        let mut folder = folder_with_note("pinned");
        context.create(&mut manager, &mut folder).unwrap();
        commit(&mut context, &mut manager).unwrap();

        let folder_id = folder.id.unwrap();
        let note_id = folder.pinned.as_ref().and_then(|n| n.id).unwrap();
        context.delete::<Folder, _>(&manager, folder_id).unwrap();

        assert_eq!(
            kinds(&context),
            vec![DirectiveKind::Delete, DirectiveKind::DeleteReference]
        );
        assert!(context.get_from_cache::<Folder>(folder_id).unwrap().is_none());
        assert!(context.get_from_cache::<Note>(note_id).unwrap().is_none());
        assert!(
            context
                .fetch_to_cache::<Note, _>(&manager, note_id)
                .unwrap()
                .is_none()
        );

        commit(&mut context, &mut manager).unwrap();
        assert_eq!(manager.size("folder").unwrap(), 0);
        assert_eq!(manager.size("note").unwrap(), 0);
    }

    #[test]
    fn test_delete_uses_committed_links_when_not_cached() {
        let (mut context, mut manager) = setup();
        let mut folder = folder_with_note("pinned");
        context.create(&mut manager, &mut folder).unwrap();
        commit(&mut context, &mut manager).unwrap();

        let mut fresh = PersistenceContext::new();
        fresh.delete::<Folder, _>(&manager, folder.id.unwrap()).unwrap();
        assert_eq!(
            kinds(&fresh),
            vec![DirectiveKind::Delete, DirectiveKind::DeleteReference]
        );
    }

    #[test]
    fn test_update_clearing_reference() {
        let (mut context, mut manager) = setup();
        let mut folder = folder_with_note("pinned");
        context.create(&mut manager, &mut folder).unwrap();
        commit(&mut context, &mut manager).unwrap();

        folder.pinned = None;
        context.update(&mut manager, &mut folder).unwrap();
        assert_eq!(
            kinds(&context),
            vec![DirectiveKind::Update, DirectiveKind::DeleteReference]
        );

        commit(&mut context, &mut manager).unwrap();
        assert_eq!(manager.size("note").unwrap(), 0);
        let loaded: Folder = manager.fetch(folder.id.unwrap()).unwrap().unwrap();
        assert!(loaded.pinned.is_none());
    }

    #[test]
    fn test_update_same_reference_updates_child() {
        let (mut context, mut manager) = setup();
        let mut folder = folder_with_note("before");
        context.create(&mut manager, &mut folder).unwrap();
        commit(&mut context, &mut manager).unwrap();

        if let Some(note) = folder.pinned.as_mut() {
            note.title = "after".into();
        }
        context.update(&mut manager, &mut folder).unwrap();
        assert_eq!(
            kinds(&context),
            vec![DirectiveKind::Update, DirectiveKind::Update]
        );

        commit(&mut context, &mut manager).unwrap();
        let loaded: Folder = manager.fetch(folder.id.unwrap()).unwrap().unwrap();
        assert_eq!(loaded.pinned.unwrap().title, "after");
    }

    #[test]
    fn test_update_reassigning_reference() {
        let (mut context, mut manager) = setup();
        let mut folder = folder_with_note("old");
        context.create(&mut manager, &mut folder).unwrap();
        commit(&mut context, &mut manager).unwrap();
        let old_id = folder.pinned.as_ref().and_then(|n| n.id).unwrap();

        folder.pinned = Some(Note::new("new", 5));
        context.update(&mut manager, &mut folder).unwrap();
        assert_eq!(
            kinds(&context),
            vec![
                DirectiveKind::Update,
                DirectiveKind::DeleteReference,
                DirectiveKind::CreateReference
            ]
        );

        commit(&mut context, &mut manager).unwrap();
        assert!(manager.fetch::<Note>(old_id).unwrap().is_none());
        let loaded: Folder = manager.fetch(folder.id.unwrap()).unwrap().unwrap();
        assert_eq!(loaded.pinned.unwrap().title, "new");
    }

    #[test]
    fn test_cached_parent_sees_child_updates() {
        let (mut context, mut manager) = setup();
        let mut folder = folder_with_note("before");
        context.create(&mut manager, &mut folder).unwrap();

        let mut note = folder.pinned.clone().unwrap();
        note.title = "after".into();
        context.update(&mut manager, &mut note).unwrap();

        let cached: Folder = context
            .get_from_cache(folder.id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(cached.pinned.unwrap().title, "after");
    }

    #[test]
    fn test_fetch_to_cache_does_not_clobber_cached_children() {
        let (mut context, mut manager) = setup();
        let mut folder = folder_with_note("stored");
        context.create(&mut manager, &mut folder).unwrap();
        commit(&mut context, &mut manager).unwrap();

        let mut fresh = PersistenceContext::new();
        let note_id = folder.pinned.as_ref().and_then(|n| n.id).unwrap();
        let mut note: Note = fresh.fetch_to_cache(&manager, note_id).unwrap().unwrap();
        note.title = "edited".into();
        fresh.update(&mut manager, &mut note).unwrap();

        let loaded: Folder = fresh
            .fetch_to_cache(&manager, folder.id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(loaded.pinned.unwrap().title, "edited");
    }

    #[test]
    fn test_clear_pending_directives() {
        let (mut context, mut manager) = setup();
        context
            .create(&mut manager, &mut Note::new("a", 0))
            .unwrap();
        context.clear_pending_directives();
        assert!(context.pending_directives().is_empty());
        assert_eq!(context.get_all_from_cache::<Note>().unwrap().len(), 1);
    }

    #[test]
    fn test_drain_stops_at_failing_directive() {
        let (mut context, mut manager) = setup();
        let mut first = Note::new("first", 0);
        context.create(&mut manager, &mut first).unwrap();
        context
            .pending_directives_mut()
            .push_back(Directive::Update(EntityImage {
                identity: Identity::new("note", 99),
                columns: Note::columns(),
                record: first.to_record(),
            }));
        let mut last = Note::new("last", 0);
        context.create(&mut manager, &mut last).unwrap();

        let err = context.drain_into(&mut manager).unwrap_err();
        assert!(err.is_store_anomaly());
        assert_eq!(manager.size("note").unwrap(), 1);
        assert_eq!(
            kinds(&context),
            vec![DirectiveKind::Update, DirectiveKind::Create]
        );
    }

    #[test]
    fn test_tombstones_clear_after_commit() {
        let (mut context, mut manager) = setup();
        let mut note = Note::new("gone", 0);
        context.create(&mut manager, &mut note).unwrap();
        context.delete::<Note, _>(&manager, 1).unwrap();
        assert!(context.is_pending_delete(&Identity::new("note", 1)));

        assert_eq!(commit(&mut context, &mut manager).unwrap(), 2);
        assert!(!context.is_pending_delete(&Identity::new("note", 1)));
        assert!(context.fetch_to_cache::<Note, _>(&manager, 1).unwrap().is_none());
    }
}
