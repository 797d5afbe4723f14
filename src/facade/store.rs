use super::config::StoreConfig;
use crate::context::{Directive, PersistenceContext};
use crate::core::{EntityId, Identity, Result, StashError};
use crate::entity::Entity;
use crate::manager::PersistenceManager;
use crate::storage::{Backend, FileBackend, MemoryBackend};
use std::collections::VecDeque;
use tracing::{debug, info, info_span, warn};

/// Session handle over one backend.
///
/// Mutations are staged in a persistence context and reach the backend only
/// on [`commit`](Self::commit) (or [`close`](Self::close), which commits
/// first). Reads see staged state: the cache is consulted before the backend.
///
/// ```ignore
/// let mut store = DataStore::in_memory();
/// store.open()?;
/// let mut user = User { id: None, name: "Alice".into() };
/// let id = store.add(&mut user)?;
/// store.commit()?;
/// assert_eq!(store.get::<User>(id)?.unwrap().name, "Alice");
/// ```
pub struct DataStore<B: Backend = MemoryBackend> {
    config: StoreConfig,
    manager: PersistenceManager<B>,
    /// Present while the store is open.
    context: Option<PersistenceContext>,
}

impl DataStore<MemoryBackend> {
    /// A store whose rows live in memory. Committed rows survive close and
    /// reopen of the same handle.
    pub fn in_memory() -> Self {
        Self::with_backend(MemoryBackend::new(), StoreConfig::in_memory())
    }
}

impl DataStore<FileBackend> {
    /// A store persisted under `config.data_dir`.
    pub fn persistent(config: StoreConfig) -> Result<Self> {
        let backend = config.file_backend()?;
        Ok(Self::with_backend(backend, config))
    }
}

impl<B: Backend> DataStore<B> {
    pub fn with_backend(backend: B, config: StoreConfig) -> Self {
        let mut manager = PersistenceManager::new(backend);
        manager.set_default_upgrade_value(config.default_upgrade_value);
        Self {
            config,
            manager,
            context: None,
        }
    }

    pub fn open(&mut self) -> Result<()> {
        if self.is_open() {
            debug!("open called on an open store");
            return Ok(());
        }
        self.manager.open()?;
        self.context = Some(PersistenceContext::new());
        info!(data_dir = ?self.config.data_dir, "store opened");
        Ok(())
    }

    /// Commits pending directives, then closes the backend.
    ///
    /// If the commit fails the store stays open with the unapplied
    /// directives still pending.
    pub fn close(&mut self) -> Result<()> {
        self.commit()?;
        self.manager.close()?;
        self.context = None;
        info!("store closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.context.is_some()
    }

    /// Applies every pending directive in order and returns how many were
    /// applied.
    ///
    /// Commits are not atomic: when a directive fails, the ones before it
    /// stay applied and it and everything after it remain pending.
    pub fn commit(&mut self) -> Result<usize> {
        let span = info_span!("stashdb.commit");
        let _enter = span.enter();

        let (context, manager) = self.session()?;
        let pending = context.pending_directives().len();
        if pending == 0 {
            debug!("nothing to commit");
            return Ok(0);
        }

        let drained = context.drain_into(manager);
        let flushed = manager.flush();
        let applied = drained?;
        flushed?;
        info!(applied, "commit finished");
        Ok(applied)
    }

    /// Stages a new instance and returns the id assigned to it. The id is
    /// written into `instance` and stays valid after commit.
    pub fn add<T: Entity>(&mut self, instance: &mut T) -> Result<EntityId> {
        let (context, manager) = self.session()?;
        context.create(manager, instance)
    }

    pub fn update<T: Entity>(&mut self, instance: &mut T) -> Result<()> {
        let (context, manager) = self.session()?;
        context.update(manager, instance)
    }

    pub fn delete<T: Entity>(&mut self, id: EntityId) -> Result<()> {
        let (context, manager) = self.session()?;
        context.delete::<T, B>(&*manager, id)
    }

    pub fn get<T: Entity>(&mut self, id: EntityId) -> Result<Option<T>> {
        let (context, manager) = self.session()?;
        if context.is_pending_delete(&Identity::new(T::TABLE, id)) {
            return Ok(None);
        }
        if let Some(entity) = context.get_from_cache::<T>(id)? {
            return Ok(Some(entity));
        }
        context.fetch_to_cache::<T, B>(&*manager, id)
    }

    /// Cached instances of `T` plus every committed row not already cached,
    /// ordered by id. Instances deleted in this session are left out.
    pub fn get_all<T: Entity>(&mut self) -> Result<Vec<T>> {
        let (context, manager) = self.session()?;
        let mut all = context.get_all_from_cache::<T>()?;

        let stored = manager.fetch_all_filtered::<T, _>(|id| {
            let identity = Identity::new(T::TABLE, id);
            !context.is_cached(&identity) && !context.is_pending_delete(&identity)
        })?;
        for entity in stored {
            all.push(context.admit(entity)?);
        }

        all.sort_by_key(|entity| entity.id());
        Ok(all)
    }

    /// Committed row count for `T`. Staged creates and deletes are not
    /// counted until they are committed.
    pub fn size<T: Entity>(&self) -> Result<usize> {
        self.ensure_open()?;
        self.manager.size(T::TABLE)
    }

    /// Removes every committed row of the named table and evicts its cached
    /// instances. Directives already staged for the table are kept.
    pub fn drop_records(&mut self, name: &str) -> Result<()> {
        let (context, manager) = self.session()?;
        manager.drop_records(name)?;
        let evicted = context.evict_table(name);
        if evicted > 0 {
            debug!(table = name, evicted, "evicted cached instances");
        }
        Ok(())
    }

    pub fn set_default_upgrade_value(&mut self, value: i64) -> Result<()> {
        self.ensure_open()?;
        self.manager.set_default_upgrade_value(value);
        self.config.default_upgrade_value = value;
        Ok(())
    }

    pub fn pending_directive_count(&self) -> Result<usize> {
        Ok(self.context()?.pending_directives().len())
    }

    pub fn pending_directives(&self) -> Result<&VecDeque<Directive>> {
        Ok(self.context()?.pending_directives())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        self.manager.backend()
    }

    /// Direct backend access. Changes made here bypass the cache.
    pub fn backend_mut(&mut self) -> &mut B {
        self.manager.backend_mut()
    }

    fn ensure_open(&self) -> Result<()> {
        self.context().map(|_| ())
    }

    fn context(&self) -> Result<&PersistenceContext> {
        self.context.as_ref().ok_or(StashError::NotOpen)
    }

    fn session(&mut self) -> Result<(&mut PersistenceContext, &mut PersistenceManager<B>)> {
        let context = self.context.as_mut().ok_or(StashError::NotOpen)?;
        Ok((context, &mut self.manager))
    }
}

impl<B: Backend> Drop for DataStore<B> {
    fn drop(&mut self) {
        if let Some(context) = &self.context {
            let pending = context.pending_directives().len();
            if pending > 0 {
                warn!(pending, "store dropped with uncommitted directives");
            }
        }
    }
}
