// ============================================================================
// stashdb Library
// ============================================================================

//! Embeddable object store.
//!
//! Application types derive [`Entity`] and are stored one table per type.
//! A [`DataStore`] stages every `add`/`update`/`delete` in a persistence
//! context (a read-through cache plus an ordered directive log) and writes
//! them to its [`Backend`] only when [`DataStore::commit`] runs.
//!
//! ```ignore
//! use stashdb::{DataStore, Entity, EntityId};
//!
//! #[derive(Debug, Clone, Entity)]
//! #[entity(table = "users")]
//! struct User {
//!     id: Option<EntityId>,
//!     name: String,
//! }
//!
//! let mut store = DataStore::in_memory();
//! store.open()?;
//! let id = store.add(&mut User { id: None, name: "Alice".into() })?;
//! store.commit()?;
//! assert_eq!(store.get::<User>(id)?.unwrap().name, "Alice");
//! ```

pub mod context;
pub mod core;
pub mod entity;
pub mod facade;
pub mod manager;
pub mod storage;

// Re-export main types for convenience
pub use context::{Directive, DirectiveKind, EntityImage, PersistenceContext};
pub use core::{Column, DataType, EntityId, Identity, Record, Result, StashError, Value};
pub use entity::{AnyEntity, ColumnValue, Entity, FieldDescriptor, FieldKind, Loader};
pub use facade::{DataStore, StoreConfig};
pub use manager::PersistenceManager;
pub use storage::{Backend, DurabilityMode, FileBackend, MemoryBackend};

pub use stashdb_derive::Entity;
