//! Object mapper: how a Rust record type maps to a table.
//!
//! Types implement [`Entity`] (usually through `#[derive(Entity)]`). The
//! persistence layer works with them through the object-safe [`AnyEntity`]
//! view so that the cache and the directive log can hold instances of any
//! entity type side by side.

mod column_value;
mod loader;

pub use column_value::ColumnValue;
pub use loader::Loader;
pub(crate) use loader::materialize;

use crate::core::{Column, DataType, EntityId, Identity, Record, Result};
use std::any::Any;
use std::fmt;

/// What a declared field stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// A primitive or string value held in a column of the owner's row.
    Column { data_type: DataType, nullable: bool },
    /// Another stored entity, linked from the owner's row.
    Reference { table: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl FieldDescriptor {
    pub const fn column(name: &'static str, data_type: DataType, nullable: bool) -> Self {
        Self {
            name,
            kind: FieldKind::Column {
                data_type,
                nullable,
            },
        }
    }

    pub const fn reference(name: &'static str, table: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Reference { table },
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind, FieldKind::Reference { .. })
    }

    /// The column backing this field, `None` for reference fields.
    pub fn to_column(&self) -> Option<Column> {
        match self.kind {
            FieldKind::Column {
                data_type,
                nullable,
            } => {
                let column = Column::new(self.name, data_type);
                Some(if nullable { column } else { column.not_null() })
            }
            FieldKind::Reference { .. } => None,
        }
    }
}

/// A record type stored in its own table.
///
/// The id field is managed by the store: it is `None` until the instance is
/// first added and must never be set by application code.
pub trait Entity: Clone + fmt::Debug + Send + Sync + 'static {
    /// Table holding every instance of this type.
    const TABLE: &'static str;

    /// Declared fields in declaration order, id excluded.
    fn fields() -> Vec<FieldDescriptor>;

    fn id(&self) -> Option<EntityId>;

    #[doc(hidden)]
    fn set_id(&mut self, id: EntityId);

    /// Column values of this instance, reference fields excluded.
    fn to_record(&self) -> Record;

    /// Rebuilds an instance from a stored row.
    fn from_record(loader: &Loader<'_>) -> Result<Self>;

    /// Calls `visitor` once per reference field, in declaration order.
    fn visit_references(&self, _visitor: &mut dyn FnMut(&'static str, Option<&dyn AnyEntity>)) {}

    /// Calls `visitor` for every reference field currently holding a value.
    fn visit_references_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&'static str, &mut dyn AnyEntity) -> Result<()>,
    ) -> Result<()> {
        Ok(())
    }

    /// Clears a reference field. Returns false for unknown fields.
    fn clear_reference(&mut self, _field: &str) -> bool {
        false
    }

    fn columns() -> Vec<Column> {
        Self::fields()
            .iter()
            .filter_map(FieldDescriptor::to_column)
            .collect()
    }

    fn identity(&self) -> Option<Identity> {
        self.id().map(|id| Identity::new(Self::TABLE, id))
    }
}

/// Type-erased view of an [`Entity`].
pub trait AnyEntity: fmt::Debug + Send + Sync + 'static {
    fn table(&self) -> &'static str;
    fn entity_id(&self) -> Option<EntityId>;
    fn assign_id(&mut self, id: EntityId);
    fn entity_identity(&self) -> Option<Identity>;
    fn column_set(&self) -> Vec<Column>;
    fn record(&self) -> Record;
    fn for_each_reference(&self, visitor: &mut dyn FnMut(&'static str, Option<&dyn AnyEntity>));
    fn for_each_reference_mut(
        &mut self,
        visitor: &mut dyn FnMut(&'static str, &mut dyn AnyEntity) -> Result<()>,
    ) -> Result<()>;
    fn detach_reference(&mut self, field: &str) -> bool;
    /// Overwrites `self` with `other` when both are the same concrete type.
    fn replace_from(&mut self, other: &dyn AnyEntity) -> bool;
    fn clone_boxed(&self) -> Box<dyn AnyEntity>;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Entity> AnyEntity for T {
    fn table(&self) -> &'static str {
        T::TABLE
    }

    fn entity_id(&self) -> Option<EntityId> {
        self.id()
    }

    fn assign_id(&mut self, id: EntityId) {
        self.set_id(id);
    }

    fn entity_identity(&self) -> Option<Identity> {
        self.identity()
    }

    fn column_set(&self) -> Vec<Column> {
        T::columns()
    }

    fn record(&self) -> Record {
        self.to_record()
    }

    fn for_each_reference(&self, visitor: &mut dyn FnMut(&'static str, Option<&dyn AnyEntity>)) {
        self.visit_references(visitor);
    }

    fn for_each_reference_mut(
        &mut self,
        visitor: &mut dyn FnMut(&'static str, &mut dyn AnyEntity) -> Result<()>,
    ) -> Result<()> {
        self.visit_references_mut(visitor)
    }

    fn detach_reference(&mut self, field: &str) -> bool {
        self.clear_reference(field)
    }

    fn replace_from(&mut self, other: &dyn AnyEntity) -> bool {
        match other.as_any().downcast_ref::<T>() {
            Some(other) => {
                *self = other.clone();
                true
            }
            None => false,
        }
    }

    fn clone_boxed(&self) -> Box<dyn AnyEntity> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Identities of the references an entity currently holds, by field.
pub(crate) fn reference_targets(entity: &dyn AnyEntity) -> Vec<(&'static str, Option<Identity>)> {
    let mut targets = Vec::new();
    entity.for_each_reference(&mut |field, child| {
        targets.push((field, child.and_then(|c| c.entity_identity())));
    });
    targets
}


#[cfg(test)]
mod tests {
    use super::fixtures::{Folder, Note};
    use super::*;

    #[test]
    fn test_columns_skip_references() {
        let columns = Folder::columns();
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].name, "name");
        assert!(!columns[0].nullable);
    }

    #[test]
    fn test_replace_from_requires_same_type() {
        let mut note = Note::new("a", 1);
        let other = Note::new("b", 2);
        assert!(note.replace_from(&other));
        assert_eq!(note.title, "b");

        let folder = Folder::default();
        assert!(!note.replace_from(&folder));
    }

    #[test]
    fn test_reference_targets() {
        let mut pinned = Note::new("p", 0);
        pinned.set_id(9);
        let folder = Folder {
            id: Some(1),
            name: "f".into(),
            pinned: Some(pinned),
        };
        let targets = reference_targets(&folder);
        assert_eq!(targets, vec![("pinned", Some(Identity::new("note", 9)))]);
    }
}
