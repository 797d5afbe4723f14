use super::{ColumnValue, Entity};
use crate::core::{DataType, EntityId, Identity, Record, Result, StashError, Value};
use crate::storage::Backend;
use tracing::warn;

/// Reference chains deeper than this are treated as a corrupt link graph.
const MAX_REFERENCE_DEPTH: usize = 64;

/// Read access to one stored row while an entity is being rebuilt.
///
/// Columns that the row predates read as the configured upgrade default:
/// non-nullable numeric columns get the default value, everything else
/// reads as NULL.
pub struct Loader<'a> {
    backend: &'a dyn Backend,
    identity: Identity,
    record: Record,
    default_upgrade_value: i64,
    depth: usize,
}

impl<'a> Loader<'a> {
    pub(crate) fn new(
        backend: &'a dyn Backend,
        identity: Identity,
        record: Record,
        default_upgrade_value: i64,
    ) -> Self {
        Self {
            backend,
            identity,
            record,
            default_upgrade_value,
            depth: 0,
        }
    }

    pub fn id(&self) -> EntityId {
        self.identity.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Raw stored value of a column, `None` when the row predates it.
    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.record.get(name)
    }

    pub fn column<V: ColumnValue>(&self, name: &str) -> Result<V> {
        let value = match self.record.get(name) {
            Some(value) => value.clone(),
            None if V::NULLABLE => Value::Null,
            None => self.upgrade_default(V::DATA_TYPE),
        };
        V::from_value(value).map_err(|err| match err {
            StashError::TypeMismatch(msg) => StashError::TypeMismatch(format!(
                "column '{}' of {}: {}",
                name, self.identity, msg
            )),
            other => other,
        })
    }

    /// Resolves a reference field by following its stored link.
    ///
    /// A link whose target row is gone reads as an empty reference.
    pub fn reference<C: Entity>(&self, field: &str) -> Result<Option<C>> {
        let Some(target) = self.backend.link(&self.identity, field)? else {
            return Ok(None);
        };

        if target.table != C::TABLE {
            return Err(StashError::StoreAnomaly(format!(
                "field '{}' of {} links to {}, expected table '{}'",
                field,
                self.identity,
                target,
                C::TABLE
            )));
        }

        if self.depth >= MAX_REFERENCE_DEPTH {
            return Err(StashError::StoreAnomaly(format!(
                "reference chain from {} exceeds {} levels",
                self.identity, MAX_REFERENCE_DEPTH
            )));
        }

        let Some(record) = self.backend.read_row(&target.table, target.id)? else {
            warn!(owner = %self.identity, field, target = %target, "dangling reference link");
            return Ok(None);
        };

        let nested = Loader {
            backend: self.backend,
            identity: target,
            record,
            default_upgrade_value: self.default_upgrade_value,
            depth: self.depth + 1,
        };
        C::from_record(&nested).map(Some)
    }

    fn upgrade_default(&self, data_type: DataType) -> Value {
        match data_type {
            DataType::Integer => Value::Integer(self.default_upgrade_value),
            DataType::Float => Value::Float(self.default_upgrade_value as f64),
            DataType::Text | DataType::Boolean => Value::Null,
        }
    }
}

/// Reads `table#id` from the backend and rebuilds it as `T`.
pub(crate) fn materialize<T: Entity>(
    backend: &dyn Backend,
    id: EntityId,
    record: Record,
    default_upgrade_value: i64,
) -> Result<T> {
    let loader = Loader::new(
        backend,
        Identity::new(T::TABLE, id),
        record,
        default_upgrade_value,
    );
    T::from_record(&loader)
}
