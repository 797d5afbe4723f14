use super::{Result, StashError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Integer key assigned by the store to every persisted entity.
pub type EntityId = i64;

/// Column name to value mapping for one entity row.
///
/// Columns the stored row predates are simply absent.
pub type Record = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Integer,
    Float,
    Text,
    Boolean,
}

impl DataType {
    pub fn is_compatible(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (DataType::Integer, Value::Integer(_)) => true,
            (DataType::Float, Value::Float(_)) => true,
            (DataType::Float, Value::Integer(_)) => true,
            (DataType::Text, Value::Text(_)) => true,
            (DataType::Boolean, Value::Boolean(_)) => true,
            _ => false,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Integer | DataType::Float)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Integer => write!(f, "INTEGER"),
            DataType::Float => write!(f, "FLOAT"),
            DataType::Text => write!(f, "TEXT"),
            DataType::Boolean => write!(f, "BOOLEAN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn validate(&self, value: &Value) -> Result<()> {
        if matches!(value, Value::Null) {
            if !self.nullable {
                return Err(StashError::ConstraintViolation(format!(
                    "Column '{}' cannot be NULL",
                    self.name
                )));
            }
            return Ok(());
        }

        if !self.data_type.is_compatible(value) {
            return Err(StashError::TypeMismatch(format!(
                "Column '{}' expects type {}, got {}",
                self.name,
                self.data_type,
                value.type_name()
            )));
        }

        Ok(())
    }
}

/// The (entity type, id) pair naming one stored instance.
///
/// Entity types are identified by their table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub table: String,
    pub id: EntityId,
}

impl Identity {
    pub fn new(table: impl Into<String>, id: EntityId) -> Self {
        Self {
            table: table.into(),
            id,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.table, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_validation() {
        let col = Column::new("age", DataType::Integer).not_null();
        assert!(col.validate(&Value::Integer(3)).is_ok());
        assert!(matches!(
            col.validate(&Value::Null),
            Err(StashError::ConstraintViolation(_))
        ));
        assert!(matches!(
            col.validate(&Value::Text("x".into())),
            Err(StashError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_float_column_accepts_integers() {
        let col = Column::new("score", DataType::Float);
        assert!(col.validate(&Value::Integer(1)).is_ok());
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(Identity::new("foo", 4).to_string(), "foo#4");
    }
}
