use crate::core::{DataType, Result, StashError, Value};

/// Conversion between a Rust field type and a stored column value.
pub trait ColumnValue: Sized {
    const DATA_TYPE: DataType;
    const NULLABLE: bool = false;

    fn to_value(&self) -> Value;
    fn from_value(value: Value) -> Result<Self>;
}

fn mismatch(expected: DataType, value: &Value) -> StashError {
    StashError::TypeMismatch(format!(
        "expected {}, got {}",
        expected,
        value.type_name()
    ))
}

macro_rules! impl_integer_column {
    ($($ty:ty),*) => {
        $(
            impl ColumnValue for $ty {
                const DATA_TYPE: DataType = DataType::Integer;

                fn to_value(&self) -> Value {
                    Value::Integer(*self as i64)
                }

                fn from_value(value: Value) -> Result<Self> {
                    match value {
                        Value::Integer(i) => <$ty>::try_from(i).map_err(|_| {
                            StashError::TypeMismatch(format!(
                                "value {} out of range for {}",
                                i,
                                stringify!($ty)
                            ))
                        }),
                        other => Err(mismatch(DataType::Integer, &other)),
                    }
                }
            }
        )*
    };
}

impl_integer_column!(i64, i32, i16, i8, u32, u16, u8);

impl ColumnValue for f64 {
    const DATA_TYPE: DataType = DataType::Float;

    fn to_value(&self) -> Value {
        Value::Float(*self)
    }

    fn from_value(value: Value) -> Result<Self> {
        value
            .as_f64()
            .ok_or_else(|| mismatch(DataType::Float, &value))
    }
}

impl ColumnValue for f32 {
    const DATA_TYPE: DataType = DataType::Float;

    fn to_value(&self) -> Value {
        Value::Float(*self as f64)
    }

    fn from_value(value: Value) -> Result<Self> {
        f64::from_value(value).map(|f| f as f32)
    }
}

impl ColumnValue for bool {
    const DATA_TYPE: DataType = DataType::Boolean;

    fn to_value(&self) -> Value {
        Value::Boolean(*self)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Boolean(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(mismatch(DataType::Boolean, &other)),
        }
    }
}

impl ColumnValue for String {
    const DATA_TYPE: DataType = DataType::Text;

    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s),
            Value::Null => Ok(String::new()),
            other => Err(mismatch(DataType::Text, &other)),
        }
    }
}

impl<T: ColumnValue> ColumnValue for Option<T> {
    const DATA_TYPE: DataType = T::DATA_TYPE;
    const NULLABLE: bool = true;

    fn to_value(&self) -> Value {
        match self {
            Some(inner) => inner.to_value(),
            None => Value::Null,
        }
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}
