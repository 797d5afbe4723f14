use thiserror::Error;

#[derive(Error, Debug)]
pub enum StashError {
    #[error("Store is not open")]
    NotOpen,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Store anomaly: {0}")]
    StoreAnomaly(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Column '{0}' not found in table '{1}'")]
    ColumnNotFound(String, String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

pub type Result<T> = std::result::Result<T, StashError>;

impl StashError {
    /// True for errors the caller can recover from by reopening the store.
    pub fn is_not_open(&self) -> bool {
        matches!(self, Self::NotOpen)
    }

    pub fn is_store_anomaly(&self) -> bool {
        matches!(self, Self::StoreAnomaly(_))
    }
}

impl From<std::io::Error> for StashError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}
