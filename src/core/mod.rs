pub mod error;
pub mod types;
pub mod value;

pub use error::{Result, StashError};
pub use types::{Column, DataType, EntityId, Identity, Record};
pub use value::Value;
