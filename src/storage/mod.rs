pub mod backend;
pub mod file;
pub mod memory;
pub mod persistence;
pub mod table;

pub use backend::Backend;
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use persistence::{DurabilityMode, JournalEntry, StoreSnapshot};
pub use table::{Row, Table, TableSchema};
