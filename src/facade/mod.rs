//! Session façade: the handle application code opens, mutates and commits.

pub mod config;
pub mod store;

pub use config::StoreConfig;
pub use store::DataStore;
