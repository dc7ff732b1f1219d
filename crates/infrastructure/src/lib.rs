pub mod database;
pub mod execution;
pub mod in_memory_status_store;

pub use database::*;
pub use execution::*;
pub use in_memory_status_store::InMemoryTaskStatusStore;
