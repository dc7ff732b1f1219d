pub mod sqlite_task_status_store;

pub use sqlite_task_status_store::SqliteTaskStatusStore;
