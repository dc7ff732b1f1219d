pub mod execution;
pub mod health_source;
pub mod status_store;

pub use execution::*;
pub use health_source::*;
pub use status_store::*;
