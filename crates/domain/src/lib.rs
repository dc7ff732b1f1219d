pub mod entities;
pub mod ports;

pub use entities::*;
pub use orchestrator_errors::{OrchestratorError, OrchestratorResult};
pub use ports::*;
