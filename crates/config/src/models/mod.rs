pub mod app_config;
pub mod database;
pub mod fault_tolerance;
pub mod observability;
pub mod resources;
pub mod scheduler;

pub use app_config::*;
pub use database::*;
pub use fault_tolerance::*;
pub use observability::*;
pub use resources::*;
pub use scheduler::*;
