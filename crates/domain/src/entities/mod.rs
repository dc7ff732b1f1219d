pub mod dependency;
pub mod health;
pub mod resource;
pub mod status;
pub mod task;
pub mod worker;

pub use dependency::*;
pub use health::*;
pub use resource::*;
pub use status::*;
pub use task::*;
pub use worker::*;
