//! 任务编排器可执行程序的应用层：任务清单、应用装配和优雅关闭。

pub mod app;
pub mod jobs;
pub mod shutdown;

pub use app::Application;
pub use jobs::{JobSpec, JobsFile, WorkerSpec};
pub use shutdown::ShutdownManager;
