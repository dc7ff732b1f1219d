pub mod shell_backend;

pub use shell_backend::{ShellExecutionBackend, ShellTaskParams};
