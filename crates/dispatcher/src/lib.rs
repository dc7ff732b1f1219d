//! 任务依赖解析与编排核心
//!
//! 依赖图与解析器、资源池、调度队列、Worker注册表、故障容错和编排服务。

pub mod dependency_graph;
pub mod dependency_manager;
pub mod dependency_resolver;
pub mod fault_tolerance;
pub mod orchestration;
pub mod resource_manager;
pub mod retry_service;
pub mod scheduler;
pub mod strategies;
pub mod worker_registry;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use dependency_graph::DependencyGraph;
pub use dependency_manager::{DependencyManager, ValidationReport};
pub use dependency_resolver::{tarjan_scc, DependencyResolver};
pub use fault_tolerance::{
    FailureDetector, FaultAssessment, FaultToleranceManager, HealthMonitor, RecoveryCallback,
    RecoveryEngine,
};
pub use orchestration::{
    MonitorSummary, OrchestrationService, OrchestratorStats, RecoverySummary, TASK_SPEC_KEY,
};
pub use resource_manager::ResourceManager;
pub use retry_service::RetryPolicy;
pub use scheduler::{QueueStats, QueuedTask, TaskScheduler};
pub use strategies::*;
pub use worker_registry::WorkerRegistry;
