use async_trait::async_trait;
use orchestrator_errors::OrchestratorResult;
use serde::{Deserialize, Serialize};

use crate::entities::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// 执行后端汇报的任务结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub state: ExecutionState,
    pub error_message: Option<String>,
    pub progress: f64,
}

impl ExecutionResult {
    pub fn running(progress: f64) -> Self {
        Self {
            success: false,
            state: ExecutionState::Running,
            error_message: None,
            progress,
        }
    }

    pub fn completed() -> Self {
        Self {
            success: true,
            state: ExecutionState::Completed,
            error_message: None,
            progress: 100.0,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            state: ExecutionState::Failed,
            error_message: Some(error.into()),
            progress: 0.0,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            success: false,
            state: ExecutionState::Cancelled,
            error_message: None,
            progress: 0.0,
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self.state, ExecutionState::Running)
    }
}

/// 外部执行后端（导入引擎等）。编排器轮询结果，不依赖推送。
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn create_task(&self, task: &Task) -> OrchestratorResult<()>;

    async fn start(&self, task_id: &str, async_mode: bool) -> OrchestratorResult<bool>;

    /// 协作式取消，后端自行决定如何停止
    async fn cancel(&self, task_id: &str, reason: &str) -> OrchestratorResult<bool>;

    async fn get_result(&self, task_id: &str) -> OrchestratorResult<Option<ExecutionResult>>;

    /// 编排器不再需要该任务的结果时调用。仍在运行的执行会被停止，记录随之删除。
    async fn discard(&self, task_id: &str) -> OrchestratorResult<()>;
}
