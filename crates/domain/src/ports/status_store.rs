use async_trait::async_trait;
use orchestrator_errors::OrchestratorResult;

use crate::entities::{StatusTransition, StatusUpdate, TaskStatus, TaskStatusInfo};

/// 任务状态持久化存储，重启后必须能够恢复全部记录
#[async_trait]
pub trait TaskStatusStore: Send + Sync {
    /// 记录已存在时返回 false
    async fn create(&self, record: TaskStatusInfo) -> OrchestratorResult<bool>;

    /// 非法转换返回 `IllegalTransition`，已存储的状态不变
    async fn update_status(
        &self,
        task_id: &str,
        update: StatusUpdate,
    ) -> OrchestratorResult<TaskStatusInfo>;

    async fn get(&self, task_id: &str) -> OrchestratorResult<Option<TaskStatusInfo>>;

    async fn list_by_status(&self, status: TaskStatus) -> OrchestratorResult<Vec<TaskStatusInfo>>;

    async fn list_all(&self) -> OrchestratorResult<Vec<TaskStatusInfo>>;

    /// 只删除已结束的记录
    async fn remove(&self, task_id: &str) -> OrchestratorResult<bool>;

    /// 删除早于指定小时数的已结束记录，返回删除数量
    async fn cleanup(&self, older_than_hours: u64) -> OrchestratorResult<u64>;

    async fn history(&self, task_id: &str) -> OrchestratorResult<Vec<StatusTransition>>;
}
