use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use orchestrator_domain::entities::{StatusTransition, StatusUpdate, TaskStatus, TaskStatusInfo};
use orchestrator_domain::ports::TaskStatusStore;
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Default)]
struct State {
    records: HashMap<String, TaskStatusInfo>,
    history: HashMap<String, Vec<StatusTransition>>,
}

/// 内存任务状态存储
///
/// 不具备持久性，适用于测试和嵌入式场景。
#[derive(Debug, Default)]
pub struct InMemoryTaskStatusStore {
    state: RwLock<State>,
}

impl InMemoryTaskStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.records.is_empty()
    }
}

fn sorted(mut records: Vec<TaskStatusInfo>) -> Vec<TaskStatusInfo> {
    records.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.task_id.cmp(&b.task_id))
    });
    records
}

#[async_trait]
impl TaskStatusStore for InMemoryTaskStatusStore {
    async fn create(&self, record: TaskStatusInfo) -> OrchestratorResult<bool> {
        let mut state = self.state.write().await;
        if state.records.contains_key(&record.task_id) {
            return Ok(false);
        }
        state.records.insert(record.task_id.clone(), record);
        Ok(true)
    }

    async fn update_status(
        &self,
        task_id: &str,
        update: StatusUpdate,
    ) -> OrchestratorResult<TaskStatusInfo> {
        let mut state = self.state.write().await;
        let current = state
            .records
            .get(task_id)
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;

        // 在副本上应用，非法转换不会污染已存储的记录
        let mut record = current.clone();
        let transition = record.apply(&update, Utc::now())?;
        state.records.insert(task_id.to_string(), record.clone());
        if let Some(transition) = transition {
            debug!("任务 {} 状态 {} -> {}", task_id, transition.from, transition.to);
            state
                .history
                .entry(task_id.to_string())
                .or_default()
                .push(transition);
        }
        Ok(record)
    }

    async fn get(&self, task_id: &str) -> OrchestratorResult<Option<TaskStatusInfo>> {
        Ok(self.state.read().await.records.get(task_id).cloned())
    }

    async fn list_by_status(&self, status: TaskStatus) -> OrchestratorResult<Vec<TaskStatusInfo>> {
        let state = self.state.read().await;
        Ok(sorted(
            state
                .records
                .values()
                .filter(|r| r.status == status)
                .cloned()
                .collect(),
        ))
    }

    async fn list_all(&self) -> OrchestratorResult<Vec<TaskStatusInfo>> {
        let state = self.state.read().await;
        Ok(sorted(state.records.values().cloned().collect()))
    }

    async fn remove(&self, task_id: &str) -> OrchestratorResult<bool> {
        let mut state = self.state.write().await;
        match state.records.get(task_id) {
            Some(record) if record.is_settled() => {
                state.records.remove(task_id);
                state.history.remove(task_id);
                Ok(true)
            }
            Some(record) => Err(OrchestratorError::validation_error(format!(
                "任务 {task_id} 尚未结束（{}），不能删除",
                record.status
            ))),
            None => Ok(false),
        }
    }

    async fn cleanup(&self, older_than_hours: u64) -> OrchestratorResult<u64> {
        let hours = i64::try_from(older_than_hours).unwrap_or(i64::MAX);
        let cutoff = Utc::now() - Duration::hours(hours.min(24 * 365 * 100));
        let mut state = self.state.write().await;

        let expired: Vec<String> = state
            .records
            .values()
            .filter(|r| r.is_settled() && r.updated_at < cutoff)
            .map(|r| r.task_id.clone())
            .collect();
        for task_id in &expired {
            state.records.remove(task_id);
            state.history.remove(task_id);
        }
        Ok(expired.len() as u64)
    }

    async fn history(&self, task_id: &str) -> OrchestratorResult<Vec<StatusTransition>> {
        Ok(self
            .state
            .read()
            .await
            .history
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_domain::entities::TaskPriority;

    fn record(id: &str) -> TaskStatusInfo {
        TaskStatusInfo::new(id, TaskPriority::Normal, 60, 1, HashMap::new())
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = InMemoryTaskStatusStore::new();
        assert!(store.create(record("a")).await.unwrap());
        assert!(!store.create(record("a")).await.unwrap());
        assert_eq!(store.len().await, 1);
        assert!(store.history("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_cycle_counts_retries() {
        let store = InMemoryTaskStatusStore::new();
        store.create(record("a")).await.unwrap();
        for status in [
            TaskStatus::Pending,
            TaskStatus::Initializing,
            TaskStatus::Running,
            TaskStatus::Failed,
            TaskStatus::Pending,
        ] {
            store
                .update_status("a", StatusUpdate::to(status))
                .await
                .unwrap();
        }
        let loaded = store.get("a").await.unwrap().unwrap();
        assert_eq!(loaded.retry_count, 1);
        assert!(!loaded.can_retry());
        assert_eq!(store.history("a").await.unwrap().len(), 5);

        // 重试预算用尽后不能再回到Pending
        for status in [TaskStatus::Initializing, TaskStatus::Error] {
            store
                .update_status("a", StatusUpdate::to(status))
                .await
                .unwrap();
        }
        let err = store
            .update_status("a", StatusUpdate::to(TaskStatus::Pending))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::IllegalTransition { .. }));
        assert_eq!(
            store.get("a").await.unwrap().unwrap().status,
            TaskStatus::Error
        );
    }

    #[tokio::test]
    async fn test_remove_and_cleanup() {
        let store = InMemoryTaskStatusStore::new();
        store.create(record("a")).await.unwrap();
        store.create(record("b")).await.unwrap();
        assert!(store.remove("a").await.is_err());

        store
            .update_status("a", StatusUpdate::to(TaskStatus::Cancelled))
            .await
            .unwrap();
        assert_eq!(store.cleanup(24).await.unwrap(), 0);
        assert_eq!(store.cleanup(0).await.unwrap(), 1);
        assert!(!store.remove("a").await.unwrap());
        assert_eq!(
            store.list_by_status(TaskStatus::Created).await.unwrap().len(),
            1
        );
    }
}
