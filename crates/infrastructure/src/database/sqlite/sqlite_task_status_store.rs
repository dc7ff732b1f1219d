use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use orchestrator_domain::entities::{
    StatusTransition, StatusUpdate, TaskPriority, TaskStatus, TaskStatusInfo,
};
use orchestrator_domain::ports::TaskStatusStore;
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

use crate::database::DatabaseManager;

const SELECT_COLUMNS: &str = "SELECT task_id, status, priority, progress, message, error, \
     retry_count, max_retries, timeout_seconds, created_at, updated_at, started_at, \
     completed_at, metadata FROM task_status";

/// 基于SQLite的任务状态存储，状态与转换历史在同一事务中写入
pub struct SqliteTaskStatusStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteTaskStatusStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    /// 连接数据库并执行建表
    pub async fn connect(url: &str, max_connections: u32) -> OrchestratorResult<Self> {
        let manager = DatabaseManager::new(url, max_connections).await?;
        manager.migrate().await?;
        Ok(Self::new(manager.pool().clone()))
    }

    pub async fn new_in_memory() -> OrchestratorResult<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    fn row_to_status_info(row: &SqliteRow) -> OrchestratorResult<TaskStatusInfo> {
        let status: String = row.try_get("status")?;
        let priority: i64 = row.try_get("priority")?;
        let metadata: String = row.try_get("metadata")?;
        let retry_count: i64 = row.try_get("retry_count")?;
        let max_retries: i64 = row.try_get("max_retries")?;
        let timeout_seconds: i64 = row.try_get("timeout_seconds")?;

        Ok(TaskStatusInfo {
            task_id: row.try_get("task_id")?,
            status: TaskStatus::from_str(&status)?,
            priority: u8::try_from(priority)
                .ok()
                .and_then(TaskPriority::from_value)
                .unwrap_or_default(),
            progress: row.try_get("progress")?,
            message: row.try_get("message")?,
            error: row.try_get("error")?,
            retry_count: u32::try_from(retry_count).unwrap_or(0),
            max_retries: u32::try_from(max_retries).unwrap_or(0),
            timeout_seconds: u64::try_from(timeout_seconds).unwrap_or(0),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            metadata: serde_json::from_str::<HashMap<String, serde_json::Value>>(&metadata)?,
        })
    }

    fn row_to_transition(row: &SqliteRow) -> OrchestratorResult<StatusTransition> {
        let from: String = row.try_get("from_status")?;
        let to: String = row.try_get("to_status")?;
        Ok(StatusTransition {
            task_id: row.try_get("task_id")?,
            from: TaskStatus::from_str(&from)?,
            to: TaskStatus::from_str(&to)?,
            message: row.try_get("message")?,
            at: row.try_get("transitioned_at")?,
        })
    }

    async fn fetch(&self, task_id: &str) -> OrchestratorResult<Option<TaskStatusInfo>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE task_id = ?"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_status_info).transpose()
    }

    async fn fetch_many(&self, sql: &str, status: Option<&str>) -> OrchestratorResult<Vec<TaskStatusInfo>> {
        let mut query = sqlx::query(sql);
        if let Some(status) = status {
            query = query.bind(status);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_status_info).collect()
    }

    async fn delete(&self, task_id: &str) -> OrchestratorResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM task_status_history WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM task_status WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TaskStatusStore for SqliteTaskStatusStore {
    #[instrument(skip(self, record), fields(task_id = %record.task_id))]
    async fn create(&self, record: TaskStatusInfo) -> OrchestratorResult<bool> {
        let metadata = serde_json::to_string(&record.metadata)?;
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            r#"
            INSERT INTO task_status (task_id, status, priority, progress, message, error,
                retry_count, max_retries, timeout_seconds, created_at, updated_at,
                started_at, completed_at, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO NOTHING
            "#,
        )
        .bind(&record.task_id)
        .bind(record.status.as_str())
        .bind(i64::from(record.priority.value()))
        .bind(record.progress)
        .bind(&record.message)
        .bind(&record.error)
        .bind(i64::from(record.retry_count))
        .bind(i64::from(record.max_retries))
        .bind(i64::try_from(record.timeout_seconds).unwrap_or(i64::MAX))
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() > 0;
        if created {
            debug!("创建任务状态记录: {}", record.task_id);
        }
        Ok(created)
    }

    #[instrument(skip(self, update), fields(to = %update.status))]
    async fn update_status(
        &self,
        task_id: &str,
        update: StatusUpdate,
    ) -> OrchestratorResult<TaskStatusInfo> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .fetch(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;
        let transition = record.apply(&update, Utc::now())?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE task_status SET status = ?, progress = ?, message = ?, error = ?,
                retry_count = ?, updated_at = ?, started_at = ?, completed_at = ?
            WHERE task_id = ?
            "#,
        )
        .bind(record.status.as_str())
        .bind(record.progress)
        .bind(&record.message)
        .bind(&record.error)
        .bind(i64::from(record.retry_count))
        .bind(record.updated_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        if let Some(transition) = &transition {
            sqlx::query(
                r#"
                INSERT INTO task_status_history (task_id, from_status, to_status, message, transitioned_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&transition.task_id)
            .bind(transition.from.as_str())
            .bind(transition.to.as_str())
            .bind(&transition.message)
            .bind(transition.at)
            .execute(&mut *tx)
            .await?;
            debug!("任务 {} 状态 {} -> {}", task_id, transition.from, transition.to);
        }
        tx.commit().await?;
        Ok(record)
    }

    async fn get(&self, task_id: &str) -> OrchestratorResult<Option<TaskStatusInfo>> {
        self.fetch(task_id).await
    }

    async fn list_by_status(&self, status: TaskStatus) -> OrchestratorResult<Vec<TaskStatusInfo>> {
        self.fetch_many(
            &format!("{SELECT_COLUMNS} WHERE status = ? ORDER BY created_at, task_id"),
            Some(status.as_str()),
        )
        .await
    }

    async fn list_all(&self) -> OrchestratorResult<Vec<TaskStatusInfo>> {
        self.fetch_many(&format!("{SELECT_COLUMNS} ORDER BY created_at, task_id"), None)
            .await
    }

    #[instrument(skip(self))]
    async fn remove(&self, task_id: &str) -> OrchestratorResult<bool> {
        let _guard = self.write_lock.lock().await;
        match self.fetch(task_id).await? {
            Some(record) if record.is_settled() => self.delete(task_id).await,
            Some(record) => Err(OrchestratorError::validation_error(format!(
                "任务 {task_id} 尚未结束（{}），不能删除",
                record.status
            ))),
            None => Ok(false),
        }
    }

    #[instrument(skip(self))]
    async fn cleanup(&self, older_than_hours: u64) -> OrchestratorResult<u64> {
        let hours = i64::try_from(older_than_hours).unwrap_or(i64::MAX);
        let cutoff: DateTime<Utc> = Utc::now() - Duration::hours(hours.min(24 * 365 * 100));
        let _guard = self.write_lock.lock().await;

        let expired: Vec<String> = self
            .list_all()
            .await?
            .into_iter()
            .filter(|r| r.is_settled() && r.updated_at < cutoff)
            .map(|r| r.task_id)
            .collect();

        let mut removed = 0;
        for task_id in &expired {
            if self.delete(task_id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("清理了 {} 条过期任务状态记录", removed);
        }
        Ok(removed)
    }

    async fn history(&self, task_id: &str) -> OrchestratorResult<Vec<StatusTransition>> {
        let rows = sqlx::query(
            "SELECT task_id, from_status, to_status, message, transitioned_at \
             FROM task_status_history WHERE task_id = ? ORDER BY id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_transition).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> TaskStatusInfo {
        let mut metadata = HashMap::new();
        metadata.insert("owner".to_string(), serde_json::json!("etl"));
        TaskStatusInfo::new(id, TaskPriority::High, 60, 1, metadata)
    }

    async fn advance(store: &SqliteTaskStatusStore, id: &str, statuses: &[TaskStatus]) {
        for status in statuses {
            store
                .update_status(id, StatusUpdate::to(*status))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = SqliteTaskStatusStore::new_in_memory().await.unwrap();
        assert!(store.create(record("a")).await.unwrap());
        assert!(!store.create(record("a")).await.unwrap());

        let loaded = store.get("a").await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Created);
        assert_eq!(loaded.priority, TaskPriority::High);
        assert_eq!(loaded.metadata["owner"], serde_json::json!("etl"));
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_illegal_transition_leaves_record_unchanged() {
        let store = SqliteTaskStatusStore::new_in_memory().await.unwrap();
        store.create(record("a")).await.unwrap();

        let err = store
            .update_status("a", StatusUpdate::to(TaskStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::IllegalTransition { .. }));
        assert_eq!(
            store.get("a").await.unwrap().unwrap().status,
            TaskStatus::Created
        );
        assert!(store.history("a").await.unwrap().is_empty());

        let missing = store
            .update_status("missing", StatusUpdate::to(TaskStatus::Pending))
            .await;
        assert!(matches!(missing, Err(OrchestratorError::TaskNotFound { .. })));
    }

    #[tokio::test]
    async fn test_history_and_list_by_status() {
        let store = SqliteTaskStatusStore::new_in_memory().await.unwrap();
        store.create(record("a")).await.unwrap();
        store.create(record("b")).await.unwrap();
        advance(
            &store,
            "a",
            &[TaskStatus::Pending, TaskStatus::Initializing, TaskStatus::Running],
        )
        .await;
        store
            .update_status(
                "a",
                StatusUpdate::to(TaskStatus::Running).with_progress(50.0),
            )
            .await
            .unwrap();

        let history: Vec<TaskStatus> = store
            .history("a")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.to)
            .collect();
        assert_eq!(
            history,
            vec![TaskStatus::Pending, TaskStatus::Initializing, TaskStatus::Running]
        );

        let running = store.list_by_status(TaskStatus::Running).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].progress, 50.0);
        assert!(running[0].started_at.is_some());
        assert_eq!(store.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_only_settled() {
        let store = SqliteTaskStatusStore::new_in_memory().await.unwrap();
        store.create(record("a")).await.unwrap();
        assert!(store.remove("a").await.is_err());

        advance(&store, "a", &[TaskStatus::Cancelled]).await;
        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());
        assert!(store.history("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_removes_old_settled_records() {
        let store = SqliteTaskStatusStore::new_in_memory().await.unwrap();
        store.create(record("done")).await.unwrap();
        store.create(record("active")).await.unwrap();
        advance(&store, "done", &[TaskStatus::Cancelled]).await;
        advance(&store, "active", &[TaskStatus::Pending]).await;

        assert_eq!(store.cleanup(1).await.unwrap(), 0);
        assert_eq!(store.cleanup(0).await.unwrap(), 1);
        assert!(store.get("done").await.unwrap().is_none());
        assert!(store.get("active").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("status.db").display());
        {
            let store = SqliteTaskStatusStore::connect(&url, 2).await.unwrap();
            store.create(record("a")).await.unwrap();
            advance(&store, "a", &[TaskStatus::Pending]).await;
            store.pool.close().await;
        }

        let reopened = SqliteTaskStatusStore::connect(&url, 2).await.unwrap();
        let loaded = reopened.get("a").await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(reopened.history("a").await.unwrap().len(), 1);
    }
}
