use chrono::{DateTime, Utc};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::task::TaskPriority;

/// 任务生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Created,
    Pending,
    Initializing,
    Running,
    Paused,
    Resuming,
    Completing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Error,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 12] = [
        TaskStatus::Created,
        TaskStatus::Pending,
        TaskStatus::Initializing,
        TaskStatus::Running,
        TaskStatus::Paused,
        TaskStatus::Resuming,
        TaskStatus::Completing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Timeout,
        TaskStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "CREATED",
            TaskStatus::Pending => "PENDING",
            TaskStatus::Initializing => "INITIALIZING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Resuming => "RESUMING",
            TaskStatus::Completing => "COMPLETING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Timeout => "TIMEOUT",
            TaskStatus::Error => "ERROR",
        }
    }

    /// 合法的目标状态
    pub fn allowed_targets(&self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Created => &[Pending, Cancelled],
            Pending => &[Initializing, Cancelled],
            Initializing => &[Running, Failed, Error, Timeout, Cancelled],
            Running => &[Paused, Completing, Failed, Cancelled, Timeout, Error],
            Paused => &[Resuming, Cancelled],
            Resuming => &[Running, Failed, Cancelled],
            Completing => &[Completed, Failed, Cancelled],
            Failed => &[Pending, Cancelled],
            Timeout | Error => &[Pending, Failed, Cancelled],
            Completed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// 不再有任何出边的状态
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// 已分配给worker、占用资源的状态
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TaskStatus::Initializing
                | TaskStatus::Running
                | TaskStatus::Paused
                | TaskStatus::Resuming
                | TaskStatus::Completing
        )
    }

    /// 可以通过重试回到Pending的失败状态
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Error
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| OrchestratorError::Serialization(format!("无效的任务状态: {s}")))
    }
}

/// 一次状态更新请求
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: TaskStatus,
    pub message: Option<String>,
    pub error: Option<String>,
    pub progress: Option<f64>,
}

impl StatusUpdate {
    pub fn to(status: TaskStatus) -> Self {
        Self {
            status,
            message: None,
            error: None,
            progress: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// 状态历史中的一条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub task_id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

/// 持久化的任务状态记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusInfo {
    pub task_id: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub progress: f64,
    pub message: Option<String>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TaskStatusInfo {
    pub fn new(
        task_id: impl Into<String>,
        priority: TaskPriority,
        timeout_seconds: u64,
        max_retries: u32,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Created,
            priority,
            progress: 0.0,
            message: None,
            error: None,
            retry_count: 0,
            max_retries,
            timeout_seconds,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            metadata,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// 终态，或者重试次数耗尽的Failed
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal() || (self.status == TaskStatus::Failed && !self.can_retry())
    }

    /// 应用一次状态更新。非法转换返回错误且记录保持不变。
    ///
    /// Running -> Running 视为进度更新，不产生历史记录。
    pub fn apply(
        &mut self,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<Option<StatusTransition>> {
        let from = self.status;
        let to = update.status;

        if from == TaskStatus::Running && to == TaskStatus::Running {
            self.merge_details(update, now);
            return Ok(None);
        }

        if !from.can_transition_to(to) {
            return Err(OrchestratorError::illegal_transition(
                &self.task_id,
                from,
                to,
            ));
        }

        // 重试耗尽的失败已是最终结局
        if from == TaskStatus::Failed && to == TaskStatus::Cancelled && !self.can_retry() {
            return Err(OrchestratorError::illegal_transition(
                &self.task_id,
                from,
                to,
            ));
        }

        if from.is_failure() && to == TaskStatus::Pending {
            if !self.can_retry() {
                return Err(OrchestratorError::illegal_transition(
                    &self.task_id,
                    from,
                    to,
                ));
            }
            self.retry_count += 1;
            self.progress = 0.0;
            self.started_at = None;
            self.completed_at = None;
        }

        self.status = to;
        match to {
            TaskStatus::Running => {
                self.started_at.get_or_insert(now);
            }
            TaskStatus::Completed => {
                self.progress = 100.0;
                self.completed_at = Some(now);
            }
            TaskStatus::Cancelled | TaskStatus::Failed => {
                self.completed_at = Some(now);
            }
            _ => {}
        }
        self.merge_details(update, now);

        Ok(Some(StatusTransition {
            task_id: self.task_id.clone(),
            from,
            to,
            message: update.message.clone(),
            at: now,
        }))
    }

    fn merge_details(&mut self, update: &StatusUpdate, now: DateTime<Utc>) {
        if let Some(progress) = update.progress.filter(|p| p.is_finite()) {
            let progress = progress.clamp(0.0, 100.0);
            // 运行期间进度只增不减
            if self.status != TaskStatus::Running || progress >= self.progress {
                self.progress = progress;
            }
        }
        if let Some(message) = &update.message {
            self.message = Some(message.clone());
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        self.updated_at = now;
    }
}
