use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("检测到循环依赖: {}", .path.join(" -> "))]
    CircularDependency { path: Vec<String> },
    #[error("非法的状态转换: 任务 {task_id} 从 {from} 到 {to}")]
    IllegalTransition {
        task_id: String,
        from: String,
        to: String,
    },
    #[error("资源不足: 任务 {task_id} 需要 {resource} {requested:.3}，剩余 {available:.3}")]
    ResourceExhausted {
        task_id: String,
        resource: String,
        requested: f64,
        available: f64,
    },
    #[error("恢复动作执行失败: {action} - {reason}")]
    RecoveryActionFailed { action: String, reason: String },
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("任务已存在: {id}")]
    TaskAlreadyExists { id: String },
    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: String },
    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("执行后端错误: {0}")]
    ExecutionBackend(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn worker_not_found<S: Into<String>>(id: S) -> Self {
        Self::WorkerNotFound { id: id.into() }
    }
    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTaskParams(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }
    pub fn illegal_transition(
        task_id: impl Into<String>,
        from: impl std::fmt::Debug,
        to: impl std::fmt::Debug,
    ) -> Self {
        Self::IllegalTransition {
            task_id: task_id.into(),
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }
    /// 提交阶段必须同步暴露给调用方的错误
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            OrchestratorError::CircularDependency { .. }
                | OrchestratorError::TaskAlreadyExists { .. }
                | OrchestratorError::InvalidTaskParams(_)
                | OrchestratorError::ValidationError(_)
        )
    }
    /// 调度循环中只需回退重排队、不视为任务失败的错误
    pub fn is_backpressure(&self) -> bool {
        matches!(self, OrchestratorError::ResourceExhausted { .. })
    }
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Internal(_) | OrchestratorError::Configuration(_)
        )
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}
