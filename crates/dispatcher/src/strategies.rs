use std::sync::Arc;

use orchestrator_domain::entities::Task;
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

/// 队列排序键，越小越先出队
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueKey {
    pub primary: i64,
    pub secondary: i64,
    /// 入队序号，保证相同键时先进先出
    pub sequence: u64,
}

/// 可插拔的排队策略
pub trait SchedulingStrategy: Send + Sync {
    /// (primary, secondary) 排序键
    fn sort_key(&self, task: &Task) -> (i64, i64);

    fn name(&self) -> &str;
}

/// 先按优先级，再按创建时间
#[derive(Debug, Default)]
pub struct PriorityStrategy;

/// 严格按创建时间
#[derive(Debug, Default)]
pub struct FifoStrategy;

/// 截止时间最早的优先，没有截止时间的排在最后，同截止时间按优先级
#[derive(Debug, Default)]
pub struct DeadlineStrategy;

impl SchedulingStrategy for PriorityStrategy {
    fn sort_key(&self, task: &Task) -> (i64, i64) {
        (
            i64::from(task.priority.value()),
            task.created_at.timestamp_micros(),
        )
    }

    fn name(&self) -> &str {
        "Priority"
    }
}

impl SchedulingStrategy for FifoStrategy {
    fn sort_key(&self, task: &Task) -> (i64, i64) {
        (task.created_at.timestamp_micros(), 0)
    }

    fn name(&self) -> &str {
        "FIFO"
    }
}

impl SchedulingStrategy for DeadlineStrategy {
    fn sort_key(&self, task: &Task) -> (i64, i64) {
        let deadline = task
            .deadline
            .map(|d| d.timestamp_micros())
            .unwrap_or(i64::MAX);
        (deadline, i64::from(task.priority.value()))
    }

    fn name(&self) -> &str {
        "Deadline"
    }
}

pub fn strategy_from_name(name: &str) -> OrchestratorResult<Arc<dyn SchedulingStrategy>> {
    match name.to_ascii_lowercase().as_str() {
        "priority" => Ok(Arc::new(PriorityStrategy)),
        "fifo" => Ok(Arc::new(FifoStrategy)),
        "deadline" => Ok(Arc::new(DeadlineStrategy)),
        other => Err(OrchestratorError::config_error(format!(
            "未知的调度策略: {other}"
        ))),
    }
}
