//! 测试用的内存执行后端
//!
//! 任务结果由测试代码手动推进，`get_result` 只返回当前设置的结果。

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use orchestrator_domain::entities::Task;
use orchestrator_domain::ports::{ExecutionBackend, ExecutionResult};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct FakeExecutionBackend {
    created: Mutex<HashMap<String, Task>>,
    results: Mutex<HashMap<String, ExecutionResult>>,
    started: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
    discarded: Mutex<Vec<String>>,
    fail_start: Mutex<HashSet<String>>,
}

impl FakeExecutionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self, task_id: &str) {
        lock(&self.results).insert(task_id.to_string(), ExecutionResult::completed());
    }

    pub fn fail(&self, task_id: &str, error: &str) {
        lock(&self.results).insert(task_id.to_string(), ExecutionResult::failed(error));
    }

    pub fn set_running(&self, task_id: &str, progress: f64) {
        lock(&self.results).insert(task_id.to_string(), ExecutionResult::running(progress));
    }

    /// 下一次 `start` 该任务时返回错误
    pub fn fail_start(&self, task_id: &str) {
        lock(&self.fail_start).insert(task_id.to_string());
    }

    pub fn started(&self) -> Vec<String> {
        lock(&self.started).clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        lock(&self.cancelled).clone()
    }

    pub fn discarded(&self) -> Vec<String> {
        lock(&self.discarded).clone()
    }

    /// 后端仍保留结果的任务数
    pub fn retained(&self) -> usize {
        lock(&self.results).len()
    }

    pub fn created(&self, task_id: &str) -> Option<Task> {
        lock(&self.created).get(task_id).cloned()
    }

    pub fn start_count(&self, task_id: &str) -> usize {
        lock(&self.started).iter().filter(|id| *id == task_id).count()
    }
}

#[async_trait]
impl ExecutionBackend for FakeExecutionBackend {
    async fn create_task(&self, task: &Task) -> OrchestratorResult<()> {
        lock(&self.created).insert(task.id.clone(), task.clone());
        lock(&self.results).remove(&task.id);
        Ok(())
    }

    async fn start(&self, task_id: &str, _async_mode: bool) -> OrchestratorResult<bool> {
        if lock(&self.fail_start).remove(task_id) {
            return Err(OrchestratorError::ExecutionBackend(format!(
                "无法启动任务 {task_id}"
            )));
        }
        if !lock(&self.created).contains_key(task_id) {
            return Err(OrchestratorError::task_not_found(task_id));
        }
        lock(&self.started).push(task_id.to_string());
        lock(&self.results)
            .entry(task_id.to_string())
            .or_insert_with(|| ExecutionResult::running(0.0));
        Ok(true)
    }

    async fn cancel(&self, task_id: &str, _reason: &str) -> OrchestratorResult<bool> {
        lock(&self.cancelled).push(task_id.to_string());
        let known = lock(&self.created).contains_key(task_id);
        if known {
            lock(&self.results).insert(task_id.to_string(), ExecutionResult::cancelled());
        }
        Ok(known)
    }

    async fn get_result(&self, task_id: &str) -> OrchestratorResult<Option<ExecutionResult>> {
        Ok(lock(&self.results).get(task_id).cloned())
    }

    async fn discard(&self, task_id: &str) -> OrchestratorResult<()> {
        lock(&self.discarded).push(task_id.to_string());
        lock(&self.created).remove(task_id);
        lock(&self.results).remove(task_id);
        Ok(())
    }
}
