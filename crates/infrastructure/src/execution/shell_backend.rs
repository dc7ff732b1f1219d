use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use orchestrator_domain::entities::Task;
use orchestrator_domain::ports::{ExecutionBackend, ExecutionResult, ExecutionState};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

/// 任务 payload 中的 Shell 参数
///
/// 没有 `args` 时通过 `sh -c` 执行 `command`，否则直接执行。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellTaskParams {
    pub command: String,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

impl ShellTaskParams {
    pub fn from_payload(payload: &serde_json::Value) -> OrchestratorResult<Self> {
        let params: ShellTaskParams = serde_json::from_value(payload.clone())
            .map_err(|e| OrchestratorError::invalid_params(format!("解析Shell任务参数失败: {e}")))?;
        if params.command.trim().is_empty() {
            return Err(OrchestratorError::invalid_params("Shell命令不能为空"));
        }
        Ok(params)
    }

    fn build_command(&self) -> Command {
        let mut cmd = match &self.args {
            Some(args) => {
                let mut cmd = Command::new(&self.command);
                cmd.args(args);
                cmd
            }
            None => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(&self.command);
                cmd
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.env_vars);
        cmd
    }
}

#[derive(Debug)]
struct ShellTask {
    params: ShellTaskParams,
    result: Option<ExecutionResult>,
    cancel: Option<oneshot::Sender<()>>,
    /// 当前这次执行的编号，旧进程的结束结果按编号丢弃
    run: u64,
}

type TaskTable = Arc<Mutex<HashMap<String, ShellTask>>>;

/// 以本地子进程执行任务的后端
///
/// 结果保留到编排器调用 `discard` 为止。
#[derive(Debug, Clone, Default)]
pub struct ShellExecutionBackend {
    tasks: TaskTable,
    next_run: Arc<AtomicU64>,
}

impl ShellExecutionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tracked_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    async fn finish(tasks: &TaskTable, task_id: &str, run: u64, result: ExecutionResult) {
        match tasks.lock().await.get_mut(task_id) {
            Some(task) if task.run == run => {
                task.cancel = None;
                task.result = Some(result);
            }
            _ => debug!("Shell任务 {} 的第 {} 次执行已被替换或丢弃", task_id, run),
        }
    }

    async fn supervise(
        tasks: TaskTable,
        task_id: String,
        run: u64,
        mut child: Child,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let started = Instant::now();
        let stderr = child.stderr.take();
        let stdout = child.stdout.take();
        let stderr_reader = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });
        let stdout_reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stdout) = stdout {
                let _ = stdout.read_to_end(&mut buf).await;
            }
            buf.len()
        });

        let exit = tokio::select! {
            status = child.wait() => Some(status),
            _ = &mut cancel_rx => None,
        };

        let result = match exit {
            None => {
                if let Err(e) = child.kill().await {
                    warn!("终止Shell任务 {} 失败: {}", task_id, e);
                }
                info!("Shell任务已取消: {}", task_id);
                ExecutionResult::cancelled()
            }
            Some(Ok(status)) if status.success() => {
                let output_bytes = stdout_reader.await.unwrap_or(0);
                info!(
                    "Shell任务执行完成: task_id={}, output={}B, duration={}ms",
                    task_id,
                    output_bytes,
                    started.elapsed().as_millis()
                );
                ExecutionResult::completed()
            }
            Some(Ok(status)) => {
                let stderr = stderr_reader.await.unwrap_or_default();
                let stderr = stderr.trim();
                let message = if stderr.is_empty() {
                    format!("命令执行失败，退出码: {:?}", status.code())
                } else {
                    format!("命令执行失败，退出码: {:?}: {}", status.code(), stderr)
                };
                warn!("Shell任务 {} {}", task_id, message);
                ExecutionResult::failed(message)
            }
            Some(Err(e)) => {
                error!("等待Shell任务 {} 结束失败: {}", task_id, e);
                ExecutionResult::failed(format!("等待进程结束失败: {e}"))
            }
        };
        Self::finish(&tasks, &task_id, run, result).await;
    }
}

#[async_trait]
impl ExecutionBackend for ShellExecutionBackend {
    async fn create_task(&self, task: &Task) -> OrchestratorResult<()> {
        let params = ShellTaskParams::from_payload(&task.payload)?;
        let mut tasks = self.tasks.lock().await;
        if let Some(previous) = tasks.get_mut(&task.id) {
            if let Some(cancel) = previous.cancel.take() {
                let _ = cancel.send(());
            }
        }
        tasks.insert(
            task.id.clone(),
            ShellTask {
                params,
                result: None,
                cancel: None,
                run: 0,
            },
        );
        Ok(())
    }

    async fn start(&self, task_id: &str, async_mode: bool) -> OrchestratorResult<bool> {
        let (child, cancel_rx, run) = {
            let mut tasks = self.tasks.lock().await;
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;
            let cancelled = task
                .result
                .as_ref()
                .is_some_and(|r| r.state == ExecutionState::Cancelled);
            if task.cancel.is_some() || cancelled {
                return Ok(false);
            }
            info!("执行Shell任务: task_id={}, command={}", task_id, task.params.command);
            let child = task.params.build_command().spawn().map_err(|e| {
                OrchestratorError::ExecutionBackend(format!("启动Shell命令失败: {e}"))
            })?;
            let (cancel_tx, cancel_rx) = oneshot::channel();
            let run = self.next_run.fetch_add(1, Ordering::Relaxed) + 1;
            task.cancel = Some(cancel_tx);
            task.result = Some(ExecutionResult::running(0.0));
            task.run = run;
            (child, cancel_rx, run)
        };

        let handle = tokio::spawn(Self::supervise(
            Arc::clone(&self.tasks),
            task_id.to_string(),
            run,
            child,
            cancel_rx,
        ));
        if !async_mode {
            handle
                .await
                .map_err(|e| OrchestratorError::ExecutionBackend(e.to_string()))?;
        }
        Ok(true)
    }

    async fn cancel(&self, task_id: &str, reason: &str) -> OrchestratorResult<bool> {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(task_id) else {
            return Ok(false);
        };
        info!("取消Shell任务 {}: {}", task_id, reason);
        match task.cancel.take() {
            Some(cancel) => Ok(cancel.send(()).is_ok()),
            None if task.result.is_none() => {
                task.result = Some(ExecutionResult::cancelled());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_result(&self, task_id: &str) -> OrchestratorResult<Option<ExecutionResult>> {
        Ok(self
            .tasks
            .lock()
            .await
            .get(task_id)
            .and_then(|task| task.result.clone()))
    }

    async fn discard(&self, task_id: &str) -> OrchestratorResult<()> {
        let removed = self.tasks.lock().await.remove(task_id);
        if let Some(cancel) = removed.and_then(|task| task.cancel) {
            info!("丢弃仍在运行的Shell任务 {}", task_id);
            let _ = cancel.send(());
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use orchestrator_domain::entities::TaskSubmission;
    use orchestrator_domain::ports::ExecutionState;
    use serde_json::json;
    use std::time::Duration;

    fn shell_task(id: &str, payload: serde_json::Value) -> Task {
        Task::from_submission(
            TaskSubmission::new("shell", "shell")
                .with_id(id)
                .with_payload(payload),
        )
        .unwrap()
    }

    async fn wait_finished(backend: &ShellExecutionBackend, id: &str) -> ExecutionResult {
        for _ in 0..200 {
            if let Some(result) = backend.get_result(id).await.unwrap() {
                if result.is_finished() {
                    return result;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} did not finish");
    }

    #[tokio::test]
    async fn test_sync_command_completes() {
        let backend = ShellExecutionBackend::new();
        backend
            .create_task(&shell_task("ok", json!({"command": "echo hello"})))
            .await
            .unwrap();
        assert!(backend.start("ok", false).await.unwrap());
        let result = backend.get_result("ok").await.unwrap().unwrap();
        assert_eq!(result.state, ExecutionState::Completed);
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_failing_command_reports_stderr() {
        let backend = ShellExecutionBackend::new();
        backend
            .create_task(&shell_task(
                "bad",
                json!({"command": "echo boom >&2; exit 3"}),
            ))
            .await
            .unwrap();
        backend.start("bad", true).await.unwrap();
        let result = wait_finished(&backend, "bad").await;
        assert_eq!(result.state, ExecutionState::Failed);
        let message = result.error_message.unwrap();
        assert!(message.contains("boom"), "{message}");
        assert!(message.contains('3'), "{message}");
    }

    #[tokio::test]
    async fn test_env_and_args() {
        let backend = ShellExecutionBackend::new();
        backend
            .create_task(&shell_task(
                "env",
                json!({"command": "test \"$MODE\" = import", "env_vars": {"MODE": "import"}}),
            ))
            .await
            .unwrap();
        backend.start("env", false).await.unwrap();
        assert!(backend.get_result("env").await.unwrap().unwrap().success);

        backend
            .create_task(&shell_task(
                "args",
                json!({"command": "false", "args": []}),
            ))
            .await
            .unwrap();
        backend.start("args", false).await.unwrap();
        assert_eq!(
            backend.get_result("args").await.unwrap().unwrap().state,
            ExecutionState::Failed
        );
    }

    #[tokio::test]
    async fn test_cancel_running_command() {
        let backend = ShellExecutionBackend::new();
        backend
            .create_task(&shell_task("slow", json!({"command": "sleep 5"})))
            .await
            .unwrap();
        backend.start("slow", true).await.unwrap();
        assert!(backend.cancel("slow", "test").await.unwrap());
        let result = wait_finished(&backend, "slow").await;
        assert_eq!(result.state, ExecutionState::Cancelled);
        assert!(!backend.cancel("unknown", "test").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_params_and_unknown_task() {
        let backend = ShellExecutionBackend::new();
        let err = backend
            .create_task(&shell_task("x", json!({"script": "echo"})))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTaskParams(_)));

        let err = backend.start("missing", true).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::TaskNotFound { .. }));
        assert!(backend.get_result("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_before_start_prevents_spawn() {
        let backend = ShellExecutionBackend::new();
        backend
            .create_task(&shell_task("early", json!({"command": "sleep 5"})))
            .await
            .unwrap();
        assert!(backend.cancel("early", "test").await.unwrap());
        assert!(!backend.start("early", true).await.unwrap());
        assert_eq!(
            backend.get_result("early").await.unwrap().unwrap().state,
            ExecutionState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_replaced_run_keeps_newer_result() {
        let backend = ShellExecutionBackend::new();
        backend
            .create_task(&shell_task("job", json!({"command": "sleep 5"})))
            .await
            .unwrap();
        backend.start("job", true).await.unwrap();

        // 重新创建会停止旧进程，旧进程的取消结果不能覆盖新的执行
        backend
            .create_task(&shell_task("job", json!({"command": "sleep 0.3"})))
            .await
            .unwrap();
        assert!(backend.start("job", true).await.unwrap());
        let result = wait_finished(&backend, "job").await;
        assert_eq!(result.state, ExecutionState::Completed);
    }

    #[tokio::test]
    async fn test_discard_stops_and_forgets_task() {
        let backend = ShellExecutionBackend::new();
        backend
            .create_task(&shell_task("done", json!({"command": "true"})))
            .await
            .unwrap();
        backend.start("done", false).await.unwrap();
        backend
            .create_task(&shell_task("slow", json!({"command": "sleep 5"})))
            .await
            .unwrap();
        backend.start("slow", true).await.unwrap();
        assert_eq!(backend.tracked_count().await, 2);

        backend.discard("done").await.unwrap();
        backend.discard("slow").await.unwrap();
        backend.discard("unknown").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(backend.tracked_count().await, 0);
        assert!(backend.get_result("slow").await.unwrap().is_none());
    }
}
