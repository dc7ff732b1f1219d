use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use orchestrator_config::AppConfig;
use orchestrator_dispatcher::{OrchestrationService, OrchestratorStats, RecoveryCallback};
use orchestrator_domain::entities::{
    FailureEvent, FailureType, HealthStatus, RecoveryAction, WorkerHeartbeat,
    WorkerRegistration,
};
use orchestrator_domain::ports::{ExecutionBackend, TaskStatusStore};
use orchestrator_infrastructure::{ShellExecutionBackend, SqliteTaskStatusStore};

use crate::jobs::JobsFile;
use crate::shutdown::ShutdownManager;

/// 没有声明Worker时注册的本地执行槽
pub const DEFAULT_WORKER_ID: &str = "local-0";
const DEFAULT_WORKER_CAPACITY: usize = 4;

/// 隔离节点：不再向其分配任务
struct IsolateWorker {
    service: Weak<OrchestrationService>,
}

#[async_trait]
impl RecoveryCallback for IsolateWorker {
    async fn execute(&self, action: RecoveryAction, event: &FailureEvent) -> bool {
        let Some(service) = self.service.upgrade() else {
            return false;
        };
        if event.failure_type == FailureType::NodeUnresponsive {
            let back_online = service
                .workers()
                .get(&event.node_id)
                .await
                .is_some_and(|w| w.is_active() && w.last_heartbeat > event.detected_at);
            if back_online {
                info!("节点 {} 已重新上线，跳过 {}", event.node_id, action);
                return true;
            }
        }
        service
            .workers()
            .set_health(&event.node_id, HealthStatus::Failed)
            .await;
        info!("执行 {}: 节点 {} 已隔离", action, event.node_id);
        true
    }
}

/// 任务转移：孤儿任务由监控循环走重试路径，这里只记录
struct FailoverTasks;

#[async_trait]
impl RecoveryCallback for FailoverTasks {
    async fn execute(&self, action: RecoveryAction, event: &FailureEvent) -> bool {
        info!(
            "执行 {}: 节点 {} 上的任务将重新调度到其他Worker",
            action, event.node_id
        );
        true
    }
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    service: Arc<OrchestrationService>,
    worker_ids: Vec<String>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化编排器，数据库: {}", config.database.url);

        let store: Arc<dyn TaskStatusStore> = Arc::new(
            SqliteTaskStatusStore::connect(&config.database.url, config.database.max_connections)
                .await
                .context("初始化任务状态存储失败")?,
        );
        let backend: Arc<dyn ExecutionBackend> = Arc::new(ShellExecutionBackend::new());
        Self::with_components(config, store, backend).await
    }

    /// 使用外部提供的存储和执行后端构建应用
    pub async fn with_components(
        config: AppConfig,
        store: Arc<dyn TaskStatusStore>,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Result<Self> {
        let service = Arc::new(
            OrchestrationService::new(&config, store, backend).context("创建编排服务失败")?,
        );
        service
            .fault_tolerance()
            .register_callback(
                RecoveryAction::IsolateNode,
                Arc::new(IsolateWorker {
                    service: Arc::downgrade(&service),
                }),
            )
            .await;
        service
            .fault_tolerance()
            .register_callback(RecoveryAction::FailoverNode, Arc::new(FailoverTasks))
            .await;

        Ok(Self {
            config,
            service,
            worker_ids: Vec::new(),
        })
    }

    pub fn service(&self) -> &Arc<OrchestrationService> {
        &self.service
    }

    /// 恢复上次运行遗留的任务，然后注册Worker并提交任务清单
    pub async fn bootstrap(&mut self, jobs: Option<&JobsFile>) -> Result<Vec<String>> {
        let summary = self
            .service
            .recover_from_store()
            .await
            .context("恢复任务状态失败")?;
        if summary.restored > 0 {
            info!(
                "已恢复 {} 个未完成任务，其中 {} 个被中断",
                summary.restored,
                summary.interrupted.len()
            );
        }

        let mut registrations = match jobs {
            Some(jobs) => jobs.registrations().context("Worker声明无效")?,
            None => Vec::new(),
        };
        if registrations.is_empty() {
            registrations.push(WorkerRegistration::new(
                DEFAULT_WORKER_ID,
                DEFAULT_WORKER_CAPACITY,
            ));
        }
        for registration in registrations {
            let worker = self.service.register_worker(registration).await;
            info!("注册Worker {}，并发上限 {}", worker.id, worker.capacity);
            self.worker_ids.push(worker.id);
        }

        let mut submitted = Vec::new();
        if let Some(jobs) = jobs {
            for submission in jobs.submissions().context("任务清单无效")? {
                let name = submission.name.clone();
                match self.service.submit(submission).await {
                    Ok(id) => {
                        info!("已提交任务 {} ({})", name, id);
                        submitted.push(id);
                    }
                    Err(e) if e.is_rejection() => warn!("任务 {} 被拒绝: {}", name, e),
                    Err(e) => return Err(e).context(format!("提交任务 {name} 失败")),
                }
            }
        }
        Ok(submitted)
    }

    /// 本地Worker的心跳循环
    fn spawn_heartbeats(&self, shutdown: &ShutdownManager) -> JoinHandle<()> {
        let service = Arc::clone(&self.service);
        let worker_ids = self.worker_ids.clone();
        let period =
            Duration::from_secs((self.config.monitoring.heartbeat_timeout_seconds / 3).max(1));
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe().await;
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for worker_id in &worker_ids {
                            let heartbeat = WorkerHeartbeat::new(worker_id);
                            if let Err(e) = service.heartbeat(heartbeat).await {
                                error!("Worker {} 心跳失败: {}", worker_id, e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// 启动后台循环，返回需要在关闭时等待的句柄
    pub async fn start(&self, shutdown: &ShutdownManager) -> Result<Vec<JoinHandle<()>>> {
        let sender = shutdown
            .sender()
            .await
            .context("关闭信号已经发出，无法启动")?;
        let mut handles = self.service.start(&sender).await;
        handles.push(self.spawn_heartbeats(shutdown));
        info!("编排器已启动，{} 个后台任务", handles.len());
        Ok(handles)
    }

    /// 等待没有可推进的任务：无执行中的任务，队列里只剩等待依赖的任务。
    ///
    /// 依赖就绪状态在调度周期才刷新，轮询间隔取两个循环周期的两倍，并要求连续多次观察到空闲。
    pub async fn wait_until_idle(&self) -> Result<OrchestratorStats> {
        const REQUIRED_IDLE_CHECKS: u32 = 3;
        let cycle_ms = self
            .config
            .scheduler
            .tick_interval_ms
            .max(self.config.monitoring.interval_ms);
        let poll = Duration::from_millis(cycle_ms.saturating_mul(2));
        let mut idle_checks = 0;
        loop {
            tokio::time::sleep(poll).await;
            let stats = self.service.stats().await?;
            let idle = stats.active_tasks == 0
                && stats.queue.ready == 0
                && stats.queue.backing_off == 0;
            idle_checks = if idle { idle_checks + 1 } else { 0 };
            if idle_checks >= REQUIRED_IDLE_CHECKS {
                return Ok(stats);
            }
        }
    }

    pub async fn log_summary(&self) {
        match self.service.stats().await {
            Ok(stats) => {
                info!(
                    "任务状态统计: {:?}，队列 {} 个，恢复计划 {} 个",
                    stats.status_counts, stats.queue.total, stats.recovery.total
                );
                if stats.queue.waiting_dependencies > 0 {
                    warn!("{} 个任务的依赖无法满足", stats.queue.waiting_dependencies);
                }
            }
            Err(e) => error!("读取统计信息失败: {}", e),
        }
        let report = self.service.validation_report().await;
        if !report.deadlocks.is_empty() {
            warn!("存在循环等待: {:?}", report.deadlocks);
        }
    }
}
