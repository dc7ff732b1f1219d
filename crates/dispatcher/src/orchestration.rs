use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use orchestrator_config::AppConfig;
use orchestrator_domain::entities::{
    HealthMetrics, ResourceUsage, StatusUpdate, Task, TaskStatus, TaskStatusInfo, TaskSubmission,
    WorkerHeartbeat, WorkerInfo, WorkerRegistration,
};
use orchestrator_domain::ports::{
    ExecutionBackend, ExecutionState, HealthMetricsSource, TaskStatusStore,
};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

use crate::dependency_graph::DependencyGraph;
use crate::dependency_manager::{DependencyManager, ValidationReport};
use crate::fault_tolerance::{FaultAssessment, FaultToleranceManager, RecoveryStats};
use crate::resource_manager::ResourceManager;
use crate::retry_service::RetryPolicy;
use crate::scheduler::{QueueStats, TaskScheduler};
use crate::strategies::strategy_from_name;
use crate::worker_registry::WorkerRegistry;

/// 状态记录元数据中保存完整任务定义的键，用于重启恢复
pub const TASK_SPEC_KEY: &str = "task_spec";

#[derive(Debug, Clone)]
struct TaskEntry {
    task: Task,
    worker_id: Option<String>,
    dispatched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct LoopSettings {
    tick_interval: Duration,
    monitor_interval: Duration,
    max_dispatch_per_tick: usize,
    deadlock_check_every_ticks: u64,
}

/// 一次监控周期的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorSummary {
    pub offline_workers: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub timed_out: Vec<String>,
    pub deadlocks: Vec<Vec<String>>,
}

/// 启动恢复的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoverySummary {
    pub restored: usize,
    pub requeued: Vec<String>,
    pub interrupted: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorStats {
    pub queue: QueueStats,
    pub tracked_tasks: usize,
    pub active_tasks: usize,
    pub active_workers: usize,
    pub resources: Vec<ResourceUsage>,
    pub recovery: RecoveryStats,
    pub status_counts: BTreeMap<String, usize>,
}

/// 任务编排服务：接收任务、调度到Worker、轮询执行结果并处理重试与依赖传播。
///
/// 各组件各自持有锁，任何操作都不会同时持有两把锁。
pub struct OrchestrationService {
    dependencies: DependencyManager,
    scheduler: TaskScheduler,
    resources: ResourceManager,
    workers: WorkerRegistry,
    fault_tolerance: FaultToleranceManager,
    retry: RetryPolicy,
    store: Arc<dyn TaskStatusStore>,
    backend: Arc<dyn ExecutionBackend>,
    health_source: Option<Arc<dyn HealthMetricsSource>>,
    registry: RwLock<HashMap<String, TaskEntry>>,
    monitor_ticks: AtomicU64,
    settings: LoopSettings,
}

impl OrchestrationService {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn TaskStatusStore>,
        backend: Arc<dyn ExecutionBackend>,
    ) -> OrchestratorResult<Self> {
        Ok(Self {
            dependencies: DependencyManager::default(),
            scheduler: TaskScheduler::new(strategy_from_name(&config.scheduler.strategy)?),
            resources: ResourceManager::from_config(&config.resources)?,
            workers: WorkerRegistry::new(config.monitoring.heartbeat_timeout_seconds),
            fault_tolerance: FaultToleranceManager::new(
                &config.fault_tolerance,
                &config.recovery,
            ),
            retry: RetryPolicy::new(config.retry.clone()),
            store,
            backend,
            health_source: None,
            registry: RwLock::new(HashMap::new()),
            monitor_ticks: AtomicU64::new(0),
            settings: LoopSettings {
                tick_interval: Duration::from_millis(config.scheduler.tick_interval_ms),
                monitor_interval: Duration::from_millis(config.monitoring.interval_ms),
                max_dispatch_per_tick: config.scheduler.max_dispatch_per_tick.max(1),
                deadlock_check_every_ticks: config.monitoring.deadlock_check_every_ticks.max(1),
            },
        })
    }

    pub fn with_health_source(mut self, source: Arc<dyn HealthMetricsSource>) -> Self {
        self.health_source = Some(source);
        self
    }

    pub fn dependencies(&self) -> &DependencyManager {
        &self.dependencies
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub fn fault_tolerance(&self) -> &FaultToleranceManager {
        &self.fault_tolerance
    }

    /// 提交任务并返回任务ID。出现循环依赖时整体拒绝，不会入队。
    pub async fn submit(&self, submission: TaskSubmission) -> OrchestratorResult<String> {
        let task = Task::from_submission(submission)?;
        let task_id = task.id.clone();

        if self.registry.read().await.contains_key(&task_id)
            || self.store.get(&task_id).await?.is_some()
        {
            return Err(OrchestratorError::TaskAlreadyExists { id: task_id });
        }

        self.dependencies.register_task(&task).await?;

        let mut metadata = task.metadata.clone();
        metadata.insert(TASK_SPEC_KEY.to_string(), serde_json::to_value(&task)?);
        let record = TaskStatusInfo::new(
            &task_id,
            task.priority,
            task.timeout_seconds,
            task.max_retries,
            metadata,
        );
        if !self.store.create(record).await? {
            return Err(OrchestratorError::TaskAlreadyExists { id: task_id });
        }
        self.store
            .update_status(
                &task_id,
                StatusUpdate::to(TaskStatus::Pending).with_message("任务已提交"),
            )
            .await?;

        self.registry.write().await.insert(
            task_id.clone(),
            TaskEntry {
                task: task.clone(),
                worker_id: None,
                dispatched_at: None,
            },
        );
        info!("{} 已提交", task.entity_description());
        self.scheduler.enqueue(task).await?;
        metrics::counter!("orchestrator_tasks_submitted_total").increment(1);
        Ok(task_id)
    }

    /// 取消任务。已经结束（终态或重试耗尽的失败）时返回 false。
    ///
    /// 先写入取消状态，正在启动中的派发会因此放弃并停止刚启动的执行。
    pub async fn cancel(&self, task_id: &str) -> OrchestratorResult<bool> {
        let record = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;
        if record.is_settled() {
            return Ok(false);
        }

        match self
            .store
            .update_status(
                task_id,
                StatusUpdate::to(TaskStatus::Cancelled).with_message("任务已取消"),
            )
            .await
        {
            Ok(_) => {}
            Err(OrchestratorError::IllegalTransition { from, .. }) => {
                debug!("任务 {} 已处于 {} 状态，无法取消", task_id, from);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        self.scheduler.remove(task_id).await;
        let entry = self.registry.write().await.remove(task_id);
        if let Some(worker_id) = entry.as_ref().and_then(|e| e.worker_id.as_deref()) {
            match self.backend.cancel(task_id, "用户取消").await {
                Ok(true) => debug!("执行后端已接受任务 {} 的取消请求", task_id),
                Ok(false) => debug!("执行后端不认识任务 {}", task_id),
                Err(e) => warn!("通知执行后端取消任务 {} 失败: {}", task_id, e),
            }
            self.discard_execution(task_id).await;
            self.resources.release(task_id).await;
            self.workers.release(worker_id).await;
        }
        self.dependencies.on_cancelled(task_id).await;
        metrics::counter!("orchestrator_tasks_cancelled_total").increment(1);
        info!("任务 {} 已取消", task_id);
        Ok(true)
    }

    pub async fn status(&self, task_id: &str) -> OrchestratorResult<Option<TaskStatusInfo>> {
        self.store.get(task_id).await
    }

    pub async fn list_by_status(
        &self,
        status: TaskStatus,
    ) -> OrchestratorResult<Vec<TaskStatusInfo>> {
        self.store.list_by_status(status).await
    }

    pub async fn register_worker(&self, registration: WorkerRegistration) -> WorkerInfo {
        self.workers.register(registration).await
    }

    pub async fn heartbeat(&self, heartbeat: WorkerHeartbeat) -> OrchestratorResult<WorkerInfo> {
        let (info, reconnected) = self.workers.heartbeat(&heartbeat).await?;
        if reconnected {
            self.fault_tolerance.mark_node_recovered(&info.id).await;
        }
        if let Some(metrics) = heartbeat.metrics {
            self.report_health(metrics).await;
        }
        Ok(info)
    }

    pub async fn report_health(&self, metrics: HealthMetrics) -> FaultAssessment {
        let assessment = self.fault_tolerance.ingest_metrics(metrics).await;
        self.workers
            .set_health(&assessment.node_id, assessment.status)
            .await;
        assessment
    }

    pub async fn validation_report(&self) -> ValidationReport {
        self.dependencies.validation_report().await
    }

    /// 调度一轮，返回成功启动的任务数
    pub async fn schedule_tick(&self) -> OrchestratorResult<usize> {
        let queued = self.scheduler.queued_task_ids().await;
        if queued.is_empty() {
            return Ok(0);
        }

        let ready: HashSet<String> = self
            .dependencies
            .ready_in_order(&queued)
            .await
            .into_iter()
            .collect();
        self.scheduler.refresh_readiness(&ready).await;
        if ready.is_empty() {
            return Ok(0);
        }

        let mut dispatched = 0;
        let mut deferred: Vec<Task> = Vec::new();
        for mut worker in self.workers.idle_workers().await {
            while worker.is_idle() && dispatched < self.settings.max_dispatch_per_tick {
                let Some(task) = self.scheduler.dequeue(&worker).await else {
                    break;
                };
                // 本轮推迟的前置任务仍排在依赖方之前
                if task
                    .prerequisite_ids()
                    .any(|id| deferred.iter().any(|d| d.id == id))
                {
                    deferred.push(task);
                    continue;
                }
                if let Err(e) = self
                    .resources
                    .allocate(&task.id, &task.resource_requirements)
                    .await
                {
                    if e.is_backpressure() {
                        debug!("{}，推迟调度", e);
                    } else {
                        error!("为任务 {} 分配资源失败: {}", task.id, e);
                    }
                    deferred.push(task);
                    continue;
                }
                if self.dispatch(task, &worker.id).await {
                    worker.current_load += 1;
                    dispatched += 1;
                }
            }
        }

        for task in deferred {
            self.scheduler.requeue(task, None).await;
        }
        if dispatched > 0 {
            debug!("本轮调度启动了 {} 个任务", dispatched);
        }
        Ok(dispatched)
    }

    /// 启动已分配资源的任务，失败时走重试流程
    async fn dispatch(&self, task: Task, worker_id: &str) -> bool {
        let task_id = task.id.clone();
        if let Err(e) = self
            .store
            .update_status(
                &task_id,
                StatusUpdate::to(TaskStatus::Initializing)
                    .with_message(format!("分配到Worker {worker_id}")),
            )
            .await
        {
            warn!("任务 {} 无法进入初始化状态: {}", task_id, e);
            self.resources.release(&task_id).await;
            return false;
        }

        if let Err(e) = self.workers.assign(worker_id).await {
            self.fail_attempt(&task_id, TaskStatus::Error, &e.to_string())
                .await;
            return false;
        }
        let attached = match self.registry.write().await.get_mut(&task_id) {
            Some(entry) => {
                entry.worker_id = Some(worker_id.to_string());
                entry.dispatched_at = Some(Utc::now());
                true
            }
            None => false,
        };
        if !attached {
            debug!("任务 {} 在分配期间被取消，放弃启动", task_id);
            self.resources.release(&task_id).await;
            self.workers.release(worker_id).await;
            return false;
        }

        let started = match self.backend.create_task(&task).await {
            Ok(()) => self.backend.start(&task_id, true).await,
            Err(e) => Err(e),
        };
        match started {
            Ok(true) => {}
            Ok(false) => {
                self.discard_execution(&task_id).await;
                self.fail_attempt(&task_id, TaskStatus::Error, "执行后端拒绝启动任务")
                    .await;
                return false;
            }
            Err(e) => {
                error!("任务 {} 启动失败: {}", task_id, e);
                self.discard_execution(&task_id).await;
                self.fail_attempt(&task_id, TaskStatus::Error, &e.to_string())
                    .await;
                return false;
            }
        }

        if let Err(e) = self
            .store
            .update_status(
                &task_id,
                StatusUpdate::to(TaskStatus::Running).with_progress(0.0),
            )
            .await
        {
            // 启动期间任务被取消或被其他流程接管，刚启动的执行没有人监督
            warn!("任务 {} 无法进入运行状态，停止执行: {}", task_id, e);
            if let Err(cancel_err) = self.backend.cancel(&task_id, "任务已离开执行流程").await {
                warn!("停止任务 {} 的执行失败: {}", task_id, cancel_err);
            }
            self.discard_execution(&task_id).await;
            if matches!(e, OrchestratorError::IllegalTransition { .. }) {
                self.release_slot(&task_id).await;
            } else {
                self.fail_attempt(&task_id, TaskStatus::Error, &e.to_string())
                    .await;
            }
            return false;
        }
        info!("任务 {} 已在Worker {} 上启动", task_id, worker_id);
        true
    }

    /// 监控一轮：Worker离线、健康采集、执行结果轮询、周期性死锁检测
    pub async fn monitor_tick(&self) -> MonitorSummary {
        let now = Utc::now();
        let mut summary = MonitorSummary::default();

        for worker_id in self.workers.detect_offline(now).await {
            self.fault_tolerance
                .mark_node_failed(&worker_id, "Worker心跳超时")
                .await;
            let orphaned: Vec<String> = self
                .registry
                .read()
                .await
                .iter()
                .filter(|(_, e)| e.worker_id.as_deref() == Some(worker_id.as_str()))
                .map(|(id, _)| id.clone())
                .collect();
            for task_id in orphaned {
                warn!("Worker {} 离线，任务 {} 进入重试流程", worker_id, task_id);
                self.discard_execution(&task_id).await;
                self.fail_attempt(&task_id, TaskStatus::Error, &format!("Worker {worker_id} 离线"))
                    .await;
                summary.failed.push(task_id);
            }
            summary.offline_workers.push(worker_id);
        }

        if let Some(source) = &self.health_source {
            for worker in self.workers.list().await.into_iter().filter(|w| w.is_active()) {
                match source.collect(&worker.id).await {
                    Ok(Some(metrics)) => {
                        self.report_health(metrics).await;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("采集Worker {} 健康指标失败: {}", worker.id, e),
                }
            }
        }

        let active: Vec<TaskEntry> = self
            .registry
            .read()
            .await
            .values()
            .filter(|e| e.worker_id.is_some())
            .cloned()
            .collect();
        for entry in active {
            self.poll_task(entry, now, &mut summary).await;
        }

        let ticks = self.monitor_ticks.fetch_add(1, Ordering::SeqCst) + 1;
        if ticks % self.settings.deadlock_check_every_ticks == 0 {
            let report = self.dependencies.validation_report().await;
            for cycle in &report.deadlocks {
                warn!("检测到依赖死锁: {}", cycle.join(" -> "));
            }
            summary.deadlocks = report.deadlocks;
        }
        summary
    }

    async fn poll_task(&self, entry: TaskEntry, now: DateTime<Utc>, summary: &mut MonitorSummary) {
        let task_id = entry.task.id.as_str();
        let timeout_ms = i64::try_from(entry.task.timeout_seconds)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        let timed_out = entry
            .dispatched_at
            .is_some_and(|at| (now - at).num_milliseconds() > timeout_ms);
        if timed_out || entry.task.is_past_deadline(now) {
            let reason = if timed_out {
                format!("执行超过 {} 秒", entry.task.timeout_seconds)
            } else {
                "超过截止时间".to_string()
            };
            if let Err(e) = self.backend.cancel(task_id, &reason).await {
                warn!("取消超时任务 {} 失败: {}", task_id, e);
            }
            self.discard_execution(task_id).await;
            self.fail_attempt(task_id, TaskStatus::Timeout, &reason).await;
            summary.timed_out.push(task_id.to_string());
            return;
        }

        let result = match self.backend.get_result(task_id).await {
            Ok(Some(result)) => result,
            Ok(None) => return,
            Err(e) => {
                warn!("查询任务 {} 执行结果失败: {}", task_id, e);
                return;
            }
        };

        match result.state {
            ExecutionState::Running => {
                let update = StatusUpdate::to(TaskStatus::Running).with_progress(result.progress);
                if let Err(e) = self.store.update_status(task_id, update).await {
                    debug!("更新任务 {} 进度失败: {}", task_id, e);
                }
            }
            ExecutionState::Completed => {
                if self.complete_task(task_id).await {
                    summary.completed.push(task_id.to_string());
                }
            }
            ExecutionState::Failed | ExecutionState::Cancelled => {
                let reason = result
                    .error_message
                    .unwrap_or_else(|| "执行后端终止了任务".to_string());
                self.discard_execution(task_id).await;
                self.fail_attempt(task_id, TaskStatus::Failed, &reason).await;
                summary.failed.push(task_id.to_string());
            }
        }
    }

    async fn complete_task(&self, task_id: &str) -> bool {
        for status in [TaskStatus::Completing, TaskStatus::Completed] {
            if let Err(e) = self
                .store
                .update_status(task_id, StatusUpdate::to(status))
                .await
            {
                warn!("任务 {} 无法标记为完成: {}", task_id, e);
                return false;
            }
        }
        self.discard_execution(task_id).await;
        self.release_slot(task_id).await;
        self.registry.write().await.remove(task_id);
        self.dependencies.on_completed(task_id).await;
        metrics::counter!("orchestrator_tasks_completed_total").increment(1);
        info!("任务 {} 执行完成", task_id);
        true
    }

    /// 结果已经处理，通知后端释放该任务的记录。必须在重新入队之前调用。
    async fn discard_execution(&self, task_id: &str) {
        if let Err(e) = self.backend.discard(task_id).await {
            debug!("清理任务 {} 的执行记录失败: {}", task_id, e);
        }
    }

    /// 归还资源和Worker槽位
    async fn release_slot(&self, task_id: &str) {
        self.resources.release(task_id).await;
        let worker_id = self
            .registry
            .write()
            .await
            .get_mut(task_id)
            .and_then(|entry| {
                entry.dispatched_at = None;
                entry.worker_id.take()
            });
        if let Some(worker_id) = worker_id {
            self.workers.release(&worker_id).await;
        }
    }

    /// 一次执行失败：进入失败类状态，然后重试或最终失败
    async fn fail_attempt(&self, task_id: &str, failure: TaskStatus, reason: &str) {
        let record = match self
            .store
            .update_status(task_id, StatusUpdate::to(failure).with_error(reason))
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!("任务 {} 无法进入 {} 状态: {}", task_id, failure, e);
                return;
            }
        };
        self.release_slot(task_id).await;
        self.retry_or_fail(record, reason).await;
    }

    /// 重试次数未用完时退避后重新入队，否则最终失败并通知依赖方
    async fn retry_or_fail(&self, record: TaskStatusInfo, reason: &str) {
        let task_id = record.task_id.clone();
        let task = self
            .registry
            .read()
            .await
            .get(&task_id)
            .map(|entry| entry.task.clone());

        if let (true, Some(task)) = (self.retry.should_retry(&record), task) {
            let not_before = self.retry.next_retry_time(record.retry_count, Utc::now());
            let update = StatusUpdate::to(TaskStatus::Pending)
                .with_message(format!("第 {} 次重试", record.retry_count + 1));
            if let Err(e) = self.store.update_status(&task_id, update).await {
                error!("任务 {} 无法重新进入待执行状态: {}", task_id, e);
                return;
            }
            self.scheduler.requeue(task, Some(not_before)).await;
            metrics::counter!("orchestrator_tasks_retried_total").increment(1);
            info!("任务 {} 将于 {} 重试", task_id, not_before);
            return;
        }

        if record.status != TaskStatus::Failed {
            if let Err(e) = self
                .store
                .update_status(
                    &task_id,
                    StatusUpdate::to(TaskStatus::Failed).with_error(reason),
                )
                .await
            {
                error!("任务 {} 无法标记为失败: {}", task_id, e);
                return;
            }
        }
        self.registry.write().await.remove(&task_id);
        self.dependencies.on_failed(&task_id).await;
        metrics::counter!("orchestrator_tasks_failed_total").increment(1);
        error!("任务 {} 最终失败: {}", task_id, reason);
    }

    /// 启动恢复：从状态存储重建依赖图和队列。
    ///
    /// 依赖图不做环检测直接载入；已结束任务的结局会重新传播；中断的执行走重试流程。
    pub async fn recover_from_store(&self) -> OrchestratorResult<RecoverySummary> {
        let records = self.store.list_all().await?;
        let mut summary = RecoverySummary::default();
        let mut graph = DependencyGraph::new();
        let mut tasks = HashMap::new();

        for record in &records {
            let Some(task) = task_from_record(record) else {
                warn!("任务 {} 缺少任务定义，跳过恢复", record.task_id);
                summary.skipped.push(record.task_id.clone());
                continue;
            };
            graph.add_node(&task.id);
            for edge in task.dependency_edges() {
                graph.add_dependency(edge);
            }
            tasks.insert(task.id.clone(), task);
        }
        self.dependencies.restore(graph).await;

        for record in &records {
            match record.status {
                TaskStatus::Completed => self.dependencies.on_completed(&record.task_id).await,
                TaskStatus::Cancelled => self.dependencies.on_cancelled(&record.task_id).await,
                TaskStatus::Failed if !record.can_retry() => {
                    self.dependencies.on_failed(&record.task_id).await
                }
                _ => {}
            }
        }

        for record in records {
            if record.is_settled() {
                continue;
            }
            let Some(task) = tasks.remove(&record.task_id) else {
                continue;
            };
            let task_id = task.id.clone();
            summary.restored += 1;
            self.registry.write().await.insert(
                task_id.clone(),
                TaskEntry {
                    task: task.clone(),
                    worker_id: None,
                    dispatched_at: None,
                },
            );

            match record.status {
                TaskStatus::Created | TaskStatus::Pending => {
                    if record.status == TaskStatus::Created {
                        self.store
                            .update_status(
                                &task_id,
                                StatusUpdate::to(TaskStatus::Pending).with_message("启动恢复"),
                            )
                            .await?;
                    }
                    if let Err(e) = self.scheduler.enqueue(task).await {
                        warn!("恢复任务 {} 入队失败: {}", task_id, e);
                        continue;
                    }
                    summary.requeued.push(task_id);
                }
                TaskStatus::Initializing | TaskStatus::Running => {
                    self.fail_attempt(&task_id, TaskStatus::Error, "编排器重启，执行中断")
                        .await;
                    summary.interrupted.push(task_id);
                }
                TaskStatus::Paused => {
                    self.store
                        .update_status(&task_id, StatusUpdate::to(TaskStatus::Resuming))
                        .await?;
                    self.fail_attempt(&task_id, TaskStatus::Failed, "编排器重启，执行中断")
                        .await;
                    summary.interrupted.push(task_id);
                }
                TaskStatus::Resuming | TaskStatus::Completing => {
                    self.fail_attempt(&task_id, TaskStatus::Failed, "编排器重启，执行中断")
                        .await;
                    summary.interrupted.push(task_id);
                }
                TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Error => {
                    let reason = record
                        .error
                        .clone()
                        .unwrap_or_else(|| "重启前执行失败".to_string());
                    self.retry_or_fail(record, &reason).await;
                    summary.interrupted.push(task_id);
                }
                TaskStatus::Completed | TaskStatus::Cancelled => {}
            }
        }

        info!(
            "启动恢复完成: 恢复 {} 个任务，重新入队 {} 个，中断 {} 个",
            summary.restored,
            summary.requeued.len(),
            summary.interrupted.len()
        );
        Ok(summary)
    }

    pub async fn stats(&self) -> OrchestratorResult<OrchestratorStats> {
        let (tracked_tasks, active_tasks) = {
            let registry = self.registry.read().await;
            (
                registry.len(),
                registry.values().filter(|e| e.worker_id.is_some()).count(),
            )
        };
        let mut status_counts = BTreeMap::new();
        for record in self.store.list_all().await? {
            *status_counts
                .entry(record.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        Ok(OrchestratorStats {
            queue: self.scheduler.stats().await,
            tracked_tasks,
            active_tasks,
            active_workers: self.workers.active_count().await,
            resources: self.resources.usage().await,
            recovery: self.fault_tolerance.recovery_stats().await,
            status_counts,
        })
    }

    /// 启动调度循环、监控循环和恢复执行器，收到停止信号后全部退出
    pub async fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let service = Arc::clone(self);
        let mut shutdown_rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.settings.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("调度循环已启动");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = service.schedule_tick().await {
                            error!("调度周期出错: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("收到停止信号，退出调度循环");
                        break;
                    }
                }
            }
        }));

        let service = Arc::clone(self);
        let mut shutdown_rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.settings.monitor_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("监控循环已启动");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        service.monitor_tick().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("收到停止信号，退出监控循环");
                        break;
                    }
                }
            }
        }));

        if let Some(handle) = self.fault_tolerance.start(shutdown.subscribe()).await {
            handles.push(handle);
        }
        handles
    }
}

fn task_from_record(record: &TaskStatusInfo) -> Option<Task> {
    let value = record.metadata.get(TASK_SPEC_KEY)?;
    match serde_json::from_value(value.clone()) {
        Ok(task) => Some(task),
        Err(e) => {
            warn!("任务 {} 的任务定义无法解析: {}", record.task_id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    use orchestrator_domain::entities::{
        DependencySpec, DependencyType, HealthStatus, ResourceType, TaskPriority,
    };
    use orchestrator_domain::ports::ExecutionResult;
    use orchestrator_infrastructure::InMemoryTaskStatusStore;

    use crate::test_utils::FakeExecutionBackend;

    /// `create_task` 停在闸门前，直到测试放行
    #[derive(Default)]
    struct GatedBackend {
        inner: FakeExecutionBackend,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ExecutionBackend for GatedBackend {
        async fn create_task(&self, task: &Task) -> OrchestratorResult<()> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.create_task(task).await
        }

        async fn start(&self, task_id: &str, async_mode: bool) -> OrchestratorResult<bool> {
            self.inner.start(task_id, async_mode).await
        }

        async fn cancel(&self, task_id: &str, reason: &str) -> OrchestratorResult<bool> {
            self.inner.cancel(task_id, reason).await
        }

        async fn get_result(&self, task_id: &str) -> OrchestratorResult<Option<ExecutionResult>> {
            self.inner.get_result(task_id).await
        }

        async fn discard(&self, task_id: &str) -> OrchestratorResult<()> {
            self.inner.discard(task_id).await
        }
    }

    fn stale_heartbeat(worker_id: &str) -> WorkerHeartbeat {
        let mut heartbeat = WorkerHeartbeat::new(worker_id);
        heartbeat.timestamp = Utc::now() - chrono::Duration::hours(1);
        heartbeat
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.retry.base_interval_ms = 1;
        config.retry.max_interval_ms = 1;
        config.retry.jitter_factor = 0.0;
        config
    }

    async fn service_with(
        config: AppConfig,
    ) -> (OrchestrationService, Arc<FakeExecutionBackend>, Arc<InMemoryTaskStatusStore>) {
        let backend = Arc::new(FakeExecutionBackend::new());
        let store = Arc::new(InMemoryTaskStatusStore::new());
        let service = OrchestrationService::new(&config, store.clone(), backend.clone()).unwrap();
        service
            .register_worker(WorkerRegistration::new("w1", 4))
            .await;
        (service, backend, store)
    }

    async fn status_of(service: &OrchestrationService, id: &str) -> TaskStatus {
        service.status(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_submit_dispatch_complete() {
        let (service, backend, _) = service_with(config()).await;
        let id = service
            .submit(TaskSubmission::new("load", "shell").with_id("load"))
            .await
            .unwrap();
        assert_eq!(status_of(&service, &id).await, TaskStatus::Pending);

        assert_eq!(service.schedule_tick().await.unwrap(), 1);
        assert_eq!(status_of(&service, &id).await, TaskStatus::Running);
        assert_eq!(backend.started(), vec!["load"]);

        backend.set_running("load", 40.0);
        service.monitor_tick().await;
        assert_eq!(service.status(&id).await.unwrap().unwrap().progress, 40.0);

        backend.complete("load");
        let summary = service.monitor_tick().await;
        assert_eq!(summary.completed, vec!["load"]);
        let record = service.status(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.progress, 100.0);
        assert_eq!(service.workers().get("w1").await.unwrap().current_load, 0);
    }

    #[tokio::test]
    async fn test_dependent_waits_for_prerequisite() {
        let (service, backend, _) = service_with(config()).await;
        service
            .submit(TaskSubmission::new("extract", "shell").with_id("extract"))
            .await
            .unwrap();
        service
            .submit(
                TaskSubmission::new("load", "shell")
                    .with_id("load")
                    .depends_on("extract", DependencyType::Success),
            )
            .await
            .unwrap();

        assert_eq!(service.schedule_tick().await.unwrap(), 1);
        assert_eq!(status_of(&service, "load").await, TaskStatus::Pending);

        backend.complete("extract");
        service.monitor_tick().await;
        assert_eq!(service.schedule_tick().await.unwrap(), 1);
        assert_eq!(status_of(&service, "load").await, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_cycle_rejected_and_nothing_enqueued() {
        let (service, _, _) = service_with(config()).await;
        service
            .submit(
                TaskSubmission::new("a", "shell")
                    .with_id("a")
                    .depends_on("b", DependencyType::Completion),
            )
            .await
            .unwrap();
        let err = service
            .submit(
                TaskSubmission::new("b", "shell")
                    .with_id("b")
                    .depends_on("a", DependencyType::Completion),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::CircularDependency { .. }));
        assert!(service.status("b").await.unwrap().is_none());
        assert_eq!(service.scheduler().queued_task_ids().await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_duplicate_submission_rejected() {
        let (service, _, _) = service_with(config()).await;
        service
            .submit(TaskSubmission::new("a", "shell").with_id("a"))
            .await
            .unwrap();
        let err = service
            .submit(TaskSubmission::new("a", "shell").with_id("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::TaskAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_failure_retries_then_fails() {
        let (service, backend, _) = service_with(config()).await;
        service
            .submit(
                TaskSubmission::new("flaky", "shell")
                    .with_id("flaky")
                    .with_max_retries(1),
            )
            .await
            .unwrap();

        service.schedule_tick().await.unwrap();
        backend.fail("flaky", "exit code 1");
        service.monitor_tick().await;
        let record = service.status("flaky").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.retry_count, 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(service.schedule_tick().await.unwrap(), 1);
        backend.fail("flaky", "exit code 1");
        service.monitor_tick().await;

        let record = service.status("flaky").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert!(record.is_settled());
        assert_eq!(backend.start_count("flaky"), 2);
    }

    #[tokio::test]
    async fn test_start_failure_goes_through_error() {
        let (service, backend, store) = service_with(config()).await;
        service
            .submit(TaskSubmission::new("a", "shell").with_id("a"))
            .await
            .unwrap();
        backend.fail_start("a");
        assert_eq!(service.schedule_tick().await.unwrap(), 0);

        let history: Vec<TaskStatus> = store
            .history("a")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.to)
            .collect();
        assert_eq!(
            history,
            vec![
                TaskStatus::Pending,
                TaskStatus::Initializing,
                TaskStatus::Error,
                TaskStatus::Pending
            ]
        );
        assert_eq!(service.resources().allocated_task_count().await, 0);
    }

    #[tokio::test]
    async fn test_resource_backpressure_defers_second_task() {
        let mut config = config();
        config.resources.capacities.insert("cpu".to_string(), 1.0);
        let (service, backend, _) = service_with(config).await;
        for id in ["first", "second"] {
            service
                .submit(
                    TaskSubmission::new(id, "shell")
                        .with_id(id)
                        .with_resource(ResourceType::Cpu, 0.6),
                )
                .await
                .unwrap();
        }

        assert_eq!(service.schedule_tick().await.unwrap(), 1);
        assert_eq!(status_of(&service, "second").await, TaskStatus::Pending);
        assert!(service.scheduler().contains("second").await);

        backend.complete("first");
        service.monitor_tick().await;
        assert_eq!(service.schedule_tick().await.unwrap(), 1);
        assert_eq!(status_of(&service, "second").await, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let (service, backend, _) = service_with(config()).await;
        service
            .submit(
                TaskSubmission::new("a", "shell")
                    .with_id("a")
                    .with_priority(TaskPriority::High),
            )
            .await
            .unwrap();
        service.schedule_tick().await.unwrap();

        assert!(service.cancel("a").await.unwrap());
        assert_eq!(status_of(&service, "a").await, TaskStatus::Cancelled);
        assert_eq!(backend.cancelled(), vec!["a"]);
        assert_eq!(service.workers().get("w1").await.unwrap().current_load, 0);
        assert!(!service.cancel("a").await.unwrap());
        assert!(service.cancel("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_timeout_goes_through_retry_path() {
        let (service, backend, _) = service_with(config()).await;
        service
            .submit(
                TaskSubmission::new("slow", "shell")
                    .with_id("slow")
                    .with_timeout(1)
                    .with_max_retries(0),
            )
            .await
            .unwrap();
        service.schedule_tick().await.unwrap();

        if let Some(entry) = service.registry.write().await.get_mut("slow") {
            entry.dispatched_at = Some(Utc::now() - chrono::Duration::seconds(5));
        }
        let summary = service.monitor_tick().await;
        assert_eq!(summary.timed_out, vec!["slow"]);
        assert_eq!(status_of(&service, "slow").await, TaskStatus::Failed);
        assert_eq!(backend.cancelled(), vec!["slow"]);
    }

    #[tokio::test]
    async fn test_recover_from_store_requeues_and_interrupts() {
        let (service, _, store) = service_with(config()).await;
        service
            .submit(TaskSubmission::new("running", "shell").with_id("running"))
            .await
            .unwrap();
        service.schedule_tick().await.unwrap();
        service
            .submit(
                TaskSubmission::new("waiting", "shell")
                    .with_id("waiting")
                    .depends_on("running", DependencyType::Success),
            )
            .await
            .unwrap();

        let backend = Arc::new(FakeExecutionBackend::new());
        let restarted = OrchestrationService::new(&config(), store.clone(), backend).unwrap();
        let summary = restarted.recover_from_store().await.unwrap();

        assert_eq!(summary.restored, 2);
        assert_eq!(summary.requeued, vec!["waiting"]);
        assert_eq!(summary.interrupted, vec!["running"]);
        let record = restarted.status("running").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.retry_count, 1);
        assert_eq!(restarted.scheduler().len().await, 2);
        assert!(!restarted
            .dependencies()
            .resolver()
            .is_task_ready("waiting")
            .await);
    }

    #[tokio::test]
    async fn test_reconnected_worker_is_scheduled_again() {
        let (service, backend, _) = service_with(config()).await;
        service.heartbeat(stale_heartbeat("w1")).await.unwrap();
        let summary = service.monitor_tick().await;
        assert_eq!(summary.offline_workers, vec!["w1"]);
        assert_eq!(
            service.fault_tolerance().node_status("w1").await,
            HealthStatus::Failed
        );

        service
            .submit(TaskSubmission::new("a", "shell").with_id("a"))
            .await
            .unwrap();
        assert_eq!(service.schedule_tick().await.unwrap(), 0);

        service.heartbeat(WorkerHeartbeat::new("w1")).await.unwrap();
        assert_eq!(
            service.fault_tolerance().node_status("w1").await,
            HealthStatus::Unknown
        );
        assert_eq!(service.schedule_tick().await.unwrap(), 1);
        assert_eq!(backend.started(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_offline_worker_tasks_are_retried_elsewhere() {
        let (service, backend, _) = service_with(config()).await;
        service
            .submit(
                TaskSubmission::new("a", "shell")
                    .with_id("a")
                    .with_resource(ResourceType::Cpu, 1.0),
            )
            .await
            .unwrap();
        assert_eq!(service.schedule_tick().await.unwrap(), 1);

        service.heartbeat(stale_heartbeat("w1")).await.unwrap();
        let summary = service.monitor_tick().await;
        assert_eq!(summary.offline_workers, vec!["w1"]);
        assert_eq!(summary.failed, vec!["a"]);

        let record = service.status("a").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.retry_count, 1);
        assert!(service.scheduler().contains("a").await);
        assert_eq!(service.workers().get("w1").await.unwrap().current_load, 0);
        assert_eq!(service.resources().allocated_task_count().await, 0);
        assert_eq!(backend.discarded(), vec!["a"]);

        service
            .register_worker(WorkerRegistration::new("w2", 1))
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(service.schedule_tick().await.unwrap(), 1);
        assert_eq!(backend.start_count("a"), 2);
        assert_eq!(service.workers().get("w2").await.unwrap().current_load, 1);
    }

    #[tokio::test]
    async fn test_cancelled_prerequisite_by_dependency_type() {
        let (service, _, _) = service_with(config()).await;
        service
            .submit(TaskSubmission::new("pre", "shell").with_id("pre"))
            .await
            .unwrap();
        service
            .submit(
                TaskSubmission::new("soft", "shell")
                    .with_id("soft")
                    .depends_on("pre", DependencyType::Completion),
            )
            .await
            .unwrap();
        service
            .submit(
                TaskSubmission::new("strict", "shell")
                    .with_id("strict")
                    .depends_on("pre", DependencyType::Success),
            )
            .await
            .unwrap();

        assert!(service.cancel("pre").await.unwrap());
        assert_eq!(service.schedule_tick().await.unwrap(), 1);
        assert_eq!(status_of(&service, "soft").await, TaskStatus::Running);
        assert_eq!(status_of(&service, "strict").await, TaskStatus::Pending);
        assert_eq!(
            service.validation_report().await.blocked_tasks,
            vec!["strict"]
        );
    }

    #[tokio::test]
    async fn test_cancel_keeps_final_failure() {
        let (service, backend, _) = service_with(config()).await;
        service
            .submit(
                TaskSubmission::new("a", "shell")
                    .with_id("a")
                    .with_max_retries(0),
            )
            .await
            .unwrap();
        service.schedule_tick().await.unwrap();
        backend.fail("a", "exit code 2");
        service.monitor_tick().await;
        assert_eq!(status_of(&service, "a").await, TaskStatus::Failed);

        assert!(!service.cancel("a").await.unwrap());
        let record = service.status("a").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("exit code 2"));
    }

    #[tokio::test]
    async fn test_prerequisite_dispatched_before_released_dependent() {
        let (service, backend, _) = service_with(config()).await;
        service
            .submit(
                TaskSubmission::new("pre", "shell")
                    .with_id("pre")
                    .with_priority(TaskPriority::Low),
            )
            .await
            .unwrap();
        let mut edge = DependencySpec::new("pre", DependencyType::Time);
        edge.timeout_seconds = Some(0);
        service
            .submit(
                TaskSubmission::new("dep", "shell")
                    .with_id("dep")
                    .with_priority(TaskPriority::Critical)
                    .with_dependency(edge),
            )
            .await
            .unwrap();

        assert_eq!(service.schedule_tick().await.unwrap(), 2);
        assert_eq!(backend.started(), vec!["pre", "dep"]);
    }

    #[tokio::test]
    async fn test_deferred_prerequisite_holds_dependent() {
        let mut config = config();
        config.resources.capacities.insert("cpu".to_string(), 1.0);
        let (service, backend, _) = service_with(config).await;
        service
            .submit(
                TaskSubmission::new("first", "shell")
                    .with_id("first")
                    .with_resource(ResourceType::Cpu, 0.6),
            )
            .await
            .unwrap();
        assert_eq!(service.schedule_tick().await.unwrap(), 1);

        service
            .submit(
                TaskSubmission::new("pre", "shell")
                    .with_id("pre")
                    .with_resource(ResourceType::Cpu, 0.6),
            )
            .await
            .unwrap();
        let mut edge = DependencySpec::new("pre", DependencyType::Time);
        edge.timeout_seconds = Some(0);
        service
            .submit(
                TaskSubmission::new("dep", "shell")
                    .with_id("dep")
                    .with_priority(TaskPriority::Critical)
                    .with_dependency(edge),
            )
            .await
            .unwrap();

        assert_eq!(service.schedule_tick().await.unwrap(), 0);
        assert_eq!(status_of(&service, "dep").await, TaskStatus::Pending);

        backend.complete("first");
        service.monitor_tick().await;
        assert_eq!(service.schedule_tick().await.unwrap(), 2);
        assert_eq!(backend.started(), vec!["first", "pre", "dep"]);
    }

    #[tokio::test]
    async fn test_cancel_during_dispatch_stops_started_execution() {
        let backend = Arc::new(GatedBackend::default());
        let store = Arc::new(InMemoryTaskStatusStore::new());
        let service =
            Arc::new(OrchestrationService::new(&config(), store, backend.clone()).unwrap());
        service
            .register_worker(WorkerRegistration::new("w1", 4))
            .await;
        service
            .submit(TaskSubmission::new("a", "shell").with_id("a"))
            .await
            .unwrap();

        let ticking = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.schedule_tick().await })
        };
        backend.entered.notified().await;
        assert!(service.cancel("a").await.unwrap());
        backend.release.notify_one();
        assert_eq!(ticking.await.unwrap().unwrap(), 0);

        assert_eq!(status_of(&service, "a").await, TaskStatus::Cancelled);
        assert_eq!(backend.inner.started(), vec!["a"]);
        assert_eq!(backend.inner.cancelled(), vec!["a", "a"]);
        assert!(backend.inner.get_result("a").await.unwrap().is_none());
        assert_eq!(service.workers().get("w1").await.unwrap().current_load, 0);
        assert_eq!(service.resources().allocated_task_count().await, 0);
        assert_eq!(service.stats().await.unwrap().tracked_tasks, 0);
    }

    #[tokio::test]
    async fn test_consumed_results_are_discarded() {
        let (service, backend, _) = service_with(config()).await;
        for id in ["ok", "bad"] {
            service
                .submit(
                    TaskSubmission::new(id, "shell")
                        .with_id(id)
                        .with_max_retries(0),
                )
                .await
                .unwrap();
        }
        assert_eq!(service.schedule_tick().await.unwrap(), 2);
        backend.complete("ok");
        backend.fail("bad", "exit code 1");
        service.monitor_tick().await;

        let mut discarded = backend.discarded();
        discarded.sort();
        assert_eq!(discarded, vec!["bad", "ok"]);
        assert_eq!(backend.retained(), 0);
    }
}
