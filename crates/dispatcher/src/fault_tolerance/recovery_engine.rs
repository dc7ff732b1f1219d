use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use orchestrator_config::RecoveryConfig;
use orchestrator_domain::entities::{
    FailureEvent, FailureType, RecoveryAction, RecoveryPlan, RecoveryPlanStatus,
};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

/// 恢复动作的执行者
#[async_trait]
pub trait RecoveryCallback: Send + Sync {
    async fn execute(&self, action: RecoveryAction, event: &FailureEvent) -> bool;
}

/// 把同步闭包适配为 `RecoveryCallback`
pub struct FnCallback<F>(pub F);

#[async_trait]
impl<F> RecoveryCallback for FnCallback<F>
where
    F: Fn(&FailureEvent) -> bool + Send + Sync,
{
    async fn execute(&self, _action: RecoveryAction, event: &FailureEvent) -> bool {
        (self.0)(event)
    }
}

/// 默认的通知动作：写一条告警日志
pub struct LogNotifier;

#[async_trait]
impl RecoveryCallback for LogNotifier {
    async fn execute(&self, action: RecoveryAction, event: &FailureEvent) -> bool {
        warn!(
            "需要人工介入: 节点 {} 发生 {} ({:?})，动作 {}: {}",
            event.node_id, event.failure_type, event.severity, action, event.description
        );
        true
    }
}

/// 故障类型对应的恢复动作，按执行顺序排列
pub fn actions_for(failure_type: FailureType) -> Vec<RecoveryAction> {
    match failure_type {
        FailureType::HighErrorRate => {
            vec![RecoveryAction::RestartService, RecoveryAction::FailoverNode]
        }
        FailureType::SlowResponse => vec![RecoveryAction::ScaleUp, RecoveryAction::NotifyOperator],
        FailureType::ResourceExhaustion => vec![RecoveryAction::ScaleUp, RecoveryAction::AutoHeal],
        FailureType::ConnectionFailure => {
            vec![RecoveryAction::RestartService, RecoveryAction::IsolateNode]
        }
        FailureType::NodeUnresponsive => vec![
            RecoveryAction::IsolateNode,
            RecoveryAction::FailoverNode,
            RecoveryAction::NotifyOperator,
        ],
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Default)]
struct PlanBook {
    plans: HashMap<String, RecoveryPlan>,
    /// 已结束的计划，按结束先后排列
    finished: VecDeque<String>,
}

impl PlanBook {
    /// 登记一个已结束的计划，超出上限时淘汰最早结束的
    fn retire(&mut self, plan_id: &str, limit: usize) {
        self.finished.push_back(plan_id.to_string());
        while self.finished.len() > limit {
            if let Some(oldest) = self.finished.pop_front() {
                self.plans.remove(&oldest);
            }
        }
    }
}

/// 在有界执行池中运行恢复计划。
///
/// 提交使用 `try_send`，队列满时立即拒绝，调用方不会被阻塞。
/// 未结束的计划全部保留，已结束的只保留最近 `history_limit` 个。
pub struct RecoveryEngine {
    callbacks: RwLock<HashMap<RecoveryAction, Arc<dyn RecoveryCallback>>>,
    plans: RwLock<PlanBook>,
    history_limit: usize,
    sender: mpsc::Sender<String>,
    receiver: Mutex<Option<mpsc::Receiver<String>>>,
    permits: Arc<Semaphore>,
}

impl RecoveryEngine {
    pub fn new(config: &RecoveryConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let mut callbacks: HashMap<RecoveryAction, Arc<dyn RecoveryCallback>> = HashMap::new();
        callbacks.insert(RecoveryAction::NotifyOperator, Arc::new(LogNotifier));
        Self {
            callbacks: RwLock::new(callbacks),
            plans: RwLock::new(PlanBook::default()),
            history_limit: config.history_limit.max(1),
            sender,
            receiver: Mutex::new(Some(receiver)),
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
        }
    }

    pub async fn register_callback(
        &self,
        action: RecoveryAction,
        callback: Arc<dyn RecoveryCallback>,
    ) {
        debug!("注册恢复动作回调: {}", action);
        self.callbacks.write().await.insert(action, callback);
    }

    pub async fn register_fn<F>(&self, action: RecoveryAction, callback: F)
    where
        F: Fn(&FailureEvent) -> bool + Send + Sync + 'static,
    {
        self.register_callback(action, Arc::new(FnCallback(callback)))
            .await;
    }

    /// 为故障生成恢复计划并放入执行队列
    pub async fn submit(&self, event: FailureEvent) -> OrchestratorResult<RecoveryPlan> {
        let plan = RecoveryPlan::new(event.clone(), actions_for(event.failure_type));
        let plan_id = plan.id.clone();
        self.plans
            .write()
            .await
            .plans
            .insert(plan_id.clone(), plan.clone());

        if let Err(e) = self.sender.try_send(plan_id.clone()) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "恢复队列已满",
                mpsc::error::TrySendError::Closed(_) => "恢复执行器已停止",
            };
            warn!("恢复计划 {} 被拒绝: {}", plan_id, reason);
            let mut book = self.plans.write().await;
            if let Some(stored) = book.plans.get_mut(&plan_id) {
                stored.status = RecoveryPlanStatus::Failed;
                stored.completed_at = Some(Utc::now());
                book.retire(&plan_id, self.history_limit);
            }
            drop(book);
            metrics::counter!("orchestrator_recovery_plans_total", "outcome" => "rejected")
                .increment(1);
            return Err(OrchestratorError::RecoveryActionFailed {
                action: "submit".to_string(),
                reason: reason.to_string(),
            });
        }

        info!(
            "节点 {} 的故障 {} 已生成恢复计划 {}，预计耗时 {}s",
            event.node_id,
            event.failure_type,
            plan_id,
            plan.estimated_duration.as_secs()
        );
        Ok(plan)
    }

    /// 启动计划分发循环。只能启动一次，再次调用返回 `None`。
    pub async fn start(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Option<JoinHandle<()>> {
        let mut receiver = self.receiver.lock().await.take()?;
        let engine = Arc::clone(self);

        Some(tokio::spawn(async move {
            info!("恢复执行器已启动");
            loop {
                tokio::select! {
                    plan_id = receiver.recv() => {
                        let Some(plan_id) = plan_id else { break };
                        let permit = match Arc::clone(&engine.permits).acquire_owned().await {
                            Ok(permit) => permit,
                            Err(e) => {
                                error!("获取恢复执行许可失败: {}", e);
                                break;
                            }
                        };
                        let engine = Arc::clone(&engine);
                        tokio::spawn(async move {
                            engine.run_plan(&plan_id).await;
                            drop(permit);
                        });
                    }
                    _ = shutdown.recv() => {
                        info!("收到停止信号，退出恢复执行器");
                        break;
                    }
                }
            }
        }))
    }

    /// 顺序执行计划中的动作。任一动作失败时计划记为Failed，其余动作继续执行。
    pub async fn run_plan(&self, plan_id: &str) -> Option<RecoveryPlan> {
        let plan = {
            let mut book = self.plans.write().await;
            let plan = book.plans.get_mut(plan_id)?;
            if plan.status != RecoveryPlanStatus::Pending {
                return Some(plan.clone());
            }
            plan.status = RecoveryPlanStatus::Running;
            plan.started_at = Some(Utc::now());
            plan.clone()
        };

        let mut failed_actions = Vec::new();
        for action in &plan.actions {
            let callback = self.callbacks.read().await.get(action).cloned();
            let succeeded = match callback {
                Some(callback) => callback.execute(*action, &plan.event).await,
                None => {
                    warn!("恢复动作 {} 没有注册回调", action);
                    false
                }
            };
            if succeeded {
                debug!("恢复计划 {} 动作 {} 执行成功", plan_id, action);
            } else {
                warn!("恢复计划 {} 动作 {} 执行失败", plan_id, action);
                failed_actions.push(*action);
            }
        }

        let status = if failed_actions.is_empty() {
            RecoveryPlanStatus::Succeeded
        } else {
            RecoveryPlanStatus::Failed
        };
        let outcome = if failed_actions.is_empty() {
            "succeeded"
        } else {
            "failed"
        };
        metrics::counter!("orchestrator_recovery_plans_total", "outcome" => outcome).increment(1);

        let mut book = self.plans.write().await;
        let stored = book.plans.get_mut(plan_id)?;
        stored.status = status;
        stored.failed_actions = failed_actions;
        stored.completed_at = Some(Utc::now());
        let finished = stored.clone();
        book.retire(plan_id, self.history_limit);
        info!("恢复计划 {} 执行结束: {:?}", plan_id, status);
        Some(finished)
    }

    pub async fn plan(&self, plan_id: &str) -> Option<RecoveryPlan> {
        self.plans.read().await.plans.get(plan_id).cloned()
    }

    pub async fn plans(&self) -> Vec<RecoveryPlan> {
        let mut plans: Vec<RecoveryPlan> =
            self.plans.read().await.plans.values().cloned().collect();
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        plans
    }

    /// 当前保留的计划统计
    pub async fn stats(&self) -> RecoveryStats {
        let book = self.plans.read().await;
        let mut stats = RecoveryStats {
            total: book.plans.len(),
            ..Default::default()
        };
        for plan in book.plans.values() {
            match plan.status {
                RecoveryPlanStatus::Pending => stats.pending += 1,
                RecoveryPlanStatus::Running => stats.running += 1,
                RecoveryPlanStatus::Succeeded => stats.succeeded += 1,
                RecoveryPlanStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}
