//! 节点健康监控、故障检测与自动恢复

pub mod failure_detector;
pub mod health_monitor;
pub mod recovery_engine;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use orchestrator_config::{FaultToleranceConfig, RecoveryConfig};
use orchestrator_domain::entities::{
    FailureEvent, HealthMetrics, HealthStatus, RecoveryAction, RecoveryPlan,
};

pub use failure_detector::FailureDetector;
pub use health_monitor::HealthMonitor;
pub use recovery_engine::{
    actions_for, FnCallback, LogNotifier, RecoveryCallback, RecoveryEngine, RecoveryStats,
};

/// 一次指标上报的处理结果
#[derive(Debug, Clone)]
pub struct FaultAssessment {
    pub node_id: String,
    pub status: HealthStatus,
    pub events: Vec<FailureEvent>,
    pub plans: Vec<RecoveryPlan>,
}

struct HealthState {
    monitor: HealthMonitor,
    detector: FailureDetector,
}

/// 健康状态只由监控循环写入，恢复计划只由恢复引擎写入
pub struct FaultToleranceManager {
    state: RwLock<HealthState>,
    engine: Arc<RecoveryEngine>,
}

impl FaultToleranceManager {
    pub fn new(config: &FaultToleranceConfig, recovery: &RecoveryConfig) -> Self {
        Self {
            state: RwLock::new(HealthState {
                monitor: HealthMonitor::new(config),
                detector: FailureDetector::new(config),
            }),
            engine: Arc::new(RecoveryEngine::new(recovery)),
        }
    }

    pub fn engine(&self) -> &Arc<RecoveryEngine> {
        &self.engine
    }

    /// 评估一次指标采样，检测到的故障会提交恢复计划
    pub async fn ingest_metrics(&self, metrics: HealthMetrics) -> FaultAssessment {
        let node_id = metrics.node_id.clone();
        let (status, events) = {
            let mut state = self.state.write().await;
            let status = state.monitor.record(metrics.clone());
            let recent: Vec<HealthMetrics> = state
                .monitor
                .history(&node_id)
                .into_iter()
                .cloned()
                .collect();
            let recent_refs: Vec<&HealthMetrics> = recent.iter().collect();
            let events = state.detector.detect(&metrics, status, &recent_refs);
            (status, events)
        };

        let plans = self.submit_all(&events).await;
        FaultAssessment {
            node_id,
            status,
            events,
            plans,
        }
    }

    /// 节点被判定失效（心跳超时等），生成一次节点无响应故障
    pub async fn mark_node_failed(&self, node_id: &str, reason: &str) -> Option<RecoveryPlan> {
        let event = {
            let mut state = self.state.write().await;
            state.monitor.mark_failed(node_id);
            state.detector.node_unresponsive(node_id, reason)
        }?;
        self.submit_all(std::slice::from_ref(&event)).await.pop()
    }

    /// 失效节点重新上线，健康状态回到未知，之后的失效会重新生成恢复计划
    pub async fn mark_node_recovered(&self, node_id: &str) {
        let mut state = self.state.write().await;
        state.monitor.reset(node_id);
        state.detector.clear(node_id);
    }

    async fn submit_all(&self, events: &[FailureEvent]) -> Vec<RecoveryPlan> {
        let mut plans = Vec::new();
        for event in events {
            match self.engine.submit(event.clone()).await {
                Ok(plan) => plans.push(plan),
                Err(e) => error!("提交节点 {} 的恢复计划失败: {}", event.node_id, e),
            }
        }
        plans
    }

    pub async fn node_status(&self, node_id: &str) -> HealthStatus {
        self.state.read().await.monitor.status(node_id)
    }

    pub async fn node_statuses(&self) -> HashMap<String, HealthStatus> {
        self.state.read().await.monitor.statuses()
    }

    pub async fn register_callback(
        &self,
        action: RecoveryAction,
        callback: Arc<dyn RecoveryCallback>,
    ) {
        self.engine.register_callback(action, callback).await;
    }

    pub async fn register_fn<F>(&self, action: RecoveryAction, callback: F)
    where
        F: Fn(&FailureEvent) -> bool + Send + Sync + 'static,
    {
        self.engine.register_fn(action, callback).await;
    }

    pub async fn recovery_stats(&self) -> RecoveryStats {
        self.engine.stats().await
    }

    pub async fn start(&self, shutdown: broadcast::Receiver<()>) -> Option<JoinHandle<()>> {
        let handle = self.engine.start(shutdown).await;
        if handle.is_none() {
            warn!("恢复执行器已经启动");
        }
        handle
    }
}
