use async_trait::async_trait;
use orchestrator_errors::OrchestratorResult;

use crate::entities::HealthMetrics;

/// 节点健康指标的拉取来源
#[async_trait]
pub trait HealthMetricsSource: Send + Sync {
    async fn collect(&self, node_id: &str) -> OrchestratorResult<Option<HealthMetrics>>;
}
