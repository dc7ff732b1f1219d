use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Failed,
    #[default]
    Unknown,
}

/// 单个节点的一次健康采样
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    /// 百分比 0-100
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub network_latency_ms: f64,
    /// 0.0-1.0
    pub error_rate: f64,
    pub response_time_ms: f64,
    pub active_connections: u64,
    /// 上次采样以来的连接失败次数
    pub connection_failures: u64,
}

impl HealthMetrics {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp: Utc::now(),
            cpu_usage: 0.0,
            memory_usage: 0.0,
            disk_usage: 0.0,
            network_latency_ms: 0.0,
            error_rate: 0.0,
            response_time_ms: 0.0,
            active_connections: 0,
            connection_failures: 0,
        }
    }

    /// 所有浮点指标有限且非负
    pub fn is_well_formed(&self) -> bool {
        [
            self.cpu_usage,
            self.memory_usage,
            self.disk_usage,
            self.network_latency_ms,
            self.error_rate,
            self.response_time_ms,
        ]
        .iter()
        .all(|v| v.is_finite() && *v >= 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    HighErrorRate,
    SlowResponse,
    ResourceExhaustion,
    ConnectionFailure,
    NodeUnresponsive,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureType::HighErrorRate => "high_error_rate",
            FailureType::SlowResponse => "slow_response",
            FailureType::ResourceExhaustion => "resource_exhaustion",
            FailureType::ConnectionFailure => "connection_failure",
            FailureType::NodeUnresponsive => "node_unresponsive",
        };
        f.write_str(name)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FailureSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// 检测到的故障
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub id: String,
    pub node_id: String,
    pub failure_type: FailureType,
    pub severity: FailureSeverity,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    pub metrics: Option<HealthMetrics>,
}

impl FailureEvent {
    pub fn new(
        node_id: impl Into<String>,
        failure_type: FailureType,
        severity: FailureSeverity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            node_id: node_id.into(),
            failure_type,
            severity,
            description: description.into(),
            detected_at: Utc::now(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: HealthMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    RestartService,
    FailoverNode,
    ScaleUp,
    IsolateNode,
    NotifyOperator,
    AutoHeal,
}

impl RecoveryAction {
    pub fn estimated_duration(&self) -> Duration {
        let secs = match self {
            RecoveryAction::RestartService => 30,
            RecoveryAction::FailoverNode => 60,
            RecoveryAction::ScaleUp => 120,
            RecoveryAction::IsolateNode => 10,
            RecoveryAction::NotifyOperator => 1,
            RecoveryAction::AutoHeal => 45,
        };
        Duration::from_secs(secs)
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryAction::RestartService => "restart_service",
            RecoveryAction::FailoverNode => "failover_node",
            RecoveryAction::ScaleUp => "scale_up",
            RecoveryAction::IsolateNode => "isolate_node",
            RecoveryAction::NotifyOperator => "notify_operator",
            RecoveryAction::AutoHeal => "auto_heal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPlanStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// 针对一次故障的恢复计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub id: String,
    pub event: FailureEvent,
    pub actions: Vec<RecoveryAction>,
    pub estimated_duration: Duration,
    /// 数值越小越优先
    pub priority: u8,
    pub status: RecoveryPlanStatus,
    pub failed_actions: Vec<RecoveryAction>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RecoveryPlan {
    pub fn new(event: FailureEvent, actions: Vec<RecoveryAction>) -> Self {
        let estimated_duration = actions.iter().map(RecoveryAction::estimated_duration).sum();
        let priority = match event.severity {
            FailureSeverity::Critical => 1,
            FailureSeverity::High => 2,
            FailureSeverity::Medium => 3,
            FailureSeverity::Low => 4,
        };
        Self {
            id: Uuid::new_v4().to_string(),
            event,
            actions,
            estimated_duration,
            priority,
            status: RecoveryPlanStatus::Pending,
            failed_actions: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            RecoveryPlanStatus::Succeeded | RecoveryPlanStatus::Failed
        )
    }
}
