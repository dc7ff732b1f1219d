use std::collections::{HashMap, VecDeque};

use tracing::{debug, info, warn};

use orchestrator_config::{FaultToleranceConfig, HealthThresholds};
use orchestrator_domain::entities::{HealthMetrics, HealthStatus};

#[derive(Debug, Default)]
struct NodeHealth {
    status: HealthStatus,
    consecutive_critical: u32,
    history: VecDeque<HealthMetrics>,
}

/// 按阈值评估节点健康状态并保留最近的指标样本
#[derive(Debug)]
pub struct HealthMonitor {
    thresholds: HealthThresholds,
    failed_after: u32,
    history_size: usize,
    nodes: HashMap<String, NodeHealth>,
}

impl HealthMonitor {
    pub fn new(config: &FaultToleranceConfig) -> Self {
        Self {
            thresholds: config.thresholds.clone(),
            failed_after: config.failed_after_consecutive_critical.max(1),
            history_size: config.history_size.max(1),
            nodes: HashMap::new(),
        }
    }

    /// 单次采样的评估结果，不考虑历史
    pub fn evaluate(&self, metrics: &HealthMetrics) -> HealthStatus {
        if !metrics.is_well_formed() {
            return HealthStatus::Unknown;
        }
        let t = &self.thresholds;
        let checks = [
            (metrics.cpu_usage, t.cpu_warning, t.cpu_critical),
            (metrics.memory_usage, t.memory_warning, t.memory_critical),
            (metrics.disk_usage, t.disk_warning, t.disk_critical),
            (
                metrics.network_latency_ms,
                t.latency_warning_ms,
                t.latency_critical_ms,
            ),
            (metrics.error_rate, t.error_rate_warning, t.error_rate_critical),
            (
                metrics.response_time_ms,
                t.response_time_warning_ms,
                t.response_time_critical_ms,
            ),
        ];

        let mut warnings = 0;
        for (value, warning, critical) in checks {
            if value >= critical {
                return HealthStatus::Critical;
            }
            if value >= warning {
                warnings += 1;
            }
        }
        if warnings >= 2 {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }

    /// 记录一次采样并返回节点的新状态。
    ///
    /// 连续 `failed_after` 次Critical后节点进入Failed；Failed的节点只有在评估
    /// 为Healthy时才会恢复。
    pub fn record(&mut self, metrics: HealthMetrics) -> HealthStatus {
        let evaluated = self.evaluate(&metrics);
        let node_id = metrics.node_id.clone();
        let failed_after = self.failed_after;
        let history_size = self.history_size;
        let node = self.nodes.entry(node_id.clone()).or_default();

        node.history.push_back(metrics);
        while node.history.len() > history_size {
            node.history.pop_front();
        }

        let previous = node.status;
        let next = match evaluated {
            HealthStatus::Critical => {
                node.consecutive_critical += 1;
                if node.consecutive_critical >= failed_after {
                    HealthStatus::Failed
                } else {
                    HealthStatus::Critical
                }
            }
            HealthStatus::Unknown => {
                warn!("节点 {} 的健康指标无效", node_id);
                if previous == HealthStatus::Failed {
                    HealthStatus::Failed
                } else {
                    HealthStatus::Unknown
                }
            }
            other => {
                node.consecutive_critical = 0;
                if previous == HealthStatus::Failed && other != HealthStatus::Healthy {
                    HealthStatus::Failed
                } else {
                    other
                }
            }
        };
        node.status = next;

        if previous != next {
            match next {
                HealthStatus::Healthy => info!("节点 {} 恢复健康", node_id),
                HealthStatus::Failed => warn!("节点 {} 判定为失效", node_id),
                _ => debug!("节点 {} 健康状态 {:?} -> {:?}", node_id, previous, next),
            }
        }
        next
    }

    /// 外部判定节点失效（例如心跳超时）
    pub fn mark_failed(&mut self, node_id: &str) -> HealthStatus {
        let node = self.nodes.entry(node_id.to_string()).or_default();
        let previous = node.status;
        node.status = HealthStatus::Failed;
        previous
    }

    /// 节点重新上线，丢弃失效前的状态与采样
    pub fn reset(&mut self, node_id: &str) {
        if self.nodes.remove(node_id).is_some() {
            info!("节点 {} 重新上线，健康状态重置", node_id);
        }
    }

    pub fn status(&self, node_id: &str) -> HealthStatus {
        self.nodes
            .get(node_id)
            .map(|n| n.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    pub fn statuses(&self) -> HashMap<String, HealthStatus> {
        self.nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.status))
            .collect()
    }

    /// 最近的采样，旧的在前
    pub fn history(&self, node_id: &str) -> Vec<&HealthMetrics> {
        self.nodes
            .get(node_id)
            .map(|n| n.history.iter().collect())
            .unwrap_or_default()
    }
}
