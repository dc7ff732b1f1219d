use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::warn;

use orchestrator_config::FaultToleranceConfig;
use orchestrator_domain::entities::{
    FailureEvent, FailureSeverity, FailureType, HealthMetrics, HealthStatus,
};

/// 基于指标模式识别故障，同一节点的同类故障只上报一次
#[derive(Debug)]
pub struct FailureDetector {
    config: FaultToleranceConfig,
    reported: HashMap<String, HashSet<(FailureType, FailureSeverity)>>,
    connection_failures: HashMap<String, VecDeque<(DateTime<Utc>, u64)>>,
}

impl FailureDetector {
    pub fn new(config: &FaultToleranceConfig) -> Self {
        Self {
            config: config.clone(),
            reported: HashMap::new(),
            connection_failures: HashMap::new(),
        }
    }

    /// `recent` 为该节点最近的采样（旧的在前，包含本次采样）
    pub fn detect(
        &mut self,
        metrics: &HealthMetrics,
        status: HealthStatus,
        recent: &[&HealthMetrics],
    ) -> Vec<FailureEvent> {
        let node_id = metrics.node_id.as_str();
        let window_failures = self.track_connection_failures(metrics);

        match status {
            HealthStatus::Healthy => {
                self.reported.remove(node_id);
                return Vec::new();
            }
            HealthStatus::Unknown => return Vec::new(),
            HealthStatus::Warning | HealthStatus::Critical | HealthStatus::Failed => {}
        }

        let mut candidates = Vec::new();

        let samples = self.config.sustained_error_samples.max(1);
        if recent.len() >= samples
            && recent[recent.len() - samples..]
                .iter()
                .all(|m| m.error_rate > self.config.high_error_rate)
        {
            let severity = if metrics.error_rate > self.config.high_error_rate_critical {
                FailureSeverity::Critical
            } else {
                FailureSeverity::High
            };
            candidates.push((
                FailureType::HighErrorRate,
                severity,
                format!(
                    "连续 {} 次采样错误率超过 {:.0}%，当前 {:.1}%",
                    samples,
                    self.config.high_error_rate * 100.0,
                    metrics.error_rate * 100.0
                ),
            ));
        }

        if metrics.response_time_ms > self.config.slow_response_ms {
            candidates.push((
                FailureType::SlowResponse,
                FailureSeverity::High,
                format!("响应时间 {:.0}ms", metrics.response_time_ms),
            ));
        }

        if metrics.cpu_usage > self.config.cpu_exhaustion
            || metrics.memory_usage > self.config.memory_exhaustion
        {
            candidates.push((
                FailureType::ResourceExhaustion,
                FailureSeverity::Critical,
                format!(
                    "资源耗尽: CPU {:.1}%，内存 {:.1}%",
                    metrics.cpu_usage, metrics.memory_usage
                ),
            ));
        }

        if window_failures >= self.config.connection_failure_threshold {
            candidates.push((
                FailureType::ConnectionFailure,
                FailureSeverity::High,
                format!(
                    "{} 秒内连接失败 {} 次",
                    self.config.connection_failure_window_seconds, window_failures
                ),
            ));
        }

        if status == HealthStatus::Failed {
            candidates.push((
                FailureType::NodeUnresponsive,
                FailureSeverity::Critical,
                "节点连续处于严重状态".to_string(),
            ));
        }

        candidates
            .into_iter()
            .filter_map(|(failure_type, severity, description)| {
                self.first_report(node_id, failure_type, severity)
                    .then(|| {
                        FailureEvent::new(node_id, failure_type, severity, description)
                            .with_metrics(metrics.clone())
                    })
            })
            .collect()
    }

    /// 节点被外部判定为失效时生成的事件，已上报过则为空
    pub fn node_unresponsive(&mut self, node_id: &str, reason: &str) -> Option<FailureEvent> {
        self.first_report(node_id, FailureType::NodeUnresponsive, FailureSeverity::Critical)
            .then(|| {
                FailureEvent::new(
                    node_id,
                    FailureType::NodeUnresponsive,
                    FailureSeverity::Critical,
                    reason,
                )
            })
    }

    /// 节点恢复后清除已上报记录，下次失效会再次上报
    pub fn clear(&mut self, node_id: &str) {
        self.reported.remove(node_id);
        self.connection_failures.remove(node_id);
    }

    fn first_report(
        &mut self,
        node_id: &str,
        failure_type: FailureType,
        severity: FailureSeverity,
    ) -> bool {
        let inserted = self
            .reported
            .entry(node_id.to_string())
            .or_default()
            .insert((failure_type, severity));
        if inserted {
            warn!("节点 {} 检测到故障: {} ({:?})", node_id, failure_type, severity);
        }
        inserted
    }

    /// 返回滑动窗口内的连接失败总数
    fn track_connection_failures(&mut self, metrics: &HealthMetrics) -> u64 {
        let window_ms = i64::try_from(self.config.connection_failure_window_seconds)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        let entries = self
            .connection_failures
            .entry(metrics.node_id.clone())
            .or_default();
        if metrics.connection_failures > 0 {
            entries.push_back((metrics.timestamp, metrics.connection_failures));
        }
        let now = metrics.timestamp;
        while entries
            .front()
            .is_some_and(|(at, _)| (now - *at).num_milliseconds() >= window_ms)
        {
            entries.pop_front();
        }
        entries.iter().map(|(_, count)| count).sum()
    }
}
