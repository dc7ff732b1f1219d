use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use orchestrator_config::RetryConfig;
use orchestrator_domain::entities::TaskStatusInfo;

/// 指数退避重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// 已重试 `retry_count` 次之后的下一次等待时长，不会短于基础间隔
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        let base_interval = self.config.base_interval_ms as f64;
        let max_interval = self.config.max_interval_ms as f64;
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);

        // 计算指数退避间隔
        let exponential_interval = base_interval * self.config.backoff_multiplier.powi(exponent);
        let capped_interval = exponential_interval.min(max_interval);

        // 添加随机抖动以避免雷群效应
        let jitter =
            capped_interval * self.config.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let final_interval = (capped_interval + jitter).max(base_interval);

        Duration::from_millis(final_interval as u64)
    }

    pub fn next_retry_time(&self, retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.next_delay(retry_count);
        let next = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        debug!(
            "第 {} 次重试将在 {} 后执行",
            retry_count + 1,
            next.format("%Y-%m-%d %H:%M:%S%.3f UTC")
        );
        next
    }

    /// 记录仍处于失败类状态且未用完重试次数
    pub fn should_retry(&self, record: &TaskStatusInfo) -> bool {
        record.status.is_failure() && record.can_retry()
    }
}
