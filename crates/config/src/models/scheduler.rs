use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    /// priority | fifo | deadline
    pub strategy: String,
    /// 单次调度周期最多派发的任务数
    pub max_dispatch_per_tick: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            strategy: "priority".to_string(),
            max_dispatch_per_tick: 64,
        }
    }
}

impl ConfigValidator for SchedulerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_interval_ms(self.tick_interval_ms, "scheduler.tick_interval_ms")?;
        ValidationUtils::validate_count(
            self.max_dispatch_per_tick,
            "scheduler.max_dispatch_per_tick",
            10000,
        )?;

        let valid_strategies = ["priority", "fifo", "deadline"];
        if !valid_strategies.contains(&self.strategy.as_str()) {
            return Err(crate::ConfigError::Validation(format!(
                "Invalid scheduling strategy: {}. Valid options: {:?}",
                self.strategy, valid_strategies
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub interval_ms: u64,
    /// 心跳超过该时长的worker被标记为离线
    pub heartbeat_timeout_seconds: u64,
    /// 每隔多少个监控周期执行一次死锁检测
    pub deadlock_check_every_ticks: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            heartbeat_timeout_seconds: 90,
            deadlock_check_every_ticks: 10,
        }
    }
}

impl ConfigValidator for MonitoringConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_interval_ms(self.interval_ms, "monitoring.interval_ms")?;
        ValidationUtils::validate_count(
            self.heartbeat_timeout_seconds as usize,
            "monitoring.heartbeat_timeout_seconds",
            86400,
        )?;
        ValidationUtils::validate_count(
            self.deadlock_check_every_ticks as usize,
            "monitoring.deadlock_check_every_ticks",
            100000,
        )?;
        Ok(())
    }
}

/// 重试退避参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_interval_ms: u64,
    pub max_interval_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 1000,
            max_interval_ms: 300_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl ConfigValidator for RetryConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.base_interval_ms > self.max_interval_ms {
            return Err(crate::ConfigError::Validation(
                "retry.base_interval_ms must be less than or equal to max_interval_ms".to_string(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(crate::ConfigError::Validation(
                "retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        ValidationUtils::validate_ratio(self.jitter_factor, "retry.jitter_factor")?;
        Ok(())
    }
}
