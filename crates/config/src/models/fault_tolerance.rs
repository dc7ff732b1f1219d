use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 健康评估阈值（警告/严重）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub memory_warning: f64,
    pub memory_critical: f64,
    pub disk_warning: f64,
    pub disk_critical: f64,
    pub latency_warning_ms: f64,
    pub latency_critical_ms: f64,
    pub error_rate_warning: f64,
    pub error_rate_critical: f64,
    pub response_time_warning_ms: f64,
    pub response_time_critical_ms: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            cpu_warning: 80.0,
            cpu_critical: 95.0,
            memory_warning: 85.0,
            memory_critical: 98.0,
            disk_warning: 85.0,
            disk_critical: 95.0,
            latency_warning_ms: 500.0,
            latency_critical_ms: 2000.0,
            error_rate_warning: 0.05,
            error_rate_critical: 0.10,
            response_time_warning_ms: 2000.0,
            response_time_critical_ms: 5000.0,
        }
    }
}

impl ConfigValidator for HealthThresholds {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_threshold_pair(self.cpu_warning, self.cpu_critical, "cpu")?;
        ValidationUtils::validate_threshold_pair(
            self.memory_warning,
            self.memory_critical,
            "memory",
        )?;
        ValidationUtils::validate_threshold_pair(self.disk_warning, self.disk_critical, "disk")?;
        ValidationUtils::validate_threshold_pair(
            self.latency_warning_ms,
            self.latency_critical_ms,
            "latency",
        )?;
        ValidationUtils::validate_threshold_pair(
            self.error_rate_warning,
            self.error_rate_critical,
            "error_rate",
        )?;
        ValidationUtils::validate_threshold_pair(
            self.response_time_warning_ms,
            self.response_time_critical_ms,
            "response_time",
        )?;
        Ok(())
    }
}

/// 故障检测模式参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultToleranceConfig {
    pub thresholds: HealthThresholds,
    pub failed_after_consecutive_critical: u32,
    pub high_error_rate: f64,
    pub high_error_rate_critical: f64,
    pub sustained_error_samples: usize,
    pub slow_response_ms: f64,
    pub cpu_exhaustion: f64,
    pub memory_exhaustion: f64,
    pub connection_failure_threshold: u64,
    pub connection_failure_window_seconds: u64,
    /// 每个节点保留的指标样本数
    pub history_size: usize,
}

impl Default for FaultToleranceConfig {
    fn default() -> Self {
        Self {
            thresholds: HealthThresholds::default(),
            failed_after_consecutive_critical: 3,
            high_error_rate: 0.10,
            high_error_rate_critical: 0.25,
            sustained_error_samples: 3,
            slow_response_ms: 5000.0,
            cpu_exhaustion: 95.0,
            memory_exhaustion: 98.0,
            connection_failure_threshold: 5,
            connection_failure_window_seconds: 60,
            history_size: 100,
        }
    }
}

impl ConfigValidator for FaultToleranceConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.thresholds.validate()?;
        ValidationUtils::validate_count(
            self.failed_after_consecutive_critical as usize,
            "fault_tolerance.failed_after_consecutive_critical",
            1000,
        )?;
        ValidationUtils::validate_count(
            self.sustained_error_samples,
            "fault_tolerance.sustained_error_samples",
            self.history_size.max(1),
        )?;
        ValidationUtils::validate_ratio(self.high_error_rate, "fault_tolerance.high_error_rate")?;
        ValidationUtils::validate_ratio(
            self.high_error_rate_critical,
            "fault_tolerance.high_error_rate_critical",
        )?;
        ValidationUtils::validate_count(
            self.connection_failure_window_seconds as usize,
            "fault_tolerance.connection_failure_window_seconds",
            86400,
        )?;
        Ok(())
    }
}

/// 恢复执行池
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_concurrent: usize,
    pub queue_capacity: usize,
    /// 保留的已结束恢复计划数量
    pub history_limit: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            queue_capacity: 64,
            history_limit: 256,
        }
    }
}

impl ConfigValidator for RecoveryConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_count(self.max_concurrent, "recovery.max_concurrent", 256)?;
        ValidationUtils::validate_count(self.queue_capacity, "recovery.queue_capacity", 100000)?;
        ValidationUtils::validate_count(self.history_limit, "recovery.history_limit", 100000)?;
        Ok(())
    }
}
