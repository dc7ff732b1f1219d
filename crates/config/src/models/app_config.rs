use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    database::DatabaseConfig,
    fault_tolerance::{FaultToleranceConfig, RecoveryConfig},
    observability::ObservabilityConfig,
    resources::ResourcesConfig,
    scheduler::{MonitoringConfig, RetryConfig, SchedulerConfig},
};
use crate::validation::ConfigValidator;

/// 环境变量前缀，例如 `ORCHESTRATOR_SCHEDULER__TICK_INTERVAL_MS=500`
pub const ENV_PREFIX: &str = "ORCHESTRATOR";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub monitoring: MonitoringConfig,
    pub retry: RetryConfig,
    pub resources: ResourcesConfig,
    pub fault_tolerance: FaultToleranceConfig,
    pub recovery: RecoveryConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/orchestrator.toml",
                "orchestrator.toml",
                "/etc/orchestrator/config.toml",
            ];

            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                tracing::debug!("未找到配置文件，使用默认配置");
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate().context("配置校验失败")?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate().context("配置校验失败")?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.database.validate()?;
        self.scheduler.validate()?;
        self.monitoring.validate()?;
        self.retry.validate()?;
        self.resources.validate()?;
        self.fault_tolerance.validate()?;
        self.recovery.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.scheduler.strategy, "priority");
        assert_eq!(config.monitoring.heartbeat_timeout_seconds, 90);
        assert_eq!(config.resources.capacities.get("cpu"), Some(&8.0));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_section_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [scheduler]
            strategy = "deadline"

            [resources.capacities]
            cpu = 1.0
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.strategy, "deadline");
        assert_eq!(config.scheduler.tick_interval_ms, 1000);
        assert_eq!(config.resources.capacities.len(), 1);
        assert_eq!(config.retry.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        let result = AppConfig::from_toml(
            r#"
            [scheduler]
            strategy = "random"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = AppConfig::default();
        let serialized = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&serialized).unwrap();
        assert_eq!(parsed.database.url, config.database.url);
        assert_eq!(
            parsed.fault_tolerance.connection_failure_threshold,
            config.fault_tolerance.connection_failure_threshold
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[database]
url = "sqlite::memory:"
max_connections = 1

[monitoring]
interval_ms = 250
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert!(config.database.is_in_memory());
        assert_eq!(config.monitoring.interval_ms, 250);
        assert_eq!(config.recovery.max_concurrent, 4);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/nonexistent/orchestrator.toml")).is_err());
    }
}
