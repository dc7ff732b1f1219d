use crate::validation::ConfigValidator;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 资源池可识别的资源类型名称
pub const KNOWN_RESOURCE_TYPES: [&str; 5] = ["cpu", "memory", "network", "db_connections", "quota"];

/// 资源池的固定总容量，未配置的类型容量为0
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    pub capacities: BTreeMap<String, f64>,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        let capacities = [
            ("cpu", 8.0),
            ("memory", 16384.0),
            ("network", 1000.0),
            ("db_connections", 20.0),
            ("quota", 100.0),
        ]
        .into_iter()
        .map(|(name, amount)| (name.to_string(), amount))
        .collect();
        Self { capacities }
    }
}

impl ConfigValidator for ResourcesConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        for (name, amount) in &self.capacities {
            if !KNOWN_RESOURCE_TYPES.contains(&name.as_str()) {
                return Err(crate::ConfigError::Validation(format!(
                    "Unknown resource type: {name}. Valid options: {KNOWN_RESOURCE_TYPES:?}"
                )));
            }
            if !amount.is_finite() || *amount < 0.0 {
                return Err(crate::ConfigError::Validation(format!(
                    "resources.capacities.{name} must be a finite non-negative number"
                )));
            }
        }
        Ok(())
    }
}
