use orchestrator_errors::OrchestratorError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Cpu,
    Memory,
    Network,
    DbConnections,
    Quota,
}

impl ResourceType {
    pub const ALL: [ResourceType; 5] = [
        ResourceType::Cpu,
        ResourceType::Memory,
        ResourceType::Network,
        ResourceType::DbConnections,
        ResourceType::Quota,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Cpu => "cpu",
            ResourceType::Memory => "memory",
            ResourceType::Network => "network",
            ResourceType::DbConnections => "db_connections",
            ResourceType::Quota => "quota",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| OrchestratorError::invalid_params(format!("未知的资源类型: {s}")))
    }
}

/// 资源类型 -> 数量
pub type ResourceRequirements = BTreeMap<ResourceType, f64>;

/// 将字符串键的资源表解析为强类型需求
pub fn parse_requirements(
    raw: &BTreeMap<String, f64>,
) -> Result<ResourceRequirements, OrchestratorError> {
    raw.iter()
        .map(|(name, amount)| Ok((name.parse::<ResourceType>()?, *amount)))
        .collect()
}

/// 资源池中某一类型的使用情况
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub resource_type: ResourceType,
    pub total: f64,
    pub available: f64,
    pub allocated: f64,
    /// 0.0 - 1.0，总量为0时为0
    pub utilization: f64,
}
