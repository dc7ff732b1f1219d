use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::debug;

use orchestrator_config::ResourcesConfig;
use orchestrator_domain::entities::{
    parse_requirements, ResourceRequirements, ResourceType, ResourceUsage,
};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

const EPSILON: f64 = 1e-9;

#[derive(Debug, Default)]
struct PoolState {
    totals: ResourceRequirements,
    available: ResourceRequirements,
    allocations: HashMap<String, ResourceRequirements>,
}

impl PoolState {
    fn available(&self, resource: ResourceType) -> f64 {
        self.available.get(&resource).copied().unwrap_or(0.0)
    }

    /// 第一个无法满足的需求
    fn shortfall(&self, requirements: &ResourceRequirements) -> Option<(ResourceType, f64, f64)> {
        requirements
            .iter()
            .filter(|(_, amount)| **amount > 0.0)
            .map(|(resource, amount)| (*resource, *amount, self.available(*resource)))
            .find(|(_, amount, available)| *amount > available + EPSILON)
    }
}

/// 固定容量的资源池，按任务原子地分配和释放
#[derive(Debug)]
pub struct ResourceManager {
    state: Mutex<PoolState>,
}

impl ResourceManager {
    /// 未出现在容量表中的资源类型容量为0
    pub fn new(capacities: ResourceRequirements) -> Self {
        Self {
            state: Mutex::new(PoolState {
                available: capacities.clone(),
                totals: capacities,
                allocations: HashMap::new(),
            }),
        }
    }

    pub fn from_config(config: &ResourcesConfig) -> OrchestratorResult<Self> {
        Ok(Self::new(parse_requirements(&config.capacities)?))
    }

    /// 全有或全无：任一资源不足时返回 `ResourceExhausted`，不做部分分配
    pub async fn allocate(
        &self,
        task_id: &str,
        requirements: &ResourceRequirements,
    ) -> OrchestratorResult<()> {
        let mut state = self.state.lock().await;

        if state.allocations.contains_key(task_id) {
            return Err(OrchestratorError::validation_error(format!(
                "任务 {task_id} 已持有资源"
            )));
        }

        if let Some((resource, requested, available)) = state.shortfall(requirements) {
            debug!(
                "任务 {} 资源不足: {} 需要 {:.3}，剩余 {:.3}",
                task_id, resource, requested, available
            );
            return Err(OrchestratorError::ResourceExhausted {
                task_id: task_id.to_string(),
                resource: resource.to_string(),
                requested,
                available,
            });
        }

        for (resource, amount) in requirements {
            if *amount > 0.0 {
                let entry = state.available.entry(*resource).or_insert(0.0);
                *entry = (*entry - amount).max(0.0);
            }
        }
        state
            .allocations
            .insert(task_id.to_string(), requirements.clone());
        Self::publish_gauges(&state);
        Ok(())
    }

    /// 归还任务持有的全部资源并返回归还的数量；未知任务为空操作
    pub async fn release(&self, task_id: &str) -> ResourceRequirements {
        let mut state = self.state.lock().await;
        let Some(allocation) = state.allocations.remove(task_id) else {
            return ResourceRequirements::new();
        };

        for (resource, amount) in &allocation {
            if *amount <= 0.0 {
                continue;
            }
            let total = state.totals.get(resource).copied().unwrap_or(0.0);
            let entry = state.available.entry(*resource).or_insert(0.0);
            *entry = (*entry + amount).min(total);
        }
        Self::publish_gauges(&state);
        allocation
    }

    pub async fn can_allocate(&self, requirements: &ResourceRequirements) -> bool {
        self.state.lock().await.shortfall(requirements).is_none()
    }

    pub async fn allocation(&self, task_id: &str) -> Option<ResourceRequirements> {
        self.state.lock().await.allocations.get(task_id).cloned()
    }

    pub async fn allocated_task_count(&self) -> usize {
        self.state.lock().await.allocations.len()
    }

    pub async fn usage(&self) -> Vec<ResourceUsage> {
        let state = self.state.lock().await;
        Self::usage_of(&state)
    }

    fn usage_of(state: &PoolState) -> Vec<ResourceUsage> {
        state
            .totals
            .iter()
            .map(|(resource, total)| {
                let available = state.available(*resource);
                let allocated = (total - available).max(0.0);
                let utilization = if *total > 0.0 { allocated / total } else { 0.0 };
                ResourceUsage {
                    resource_type: *resource,
                    total: *total,
                    available,
                    allocated,
                    utilization,
                }
            })
            .collect()
    }

    fn publish_gauges(state: &PoolState) {
        for usage in Self::usage_of(state) {
            metrics::gauge!(
                "orchestrator_resource_utilization",
                "resource" => usage.resource_type.as_str()
            )
            .set(usage.utilization);
        }
    }
}
