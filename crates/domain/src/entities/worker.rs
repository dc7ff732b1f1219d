use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::health::{HealthMetrics, HealthStatus};
use super::resource::ResourceRequirements;
use super::task::Task;

/// 资源比较的容差
const RESOURCE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerStatus {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "OFFLINE")]
    Offline,
}

/// Worker注册请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    /// 最大并发任务数
    pub capacity: usize,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub available_resources: ResourceRequirements,
}

impl WorkerRegistration {
    pub fn new(worker_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            worker_id: worker_id.into(),
            capacity,
            capabilities: Vec::new(),
            available_resources: ResourceRequirements::new(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequirements) -> Self {
        self.available_resources = resources;
        self
    }
}

/// Worker心跳信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    /// 为空表示资源快照未变化
    pub available_resources: Option<ResourceRequirements>,
    pub metrics: Option<HealthMetrics>,
    pub timestamp: DateTime<Utc>,
}

impl WorkerHeartbeat {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            available_resources: None,
            metrics: None,
            timestamp: Utc::now(),
        }
    }
}

/// Worker节点信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub capacity: usize,
    pub current_load: usize,
    pub available_resources: ResourceRequirements,
    pub capabilities: Vec<String>,
    pub status: WorkerStatus,
    pub health: HealthStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerInfo {
    pub fn new(registration: WorkerRegistration) -> Self {
        let now = Utc::now();
        Self {
            id: registration.worker_id,
            capacity: registration.capacity,
            current_load: 0,
            available_resources: registration.available_resources,
            capabilities: registration.capabilities,
            status: WorkerStatus::Active,
            health: HealthStatus::Unknown,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, WorkerStatus::Active)
    }

    /// 在线且仍有空闲槽位
    pub fn is_idle(&self) -> bool {
        self.is_active() && self.current_load < self.capacity
    }

    /// 检查Worker是否可以执行该任务。
    ///
    /// 只约束Worker快照中出现的资源类型，其余类型由资源池约束。
    pub fn can_handle(&self, task: &Task) -> bool {
        if !self.is_idle() {
            return false;
        }
        if !self.capabilities.is_empty() && !self.capabilities.contains(&task.task_type) {
            return false;
        }
        task.resource_requirements
            .iter()
            .all(|(resource, amount)| match self.available_resources.get(resource) {
                Some(advertised) => *amount <= advertised + RESOURCE_EPSILON,
                None => true,
            })
    }

    pub fn load_percentage(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            (self.current_load as f64 / self.capacity as f64) * 100.0
        }
    }

    /// 刷新心跳。离线Worker重新上线时清除离线时记下的健康状态，返回 true
    pub fn update_heartbeat(&mut self, heartbeat: &WorkerHeartbeat) -> bool {
        if let Some(resources) = &heartbeat.available_resources {
            self.available_resources = resources.clone();
        }
        self.last_heartbeat = heartbeat.timestamp;
        let reconnected = self.status == WorkerStatus::Offline;
        if reconnected {
            self.health = HealthStatus::Unknown;
        }
        self.status = WorkerStatus::Active;
        reconnected
    }

    pub fn is_heartbeat_expired(&self, now: DateTime<Utc>, timeout_seconds: i64) -> bool {
        (now - self.last_heartbeat).num_seconds() > timeout_seconds
    }
}
