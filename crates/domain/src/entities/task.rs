use chrono::{DateTime, Utc};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::dependency::{invalid_condition_token, DependencyType, TaskDependency};
use super::resource::{ResourceRequirements, ResourceType};

/// 任务优先级，数值越小越优先
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical = 1,
    High = 2,
    #[default]
    Normal = 3,
    Low = 4,
    Background = 5,
}

impl TaskPriority {
    pub fn value(&self) -> u8 {
        *self as u8
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(TaskPriority::Critical),
            2 => Some(TaskPriority::High),
            3 => Some(TaskPriority::Normal),
            4 => Some(TaskPriority::Low),
            5 => Some(TaskPriority::Background),
            _ => None,
        }
    }
}

/// 任务声明的一条依赖
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub prerequisite_id: String,
    #[serde(default)]
    pub dependency_type: DependencyType,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl DependencySpec {
    pub fn new(prerequisite_id: impl Into<String>, dependency_type: DependencyType) -> Self {
        Self {
            prerequisite_id: prerequisite_id.into(),
            dependency_type,
            condition: None,
            timeout_seconds: None,
        }
    }

    pub fn to_edge(&self, dependent_id: &str) -> TaskDependency {
        let mut edge = TaskDependency::new(
            dependent_id,
            self.prerequisite_id.clone(),
            self.dependency_type,
        );
        edge.condition = self.condition.clone();
        edge.timeout_seconds = self.timeout_seconds;
        edge
    }
}

/// 调用方提交的任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// 为空时自动生成
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub task_type: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    #[serde(default)]
    pub resource_requirements: ResourceRequirements,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl TaskSubmission {
    pub fn new(name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            task_type: task_type.into(),
            priority: TaskPriority::default(),
            deadline: None,
            dependencies: Vec::new(),
            resource_requirements: ResourceRequirements::new(),
            payload: serde_json::Value::Null,
            metadata: HashMap::new(),
            max_retries: None,
            timeout_seconds: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn depends_on(mut self, prerequisite_id: impl Into<String>, kind: DependencyType) -> Self {
        self.dependencies
            .push(DependencySpec::new(prerequisite_id, kind));
        self
    }

    pub fn with_dependency(mut self, dependency: DependencySpec) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_resource(mut self, resource: ResourceType, amount: f64) -> Self {
        self.resource_requirements.insert(resource, amount);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }
}

/// 编排器内部持有的任务定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub task_type: String,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub dependencies: Vec<DependencySpec>,
    pub resource_requirements: ResourceRequirements,
    pub payload: serde_json::Value,
    pub metadata: HashMap<String, serde_json::Value>,
    pub max_retries: u32,
    pub timeout_seconds: u64,
}

impl Task {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

    /// 校验提交内容并生成任务
    pub fn from_submission(submission: TaskSubmission) -> OrchestratorResult<Self> {
        let task = Self {
            id: submission
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: submission.name,
            task_type: submission.task_type,
            priority: submission.priority,
            created_at: Utc::now(),
            deadline: submission.deadline,
            dependencies: submission.dependencies,
            resource_requirements: submission.resource_requirements,
            payload: submission.payload,
            metadata: submission.metadata,
            max_retries: submission.max_retries.unwrap_or(Self::DEFAULT_MAX_RETRIES),
            timeout_seconds: submission
                .timeout_seconds
                .unwrap_or(Self::DEFAULT_TIMEOUT_SECONDS),
        };
        task.validate()?;
        Ok(task)
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::invalid_params("任务名称不能为空"));
        }
        if self.task_type.trim().is_empty() {
            return Err(OrchestratorError::invalid_params("任务类型不能为空"));
        }
        if self.timeout_seconds == 0 {
            return Err(OrchestratorError::invalid_params("超时时间必须大于0"));
        }
        for (resource, amount) in &self.resource_requirements {
            if !amount.is_finite() || *amount < 0.0 {
                return Err(OrchestratorError::invalid_params(format!(
                    "资源需求无效: {resource} = {amount}"
                )));
            }
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if dep.prerequisite_id == self.id {
                return Err(OrchestratorError::CircularDependency {
                    path: vec![self.id.clone(), self.id.clone()],
                });
            }
            if !seen.insert(dep.prerequisite_id.as_str()) {
                return Err(OrchestratorError::invalid_params(format!(
                    "重复的依赖: {}",
                    dep.prerequisite_id
                )));
            }
            if let Some(token) = dep.condition.as_deref().and_then(invalid_condition_token) {
                return Err(OrchestratorError::invalid_params(format!(
                    "无法识别的依赖条件: {token}"
                )));
            }
        }
        Ok(())
    }

    pub fn dependency_edges(&self) -> Vec<TaskDependency> {
        self.dependencies
            .iter()
            .map(|dep| dep.to_edge(&self.id))
            .collect()
    }

    pub fn prerequisite_ids(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|d| d.prerequisite_id.as_str())
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now > deadline)
    }

    pub fn entity_description(&self) -> String {
        format!(
            "任务 '{}' (ID: {}, 类型: {}, 优先级: {:?})",
            self.name, self.id, self.task_type, self.priority
        )
    }
}
