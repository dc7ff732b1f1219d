use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orchestrator_domain::entities::{
    parse_requirements, DependencySpec, DependencyType, TaskPriority, TaskSubmission,
    WorkerRegistration,
};
use orchestrator_errors::OrchestratorResult;

/// 任务清单文件
///
/// ```toml
/// [[workers]]
/// id = "local-1"
/// capacity = 2
///
/// [[jobs]]
/// id = "extract"
/// name = "抽取订单"
/// command = "echo extract"
/// resources = { cpu = 0.5 }
///
/// [[jobs]]
/// id = "load"
/// name = "导入订单"
/// command = "echo load"
/// depends_on = ["extract"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsFile {
    pub workers: Vec<WorkerSpec>,
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: String,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub resources: BTreeMap<String, f64>,
}

fn default_capacity() -> usize {
    1
}

fn default_task_type() -> String {
    "shell".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// 直接指定执行后端的 payload，优先于 `command`
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// 简写：按成功依赖处理
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    #[serde(default)]
    pub resources: BTreeMap<String, f64>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl JobsFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("读取任务清单失败: {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("解析任务清单失败: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// 按清单顺序生成提交请求，前置任务需排在依赖它的任务之前
    pub fn submissions(&self) -> OrchestratorResult<Vec<TaskSubmission>> {
        self.jobs.iter().map(JobSpec::to_submission).collect()
    }

    pub fn registrations(&self) -> OrchestratorResult<Vec<WorkerRegistration>> {
        self.workers.iter().map(WorkerSpec::to_registration).collect()
    }
}

impl WorkerSpec {
    pub fn to_registration(&self) -> OrchestratorResult<WorkerRegistration> {
        Ok(WorkerRegistration::new(&self.id, self.capacity)
            .with_capabilities(self.capabilities.iter().cloned())
            .with_resources(parse_requirements(&self.resources)?))
    }
}

impl JobSpec {
    fn payload(&self) -> serde_json::Value {
        if let Some(payload) = &self.payload {
            return payload.clone();
        }
        let mut payload = serde_json::Map::new();
        if let Some(command) = &self.command {
            payload.insert("command".to_string(), command.clone().into());
        }
        if let Some(args) = &self.args {
            payload.insert(
                "args".to_string(),
                serde_json::Value::Array(args.iter().cloned().map(Into::into).collect()),
            );
        }
        if let Some(dir) = &self.working_dir {
            payload.insert("working_dir".to_string(), dir.clone().into());
        }
        if !self.env.is_empty() {
            let env: serde_json::Map<String, serde_json::Value> = self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone().into()))
                .collect();
            payload.insert("env_vars".to_string(), serde_json::Value::Object(env));
        }
        serde_json::Value::Object(payload)
    }

    pub fn to_submission(&self) -> OrchestratorResult<TaskSubmission> {
        let mut submission = TaskSubmission::new(&self.name, &self.task_type)
            .with_priority(self.priority)
            .with_payload(self.payload());
        submission.id = self.id.clone();
        submission.deadline = self.deadline;
        submission.max_retries = self.max_retries;
        submission.timeout_seconds = self.timeout_seconds;
        submission.resource_requirements = parse_requirements(&self.resources)?;
        for prerequisite in &self.depends_on {
            submission = submission.depends_on(prerequisite, DependencyType::Success);
        }
        for dependency in &self.dependencies {
            submission = submission.with_dependency(dependency.clone());
        }
        Ok(submission)
    }
}
