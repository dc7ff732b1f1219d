use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 依赖边的语义类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// 前置任务进入任意终态即可
    #[default]
    Completion,
    /// 前置任务必须成功完成
    Success,
    /// 前置任务产出的数据可用，即成功完成
    Data,
    /// 前置任务释放了资源，即进入任意终态
    Resource,
    /// 等待前置任务成功，超时后放行
    Time,
    /// 按条件表达式匹配前置任务的结局
    Condition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyStatus {
    Pending,
    Satisfied,
    Failed,
    Timeout,
    Cancelled,
}

impl DependencyStatus {
    /// 该边已无法再被满足，依赖方永久阻塞
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            DependencyStatus::Failed | DependencyStatus::Timeout | DependencyStatus::Cancelled
        )
    }
}

/// 前置任务的最终结局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrerequisiteOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl PrerequisiteOutcome {
    fn as_condition_token(&self) -> &'static str {
        match self {
            PrerequisiteOutcome::Completed => "completed",
            PrerequisiteOutcome::Failed => "failed",
            PrerequisiteOutcome::Cancelled => "cancelled",
        }
    }
}

/// 条件表达式可用的取值
pub const CONDITION_TOKENS: [&str; 4] = ["completed", "failed", "cancelled", "terminal"];

/// 校验条件表达式，返回第一个无法识别的取值
pub fn invalid_condition_token(condition: &str) -> Option<String> {
    condition
        .split('|')
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .find(|token| !CONDITION_TOKENS.contains(&token.as_str()))
}

/// 依赖边：dependent 依赖 prerequisite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDependency {
    pub dependent_id: String,
    pub prerequisite_id: String,
    pub dependency_type: DependencyType,
    pub status: DependencyStatus,
    pub condition: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl TaskDependency {
    pub fn new(
        dependent_id: impl Into<String>,
        prerequisite_id: impl Into<String>,
        dependency_type: DependencyType,
    ) -> Self {
        Self {
            dependent_id: dependent_id.into(),
            prerequisite_id: prerequisite_id.into(),
            dependency_type,
            status: DependencyStatus::Pending,
            condition: None,
            timeout_seconds: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn key(&self) -> (String, String) {
        (self.dependent_id.clone(), self.prerequisite_id.clone())
    }

    pub fn is_satisfied(&self) -> bool {
        self.status == DependencyStatus::Satisfied
    }

    /// 仍处于Pending且已超过超时时间
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.timeout_seconds {
            Some(timeout) if self.status == DependencyStatus::Pending => {
                let timeout_ms = i64::try_from(timeout)
                    .unwrap_or(i64::MAX)
                    .saturating_mul(1000);
                (now - self.created_at).num_milliseconds() >= timeout_ms
            }
            _ => false,
        }
    }

    /// 前置任务进入终态后该边的新状态
    pub fn status_for_outcome(&self, outcome: PrerequisiteOutcome) -> DependencyStatus {
        match self.dependency_type {
            DependencyType::Completion | DependencyType::Resource => DependencyStatus::Satisfied,
            DependencyType::Success | DependencyType::Data | DependencyType::Time => {
                Self::success_only(outcome)
            }
            DependencyType::Condition => match self.condition_tokens() {
                None => Self::success_only(outcome),
                Some(tokens) => {
                    let matched = tokens
                        .iter()
                        .any(|t| t == "terminal" || t == outcome.as_condition_token());
                    if matched {
                        DependencyStatus::Satisfied
                    } else {
                        DependencyStatus::Failed
                    }
                }
            },
        }
    }

    /// 边超时后的新状态，Time类型超时即放行
    pub fn status_on_timeout(&self) -> DependencyStatus {
        match self.dependency_type {
            DependencyType::Time => DependencyStatus::Satisfied,
            DependencyType::Completion
            | DependencyType::Success
            | DependencyType::Data
            | DependencyType::Resource
            | DependencyType::Condition => DependencyStatus::Timeout,
        }
    }

    /// 设置状态，只有Pending的边会被改变
    pub fn resolve(&mut self, status: DependencyStatus, now: DateTime<Utc>) -> bool {
        if self.status != DependencyStatus::Pending || status == DependencyStatus::Pending {
            return false;
        }
        self.status = status;
        self.resolved_at = Some(now);
        true
    }

    fn success_only(outcome: PrerequisiteOutcome) -> DependencyStatus {
        match outcome {
            PrerequisiteOutcome::Completed => DependencyStatus::Satisfied,
            PrerequisiteOutcome::Failed => DependencyStatus::Failed,
            PrerequisiteOutcome::Cancelled => DependencyStatus::Cancelled,
        }
    }

    fn condition_tokens(&self) -> Option<Vec<String>> {
        let tokens: Vec<String> = self
            .condition
            .as_deref()?
            .split('|')
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        (!tokens.is_empty()).then_some(tokens)
    }
}
