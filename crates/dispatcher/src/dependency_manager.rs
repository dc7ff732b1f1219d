use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use orchestrator_domain::entities::Task;
use orchestrator_errors::OrchestratorResult;

use crate::dependency_graph::DependencyGraph;
use crate::dependency_resolver::DependencyResolver;

/// 依赖图的诊断报告。死锁只在这里体现，从不作为错误抛出。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub deadlocks: Vec<Vec<String>>,
    pub blocked_tasks: Vec<String>,
    pub node_count: usize,
    pub edge_count: usize,
    pub pending_edges: usize,
    pub generated_at: DateTime<Utc>,
}

impl ValidationReport {
    pub fn is_healthy(&self) -> bool {
        self.deadlocks.is_empty() && self.blocked_tasks.is_empty()
    }
}

/// 编排服务访问依赖解析器的门面
#[derive(Debug, Clone)]
pub struct DependencyManager {
    resolver: Arc<DependencyResolver>,
}

impl Default for DependencyManager {
    fn default() -> Self {
        Self::new(Arc::new(DependencyResolver::new()))
    }
}

impl DependencyManager {
    pub fn new(resolver: Arc<DependencyResolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &Arc<DependencyResolver> {
        &self.resolver
    }

    /// 注册任务节点及其全部依赖，出现环时整体拒绝
    pub async fn register_task(&self, task: &Task) -> OrchestratorResult<()> {
        let edges = task.dependency_edges();
        if edges.is_empty() {
            self.resolver.add_node(&task.id).await;
            return Ok(());
        }
        debug!("注册任务 {} 的 {} 条依赖", task.id, edges.len());
        self.resolver.add_dependencies(&task.id, edges).await
    }

    /// 对排队任务做拓扑排序后筛出已就绪的任务，保持拓扑顺序
    pub async fn ready_in_order(&self, queued: &[String]) -> Vec<String> {
        if queued.is_empty() {
            return Vec::new();
        }
        let ordered = self.resolver.get_topological_order(queued).await;
        self.resolver.get_ready_tasks(&ordered).await
    }

    pub async fn on_completed(&self, task_id: &str) {
        let unblocked = self.resolver.mark_completed(task_id).await;
        if !unblocked.is_empty() {
            debug!("任务 {} 完成，更新了 {:?} 的依赖", task_id, unblocked);
        }
    }

    pub async fn on_failed(&self, task_id: &str) {
        let affected = self.resolver.mark_failed(task_id).await;
        if !affected.is_empty() {
            debug!("任务 {} 最终失败，影响依赖任务 {:?}", task_id, affected);
        }
    }

    pub async fn on_cancelled(&self, task_id: &str) {
        let affected = self.resolver.mark_cancelled(task_id).await;
        if !affected.is_empty() {
            debug!("任务 {} 已取消，影响依赖任务 {:?}", task_id, affected);
        }
    }

    /// 恢复时使用：跳过环检测直接载入持久化的依赖关系
    pub async fn restore(&self, graph: DependencyGraph) {
        if let Some(cycle) = graph.find_cycle() {
            warn!("恢复的依赖图中存在环: {}", cycle.join(" -> "));
        }
        self.resolver.restore_unchecked(graph).await;
    }

    pub async fn validation_report(&self) -> ValidationReport {
        let deadlocks = self.resolver.detect_deadlocks().await;
        let blocked_tasks = self.resolver.blocked_tasks().await;
        let (node_count, edge_count, pending_edges) = self.resolver.graph_stats().await;
        ValidationReport {
            deadlocks,
            blocked_tasks,
            node_count,
            edge_count,
            pending_edges,
            generated_at: Utc::now(),
        }
    }
}
