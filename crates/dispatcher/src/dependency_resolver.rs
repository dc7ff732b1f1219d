use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use orchestrator_domain::entities::{DependencyStatus, PrerequisiteOutcome, TaskDependency};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

use crate::dependency_graph::DependencyGraph;

#[derive(Debug, Default)]
struct ResolverState {
    graph: DependencyGraph,
    completed: HashSet<String>,
    failed: HashSet<String>,
    cancelled: HashSet<String>,
}

impl ResolverState {
    fn outcome(&self, id: &str) -> Option<PrerequisiteOutcome> {
        if self.completed.contains(id) {
            Some(PrerequisiteOutcome::Completed)
        } else if self.cancelled.contains(id) {
            Some(PrerequisiteOutcome::Cancelled)
        } else if self.failed.contains(id) {
            Some(PrerequisiteOutcome::Failed)
        } else {
            None
        }
    }

    fn is_resolved(&self, id: &str) -> bool {
        self.outcome(id).is_some()
    }

    fn is_ready(&self, id: &str) -> bool {
        self.graph.edges_of(id).all(TaskDependency::is_satisfied)
    }

    /// 前置任务已有结局时立即结算新加入的边
    fn settle_new_edge(
        graph: &mut DependencyGraph,
        outcome: Option<PrerequisiteOutcome>,
        dependent: &str,
        prerequisite: &str,
        now: DateTime<Utc>,
    ) {
        let (Some(outcome), Some(edge)) = (outcome, graph.edge_mut(dependent, prerequisite)) else {
            return;
        };
        let status = edge.status_for_outcome(outcome);
        edge.resolve(status, now);
    }

    /// 把前置任务的结局传播到所有依赖它的边
    fn cascade(&mut self, prerequisite: &str, outcome: PrerequisiteOutcome) -> Vec<String> {
        let now = Utc::now();
        let dependents: Vec<String> = self.graph.dependents(prerequisite).cloned().collect();
        let mut changed = Vec::new();
        for dependent in dependents {
            if let Some(edge) = self.graph.edge_mut(&dependent, prerequisite) {
                let status = edge.status_for_outcome(outcome);
                if edge.resolve(status, now) {
                    debug!(
                        "依赖边 {} -> {} 状态更新为 {:?}",
                        dependent, prerequisite, status
                    );
                    changed.push(dependent);
                }
            }
        }
        changed
    }
}

/// 依赖解析器：保证依赖图无环，并回答就绪、排序和死锁查询
#[derive(Debug, Default)]
pub struct DependencyResolver {
    state: RwLock<ResolverState>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接使用已有的图，不做环检测。用于恢复历史状态。
    pub fn from_graph_unchecked(graph: DependencyGraph) -> Self {
        Self {
            state: RwLock::new(ResolverState {
                graph,
                ..Default::default()
            }),
        }
    }

    /// 用新的图替换当前状态，不做环检测，终态集合一并清空
    pub async fn restore_unchecked(&self, graph: DependencyGraph) {
        let mut state = self.state.write().await;
        *state = ResolverState {
            graph,
            ..Default::default()
        };
    }

    pub async fn add_node(&self, id: &str) {
        self.state.write().await.graph.add_node(id);
    }

    /// 在图的副本上检测环，无环时才提交
    pub async fn add_dependency(&self, dep: TaskDependency) -> OrchestratorResult<()> {
        let dependent = dep.dependent_id.clone();
        self.add_dependencies(&dependent, vec![dep]).await
    }

    /// 批量添加同一任务的依赖，要么全部提交，要么全部拒绝
    pub async fn add_dependencies(
        &self,
        task_id: &str,
        deps: Vec<TaskDependency>,
    ) -> OrchestratorResult<()> {
        if let Some(dep) = deps.iter().find(|d| d.dependent_id == d.prerequisite_id) {
            return Err(OrchestratorError::CircularDependency {
                path: vec![dep.dependent_id.clone(), dep.dependent_id.clone()],
            });
        }

        let mut state = self.state.write().await;
        let mut candidate = state.graph.clone();
        candidate.add_node(task_id);
        let keys: Vec<(String, String)> = deps.iter().map(TaskDependency::key).collect();
        for dep in deps {
            candidate.add_dependency(dep);
        }

        let starts: BTreeSet<&str> = keys.iter().map(|(d, _)| d.as_str()).collect();
        for start in starts {
            if let Some(path) = candidate.find_cycle_from(start) {
                warn!("拒绝依赖：检测到循环依赖 {}", path.join(" -> "));
                return Err(OrchestratorError::CircularDependency { path });
            }
        }

        let now = Utc::now();
        for (dependent, prerequisite) in &keys {
            let outcome = state.outcome(prerequisite);
            ResolverState::settle_new_edge(&mut candidate, outcome, dependent, prerequisite, now);
        }
        state.graph = candidate;
        debug!("任务 {} 的 {} 条依赖已提交", task_id, keys.len());
        Ok(())
    }

    pub async fn remove_dependency(
        &self,
        dependent: &str,
        prerequisite: &str,
    ) -> Option<TaskDependency> {
        self.state
            .write()
            .await
            .graph
            .remove_dependency(dependent, prerequisite)
    }

    /// 全部入边均为 Satisfied 时就绪
    pub async fn is_task_ready(&self, id: &str) -> bool {
        self.state.read().await.is_ready(id)
    }

    /// 先结算已超时的边，再按输入顺序过滤出就绪任务
    pub async fn get_ready_tasks(&self, candidates: &[String]) -> Vec<String> {
        self.expire_timeouts(Utc::now()).await;
        let state = self.state.read().await;
        candidates
            .iter()
            .filter(|id| state.is_ready(id))
            .cloned()
            .collect()
    }

    /// 结算超时的 Pending 边，返回受影响的依赖方
    pub async fn expire_timeouts(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut state = self.state.write().await;
        let mut affected = Vec::new();
        for edge in state.graph.edges_mut() {
            if edge.is_expired(now) {
                let status = edge.status_on_timeout();
                edge.resolve(status, now);
                info!(
                    "依赖边 {} -> {} 超时，状态更新为 {:?}",
                    edge.dependent_id, edge.prerequisite_id, status
                );
                affected.push(edge.dependent_id.clone());
            }
        }
        affected
    }

    /// 限定在候选集合内的Kahn拓扑排序，同入度按输入顺序。
    /// 无法排序的剩余任务按原顺序追加在末尾。
    pub async fn get_topological_order(&self, candidates: &[String]) -> Vec<String> {
        let state = self.state.read().await;

        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, id) in candidates.iter().enumerate() {
            index.entry(id.as_str()).or_insert(i);
        }

        let mut in_degree: HashMap<usize, usize> = index.values().map(|&i| (i, 0)).collect();
        for (&id, &i) in &index {
            let count = state
                .graph
                .prerequisites(id)
                .filter(|p| index.contains_key(p.as_str()))
                .count();
            in_degree.insert(i, count);
        }

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(index.len());
        let mut placed = HashSet::new();

        while let Some(i) = ready.pop_first() {
            let id = &candidates[i];
            order.push(id.clone());
            placed.insert(i);
            for dependent in state.graph.dependents(id) {
                if let Some(&j) = index.get(dependent.as_str()) {
                    if let Some(degree) = in_degree.get_mut(&j) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 && !placed.contains(&j) {
                            ready.insert(j);
                        }
                    }
                }
            }
        }

        if order.len() < index.len() {
            let mut leftover: Vec<usize> = index
                .values()
                .copied()
                .filter(|i| !placed.contains(i))
                .collect();
            leftover.sort_unstable();
            warn!(
                "拓扑排序未能覆盖全部候选任务，{} 个任务按原顺序追加",
                leftover.len()
            );
            order.extend(leftover.into_iter().map(|i| candidates[i].clone()));
        }
        order
    }

    /// Tarjan强连通分量。只有成员都未结束且都未就绪的分量才算死锁。
    pub async fn detect_deadlocks(&self) -> Vec<Vec<String>> {
        let state = self.state.read().await;
        let mut deadlocks: Vec<Vec<String>> = tarjan_scc(&state.graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .filter(|component| {
                component
                    .iter()
                    .all(|id| !state.is_resolved(id) && !state.is_ready(id))
            })
            .map(|mut component| {
                component.sort();
                component
            })
            .collect();
        deadlocks.sort();
        deadlocks
    }

    pub async fn mark_completed(&self, id: &str) -> Vec<String> {
        let mut state = self.state.write().await;
        state.completed.insert(id.to_string());
        state.cascade(id, PrerequisiteOutcome::Completed)
    }

    pub async fn mark_failed(&self, id: &str) -> Vec<String> {
        let mut state = self.state.write().await;
        state.failed.insert(id.to_string());
        state.cascade(id, PrerequisiteOutcome::Failed)
    }

    pub async fn mark_cancelled(&self, id: &str) -> Vec<String> {
        let mut state = self.state.write().await;
        state.cancelled.insert(id.to_string());
        state.cascade(id, PrerequisiteOutcome::Cancelled)
    }

    /// 存在无法满足的入边、永远不会就绪的任务
    pub async fn blocked_tasks(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut blocked: Vec<String> = state
            .graph
            .nodes()
            .filter(|id| !state.is_resolved(id))
            .filter(|id| state.graph.edges_of(id).any(|e| e.status.is_blocking()))
            .cloned()
            .collect();
        blocked.sort();
        blocked
    }

    /// BFS求全部直接和间接前置任务
    pub async fn transitive_prerequisites(&self, id: &str) -> Vec<String> {
        let state = self.state.read().await;
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let mut result = Vec::new();

        for prerequisite in state.graph.prerequisites(id) {
            if visited.insert(prerequisite.clone()) {
                queue.push_back(prerequisite.clone());
            }
        }
        while let Some(current) = queue.pop_front() {
            for prerequisite in state.graph.prerequisites(&current) {
                if visited.insert(prerequisite.clone()) {
                    queue.push_back(prerequisite.clone());
                }
            }
            result.push(current);
        }
        result
    }

    pub async fn dependencies_of(&self, id: &str) -> Vec<TaskDependency> {
        let state = self.state.read().await;
        let mut edges: Vec<TaskDependency> = state.graph.edges_of(id).cloned().collect();
        edges.sort_by(|a, b| a.prerequisite_id.cmp(&b.prerequisite_id));
        edges
    }

    pub async fn graph_snapshot(&self) -> DependencyGraph {
        self.state.read().await.graph.clone()
    }

    /// (节点数, 边数, Pending边数)
    pub async fn graph_stats(&self) -> (usize, usize, usize) {
        let state = self.state.read().await;
        let pending = state
            .graph
            .edges()
            .filter(|e| e.status == DependencyStatus::Pending)
            .count();
        (state.graph.node_count(), state.graph.edge_count(), pending)
    }
}

/// 迭代版Tarjan算法，返回全部强连通分量
pub fn tarjan_scc(graph: &DependencyGraph) -> Vec<Vec<String>> {
    let mut nodes: Vec<&String> = graph.nodes().collect();
    nodes.sort();
    let position: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();
    let successors: Vec<Vec<usize>> = nodes
        .iter()
        .map(|n| {
            let mut next: Vec<usize> = graph
                .prerequisites(n)
                .filter_map(|p| position.get(p.as_str()).copied())
                .collect();
            next.sort_unstable();
            next
        })
        .collect();

    let n = nodes.len();
    let mut index = vec![usize::MAX; n];
    let mut lowlink = vec![0; n];
    let mut on_stack = vec![false; n];
    let mut stack = Vec::new();
    let mut next_index = 0;
    let mut components = Vec::new();

    for root in 0..n {
        if index[root] != usize::MAX {
            continue;
        }
        // (节点, 下一个待访问的后继下标)
        let mut call_stack = vec![(root, 0usize)];
        index[root] = next_index;
        lowlink[root] = next_index;
        next_index += 1;
        stack.push(root);
        on_stack[root] = true;

        while let Some(frame) = call_stack.last_mut() {
            let (v, child) = *frame;
            if let Some(&w) = successors[v].get(child) {
                frame.1 += 1;
                if index[w] == usize::MAX {
                    index[w] = next_index;
                    lowlink[w] = next_index;
                    next_index += 1;
                    stack.push(w);
                    on_stack[w] = true;
                    call_stack.push((w, 0));
                } else if on_stack[w] {
                    lowlink[v] = lowlink[v].min(index[w]);
                }
                continue;
            }

            call_stack.pop();
            if let Some(&(parent, _)) = call_stack.last() {
                lowlink[parent] = lowlink[parent].min(lowlink[v]);
            }
            if lowlink[v] == index[v] {
                let mut component = Vec::new();
                while let Some(w) = stack.pop() {
                    on_stack[w] = false;
                    component.push(nodes[w].clone());
                    if w == v {
                        break;
                    }
                }
                components.push(component);
            }
        }
    }
    components
}
