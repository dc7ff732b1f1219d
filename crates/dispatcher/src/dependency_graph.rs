use std::collections::{HashMap, HashSet};

use orchestrator_domain::entities::TaskDependency;

/// 任务依赖图。
///
/// `incoming` 按 dependent -> prerequisite 保存边的详情（反向邻接），
/// `outgoing` 保存 prerequisite -> dependents（正向邻接），两者始终同步。
/// 节点在第一次被引用时创建，只有边可以删除。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyGraph {
    incoming: HashMap<String, HashMap<String, TaskDependency>>,
    outgoing: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新建节点时返回 true
    pub fn add_node(&mut self, id: &str) -> bool {
        let created = !self.incoming.contains_key(id);
        self.incoming.entry(id.to_string()).or_default();
        self.outgoing.entry(id.to_string()).or_default();
        created
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.incoming.contains_key(id)
    }

    /// 添加或替换一条边，返回被替换的旧边
    pub fn add_dependency(&mut self, dep: TaskDependency) -> Option<TaskDependency> {
        self.add_node(&dep.dependent_id);
        self.add_node(&dep.prerequisite_id);
        self.outgoing
            .entry(dep.prerequisite_id.clone())
            .or_default()
            .insert(dep.dependent_id.clone());
        self.incoming
            .entry(dep.dependent_id.clone())
            .or_default()
            .insert(dep.prerequisite_id.clone(), dep)
    }

    pub fn remove_dependency(
        &mut self,
        dependent: &str,
        prerequisite: &str,
    ) -> Option<TaskDependency> {
        let removed = self.incoming.get_mut(dependent)?.remove(prerequisite)?;
        if let Some(dependents) = self.outgoing.get_mut(prerequisite) {
            dependents.remove(dependent);
        }
        Some(removed)
    }

    /// dependent 的全部前置任务
    pub fn prerequisites(&self, id: &str) -> impl Iterator<Item = &String> + '_ {
        self.incoming.get(id).into_iter().flat_map(|edges| edges.keys())
    }

    /// 依赖 prerequisite 的全部任务
    pub fn dependents(&self, id: &str) -> impl Iterator<Item = &String> + '_ {
        self.outgoing.get(id).into_iter().flatten()
    }

    pub fn get(&self, dependent: &str, prerequisite: &str) -> Option<&TaskDependency> {
        self.incoming.get(dependent)?.get(prerequisite)
    }

    pub fn edge_mut(&mut self, dependent: &str, prerequisite: &str) -> Option<&mut TaskDependency> {
        self.incoming.get_mut(dependent)?.get_mut(prerequisite)
    }

    /// dependent 的全部入边
    pub fn edges_of(&self, dependent: &str) -> impl Iterator<Item = &TaskDependency> + '_ {
        self.incoming.get(dependent).into_iter().flat_map(|edges| edges.values())
    }

    pub fn edges(&self) -> impl Iterator<Item = &TaskDependency> + '_ {
        self.incoming.values().flat_map(|edges| edges.values())
    }

    pub fn edges_mut(&mut self) -> impl Iterator<Item = &mut TaskDependency> + '_ {
        self.incoming.values_mut().flat_map(|edges| edges.values_mut())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &String> + '_ {
        self.incoming.keys()
    }

    pub fn node_count(&self) -> usize {
        self.incoming.len()
    }

    pub fn edge_count(&self) -> usize {
        self.incoming.values().map(HashMap::len).sum()
    }

    /// 从 start 出发沿 dependent -> prerequisite 方向做DFS，
    /// 返回首尾相同的环路径，例如 `[C, A, B, C]`
    pub fn find_cycle_from(&self, start: &str) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        self.dfs_cycle(start, &mut visited)
    }

    /// 在整个图中查找任意一个环
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut nodes: Vec<&String> = self.nodes().collect();
        nodes.sort();

        let mut visited = HashSet::new();
        for node in nodes {
            if visited.contains(node.as_str()) {
                continue;
            }
            if let Some(cycle) = self.dfs_cycle(node, &mut visited) {
                return Some(cycle);
            }
        }
        None
    }

    fn sorted_prerequisites(&self, node: &str) -> std::vec::IntoIter<&String> {
        let mut next: Vec<&String> = self.prerequisites(node).collect();
        next.sort();
        next.into_iter()
    }

    /// 显式栈实现的DFS，依赖链再长也不会耗尽调用栈
    fn dfs_cycle(&self, start: &str, visited: &mut HashSet<String>) -> Option<Vec<String>> {
        if !visited.insert(start.to_string()) {
            return None;
        }

        let mut path = vec![start.to_string()];
        let mut on_path: HashSet<String> = HashSet::from([start.to_string()]);
        let mut frames = vec![self.sorted_prerequisites(start)];

        while let Some(frame) = frames.last_mut() {
            match frame.next() {
                Some(next) => {
                    if on_path.contains(next.as_str()) {
                        let pos = path.iter().position(|n| n == next)?;
                        let mut cycle = path[pos..].to_vec();
                        cycle.push(next.clone());
                        return Some(cycle);
                    }
                    if visited.insert(next.clone()) {
                        path.push(next.clone());
                        on_path.insert(next.clone());
                        frames.push(self.sorted_prerequisites(next));
                    }
                }
                None => {
                    frames.pop();
                    if let Some(done) = path.pop() {
                        on_path.remove(&done);
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_domain::entities::DependencyType;

    fn edge(dependent: &str, prerequisite: &str) -> TaskDependency {
        TaskDependency::new(dependent, prerequisite, DependencyType::Success)
    }

    #[test]
    fn test_adjacency_stays_in_sync() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(edge("b", "a"));
        graph.add_dependency(edge("c", "a"));

        let mut dependents: Vec<&String> = graph.dependents("a").collect();
        dependents.sort();
        assert_eq!(dependents, vec!["b", "c"]);
        assert_eq!(graph.prerequisites("b").collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);

        let removed = graph.remove_dependency("b", "a").unwrap();
        assert_eq!(removed.prerequisite_id, "a");
        assert_eq!(graph.dependents("a").count(), 1);
        assert!(graph.get("b", "a").is_none());
        // 节点保留
        assert!(graph.contains_node("b"));
        assert!(graph.remove_dependency("b", "a").is_none());
    }

    #[test]
    fn test_unknown_node_queries_are_empty() {
        let graph = DependencyGraph::new();
        assert_eq!(graph.prerequisites("missing").count(), 0);
        assert_eq!(graph.dependents("missing").count(), 0);
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn test_find_cycle_path_closes_on_start() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(edge("a", "b"));
        graph.add_dependency(edge("b", "c"));
        assert!(graph.find_cycle_from("a").is_none());

        graph.add_dependency(edge("c", "a"));
        assert_eq!(
            graph.find_cycle_from("c").unwrap(),
            vec!["c", "a", "b", "c"]
        );
        let any = graph.find_cycle().unwrap();
        assert_eq!(any.first(), any.last());
        assert_eq!(any.len(), 4);
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(edge("d", "b"));
        graph.add_dependency(edge("d", "c"));
        graph.add_dependency(edge("b", "a"));
        graph.add_dependency(edge("c", "a"));
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn test_long_chain_cycle_search() {
        const LEN: usize = 50_000;
        let mut graph = DependencyGraph::new();
        for i in 1..LEN {
            graph.add_dependency(edge(&format!("n{}", i - 1), &format!("n{}", i)));
        }
        assert!(graph.find_cycle_from("n0").is_none());
        assert!(graph.find_cycle().is_none());

        graph.add_dependency(edge(&format!("n{}", LEN - 1), "n0"));
        let cycle = graph.find_cycle_from("n0").unwrap();
        assert_eq!(cycle.len(), LEN + 1);
        assert_eq!(cycle.first().map(String::as_str), Some("n0"));
        assert_eq!(cycle.last().map(String::as_str), Some("n0"));
    }
}
