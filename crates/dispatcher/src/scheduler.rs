use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use orchestrator_domain::entities::{Task, WorkerInfo};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

use crate::strategies::{PriorityStrategy, QueueKey, SchedulingStrategy};

/// 队列中的任务。只有处于Pending状态的任务会在队列里。
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task: Task,
    pub dependencies_ready: bool,
    /// 重试退避结束时间
    pub not_before: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    sequence: u64,
}

impl QueuedTask {
    pub fn is_ready_to_execute(&self, now: DateTime<Utc>) -> bool {
        self.dependencies_ready && self.not_before.map_or(true, |t| t <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    key: QueueKey,
    task_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub strategy: String,
    pub total: usize,
    pub ready: usize,
    pub waiting_dependencies: usize,
    pub backing_off: usize,
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<QueueEntry>>,
    tasks: HashMap<String, QueuedTask>,
    next_sequence: u64,
}

impl QueueState {
    /// 仍有已就绪的前置任务在队列中时让出，保证前置任务先被取出
    fn waits_for_prerequisite(&self, queued: &QueuedTask) -> bool {
        queued.task.prerequisite_ids().any(|id| {
            self.tasks
                .get(id)
                .is_some_and(|prerequisite| prerequisite.dependencies_ready)
        })
    }

    /// 堆中的条目只有在序号与当前任务一致时才有效，删除是惰性的
    fn is_live(&self, entry: &QueueEntry) -> bool {
        self.tasks
            .get(&entry.task_id)
            .is_some_and(|queued| queued.sequence == entry.key.sequence)
    }

    fn push(
        &mut self,
        strategy: &dyn SchedulingStrategy,
        task: Task,
        not_before: Option<DateTime<Utc>>,
    ) {
        let (primary, secondary) = strategy.sort_key(&task);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let entry = QueueEntry {
            key: QueueKey {
                primary,
                secondary,
                sequence,
            },
            task_id: task.id.clone(),
        };
        self.tasks.insert(
            task.id.clone(),
            QueuedTask {
                task,
                dependencies_ready: false,
                not_before,
                enqueued_at: Utc::now(),
                sequence,
            },
        );
        self.heap.push(Reverse(entry));
    }
}

/// 按策略排序的任务队列。
///
/// `dequeue` 按顺序弹出候选，第一个可执行且worker能处理的任务被取出，
/// 其余候选原样放回。前置任务还在队列中且已就绪时，依赖方不会先于它出队。这是O(n)的线性扫描，适用于几百以内的队列深度。
pub struct TaskScheduler {
    strategy: Arc<dyn SchedulingStrategy>,
    state: Mutex<QueueState>,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(Arc::new(PriorityStrategy))
    }
}

impl TaskScheduler {
    pub fn new(strategy: Arc<dyn SchedulingStrategy>) -> Self {
        Self {
            strategy,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    pub async fn enqueue(&self, task: Task) -> OrchestratorResult<()> {
        self.enqueue_after(task, None).await
    }

    /// 入队，`not_before` 之前不可执行
    pub async fn enqueue_after(
        &self,
        task: Task,
        not_before: Option<DateTime<Utc>>,
    ) -> OrchestratorResult<()> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(OrchestratorError::TaskAlreadyExists {
                id: task.id.clone(),
            });
        }
        debug!("任务 {} 入队", task.id);
        state.push(self.strategy.as_ref(), task, not_before);
        metrics::gauge!("orchestrator_queue_depth").set(state.tasks.len() as f64);
        Ok(())
    }

    /// 放回一个已出队的任务，替换同ID的旧条目
    pub async fn requeue(&self, task: Task, not_before: Option<DateTime<Utc>>) {
        let mut state = self.state.lock().await;
        let ready = state
            .tasks
            .get(&task.id)
            .map(|q| q.dependencies_ready)
            .unwrap_or(false);
        let id = task.id.clone();
        state.push(self.strategy.as_ref(), task, not_before);
        if let Some(queued) = state.tasks.get_mut(&id) {
            queued.dependencies_ready = ready;
        }
        metrics::gauge!("orchestrator_queue_depth").set(state.tasks.len() as f64);
    }

    pub async fn dequeue(&self, worker: &WorkerInfo) -> Option<Task> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut skipped = Vec::new();
        let mut selected = None;

        while let Some(Reverse(entry)) = state.heap.pop() {
            if !state.is_live(&entry) {
                continue;
            }
            let eligible = state
                .tasks
                .get(&entry.task_id)
                .is_some_and(|q| {
                    q.is_ready_to_execute(now)
                        && worker.can_handle(&q.task)
                        && !state.waits_for_prerequisite(q)
                });
            if eligible {
                selected = state.tasks.remove(&entry.task_id).map(|q| q.task);
                break;
            }
            skipped.push(entry);
        }

        for entry in skipped {
            state.heap.push(Reverse(entry));
        }
        if let Some(task) = &selected {
            debug!("Worker {} 取出任务 {}", worker.id, task.id);
            metrics::gauge!("orchestrator_queue_depth").set(state.tasks.len() as f64);
        }
        selected
    }

    /// 更新依赖就绪标记：在 `ready` 中的为就绪，其余为未就绪
    pub async fn refresh_readiness(&self, ready: &HashSet<String>) -> usize {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for (id, queued) in state.tasks.iter_mut() {
            queued.dependencies_ready = ready.contains(id);
            if queued.dependencies_ready {
                count += 1;
            }
        }
        count
    }

    pub async fn remove(&self, task_id: &str) -> Option<Task> {
        let mut state = self.state.lock().await;
        let removed = state.tasks.remove(task_id).map(|q| q.task);
        if removed.is_some() {
            metrics::gauge!("orchestrator_queue_depth").set(state.tasks.len() as f64);
        }
        removed
    }

    pub async fn contains(&self, task_id: &str) -> bool {
        self.state.lock().await.tasks.contains_key(task_id)
    }

    pub async fn get(&self, task_id: &str) -> Option<QueuedTask> {
        self.state.lock().await.tasks.get(task_id).cloned()
    }

    /// 按策略顺序列出排队任务
    pub async fn queued_task_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut entries: Vec<&QueueEntry> = state
            .heap
            .iter()
            .map(|Reverse(entry)| entry)
            .filter(|entry| state.is_live(entry))
            .collect();
        entries.sort();
        entries.into_iter().map(|e| e.task_id.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.tasks.is_empty()
    }

    pub async fn stats(&self) -> QueueStats {
        let now = Utc::now();
        let state = self.state.lock().await;
        let mut stats = QueueStats {
            strategy: self.strategy.name().to_string(),
            total: state.tasks.len(),
            ..Default::default()
        };
        for queued in state.tasks.values() {
            if !queued.dependencies_ready {
                stats.waiting_dependencies += 1;
            } else if queued.is_ready_to_execute(now) {
                stats.ready += 1;
            } else {
                stats.backing_off += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use orchestrator_domain::entities::{
        DependencyType, ResourceRequirements, ResourceType, TaskPriority, TaskSubmission,
        WorkerRegistration,
    };

    use crate::strategies::FifoStrategy;

    fn task(id: &str, priority: TaskPriority) -> Task {
        Task::from_submission(
            TaskSubmission::new(id, "shell")
                .with_id(id)
                .with_priority(priority),
        )
        .unwrap()
    }

    fn worker(capacity: usize) -> WorkerInfo {
        WorkerInfo::new(WorkerRegistration::new("w1", capacity))
    }

    fn all_ready(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_dequeue_in_priority_order() {
        let scheduler = TaskScheduler::default();
        scheduler.enqueue(task("low", TaskPriority::Low)).await.unwrap();
        scheduler
            .enqueue(task("critical", TaskPriority::Critical))
            .await
            .unwrap();
        scheduler
            .enqueue(task("normal", TaskPriority::Normal))
            .await
            .unwrap();
        scheduler
            .refresh_readiness(&all_ready(&["low", "critical", "normal"]))
            .await;

        assert_eq!(
            scheduler.queued_task_ids().await,
            vec!["critical", "normal", "low"]
        );
        let w = worker(4);
        assert_eq!(scheduler.dequeue(&w).await.unwrap().id, "critical");
        assert_eq!(scheduler.dequeue(&w).await.unwrap().id, "normal");
        assert_eq!(scheduler.dequeue(&w).await.unwrap().id, "low");
        assert!(scheduler.dequeue(&w).await.is_none());
    }

    #[tokio::test]
    async fn test_skipped_tasks_keep_their_position() {
        let scheduler = TaskScheduler::default();
        scheduler
            .enqueue(task("blocked", TaskPriority::Critical))
            .await
            .unwrap();
        scheduler
            .enqueue(task("ready", TaskPriority::Low))
            .await
            .unwrap();
        scheduler.refresh_readiness(&all_ready(&["ready"])).await;

        let w = worker(4);
        assert_eq!(scheduler.dequeue(&w).await.unwrap().id, "ready");
        assert_eq!(scheduler.queued_task_ids().await, vec!["blocked"]);
        assert!(scheduler.dequeue(&w).await.is_none());

        scheduler.refresh_readiness(&all_ready(&["blocked"])).await;
        assert_eq!(scheduler.dequeue(&w).await.unwrap().id, "blocked");
    }

    #[tokio::test]
    async fn test_dequeue_respects_worker_snapshot() {
        let scheduler = TaskScheduler::default();
        let big = Task::from_submission(
            TaskSubmission::new("big", "shell")
                .with_id("big")
                .with_priority(TaskPriority::Critical)
                .with_resource(ResourceType::Cpu, 4.0),
        )
        .unwrap();
        scheduler.enqueue(big).await.unwrap();
        scheduler
            .enqueue(task("small", TaskPriority::Low))
            .await
            .unwrap();
        scheduler
            .refresh_readiness(&all_ready(&["big", "small"]))
            .await;

        let mut resources = ResourceRequirements::new();
        resources.insert(ResourceType::Cpu, 1.0);
        let w = WorkerInfo::new(WorkerRegistration::new("w1", 2).with_resources(resources));
        assert_eq!(scheduler.dequeue(&w).await.unwrap().id, "small");
        assert!(scheduler.contains("big").await);
    }

    #[tokio::test]
    async fn test_backoff_delays_execution() {
        let scheduler = TaskScheduler::default();
        scheduler
            .enqueue_after(
                task("retry", TaskPriority::Normal),
                Some(Utc::now() + Duration::seconds(60)),
            )
            .await
            .unwrap();
        scheduler.refresh_readiness(&all_ready(&["retry"])).await;

        assert!(scheduler.dequeue(&worker(1)).await.is_none());
        let stats = scheduler.stats().await;
        assert_eq!(stats.backing_off, 1);
        assert_eq!(stats.ready, 0);
    }

    #[tokio::test]
    async fn test_remove_and_reenqueue_does_not_duplicate() {
        let scheduler = TaskScheduler::new(Arc::new(FifoStrategy));
        scheduler.enqueue(task("a", TaskPriority::Normal)).await.unwrap();
        assert!(scheduler
            .enqueue(task("a", TaskPriority::Normal))
            .await
            .is_err());

        assert!(scheduler.remove("a").await.is_some());
        assert!(scheduler.remove("a").await.is_none());
        scheduler.enqueue(task("a", TaskPriority::Normal)).await.unwrap();

        assert_eq!(scheduler.queued_task_ids().await, vec!["a"]);
        assert_eq!(scheduler.len().await, 1);
    }

    #[tokio::test]
    async fn test_requeue_keeps_readiness() {
        let scheduler = TaskScheduler::default();
        scheduler.enqueue(task("a", TaskPriority::Normal)).await.unwrap();
        scheduler.refresh_readiness(&all_ready(&["a"])).await;

        let w = worker(1);
        let taken = scheduler.dequeue(&w).await.unwrap();
        scheduler.requeue(taken, None).await;
        // 出队后条目已删除，放回时按未就绪处理，等待下一次刷新
        assert_eq!(scheduler.stats().await.waiting_dependencies, 1);
        scheduler.refresh_readiness(&all_ready(&["a"])).await;
        assert_eq!(scheduler.dequeue(&w).await.unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_ready_prerequisite_leaves_first() {
        let scheduler = TaskScheduler::default();
        let dependent = Task::from_submission(
            TaskSubmission::new("dep", "shell")
                .with_id("dep")
                .with_priority(TaskPriority::Critical)
                .depends_on("pre", DependencyType::Time),
        )
        .unwrap();
        scheduler.enqueue(dependent).await.unwrap();
        scheduler.enqueue(task("pre", TaskPriority::Low)).await.unwrap();
        scheduler
            .refresh_readiness(&all_ready(&["pre", "dep"]))
            .await;

        let w = worker(4);
        assert_eq!(scheduler.dequeue(&w).await.unwrap().id, "pre");
        assert_eq!(scheduler.dequeue(&w).await.unwrap().id, "dep");
    }

    #[tokio::test]
    async fn test_unready_prerequisite_does_not_hold_dependent() {
        let scheduler = TaskScheduler::default();
        let dependent = Task::from_submission(
            TaskSubmission::new("dep", "shell")
                .with_id("dep")
                .depends_on("pre", DependencyType::Time),
        )
        .unwrap();
        scheduler.enqueue(dependent).await.unwrap();
        scheduler.enqueue(task("pre", TaskPriority::Low)).await.unwrap();
        scheduler.refresh_readiness(&all_ready(&["dep"])).await;

        assert_eq!(scheduler.dequeue(&worker(4)).await.unwrap().id, "dep");
    }
}
