use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use orchestrator_domain::entities::{
    HealthStatus, WorkerHeartbeat, WorkerInfo, WorkerRegistration, WorkerStatus,
};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

/// Worker注册表，负责心跳与离线检测
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerInfo>>,
    heartbeat_timeout_seconds: i64,
}

impl WorkerRegistry {
    pub fn new(heartbeat_timeout_seconds: u64) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            heartbeat_timeout_seconds: i64::try_from(heartbeat_timeout_seconds)
                .unwrap_or(i64::MAX),
        }
    }

    /// 重复注册会覆盖旧信息，但保留当前负载
    pub async fn register(&self, registration: WorkerRegistration) -> WorkerInfo {
        let mut workers = self.workers.write().await;
        let mut info = WorkerInfo::new(registration);
        if let Some(existing) = workers.get(&info.id) {
            info.current_load = existing.current_load;
            info.registered_at = existing.registered_at;
            info!("Worker {} 重新注册", info.id);
        } else {
            info!("Worker {} 注册成功，容量: {}", info.id, info.capacity);
        }
        workers.insert(info.id.clone(), info.clone());
        metrics::gauge!("orchestrator_workers_registered").set(workers.len() as f64);
        info
    }

    pub async fn unregister(&self, worker_id: &str) -> Option<WorkerInfo> {
        let mut workers = self.workers.write().await;
        let removed = workers.remove(worker_id);
        if removed.is_some() {
            info!("Worker {} 已注销", worker_id);
            metrics::gauge!("orchestrator_workers_registered").set(workers.len() as f64);
        }
        removed
    }

    /// 返回最新的Worker信息，以及该Worker是否刚从离线恢复
    pub async fn heartbeat(
        &self,
        heartbeat: &WorkerHeartbeat,
    ) -> OrchestratorResult<(WorkerInfo, bool)> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(&heartbeat.worker_id)
            .ok_or_else(|| OrchestratorError::worker_not_found(&heartbeat.worker_id))?;
        let reconnected = worker.update_heartbeat(heartbeat);
        if reconnected {
            info!("Worker {} 恢复在线", worker.id);
        }
        debug!("收到Worker {} 心跳", worker.id);
        Ok((worker.clone(), reconnected))
    }

    /// 将心跳超时的在线Worker标记为离线，返回本次新离线的Worker ID
    pub async fn detect_offline(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut workers = self.workers.write().await;
        let mut offline = Vec::new();
        for worker in workers.values_mut() {
            if worker.is_active() && worker.is_heartbeat_expired(now, self.heartbeat_timeout_seconds)
            {
                warn!(
                    "Worker {} 心跳超时，最后心跳: {}",
                    worker.id,
                    worker.last_heartbeat.format("%Y-%m-%d %H:%M:%S UTC")
                );
                worker.status = WorkerStatus::Offline;
                worker.health = HealthStatus::Failed;
                offline.push(worker.id.clone());
            }
        }
        offline.sort();
        offline
    }

    /// 可接收任务的Worker，按负载升序、ID升序
    pub async fn idle_workers(&self) -> Vec<WorkerInfo> {
        let workers = self.workers.read().await;
        let mut idle: Vec<WorkerInfo> = workers
            .values()
            .filter(|w| w.is_idle() && w.health != HealthStatus::Failed)
            .cloned()
            .collect();
        idle.sort_by(|a, b| {
            a.load_percentage()
                .total_cmp(&b.load_percentage())
                .then_with(|| a.id.cmp(&b.id))
        });
        idle
    }

    pub async fn assign(&self, worker_id: &str) -> OrchestratorResult<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| OrchestratorError::worker_not_found(worker_id))?;
        worker.current_load += 1;
        Ok(())
    }

    pub async fn release(&self, worker_id: &str) {
        if let Some(worker) = self.workers.write().await.get_mut(worker_id) {
            worker.current_load = worker.current_load.saturating_sub(1);
        }
    }

    pub async fn set_health(&self, worker_id: &str, health: HealthStatus) {
        if let Some(worker) = self.workers.write().await.get_mut(worker_id) {
            worker.health = health;
        }
    }

    pub async fn get(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.workers.read().await.get(worker_id).cloned()
    }

    pub async fn list(&self) -> Vec<WorkerInfo> {
        let mut list: Vec<WorkerInfo> = self.workers.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn active_count(&self) -> usize {
        self.workers
            .read()
            .await
            .values()
            .filter(|w| w.is_active())
            .count()
    }
}
