use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// 优雅关闭管理器
#[derive(Clone)]
pub struct ShutdownManager {
    /// 关闭信号发送器，关闭后置空
    shutdown_tx: Arc<RwLock<Option<broadcast::Sender<()>>>>,
    is_shutdown: Arc<RwLock<bool>>,
    /// 等待后台循环退出的时间
    drain_timeout: Duration,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx: Arc::new(RwLock::new(Some(shutdown_tx))),
            is_shutdown: Arc::new(RwLock::new(false)),
            drain_timeout,
        }
    }

    /// 订阅关闭信号，已关闭时返回立即触发的接收器
    pub async fn subscribe(&self) -> broadcast::Receiver<()> {
        match self.shutdown_tx.read().await.as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                let _ = tx.send(());
                rx
            }
        }
    }

    /// 关闭前的发送端，供需要自行订阅的组件使用
    pub async fn sender(&self) -> Option<broadcast::Sender<()>> {
        self.shutdown_tx.read().await.clone()
    }

    /// 触发关闭，重复调用无效果
    pub async fn shutdown(&self) {
        let mut is_shutdown = self.is_shutdown.write().await;
        if *is_shutdown {
            debug!("关闭管理器已经触发过关闭");
            return;
        }
        *is_shutdown = true;
        info!("触发系统关闭");

        if let Some(tx) = self.shutdown_tx.write().await.take() {
            debug!("发送关闭信号给 {} 个订阅者", tx.receiver_count());
            let _ = tx.send(());
        }
        info!("关闭信号已发送");
    }

    pub async fn is_shutdown(&self) -> bool {
        *self.is_shutdown.read().await
    }

    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.subscribe().await;
        let _ = rx.recv().await;
    }

    /// 发送关闭信号并等待后台任务退出，超时返回 false
    pub async fn drain(&self, handles: Vec<JoinHandle<()>>) -> bool {
        self.shutdown().await;
        let count = handles.len();
        match timeout(self.drain_timeout, join_all(handles)).await {
            Ok(results) => {
                for result in results.into_iter().filter_map(Result::err) {
                    warn!("后台任务异常退出: {}", result);
                }
                info!("{} 个后台任务已退出", count);
                true
            }
            Err(_) => {
                warn!("等待后台任务退出超时（{:?}）", self.drain_timeout);
                false
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
