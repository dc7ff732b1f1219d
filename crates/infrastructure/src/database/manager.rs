use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use orchestrator_errors::OrchestratorResult;

/// 建表语句，启动时幂等执行
const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS task_status (
        task_id TEXT PRIMARY KEY NOT NULL,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL,
        progress REAL NOT NULL DEFAULT 0,
        message TEXT,
        error TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 0,
        timeout_seconds INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        metadata TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_status_status ON task_status(status)",
    r#"
    CREATE TABLE IF NOT EXISTS task_status_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL,
        from_status TEXT NOT NULL,
        to_status TEXT NOT NULL,
        message TEXT,
        transitioned_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_status_history_task ON task_status_history(task_id)",
];

/// SQLite连接池管理
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// 内存数据库只使用一个连接，否则每个连接各自是一个独立的库
    pub async fn new(url: &str, max_connections: u32) -> OrchestratorResult<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let max_connections = if in_memory { 1 } else { max_connections.max(1) };

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30));
        if in_memory {
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        info!("已连接数据库: {} (最大连接数 {})", url, max_connections);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> OrchestratorResult<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("数据库表结构已就绪");
        Ok(())
    }

    pub async fn health_check(&self) -> OrchestratorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
