use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use orchestrator::{Application, JobsFile, ShutdownManager};
use orchestrator_config::AppConfig;
use orchestrator_dispatcher::test_utils::FakeExecutionBackend;
use orchestrator_domain::entities::TaskStatus;
use orchestrator_domain::ports::TaskStatusStore;
use orchestrator_infrastructure::{InMemoryTaskStatusStore, SqliteTaskStatusStore};

fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.scheduler.tick_interval_ms = 10;
    config.monitoring.interval_ms = 10;
    config.retry.base_interval_ms = 1;
    config.retry.max_interval_ms = 1;
    config.retry.jitter_factor = 0.0;
    config
}

async fn status_of(app: &Application, id: &str) -> TaskStatus {
    app.service().status(id).await.unwrap().unwrap().status
}

/// 清单中的依赖关系决定执行顺序，条件依赖在前置任务失败后放行
#[tokio::test]
async fn test_manifest_pipeline_respects_dependencies() -> Result<()> {
    let jobs = JobsFile::from_toml(
        r#"
[[workers]]
id = "w1"
capacity = 2

[[jobs]]
id = "extract"
name = "抽取"
command = "echo extract"

[[jobs]]
id = "transform"
name = "转换"
command = "echo transform"
depends_on = ["extract"]
max_retries = 0

[[jobs]]
id = "notify"
name = "失败通知"
command = "echo notify"
dependencies = [{ prerequisite_id = "transform", dependency_type = "condition", condition = "failed" }]
"#,
    )?;

    let backend = Arc::new(FakeExecutionBackend::new());
    let store = Arc::new(InMemoryTaskStatusStore::new());
    let mut app = Application::with_components(fast_config(), store, backend.clone()).await?;
    let submitted = app.bootstrap(Some(&jobs)).await?;
    assert_eq!(submitted, vec!["extract", "transform", "notify"]);

    let service = app.service();
    assert_eq!(service.schedule_tick().await?, 1);
    assert_eq!(status_of(&app, "transform").await, TaskStatus::Pending);

    backend.complete("extract");
    service.monitor_tick().await;
    assert_eq!(service.schedule_tick().await?, 1);
    assert_eq!(status_of(&app, "transform").await, TaskStatus::Running);

    backend.fail("transform", "exit code 1");
    let summary = service.monitor_tick().await;
    assert_eq!(summary.failed, vec!["transform"]);
    assert_eq!(status_of(&app, "transform").await, TaskStatus::Failed);

    assert_eq!(service.schedule_tick().await?, 1);
    assert_eq!(backend.started(), vec!["extract", "transform", "notify"]);
    Ok(())
}

/// 清单中成环的任务被拒绝，其余任务照常提交
#[tokio::test]
async fn test_manifest_cycle_is_rejected() -> Result<()> {
    let jobs = JobsFile::from_toml(
        r#"
[[jobs]]
id = "a"
name = "a"
command = "true"
depends_on = ["b"]

[[jobs]]
id = "b"
name = "b"
command = "true"
depends_on = ["a"]
"#,
    )?;

    let backend = Arc::new(FakeExecutionBackend::new());
    let store = Arc::new(InMemoryTaskStatusStore::new());
    let mut app = Application::with_components(fast_config(), store.clone(), backend).await?;
    let submitted = app.bootstrap(Some(&jobs)).await?;

    assert_eq!(submitted, vec!["a"]);
    assert!(store.get("b").await?.is_none());
    assert!(app.service().validation_report().await.deadlocks.is_empty());
    Ok(())
}

/// 重启后执行中的任务走重试流程，排队的任务重新入队
#[tokio::test]
async fn test_restart_recovers_from_sqlite() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let url = format!("sqlite:{}", dir.path().join("orchestrator.db").display());
    let mut config = fast_config();
    config.database.url = url.clone();

    let jobs = JobsFile::from_toml(
        r#"
[[jobs]]
id = "a"
name = "a"
command = "true"

[[jobs]]
id = "b"
name = "b"
command = "true"
depends_on = ["a"]
"#,
    )?;

    {
        let store = Arc::new(SqliteTaskStatusStore::connect(&url, 2).await?);
        let backend = Arc::new(FakeExecutionBackend::new());
        let mut app = Application::with_components(config.clone(), store, backend).await?;
        app.bootstrap(Some(&jobs)).await?;
        assert_eq!(app.service().schedule_tick().await?, 1);
        assert_eq!(status_of(&app, "a").await, TaskStatus::Running);
    }

    let store = Arc::new(SqliteTaskStatusStore::connect(&url, 2).await?);
    let backend = Arc::new(FakeExecutionBackend::new());
    let mut app = Application::with_components(config, store, backend.clone()).await?;
    app.bootstrap(None).await?;

    let record = app.service().status("a").await?.unwrap();
    assert_eq!(record.status, TaskStatus::Pending);
    assert_eq!(record.retry_count, 1);
    assert_eq!(status_of(&app, "b").await, TaskStatus::Pending);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let service = app.service();
    assert_eq!(service.schedule_tick().await?, 1);
    backend.complete("a");
    service.monitor_tick().await;
    assert_eq!(service.schedule_tick().await?, 1);
    assert_eq!(backend.started(), vec!["a", "b"]);
    Ok(())
}

/// 真实子进程执行：后台循环把清单跑完
#[cfg(unix)]
#[tokio::test]
async fn test_shell_jobs_run_to_completion() -> Result<()> {
    let mut config = fast_config();
    config.database.url = "sqlite::memory:".to_string();
    config.database.max_connections = 1;

    let jobs = JobsFile::from_toml(
        r#"
[[workers]]
id = "local-1"
capacity = 2

[[jobs]]
id = "first"
name = "first"
command = "echo one"

[[jobs]]
id = "second"
name = "second"
command = "test -n \"$BATCH\""
env = { BATCH = "2024-01" }
depends_on = ["first"]

[[jobs]]
id = "broken"
name = "broken"
command = "exit 7"
max_retries = 0
"#,
    )?;

    let mut app = Application::new(config).await?;
    app.bootstrap(Some(&jobs)).await?;

    let shutdown = ShutdownManager::with_timeout(Duration::from_secs(5));
    let handles = app.start(&shutdown).await?;
    let stats = tokio::time::timeout(Duration::from_secs(20), app.wait_until_idle()).await??;
    assert!(shutdown.drain(handles).await);

    assert_eq!(stats.status_counts.get("COMPLETED"), Some(&2));
    assert_eq!(stats.status_counts.get("FAILED"), Some(&1));
    let broken = app.service().status("broken").await?.unwrap();
    assert!(broken.error.unwrap_or_default().contains('7'));
    Ok(())
}
