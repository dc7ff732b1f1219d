use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use orchestrator::{Application, JobsFile, ShutdownManager};
use orchestrator_config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("orchestrator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("任务依赖解析与编排")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时按默认位置查找"),
        )
        .arg(
            Arg::new("jobs")
                .short('j')
                .long("jobs")
                .value_name("FILE")
                .help("任务清单（TOML）"),
        )
        .arg(
            Arg::new("once")
                .long("once")
                .action(ArgAction::SetTrue)
                .help("任务全部结束后退出"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let jobs_path = matches.get_one::<String>("jobs");
    let once = matches.get_flag("once");

    let config = AppConfig::load(config_path.map(String::as_str)).with_context(|| {
        format!(
            "加载配置失败: {}",
            config_path.map_or("<默认>", String::as_str)
        )
    })?;

    let log_level = matches
        .get_one::<String>("log-level")
        .unwrap_or(&config.observability.log_level);
    let log_format = matches
        .get_one::<String>("log-format")
        .unwrap_or(&config.observability.log_format);
    init_logging(log_level, log_format)?;

    info!("启动任务编排器");
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }

    let jobs = jobs_path.map(JobsFile::load).transpose()?;

    let mut app = Application::new(config).await?;
    let submitted = app.bootstrap(jobs.as_ref()).await?;
    if !submitted.is_empty() {
        info!("共提交 {} 个任务", submitted.len());
    }

    let shutdown_manager = ShutdownManager::new();
    let handles = app.start(&shutdown_manager).await?;

    if once {
        tokio::select! {
            result = app.wait_until_idle() => {
                if let Err(e) = result {
                    error!("等待任务结束失败: {e}");
                }
                info!("没有可推进的任务，准备退出");
            }
            _ = wait_for_shutdown_signal() => {
                info!("收到关闭信号，开始优雅关闭...");
            }
        }
    } else {
        wait_for_shutdown_signal().await;
        info!("收到关闭信号，开始优雅关闭...");
    }

    if !shutdown_manager.drain(handles).await {
        warn!("后台任务未能按时退出，强制退出");
    }
    app.log_summary().await;

    info!("任务编排器已退出");
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
