use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mediaflow::app::{AppMode, Application};
use mediaflow::shutdown::{wait_for_shutdown_signal, ShutdownManager};
use mediaflow_config::{AppConfig, LogFormat, ObservabilityConfig};

/// 媒体处理流水线的任务编排与状态同步引擎
#[derive(Parser, Debug)]
#[command(name = "mediaflow", version, about)]
struct Options {
    /// 配置文件路径，缺省时依次查找默认位置
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// 运行模式
    #[arg(
        short,
        long,
        value_name = "MODE",
        value_parser = ["dispatcher", "worker", "api", "all"],
        default_value = "all"
    )]
    mode: String,

    /// Worker ID，覆盖配置文件
    #[arg(long, value_name = "ID")]
    worker_id: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    log_level: Option<String>,

    /// 日志格式，覆盖配置文件
    #[arg(long, value_name = "FORMAT", value_parser = ["json", "pretty"])]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::parse();

    let mut config = AppConfig::load(options.config.as_deref()).with_context(|| {
        format!(
            "加载配置失败: {}",
            options.config.as_deref().unwrap_or("默认路径")
        )
    })?;

    if let Some(level) = &options.log_level {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = options.log_format.as_deref() {
        config.observability.log_format = match format {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
    }
    if let Some(id) = &options.worker_id {
        config.worker.worker_id = id.clone();
    }

    init_logging(&config.observability)?;
    if config.observability.metrics_enabled {
        init_metrics(&config.observability)?;
    }

    let mode = AppMode::parse(&options.mode)?;
    info!("启动 mediaflow，模式: {:?}", mode);

    let app = Arc::new(Application::new(config, mode).await?);
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let app = Arc::clone(&app);
        let token = shutdown_manager.subscribe();
        tokio::spawn(async move {
            if let Err(e) = app.run(token).await {
                error!("应用运行失败: {e}");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown();

    if shutdown_manager.join(app_handle).await {
        info!("应用已优雅关闭");
    }

    info!("mediaflow 已退出");
    Ok(())
}

/// 初始化日志系统，`RUST_LOG` 优先于配置
fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.log_format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        LogFormat::Pretty => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
    }

    Ok(())
}

/// 安装 Prometheus 导出器
fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let address: SocketAddr = config
        .metrics_bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {}", config.metrics_bind_address))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| anyhow::anyhow!("安装Prometheus导出器失败: {}", e))?;

    info!("Prometheus指标导出于 {}", address);
    Ok(())
}
