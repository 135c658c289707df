use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use mediaflow::app::{AppMode, Application};
use mediaflow_config::AppConfig;
use mediaflow_dispatcher::{ReclaimReport, Reclaimer, ReclaimerConfig};
use mediaflow_domain::{ItemSnapshot, Stage, Task, TaskLog};

/// CLI应用程序主结构
#[derive(Parser, Debug)]
#[command(name = "mediaflow-cli")]
#[command(version)]
#[command(about = "媒体处理流水线 - 命令行管理工具")]
#[command(long_about = "直接读写任务登记表：查询进度与审计日志、派发或撤销阶段、执行回收")]
struct CliApp {
    #[command(subcommand)]
    command: Commands,

    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 以 JSON 输出
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 查看媒体项整体进度
    Status {
        /// 媒体项ID
        item_id: i64,
    },
    /// 列出媒体项的任务行
    Tasks {
        /// 媒体项ID
        item_id: i64,
    },
    /// 查看任务的状态变更日志
    Logs {
        /// 任务ID
        task_id: i64,
    },
    /// 派发一个阶段
    Dispatch {
        /// 媒体项ID
        item_id: i64,
        /// 阶段名，缺省为第一个阶段
        stage: Option<String>,
        /// 阶段输入 (JSON格式)
        #[arg(short, long)]
        input: Option<String>,
    },
    /// 撤销任务
    Cancel {
        /// 任务ID
        task_id: i64,
    },
    /// 执行一次回收
    Cleanup {
        /// 只统计不修改
        #[arg(long)]
        dry_run: bool,
    },
    /// 校验配置并输出生效的配置
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = CliApp::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("加载配置失败")?;

    if let Commands::Config = cli.command {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    let app = Application::new(config, AppMode::Dispatcher).await?;
    run(&app, cli.command, cli.json).await
}

async fn run(app: &Application, command: Commands, json: bool) -> Result<()> {
    let registry = app.registry();

    match command {
        Commands::Status { item_id } => {
            let snapshot = registry.get_item_status(item_id).await?;
            if json {
                print_json(&snapshot)?;
            } else {
                print_snapshot(&snapshot);
            }
        }
        Commands::Tasks { item_id } => {
            let tasks = registry.get_tasks(item_id).await?;
            if json {
                print_json(&tasks)?;
            } else {
                print_tasks_table(&tasks);
            }
        }
        Commands::Logs { task_id } => {
            if registry.get_task(task_id).await?.is_none() {
                return Err(anyhow::anyhow!("任务不存在: {}", task_id));
            }
            let logs = registry.get_logs(task_id).await?;
            if json {
                print_json(&logs)?;
            } else {
                print_logs(&logs);
            }
        }
        Commands::Dispatch {
            item_id,
            stage,
            input,
        } => {
            let input = match input {
                Some(raw) => Some(
                    serde_json::from_str::<Value>(&raw)
                        .context("解析阶段输入失败，请确保是有效的JSON格式")?,
                ),
                None => None,
            };
            let dispatcher = app.dispatcher();
            let task = match stage {
                Some(name) => {
                    let stage: Stage = name.parse()?;
                    dispatcher.dispatch(item_id, stage, input).await?
                }
                None => dispatcher.start_item(item_id, input).await?,
            };
            println!("阶段派发成功!");
            println!("任务ID: {}", task.id);
            println!("阶段: {} (第 {} 次)", task.stage, task.attempt);
            println!("消息ID: {}", task.broker_task_id);
        }
        Commands::Cancel { task_id } => {
            let task = app.dispatcher().cancel(task_id).await?;
            println!("任务 {} 已撤销，当前状态: {}", task.id, task.status);
        }
        Commands::Cleanup { dry_run } => {
            let config = ReclaimerConfig {
                dry_run,
                ..ReclaimerConfig::from(&app.config().reclaimer)
            };
            let reclaimer = Reclaimer::new(app.dispatcher(), config);
            let report = reclaimer.run_cleanup().await?;
            if json {
                print_json(&report)?;
            } else {
                print_report(&report);
            }
        }
        Commands::Config => println!("{}", app.config().to_toml()?),
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_snapshot(snapshot: &ItemSnapshot) {
    println!("媒体项: {}", snapshot.item_id);
    println!("整体状态: {:?}", snapshot.overall_status);
    println!("整体进度: {:.1}%", snapshot.overall_progress);
    println!("当前阶段: {}", snapshot.current_stage);
    println!("错误数: {}", snapshot.error_count);
    if let Some(error) = &snapshot.last_error {
        println!("最近错误: {}", error);
    }
    println!();
    println!("{:<12} {:>6} {:<10} {:>8} {:>8}", "阶段", "权重", "状态", "进度", "尝试");
    println!("{}", "-".repeat(50));
    for stage in &snapshot.stages {
        println!(
            "{:<12} {:>6} {:<10} {:>7}% {:>8}",
            stage.stage,
            stage.weight,
            stage
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
            stage.progress,
            stage
                .attempt
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
}

fn print_tasks_table(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("没有找到任务");
        return;
    }

    println!(
        "{:<8} {:<12} {:>6} {:<10} {:>6} {:>8} {:<20}",
        "ID", "阶段", "尝试", "状态", "进度", "重试", "更新时间"
    );
    println!("{}", "-".repeat(80));
    for task in tasks {
        println!(
            "{:<8} {:<12} {:>6} {:<10} {:>5}% {:>4}/{:<3} {:<20}",
            task.id,
            task.stage,
            task.attempt,
            task.status,
            task.progress,
            task.retry_count,
            task.max_retries,
            task.updated_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
}

fn print_logs(logs: &[TaskLog]) {
    for log in logs {
        let from = log
            .old_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} {} -> {} {}",
            log.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            from,
            log.new_status,
            log.message.as_deref().unwrap_or(""),
        );
        if let Some(details) = &log.details {
            println!("    {}", details);
        }
    }
}

fn print_report(report: &ReclaimReport) {
    if report.dry_run {
        println!("演练模式：以下为预计处理数量，未做任何修改");
    }
    println!(
        "{:<20} {:>8} {:>8} {:>8} {:>8}",
        "类别", "处理", "成功", "失败", "跳过"
    );
    println!("{}", "-".repeat(56));
    for (name, category) in report.categories() {
        println!(
            "{:<20} {:>8} {:>8} {:>8} {:>8}",
            name, category.processed, category.succeeded, category.failed, category.skipped
        );
    }
    println!("合计处理: {}", report.total_processed());
}
