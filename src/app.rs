use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mediaflow_api::{create_app, serve, AppState, Notifier};
use mediaflow_config::AppConfig;
use mediaflow_dispatcher::{
    AdapterConfig, Reclaimer, ReclaimerConfig, RetryPolicy, StageDispatcher, StatusAdapter,
};
use mediaflow_domain::{BrokerClient, TaskRegistry, TaskRepository, TransitionBus};
use mediaflow_infrastructure::{
    BrokerFactory, DatabaseManager, SqliteTaskRepository, TransitionPublisher,
};
use mediaflow_worker::{SimulatedExecutor, WorkerOptions, WorkerService};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行回收器
    Dispatcher,
    /// 仅运行Worker
    Worker,
    /// 仅运行API服务器和推送层
    Api,
    /// 运行所有组件
    All,
}

impl AppMode {
    pub fn parse(mode: &str) -> Result<Self> {
        match mode {
            "dispatcher" => Ok(AppMode::Dispatcher),
            "worker" => Ok(AppMode::Worker),
            "api" => Ok(AppMode::Api),
            "all" => Ok(AppMode::All),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {mode}")),
        }
    }

    fn includes(self, other: AppMode) -> bool {
        self == AppMode::All || self == other
    }
}

/// 主应用程序：按运行模式组装各组件
///
/// 所有组件共用同一个登记表。登记表的每次写入都发布到代理的状态变更广播，
/// API 进程的推送层订阅广播，所以调度器和 Worker 在别的进程里写入也能推给连接。
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    database: DatabaseManager,
    registry: TaskRegistry,
    notifier: Arc<Notifier>,
    dispatcher: Arc<StageDispatcher>,
    adapter: Arc<StatusAdapter>,
    broker: Arc<dyn BrokerClient>,
    transitions: Arc<dyn TransitionBus>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        let database = DatabaseManager::new(&config.database).await?;
        let repository: Arc<dyn TaskRepository> =
            Arc::new(SqliteTaskRepository::new(database.pool().clone()));
        let graph = config.pipeline.stage_graph().context("构建阶段图失败")?;

        info!("连接消息代理: {}", mask_url(&config.broker.url));
        let handles = BrokerFactory::connect(&config.broker)
            .await
            .context("连接消息代理失败")?;
        let broker = handles.client;
        let transitions = handles.transitions;

        let notifier = Arc::new(Notifier::from_config(
            Arc::clone(&repository),
            graph.clone(),
            &config.notifier,
        ));
        let registry = TaskRegistry::new(repository, graph)
            .with_listener(Arc::new(TransitionPublisher::new(Arc::clone(&transitions))));

        let dispatcher = Arc::new(
            StageDispatcher::new(
                registry.clone(),
                Arc::clone(&broker),
                RetryPolicy::from(&config.retry),
            )
            .with_default_max_retries(config.pipeline.default_max_retries),
        );
        let adapter = Arc::new(StatusAdapter::new(
            Arc::clone(&dispatcher),
            AdapterConfig {
                auto_advance: config.pipeline.auto_advance,
                ..AdapterConfig::default()
            },
        ));

        Ok(Self {
            config,
            mode,
            database,
            registry,
            notifier,
            dispatcher,
            adapter,
            broker,
            transitions,
        })
    }

    /// 启动本模式下的组件，令牌取消后等待它们全部退出
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);
        let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        if self.mode.includes(AppMode::Dispatcher) {
            if self.config.reclaimer.enabled {
                handles.push(("reclaimer", self.start_reclaimer(token.child_token())));
            } else {
                info!("回收器已禁用");
            }
        }

        if self.mode.includes(AppMode::Worker) {
            if self.config.worker.enabled {
                handles.push(("worker", self.start_worker(token.child_token())));
            } else {
                info!("Worker已禁用");
            }
        }

        if self.mode.includes(AppMode::Api) {
            if self.config.api.enabled {
                handles.extend(self.start_api(token.child_token()).await?);
            } else {
                info!("API服务器已禁用");
            }
        }

        if handles.is_empty() {
            warn!("模式 {:?} 下没有启用任何组件", self.mode);
        }

        token.cancelled().await;
        info!("收到关闭信号，等待 {} 个组件退出", handles.len());

        for (name, handle) in handles {
            if let Err(e) = handle.await {
                error!("组件 {} 异常退出: {}", name, e);
            }
        }

        self.database.close().await;
        info!("所有组件已停止");
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> Arc<StageDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        Arc::clone(&self.notifier)
    }

    fn start_reclaimer(&self, token: CancellationToken) -> JoinHandle<()> {
        let settings = &self.config.reclaimer;
        let reclaimer = Arc::new(Reclaimer::new(
            Arc::clone(&self.dispatcher),
            ReclaimerConfig::from(settings),
        ));
        reclaimer.spawn(Duration::from_secs(settings.interval_seconds), token)
    }

    fn start_worker(&self, token: CancellationToken) -> JoinHandle<()> {
        let worker = &self.config.worker;
        let mut options = WorkerOptions::from_config(worker, &self.config.broker);
        options.worker_id = format!("{}@{}", worker.worker_id, local_hostname());

        let executors = if worker.simulate_executors {
            info!("为所有阶段注册模拟执行器");
            SimulatedExecutor::registry(
                self.registry.graph().iter().map(|s| s.stage),
                Duration::from_millis(worker.simulated_step_ms),
            )
        } else {
            Default::default()
        };
        if executors.is_empty() {
            warn!("没有注册任何阶段执行器，收到的阶段消息都会以不可恢复错误结束");
        }

        let service = Arc::new(WorkerService::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.adapter),
            executors,
            options,
        ));
        service.spawn(token)
    }

    async fn start_api(
        &self,
        token: CancellationToken,
    ) -> Result<Vec<(&'static str, JoinHandle<()>)>> {
        let relay = Arc::clone(&self.notifier)
            .spawn_relay(Arc::clone(&self.transitions), token.clone())
            .await
            .context("订阅状态变更广播失败")?;

        let notifier_config = &self.config.notifier;
        let heartbeat = Arc::clone(&self.notifier).spawn_heartbeat(
            Duration::from_secs(notifier_config.heartbeat_interval_seconds),
            Duration::from_secs(notifier_config.connection_timeout_seconds),
            token.clone(),
        );

        let state = AppState {
            registry: self.registry.clone(),
            notifier: Arc::clone(&self.notifier),
        };
        let app = create_app(state, &self.config.api);
        let bind_address = self.config.api.bind_address.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = serve(app, &bind_address, token).await {
                error!("API服务器运行失败: {}", e);
            }
        });

        Ok(vec![
            ("notifier-relay", relay),
            ("notifier-heartbeat", heartbeat),
            ("api", server),
        ])
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// 屏蔽URL中的密码
pub fn mask_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if !url[colon_pos + 1..at_pos].starts_with("//") {
                let mut masked = url.to_string();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
    }
    url.to_string()
}
