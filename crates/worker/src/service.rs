use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mediaflow_config::{BrokerConfig, WorkerConfig};
use mediaflow_dispatcher::{Claim, SignalOutcome, StatusAdapter};
use mediaflow_domain::{
    BrokerClient, Delivery, ErrorClass, PipelineResult, StageMessage, Task,
};

use crate::executor::{ExecutorRegistry, ProgressReporter, StageContext, StageError};

pub const SOFT_TIME_LIMIT_ERROR: &str = "soft time limit exceeded";
pub const HARD_TIME_LIMIT_ERROR: &str = "hard time limit exceeded";

/// 停止时等待执行器响应取消的时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_id: String,
    pub max_concurrent_tasks: usize,
    pub soft_time_limit: Duration,
    pub hard_time_limit: Duration,
    /// 队列为空时的轮询间隔
    pub poll_interval: Duration,
}

impl WorkerOptions {
    pub fn from_config(worker: &WorkerConfig, broker: &BrokerConfig) -> Self {
        Self {
            worker_id: worker.worker_id.clone(),
            max_concurrent_tasks: worker.max_concurrent_tasks.max(1),
            soft_time_limit: Duration::from_secs(worker.soft_time_limit_seconds),
            hard_time_limit: Duration::from_secs(worker.hard_time_limit_seconds),
            poll_interval: Duration::from_millis(broker.poll_interval_ms),
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default(), &BrokerConfig::default())
    }
}

/// 一次执行的结局
#[derive(Debug)]
enum Execution {
    Finished(Result<Value, StageError>),
    SoftTimeout,
    HardTimeout,
    /// 进程停止，消息退回队列由其他 worker 接管
    Interrupted,
}

/// Worker 服务：从消息代理拉取阶段消息，认领后交给执行器，
/// 结果经状态适配器写回登记表，最后才确认消息。
pub struct WorkerService {
    broker: Arc<dyn BrokerClient>,
    adapter: Arc<StatusAdapter>,
    executors: ExecutorRegistry,
    options: WorkerOptions,
    permits: Arc<Semaphore>,
}

impl WorkerService {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        adapter: Arc<StatusAdapter>,
        executors: ExecutorRegistry,
        options: WorkerOptions,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_concurrent_tasks.max(1)));
        Self {
            broker,
            adapter,
            executors,
            options,
            permits,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.options.worker_id
    }

    /// 正在执行的消息数
    pub fn in_flight(&self) -> usize {
        self.options.max_concurrent_tasks.max(1) - self.permits.available_permits()
    }

    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(token).await })
    }

    /// 拉取循环，令牌取消后停止拉取并等待在途执行结束
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(
            "Worker {} 启动，并发上限 {}，执行器 {:?}",
            self.options.worker_id,
            self.options.max_concurrent_tasks,
            self.executors.stages()
        );
        let mut in_flight = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let fetched = tokio::select! {
                _ = token.cancelled() => break,
                fetched = self.broker.fetch() => fetched,
            };

            match fetched {
                Ok(Some(delivery)) => {
                    let this = Arc::clone(&self);
                    let token = token.clone();
                    let delay = delivery
                        .message
                        .as_stage_message()
                        .and_then(|message| message.remaining_delay(Utc::now()));
                    match delay {
                        // 未到期的消息不占并发名额，到期后再排队取名额
                        Some(delay) => {
                            drop(permit);
                            in_flight.spawn(async move {
                                this.hold_until_due(delivery, delay, token).await;
                            });
                        }
                        None => {
                            in_flight.spawn(async move {
                                this.handle_delivery(delivery, token).await;
                                drop(permit);
                            });
                        }
                    }
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = sleep(self.options.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!("拉取消息失败: {}", e);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = sleep(self.options.poll_interval) => {}
                    }
                }
            }

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!("执行协程异常退出: {}", e);
                }
            }
        }

        info!(
            "Worker {} 停止拉取，等待 {} 个在途执行",
            self.options.worker_id,
            in_flight.len()
        );
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("执行协程异常退出: {}", e);
            }
        }
        info!("Worker {} 已停止", self.options.worker_id);
    }

    /// 等到 eta 再取并发名额执行，期间停止则退回队列
    async fn hold_until_due(&self, delivery: Delivery, delay: Duration, token: CancellationToken) {
        let tag = delivery.delivery_tag;
        debug!("消息 (tag={}) 尚未到期，暂存 {:?}", tag, delay);
        counter!("mediaflow_worker_held_messages_total").increment(1);

        tokio::select! {
            _ = token.cancelled() => {
                self.settle(tag, false).await;
                return;
            }
            _ = sleep(delay) => {}
        }

        let permit = tokio::select! {
            _ = token.cancelled() => {
                self.settle(tag, false).await;
                return;
            }
            permit = self.permits.clone().acquire_owned() => permit,
        };
        match permit {
            Ok(permit) => {
                self.handle_delivery(delivery, token).await;
                drop(permit);
            }
            Err(_) => self.settle(tag, false).await,
        }
    }

    /// 处理一次投递，保证最终 ack 或 nack
    pub async fn handle_delivery(&self, delivery: Delivery, token: CancellationToken) {
        let tag = delivery.delivery_tag;
        let Some(message) = delivery.message.as_stage_message().cloned() else {
            debug!("忽略非阶段消息 {}", delivery.message.id);
            self.settle(tag, true).await;
            return;
        };

        if let Some(delay) = message.remaining_delay(Utc::now()) {
            debug!("消息 {} 尚未到期，等待 {:?}", message.broker_task_id, delay);
            tokio::select! {
                _ = token.cancelled() => {
                    self.settle(tag, false).await;
                    return;
                }
                _ = sleep(delay) => {}
            }
        }

        let task = match self.adapter.claim(&message, delivery.redelivered).await {
            Ok(Claim::Execute(task)) => task,
            Ok(Claim::Skip(reason)) => {
                debug!("跳过消息 {}: {}", message.broker_task_id, reason);
                self.settle(tag, true).await;
                return;
            }
            Err(e) => {
                warn!("认领消息 {} 失败，退回队列: {}", message.broker_task_id, e);
                self.settle(tag, false).await;
                return;
            }
        };

        let execution = self.execute(task, &message, &token).await;
        let outcome = match execution {
            Execution::Interrupted => {
                info!("任务 {} 的执行被停止打断，退回队列", message.task_id);
                self.settle(tag, false).await;
                return;
            }
            Execution::Finished(Ok(output)) => {
                self.record("success");
                self.adapter.complete(&message.broker_task_id, output).await
            }
            Execution::Finished(Err(e)) => {
                self.record("error");
                self.adapter
                    .fail(&message.broker_task_id, &e.message, Some(e.class))
                    .await
            }
            Execution::SoftTimeout => {
                self.record("soft_timeout");
                self.adapter
                    .fail(
                        &message.broker_task_id,
                        SOFT_TIME_LIMIT_ERROR,
                        Some(ErrorClass::Recoverable),
                    )
                    .await
            }
            Execution::HardTimeout => {
                self.record("hard_timeout");
                self.adapter
                    .fail(
                        &message.broker_task_id,
                        HARD_TIME_LIMIT_ERROR,
                        Some(ErrorClass::Recoverable),
                    )
                    .await
            }
        };

        match outcome {
            Ok(outcome) => {
                if let SignalOutcome::Duplicate(task) = &outcome {
                    debug!("任务 {} 已是 {}，结果被忽略", task.id, task.status);
                }
                self.settle(tag, true).await;
            }
            Err(e) => {
                warn!(
                    "写回任务 {} 的结果失败，退回队列: {}",
                    message.broker_task_id, e
                );
                self.settle(tag, false).await;
            }
        }
    }

    async fn execute(&self, task: Task, message: &StageMessage, token: &CancellationToken) -> Execution {
        let Some(executor) = self.executors.get(task.stage) else {
            warn!("阶段 {} 没有注册执行器", task.stage);
            return Execution::Finished(Err(StageError::non_recoverable(format!(
                "no executor registered for stage {}",
                task.stage
            ))));
        };

        let cancel = token.child_token();
        let context = StageContext::new(task, message.input_data.clone(), cancel.clone());
        let reporter = ProgressReporter::new(
            Arc::clone(&self.adapter),
            &message.broker_task_id,
            cancel.clone(),
        );

        let started = std::time::Instant::now();
        let mut handle = tokio::spawn(async move { executor.execute(context, reporter).await });

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                cancel.cancel();
                return match timeout(SHUTDOWN_GRACE, &mut handle).await {
                    Ok(Ok(Ok(output))) => Execution::Finished(Ok(output)),
                    Ok(_) => Execution::Interrupted,
                    Err(_) => {
                        handle.abort();
                        Execution::Interrupted
                    }
                };
            }
            joined = &mut handle => {
                debug!("任务 {} 执行耗时 {:?}", message.task_id, started.elapsed());
                return Execution::Finished(flatten(joined));
            }
            _ = sleep(self.options.soft_time_limit) => {}
        }

        warn!(
            "任务 {} 超过软超时 {:?}，取消执行",
            message.task_id, self.options.soft_time_limit
        );
        cancel.cancel();

        let remaining = self
            .options
            .hard_time_limit
            .saturating_sub(self.options.soft_time_limit);
        match timeout(remaining, &mut handle).await {
            Ok(_) => Execution::SoftTimeout,
            Err(_) => {
                error!(
                    "任务 {} 超过硬超时 {:?}，中止执行",
                    message.task_id, self.options.hard_time_limit
                );
                handle.abort();
                Execution::HardTimeout
            }
        }
    }

    async fn settle(&self, delivery_tag: u64, ack: bool) {
        let result: PipelineResult<()> = if ack {
            self.broker.ack(delivery_tag).await
        } else {
            self.broker.nack(delivery_tag, true).await
        };
        if let Err(e) = result {
            error!("确认投递 {} 失败: {}", delivery_tag, e);
        }
    }

    fn record(&self, outcome: &'static str) {
        counter!("mediaflow_worker_executions_total", "outcome" => outcome).increment(1);
    }
}

fn flatten(
    joined: Result<Result<Value, StageError>, tokio::task::JoinError>,
) -> Result<Value, StageError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(StageError::non_recoverable(format!("executor panicked: {e}"))),
        Err(e) => Err(StageError::recoverable(format!("executor aborted: {e}"))),
    }
}
