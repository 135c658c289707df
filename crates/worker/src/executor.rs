use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mediaflow_dispatcher::{SignalOutcome, StatusAdapter};
use mediaflow_domain::{ErrorClass, PipelineResult, Stage, Task};

/// 执行器返回的错误，带有分类
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StageError {
    pub class: ErrorClass,
    pub message: String,
}

impl StageError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Recoverable,
            message: message.into(),
        }
    }

    pub fn non_recoverable(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::NonRecoverable,
            message: message.into(),
        }
    }
}

/// 单次执行的上下文
#[derive(Debug, Clone)]
pub struct StageContext {
    pub task: Task,
    pub input: Option<Value>,
    cancel: CancellationToken,
}

impl StageContext {
    pub fn new(task: Task, input: Option<Value>, cancel: CancellationToken) -> Self {
        Self {
            task,
            input,
            cancel,
        }
    }

    pub fn stage(&self) -> Stage {
        self.task.stage
    }

    pub fn item_id(&self) -> i64 {
        self.task.item_id
    }

    pub fn broker_task_id(&self) -> &str {
        &self.task.broker_task_id
    }

    /// 软超时、任务撤销或进程停止时被取消
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// 执行器上报进度的入口
///
/// 发现任务已被撤销或已结束时取消本次执行的令牌。
#[derive(Clone)]
pub struct ProgressReporter {
    adapter: Arc<StatusAdapter>,
    broker_task_id: String,
    cancel: CancellationToken,
}

impl ProgressReporter {
    pub fn new(
        adapter: Arc<StatusAdapter>,
        broker_task_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            broker_task_id: broker_task_id.into(),
            cancel,
        }
    }

    pub async fn report(&self, progress: i32, message: Option<String>) -> PipelineResult<()> {
        match self
            .adapter
            .report_progress(&self.broker_task_id, progress, message)
            .await?
        {
            SignalOutcome::Duplicate(task) => {
                info!(
                    "任务 {} 已处于 {}，停止执行",
                    task.id, task.status
                );
                self.cancel.cancel();
            }
            SignalOutcome::Unknown => {
                warn!("上报进度时找不到任务 {}", self.broker_task_id);
            }
            SignalOutcome::Applied(_) | SignalOutcome::Unchanged(_) => {}
        }
        Ok(())
    }
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(
        &self,
        context: StageContext,
        reporter: ProgressReporter,
    ) -> Result<Value, StageError>;

    fn name(&self) -> &str;
}

/// 阶段到执行器的映射
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: BTreeMap<Stage, Arc<dyn StageExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: Stage, executor: Arc<dyn StageExecutor>) {
        info!("注册执行器 {} -> {}", stage, executor.name());
        if self.executors.insert(stage, executor).is_some() {
            debug!("阶段 {} 的执行器被替换", stage);
        }
    }

    pub fn with(mut self, stage: Stage, executor: Arc<dyn StageExecutor>) -> Self {
        self.register(stage, executor);
        self
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageExecutor>> {
        self.executors.get(&stage).cloned()
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.executors.contains_key(&stage)
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.executors.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
