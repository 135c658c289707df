use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mediaflow_domain::{
    BrokerClient, NewTask, PipelineError, PipelineResult, Stage, StageMessage, StatusChange, Task,
    TaskRegistry, TaskStatus,
};

use crate::retry_policy::RetryPolicy;

/// 阶段派发：在登记表中建立任务，再把阶段消息交给消息代理
pub struct StageDispatcher {
    registry: TaskRegistry,
    broker: Arc<dyn BrokerClient>,
    retry_policy: RetryPolicy,
    default_max_retries: i32,
}

impl StageDispatcher {
    pub fn new(
        registry: TaskRegistry,
        broker: Arc<dyn BrokerClient>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            broker,
            retry_policy,
            default_max_retries: NewTask::DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_default_max_retries(mut self, max_retries: i32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn broker(&self) -> Arc<dyn BrokerClient> {
        self.broker.clone()
    }

    pub fn default_max_retries(&self) -> i32 {
        self.default_max_retries
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// 派发一个阶段
    ///
    /// 该阶段已有活跃任务时返回 `Conflict`。消息发布失败时任务直接记为
    /// FAILURE，不会留下没有消息对应的 PENDING 行。
    pub async fn dispatch(
        &self,
        item_id: i64,
        stage: Stage,
        input_data: Option<serde_json::Value>,
    ) -> PipelineResult<Task> {
        if !self.registry.graph().contains(stage) {
            return Err(PipelineError::UnknownStage(stage.to_string()));
        }

        let mut new_task = NewTask::new(item_id, stage, Uuid::new_v4().to_string())
            .with_max_retries(self.default_max_retries);
        if let Some(input) = input_data {
            new_task = new_task.with_input(input);
        }

        let task = self.registry.create_task(&new_task).await?;
        let message = StageMessage::for_task(&task);

        if let Err(e) = self.broker.enqueue(&message).await {
            warn!("任务 {} 发布到消息队列失败: {}", task.id, e);
            let change = StatusChange::to(TaskStatus::Failure)
                .with_error(format!("发布消息失败: {e}"));
            if let Err(update_err) = self
                .registry
                .update_status(task.id, task.version, &change)
                .await
            {
                warn!("标记任务 {} 失败时出错: {}", task.id, update_err);
            }
            return Err(e);
        }

        counter!("mediaflow_dispatched_tasks_total", "stage" => stage.as_str()).increment(1);
        info!(
            "已派发 item={} stage={} attempt={} broker_task_id={}",
            item_id, stage, task.attempt, task.broker_task_id
        );
        Ok(task)
    }

    /// 从阶段图的第一个阶段开始处理媒体项
    pub async fn start_item(
        &self,
        item_id: i64,
        input_data: Option<serde_json::Value>,
    ) -> PipelineResult<Task> {
        let first = self.registry.graph().first();
        self.dispatch(item_id, first, input_data).await
    }

    /// 阶段成功后派发下一阶段，上一阶段的输出作为输入
    ///
    /// 已是最后一个阶段返回 `None`；下一阶段已被别人派发时同样返回 `None`。
    pub async fn advance(&self, completed: &Task) -> PipelineResult<Option<Task>> {
        let Some(next) = self.registry.graph().next(completed.stage) else {
            debug!("媒体项 {} 已完成全部阶段", completed.item_id);
            return Ok(None);
        };

        match self
            .dispatch(completed.item_id, next, completed.output_data.clone())
            .await
        {
            Ok(task) => Ok(Some(task)),
            Err(e) if e.is_control_signal() => {
                debug!("下一阶段 {} 已有活跃任务: {}", next, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// 重新发布处于 RETRY 的任务，按退避策略设置 eta
    pub async fn redispatch(&self, task: &Task) -> PipelineResult<()> {
        let eta = self
            .retry_policy
            .next_retry_at(task.retry_count, Utc::now());
        let message = StageMessage::for_task(task).with_eta(eta);
        self.broker.enqueue(&message).await?;

        counter!("mediaflow_task_retries_total", "stage" => task.stage.as_str()).increment(1);
        info!(
            "任务 {} 第 {}/{} 次重试，预计执行时间 {}",
            task.id,
            task.retry_count,
            task.max_retries,
            eta.format("%Y-%m-%d %H:%M:%S UTC")
        );
        Ok(())
    }

    /// 撤销任务
    ///
    /// 登记表中的 REVOKED 是权威结果；随后尽力通知消息代理放弃投递，
    /// 代理出错只记录日志。已撤销的任务直接返回。
    pub async fn cancel(&self, task_id: i64) -> PipelineResult<Task> {
        const MAX_ATTEMPTS: usize = 3;

        let mut attempt = 0;
        let revoked = loop {
            attempt += 1;
            let task = self
                .registry
                .get_task(task_id)
                .await?
                .ok_or_else(|| PipelineError::task_not_found(task_id))?;
            if task.status == TaskStatus::Revoked {
                return Ok(task);
            }

            let change = StatusChange::to(TaskStatus::Revoked).with_message("已被撤销");
            match self
                .registry
                .update_status(task.id, task.version, &change)
                .await
            {
                Ok(task) => break task,
                Err(e) if e.is_version_mismatch() && attempt < MAX_ATTEMPTS => {
                    debug!("撤销任务 {} 时版本冲突，重试", task_id);
                }
                Err(e) => return Err(e),
            }
        };

        if let Err(e) = self.broker.revoke(&revoked.broker_task_id).await {
            warn!(
                "通知消息代理撤销 {} 失败，登记表已记为 REVOKED: {}",
                revoked.broker_task_id, e
            );
        }
        info!("任务 {} 已撤销", task_id);
        Ok(revoked)
    }
}
