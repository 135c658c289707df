use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mediaflow_errors::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::entities::{Stage, Task};

/// 消息代理侧的原生投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerState {
    Queued,
    Started,
    Completed,
    Errored,
    RetryScheduled,
    Cancelled,
}

impl BrokerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerState::Queued => "queued",
            BrokerState::Started => "started",
            BrokerState::Completed => "completed",
            BrokerState::Errored => "errored",
            BrokerState::RetryScheduled => "retry_scheduled",
            BrokerState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" | "pending" => Ok(BrokerState::Queued),
            "started" => Ok(BrokerState::Started),
            "completed" | "success" => Ok(BrokerState::Completed),
            "errored" | "failure" => Ok(BrokerState::Errored),
            "retry_scheduled" | "retry" => Ok(BrokerState::RetryScheduled),
            "cancelled" | "revoked" => Ok(BrokerState::Cancelled),
            _ => Err(PipelineError::validation_error(format!(
                "无效的代理状态: {s}"
            ))),
        }
    }
}

/// 执行错误的分类，决定进入 RETRY 还是直接 FAILURE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Recoverable,
    NonRecoverable,
}

impl ErrorClass {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorClass::Recoverable)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Recoverable => f.write_str("recoverable"),
            ErrorClass::NonRecoverable => f.write_str("non_recoverable"),
        }
    }
}

/// 阶段执行消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMessage {
    pub broker_task_id: String,
    pub task_id: i64,
    pub item_id: i64,
    pub stage: Stage,
    pub attempt: i32,
    pub retry_count: i32,
    pub input_data: Option<serde_json::Value>,
    /// 最早可执行时间，重试退避时设置
    pub eta: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
}

impl StageMessage {
    pub fn for_task(task: &Task) -> Self {
        Self {
            broker_task_id: task.broker_task_id.clone(),
            task_id: task.id,
            item_id: task.item_id,
            stage: task.stage,
            attempt: task.attempt,
            retry_count: task.retry_count,
            input_data: task.input_data.clone(),
            eta: None,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    /// 距离 eta 还需等待的时间，已到期返回 None
    pub fn remaining_delay(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.eta
            .filter(|eta| *eta > now)
            .and_then(|eta| (eta - now).to_std().ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlAction {
    Revoke,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub broker_task_id: String,
    pub action: ControlAction,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageType {
    StageExecution(StageMessage),
    TaskControl(ControlMessage),
}

/// 队列上传输的消息信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
}

impl Message {
    pub fn stage_execution(message: StageMessage) -> Self {
        let correlation_id = Some(message.broker_task_id.clone());
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: MessageType::StageExecution(message),
            timestamp: Utc::now(),
            correlation_id,
        }
    }

    pub fn revoke(broker_task_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: MessageType::TaskControl(ControlMessage {
                broker_task_id: broker_task_id.to_string(),
                action: ControlAction::Revoke,
                timestamp: Utc::now(),
            }),
            timestamp: Utc::now(),
            correlation_id: Some(broker_task_id.to_string()),
        }
    }

    pub fn as_stage_message(&self) -> Option<&StageMessage> {
        match &self.message_type {
            MessageType::StageExecution(message) => Some(message),
            MessageType::TaskControl(_) => None,
        }
    }

    pub fn to_bytes(&self) -> PipelineResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(PipelineError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> PipelineResult<Self> {
        serde_json::from_slice(bytes).map_err(PipelineError::from)
    }
}

/// 一次未确认的投递，处理完成后用 `delivery_tag` 确认
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub message: Message,
}

/// 消息代理客户端
///
/// 投递语义为至少一次：消费方在处理结束后才调用 `ack`（延迟确认），
/// 未确认的投递在连接断开后重新投递。
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// 发布阶段消息，返回代理侧的任务标识
    async fn enqueue(&self, message: &StageMessage) -> PipelineResult<String>;

    /// 查询原生投递状态，代理已不记得该任务时返回 None
    async fn inspect(&self, broker_task_id: &str) -> PipelineResult<Option<BrokerState>>;

    /// 尽力放弃投递，登记表中的 REVOKED 状态才是权威结果
    async fn revoke(&self, broker_task_id: &str) -> PipelineResult<()>;

    async fn fetch(&self) -> PipelineResult<Option<Delivery>>;

    async fn ack(&self, delivery_tag: u64) -> PipelineResult<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> PipelineResult<()>;
}

/// 媒体项状态变更事件，只携带媒体项 ID，接收方自行重新聚合快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub item_id: i64,
    pub timestamp: DateTime<Utc>,
}

impl TransitionEvent {
    pub fn new(item_id: i64) -> Self {
        Self {
            item_id,
            timestamp: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> PipelineResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(PipelineError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> PipelineResult<Self> {
        serde_json::from_slice(bytes).map_err(PipelineError::from)
    }
}

/// 跨进程广播状态变更
///
/// 写入端（调度器、执行端）发布，推送层所在的进程订阅。每个订阅者
/// 都收到全部事件；广播是尽力而为的，丢失的事件由客户端的
/// `request_status_update` 补齐。
#[async_trait]
pub trait TransitionBus: Send + Sync {
    async fn publish_transition(&self, event: &TransitionEvent) -> PipelineResult<()>;

    async fn subscribe_transitions(
        &self,
    ) -> PipelineResult<tokio::sync::mpsc::Receiver<TransitionEvent>>;
}
