use async_trait::async_trait;
use mediaflow_domain::{
    BrokerClient, BrokerState, Delivery, Message, MessageType, StageMessage, TransitionBus,
    TransitionEvent,
};
use mediaflow_errors::PipelineResult;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const TRANSITION_BUFFER: usize = 256;

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<(Message, bool)>,
    unacked: HashMap<u64, Message>,
    states: HashMap<String, BrokerState>,
    revoked: HashSet<String>,
    next_tag: u64,
    watchers: Vec<mpsc::Sender<TransitionEvent>>,
}

/// 内存消息代理实现
///
/// 单进程嵌入式部署使用。语义与 RabbitMQ 实现一致：延迟确认，
/// `nack(requeue = true)` 把消息放回队首并标记为重投。
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<QueueState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        info!("创建内存消息代理");
        Self::default()
    }

    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn unacked_len(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    /// 模拟连接断开：所有未确认的投递回到队列并标记为重投
    pub async fn recover(&self) {
        let mut state = self.state.lock().await;
        let mut pending: Vec<(u64, Message)> = state.unacked.drain().collect();
        pending.sort_by_key(|(tag, _)| *tag);
        for (_, message) in pending.into_iter().rev() {
            if let Some(stage) = message.as_stage_message() {
                state
                    .states
                    .insert(stage.broker_task_id.clone(), BrokerState::Queued);
            }
            state.ready.push_front((message, true));
        }
    }
}

fn message_task_id(message: &Message) -> Option<String> {
    match &message.message_type {
        MessageType::StageExecution(stage) => Some(stage.broker_task_id.clone()),
        MessageType::TaskControl(_) => None,
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn enqueue(&self, message: &StageMessage) -> PipelineResult<String> {
        let mut state = self.state.lock().await;
        state.revoked.remove(&message.broker_task_id);
        state
            .states
            .insert(message.broker_task_id.clone(), BrokerState::Queued);
        state
            .ready
            .push_back((Message::stage_execution(message.clone()), false));
        drop(state);

        debug!("消息已入队: {}", message.broker_task_id);
        Ok(message.broker_task_id.clone())
    }

    async fn inspect(&self, broker_task_id: &str) -> PipelineResult<Option<BrokerState>> {
        Ok(self.state.lock().await.states.get(broker_task_id).copied())
    }

    async fn revoke(&self, broker_task_id: &str) -> PipelineResult<()> {
        let mut state = self.state.lock().await;
        state.revoked.insert(broker_task_id.to_string());
        state
            .states
            .insert(broker_task_id.to_string(), BrokerState::Cancelled);
        state
            .ready
            .retain(|(message, _)| message_task_id(message).as_deref() != Some(broker_task_id));
        Ok(())
    }

    async fn fetch(&self) -> PipelineResult<Option<Delivery>> {
        let mut state = self.state.lock().await;
        while let Some((message, redelivered)) = state.ready.pop_front() {
            let Some(id) = message_task_id(&message) else {
                continue;
            };
            if state.revoked.contains(&id) {
                continue;
            }

            state.next_tag += 1;
            let delivery_tag = state.next_tag;
            state.states.insert(id, BrokerState::Started);
            state.unacked.insert(delivery_tag, message.clone());
            return Ok(Some(Delivery {
                delivery_tag,
                redelivered,
                message,
            }));
        }
        Ok(None)
    }

    async fn ack(&self, delivery_tag: u64) -> PipelineResult<()> {
        let mut state = self.state.lock().await;
        if let Some(message) = state.unacked.remove(&delivery_tag) {
            if let Some(id) = message_task_id(&message) {
                if !state.revoked.contains(&id) {
                    state.states.insert(id, BrokerState::Completed);
                }
            }
        }
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> PipelineResult<()> {
        let mut state = self.state.lock().await;
        let Some(message) = state.unacked.remove(&delivery_tag) else {
            return Ok(());
        };
        let id = message_task_id(&message);

        if requeue {
            if let Some(id) = id {
                state.states.insert(id, BrokerState::Queued);
            }
            state.ready.push_front((message, true));
        } else if let Some(id) = id {
            state.states.insert(id, BrokerState::Errored);
        }
        Ok(())
    }
}

#[async_trait]
impl TransitionBus for InMemoryBroker {
    async fn publish_transition(&self, event: &TransitionEvent) -> PipelineResult<()> {
        let mut state = self.state.lock().await;
        state.watchers.retain(|watcher| match watcher.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("状态变更订阅者积压，丢弃媒体项 {} 的事件", event.item_id);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        Ok(())
    }

    async fn subscribe_transitions(&self) -> PipelineResult<mpsc::Receiver<TransitionEvent>> {
        let (sender, receiver) = mpsc::channel(TRANSITION_BUFFER);
        self.state.lock().await.watchers.push(sender);
        Ok(receiver)
    }
}
