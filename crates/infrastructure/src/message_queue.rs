use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*, types::FieldTable, BasicProperties, Channel, Connection, ConnectionProperties,
    ExchangeKind, Queue,
};
use mediaflow_config::BrokerConfig;
use mediaflow_domain::{
    BrokerClient, BrokerState, Delivery, Message, MessageType, StageMessage, TransitionBus,
    TransitionEvent,
};
use mediaflow_errors::{PipelineError, PipelineResult};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

const TRANSITION_BUFFER: usize = 256;

/// 本进程观察到的投递状态
///
/// RabbitMQ 本身不提供按任务查询的接口，`inspect` 只能回答本进程经手过的任务。
#[derive(Debug, Default)]
struct DeliveryLedger {
    states: HashMap<String, BrokerState>,
    in_flight: HashMap<u64, String>,
    revoked: HashSet<String>,
}

/// RabbitMQ消息代理实现
pub struct RabbitMqBroker {
    connection: Connection,
    channel: Arc<Mutex<Channel>>,
    config: BrokerConfig,
    ledger: Arc<Mutex<DeliveryLedger>>,
}

impl RabbitMqBroker {
    pub async fn new(config: BrokerConfig) -> PipelineResult<Self> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| PipelineError::MessageQueue(format!("连接RabbitMQ失败: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| PipelineError::MessageQueue(format!("创建通道失败: {e}")))?;

        info!("成功连接到RabbitMQ: {}", config.url);

        let broker = Self {
            connection,
            channel: Arc::new(Mutex::new(channel)),
            config,
            ledger: Arc::new(Mutex::new(DeliveryLedger::default())),
        };
        broker.initialize_queues().await?;
        Ok(broker)
    }

    async fn initialize_queues(&self) -> PipelineResult<()> {
        let channel = self.channel.lock().await;
        self.declare_queue(&channel, &self.config.stage_queue).await?;
        self.declare_queue(&channel, &self.config.control_queue).await?;
        channel
            .exchange_declare(
                &self.config.transition_exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                PipelineError::MessageQueue(format!(
                    "声明交换机 {} 失败: {e}",
                    self.config.transition_exchange
                ))
            })?;
        info!("所有队列初始化完成");
        Ok(())
    }

    async fn declare_queue(&self, channel: &Channel, queue_name: &str) -> PipelineResult<Queue> {
        let queue = channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                PipelineError::MessageQueue(format!("声明队列 {queue_name} 失败: {e}"))
            })?;

        debug!("队列 {} 声明成功", queue_name);
        Ok(queue)
    }

    async fn publish(&self, queue: &str, message: &Message) -> PipelineResult<()> {
        let payload = message.to_bytes()?;
        let channel = self.channel.lock().await;

        let confirm = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| {
                PipelineError::MessageQueue(format!("发布消息到队列 {queue} 失败: {e}"))
            })?;

        confirm
            .await
            .map_err(|e| PipelineError::MessageQueue(format!("消息发布确认失败: {e}")))?;

        debug!("消息已发布到队列: {}", queue);
        Ok(())
    }

    /// 每个订阅者一个独占的临时队列，连接断开后由服务端删除
    async fn bind_transition_queue(&self, channel: &Channel) -> PipelineResult<Queue> {
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| PipelineError::MessageQueue(format!("声明状态变更队列失败: {e}")))?;

        channel
            .queue_bind(
                queue.name().as_str(),
                &self.config.transition_exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                PipelineError::MessageQueue(format!(
                    "绑定队列到交换机 {} 失败: {e}",
                    self.config.transition_exchange
                ))
            })?;
        Ok(queue)
    }

    async fn settle(&self, delivery_tag: u64, state: BrokerState) {
        let mut ledger = self.ledger.lock().await;
        if let Some(broker_task_id) = ledger.in_flight.remove(&delivery_tag) {
            ledger.states.insert(broker_task_id, state);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn close(&self) -> PipelineResult<()> {
        self.connection
            .close(200, "正常关闭")
            .await
            .map_err(|e| PipelineError::MessageQueue(format!("关闭连接失败: {e}")))?;

        info!("RabbitMQ连接已关闭");
        Ok(())
    }
}

#[async_trait]
impl BrokerClient for RabbitMqBroker {
    async fn enqueue(&self, message: &StageMessage) -> PipelineResult<String> {
        let envelope = Message::stage_execution(message.clone());
        self.publish(&self.config.stage_queue, &envelope).await?;

        let mut ledger = self.ledger.lock().await;
        ledger.revoked.remove(&message.broker_task_id);
        ledger
            .states
            .insert(message.broker_task_id.clone(), BrokerState::Queued);
        Ok(message.broker_task_id.clone())
    }

    async fn inspect(&self, broker_task_id: &str) -> PipelineResult<Option<BrokerState>> {
        Ok(self.ledger.lock().await.states.get(broker_task_id).copied())
    }

    async fn revoke(&self, broker_task_id: &str) -> PipelineResult<()> {
        {
            let mut ledger = self.ledger.lock().await;
            ledger.revoked.insert(broker_task_id.to_string());
            ledger
                .states
                .insert(broker_task_id.to_string(), BrokerState::Cancelled);
        }
        self.publish(&self.config.control_queue, &Message::revoke(broker_task_id))
            .await
    }

    async fn fetch(&self) -> PipelineResult<Option<Delivery>> {
        loop {
            let fetched = {
                let channel = self.channel.lock().await;
                channel
                    .basic_get(&self.config.stage_queue, BasicGetOptions::default())
                    .await
                    .map_err(|e| {
                        PipelineError::MessageQueue(format!(
                            "从队列 {} 获取消息失败: {e}",
                            self.config.stage_queue
                        ))
                    })?
            };

            let Some(got) = fetched else {
                return Ok(None);
            };
            let delivery_tag = got.delivery.delivery_tag;
            let redelivered = got.delivery.redelivered;

            let message = match Message::from_bytes(&got.delivery.data) {
                Ok(message) => message,
                Err(e) => {
                    warn!("丢弃无法解析的消息 (tag={}): {}", delivery_tag, e);
                    self.nack(delivery_tag, false).await?;
                    continue;
                }
            };

            let broker_task_id = match &message.message_type {
                MessageType::StageExecution(stage) => stage.broker_task_id.clone(),
                MessageType::TaskControl(_) => {
                    self.ack(delivery_tag).await?;
                    continue;
                }
            };

            {
                let mut ledger = self.ledger.lock().await;
                if ledger.revoked.contains(&broker_task_id) {
                    drop(ledger);
                    debug!("任务 {} 已撤销，丢弃投递", broker_task_id);
                    self.ack(delivery_tag).await?;
                    continue;
                }
                ledger
                    .states
                    .insert(broker_task_id.clone(), BrokerState::Started);
                ledger.in_flight.insert(delivery_tag, broker_task_id);
            }

            return Ok(Some(Delivery {
                delivery_tag,
                redelivered,
                message,
            }));
        }
    }

    async fn ack(&self, delivery_tag: u64) -> PipelineResult<()> {
        {
            let channel = self.channel.lock().await;
            channel
                .basic_ack(delivery_tag, BasicAckOptions::default())
                .await
                .map_err(|e| PipelineError::MessageQueue(format!("确认消息失败: {e}")))?;
        }
        self.settle(delivery_tag, BrokerState::Completed).await;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> PipelineResult<()> {
        {
            let channel = self.channel.lock().await;
            channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        multiple: false,
                        requeue,
                    },
                )
                .await
                .map_err(|e| PipelineError::MessageQueue(format!("拒绝消息失败: {e}")))?;
        }
        let state = if requeue {
            BrokerState::Queued
        } else {
            BrokerState::Errored
        };
        self.settle(delivery_tag, state).await;
        Ok(())
    }
}

#[async_trait]
impl TransitionBus for RabbitMqBroker {
    async fn publish_transition(&self, event: &TransitionEvent) -> PipelineResult<()> {
        let payload = event.to_bytes()?;
        let channel = self.channel.lock().await;
        channel
            .basic_publish(
                &self.config.transition_exchange,
                "",
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| PipelineError::MessageQueue(format!("广播状态变更失败: {e}")))?;
        Ok(())
    }

    async fn subscribe_transitions(&self) -> PipelineResult<mpsc::Receiver<TransitionEvent>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| PipelineError::MessageQueue(format!("创建通道失败: {e}")))?;
        let queue = self.bind_transition_queue(&channel).await?;

        let mut consumer = channel
            .basic_consume(
                queue.name().as_str(),
                "mediaflow-transitions",
                BasicConsumeOptions {
                    no_ack: true,
                    exclusive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| PipelineError::MessageQueue(format!("创建消费者失败: {e}")))?;
        debug!("订阅状态变更，队列 {}", queue.name());

        let (sender, receiver) = mpsc::channel(TRANSITION_BUFFER);
        tokio::spawn(async move {
            // 通道随任务一起存活
            let _channel = channel;
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        warn!("状态变更消费中断: {}", e);
                        break;
                    }
                };
                match TransitionEvent::from_bytes(&delivery.data) {
                    Ok(event) => {
                        if sender.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("丢弃无法解析的状态变更: {}", e),
                }
            }
            debug!("状态变更转发结束");
        });
        Ok(receiver)
    }
}
