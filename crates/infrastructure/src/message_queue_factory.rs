use async_trait::async_trait;
use mediaflow_config::{BrokerConfig, BrokerType};
use mediaflow_domain::{BrokerClient, TransitionBus, TransitionEvent, TransitionListener};
use mediaflow_errors::PipelineResult;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{InMemoryBroker, RabbitMqBroker};

/// 同一个代理连接的两个视角：任务队列和状态变更广播
#[derive(Clone)]
pub struct BrokerHandles {
    pub client: Arc<dyn BrokerClient>,
    pub transitions: Arc<dyn TransitionBus>,
}

pub struct BrokerFactory;

impl BrokerFactory {
    pub async fn create(config: &BrokerConfig) -> PipelineResult<Arc<dyn BrokerClient>> {
        Ok(Self::connect(config).await?.client)
    }

    pub async fn connect(config: &BrokerConfig) -> PipelineResult<BrokerHandles> {
        debug!("Creating broker with type: {:?}", config.r#type);

        match config.r#type {
            BrokerType::Rabbitmq => {
                info!("Initializing RabbitMQ broker");
                let rabbitmq = Arc::new(RabbitMqBroker::new(config.clone()).await?);
                Ok(BrokerHandles {
                    client: rabbitmq.clone(),
                    transitions: rabbitmq,
                })
            }
            BrokerType::InMemory => {
                info!("Initializing in-memory broker");
                let broker = Arc::new(InMemoryBroker::new());
                Ok(BrokerHandles {
                    client: broker.clone(),
                    transitions: broker,
                })
            }
        }
    }
}

/// 把登记表的状态变更发布到广播上，推送层可以在另一个进程
pub struct TransitionPublisher {
    bus: Arc<dyn TransitionBus>,
}

impl TransitionPublisher {
    pub fn new(bus: Arc<dyn TransitionBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl TransitionListener for TransitionPublisher {
    async fn on_transition(&self, item_id: i64) {
        if let Err(e) = self.bus.publish_transition(&TransitionEvent::new(item_id)).await {
            warn!("发布媒体项 {} 的状态变更失败: {}", item_id, e);
        }
    }
}
