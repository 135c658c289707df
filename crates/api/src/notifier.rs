use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, gauge};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mediaflow_config::NotifierConfig;
use mediaflow_domain::{
    aggregate, ItemSnapshot, PipelineError, PipelineResult, StageGraph, TaskRepository,
    TransitionBus, TransitionListener,
};

use crate::protocol::{ClientMessage, ServerMessage};

pub type ConnectionId = u64;

struct Connection {
    sender: mpsc::Sender<ServerMessage>,
    items: HashSet<i64>,
    last_seen: Instant,
}

#[derive(Default)]
struct Connections {
    by_id: HashMap<ConnectionId, Connection>,
    subscribers: HashMap<i64, HashSet<ConnectionId>>,
}

impl Connections {
    fn remove(&mut self, id: ConnectionId) -> bool {
        let Some(connection) = self.by_id.remove(&id) else {
            return false;
        };
        for item_id in connection.items {
            if let Some(subscribers) = self.subscribers.get_mut(&item_id) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    self.subscribers.remove(&item_id);
                }
            }
        }
        gauge!("mediaflow_notifier_connections").set(self.by_id.len() as f64);
        true
    }
}

/// 推送层
///
/// 每个客户端一条连接，连接上可以订阅多个媒体项。写入路径每次状态变更后
/// 调用 [`TransitionListener::on_transition`]，这里重新聚合快照并推给订阅者。
/// 出站通道有界，推送使用 `try_send`：慢连接或已关闭的连接直接驱逐，
/// 不会拖住写入路径。
///
/// 同一媒体项的“读快照再投递”在该项的门锁内串行执行，后投递的帧
/// 读到的状态不会比先投递的旧。
pub struct Notifier {
    repository: Arc<dyn TaskRepository>,
    graph: StageGraph,
    channel_capacity: usize,
    next_id: AtomicU64,
    connections: RwLock<Connections>,
    item_gates: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl Notifier {
    pub fn new(repository: Arc<dyn TaskRepository>, graph: StageGraph, channel_capacity: usize) -> Self {
        Self {
            repository,
            graph,
            channel_capacity: channel_capacity.max(1),
            next_id: AtomicU64::new(1),
            connections: RwLock::new(Connections::default()),
            item_gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(
        repository: Arc<dyn TaskRepository>,
        graph: StageGraph,
        config: &NotifierConfig,
    ) -> Self {
        Self::new(repository, graph, config.channel_capacity)
    }

    /// 登记一条新连接，返回连接 ID 和出站帧的接收端
    pub async fn register(&self) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.channel_capacity);

        let mut connections = self.connections.write().await;
        connections.by_id.insert(
            id,
            Connection {
                sender,
                items: HashSet::new(),
                last_seen: Instant::now(),
            },
        );
        gauge!("mediaflow_notifier_connections").set(connections.by_id.len() as f64);
        debug!("连接 {} 已登记", id);
        (id, receiver)
    }

    /// 订阅媒体项，并立即推送一份完整快照
    pub async fn subscribe(&self, connection: ConnectionId, item_id: i64) -> PipelineResult<()> {
        {
            let mut guard = self.connections.write().await;
            let state = &mut *guard;
            let Some(entry) = state.by_id.get_mut(&connection) else {
                return Err(PipelineError::validation_error(format!(
                    "连接 {connection} 不存在"
                )));
            };
            entry.items.insert(item_id);
            state.subscribers.entry(item_id).or_default().insert(connection);
        }
        debug!("连接 {} 订阅媒体项 {}", connection, item_id);

        self.with_item_gate(item_id, async {
            let snapshot = self.snapshot(item_id).await?;
            self.deliver(&[connection], ServerMessage::Snapshot { item_id, snapshot })
                .await;
            Ok::<_, PipelineError>(())
        })
        .await
    }

    pub async fn unsubscribe(&self, connection: ConnectionId, item_id: i64) {
        let mut guard = self.connections.write().await;
        let state = &mut *guard;
        if let Some(entry) = state.by_id.get_mut(&connection) {
            entry.items.remove(&item_id);
        }
        if let Some(subscribers) = state.subscribers.get_mut(&item_id) {
            subscribers.remove(&connection);
            if subscribers.is_empty() {
                state.subscribers.remove(&item_id);
            }
        }
    }

    /// 为连接的全部订阅重新拉取快照，返回推送的份数
    pub async fn request_status_update(&self, connection: ConnectionId) -> PipelineResult<usize> {
        let items: Vec<i64> = {
            let connections = self.connections.read().await;
            match connections.by_id.get(&connection) {
                Some(entry) => entry.items.iter().copied().collect(),
                None => {
                    return Err(PipelineError::validation_error(format!(
                        "连接 {connection} 不存在"
                    )))
                }
            }
        };

        let mut pushed = 0;
        for item_id in items {
            pushed += self
                .with_item_gate(item_id, async {
                    let snapshot = self.snapshot(item_id).await?;
                    Ok::<_, PipelineError>(
                        self.deliver(&[connection], ServerMessage::Snapshot { item_id, snapshot })
                            .await,
                    )
                })
                .await?;
        }
        Ok(pushed)
    }

    pub async fn disconnect(&self, connection: ConnectionId) {
        if self.connections.write().await.remove(connection) {
            debug!("连接 {} 已断开", connection);
        }
    }

    /// 任何入站帧都刷新连接的存活时间
    pub async fn touch(&self, connection: ConnectionId) {
        if let Some(entry) = self.connections.write().await.by_id.get_mut(&connection) {
            entry.last_seen = Instant::now();
        }
    }

    /// 处理一条客户端帧，失败时给该连接回一条 error 帧
    pub async fn handle_client_message(&self, connection: ConnectionId, message: ClientMessage) {
        self.touch(connection).await;

        let result = match message {
            ClientMessage::Subscribe { item_id } => self.subscribe(connection, item_id).await,
            ClientMessage::Unsubscribe { item_id } => {
                self.unsubscribe(connection, item_id).await;
                Ok(())
            }
            ClientMessage::RequestStatusUpdate => {
                self.request_status_update(connection).await.map(|_| ())
            }
            ClientMessage::Ping => {
                self.deliver(&[connection], ServerMessage::Pong).await;
                Ok(())
            }
            ClientMessage::Pong => Ok(()),
        };

        if let Err(e) = result {
            warn!("处理连接 {} 的消息失败: {}", connection, e);
            self.send_error(connection, e.to_string()).await;
        }
    }

    pub async fn send_error(&self, connection: ConnectionId, message: impl Into<String>) {
        self.deliver(
            &[connection],
            ServerMessage::Error {
                message: message.into(),
            },
        )
        .await;
    }

    /// 驱逐超过 `timeout` 没有入站帧的连接
    pub async fn evict_stale(&self, timeout: Duration) -> usize {
        let mut connections = self.connections.write().await;
        let stale: Vec<ConnectionId> = connections
            .by_id
            .iter()
            .filter(|(_, entry)| entry.last_seen.elapsed() >= timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            connections.remove(*id);
            counter!("mediaflow_notifier_evictions_total", "reason" => "heartbeat").increment(1);
            info!("连接 {} 心跳超时，已驱逐", id);
        }
        stale.len()
    }

    /// 向所有连接发送 ping
    pub async fn ping_all(&self) -> usize {
        let targets: Vec<ConnectionId> =
            self.connections.read().await.by_id.keys().copied().collect();
        let ping = ServerMessage::Ping {
            timestamp: Utc::now().timestamp_millis(),
        };
        self.deliver(&targets, ping).await
    }

    pub fn spawn_heartbeat(
        self: Arc<Self>,
        interval: Duration,
        timeout: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("心跳循环启动，间隔 {:?}，超时 {:?}", interval, timeout);
            let mut ticker = tokio::time::interval(interval);
            // 第一次 tick 立即返回
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("心跳循环停止");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = self.evict_stale(timeout).await;
                        let pinged = self.ping_all().await;
                        debug!("心跳: 驱逐 {} 条连接，ping {} 条", evicted, pinged);
                    }
                }
            }
        })
    }

    /// 订阅状态变更广播，每个事件按本地变更处理
    ///
    /// 写入发生在其他进程时，推送层只能从广播得知变更。订阅在返回前完成，
    /// 之后发布的事件不会丢。
    pub async fn spawn_relay(
        self: Arc<Self>,
        bus: Arc<dyn TransitionBus>,
        token: CancellationToken,
    ) -> PipelineResult<JoinHandle<()>> {
        let mut events = bus.subscribe_transitions().await?;
        info!("开始接收状态变更广播");

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("状态变更转发停止");
                        break;
                    }
                    event = events.recv() => {
                        let Some(event) = event else {
                            warn!("状态变更广播已关闭");
                            break;
                        };
                        counter!("mediaflow_notifier_relayed_total").increment(1);
                        self.on_transition(event.item_id).await;
                    }
                }
            }
        }))
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.by_id.len()
    }

    pub async fn subscriber_count(&self, item_id: i64) -> usize {
        self.connections
            .read()
            .await
            .subscribers
            .get(&item_id)
            .map_or(0, HashSet::len)
    }

    pub async fn subscriptions(&self, connection: ConnectionId) -> Vec<i64> {
        let connections = self.connections.read().await;
        let mut items: Vec<i64> = connections
            .by_id
            .get(&connection)
            .map(|entry| entry.items.iter().copied().collect())
            .unwrap_or_default();
        items.sort_unstable();
        items
    }

    pub async fn snapshot(&self, item_id: i64) -> PipelineResult<ItemSnapshot> {
        let tasks = self.repository.get_tasks(item_id).await?;
        Ok(aggregate(item_id, &tasks, &self.graph))
    }

    async fn lock_item(&self, item_id: i64) -> OwnedMutexGuard<()> {
        let gate = self.item_gates.lock().await.entry(item_id).or_default().clone();
        gate.lock_owned().await
    }

    async fn with_item_gate<T>(&self, item_id: i64, work: impl Future<Output = T>) -> T {
        let guard = self.lock_item(item_id).await;
        let output = work.await;
        drop(guard);

        let mut gates = self.item_gates.lock().await;
        if gates.get(&item_id).is_some_and(|gate| Arc::strong_count(gate) == 1) {
            gates.remove(&item_id);
        }
        output
    }

    /// 非阻塞投递，返回成功投递的连接数；满或已关闭的连接被驱逐
    async fn deliver(&self, targets: &[ConnectionId], message: ServerMessage) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let connections = self.connections.read().await;
            for id in targets {
                let Some(entry) = connections.by_id.get(id) else {
                    continue;
                };
                match entry.sender.try_send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => failed.push((*id, "backpressure")),
                    Err(TrySendError::Closed(_)) => failed.push((*id, "closed")),
                }
            }
        }

        if !failed.is_empty() {
            let mut connections = self.connections.write().await;
            for (id, reason) in failed {
                if connections.remove(id) {
                    counter!("mediaflow_notifier_evictions_total", "reason" => reason).increment(1);
                    warn!("连接 {} 无法接收推送 ({})，已驱逐", id, reason);
                }
            }
        }
        delivered
    }
}

#[async_trait]
impl TransitionListener for Notifier {
    async fn on_transition(&self, item_id: i64) {
        if !self.connections.read().await.subscribers.contains_key(&item_id) {
            return;
        }

        self.with_item_gate(item_id, async {
            // 拿到门锁后再取订阅者
            let targets: Vec<ConnectionId> =
                match self.connections.read().await.subscribers.get(&item_id) {
                    Some(subscribers) => subscribers.iter().copied().collect(),
                    None => return,
                };

            let snapshot = match self.snapshot(item_id).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("计算媒体项 {} 的快照失败，跳过推送: {}", item_id, e);
                    return;
                }
            };

            let delivered = self
                .deliver(&targets, ServerMessage::ProgressUpdate { item_id, snapshot })
                .await;
            counter!("mediaflow_notifier_pushes_total").increment(delivered as u64);
        })
        .await
    }
}
