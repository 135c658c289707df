use mediaflow_domain::ItemSnapshot;
use serde::{Deserialize, Serialize};

/// 客户端发来的帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { item_id: i64 },
    Unsubscribe { item_id: i64 },
    RequestStatusUpdate,
    Ping,
    Pong,
}

/// 推送给客户端的帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// 订阅或主动拉取时的完整快照
    Snapshot { item_id: i64, snapshot: ItemSnapshot },
    /// 状态变更后的推送
    ProgressUpdate { item_id: i64, snapshot: ItemSnapshot },
    Ping { timestamp: i64 },
    Pong,
    Error { message: String },
}

impl ServerMessage {
    pub fn item_id(&self) -> Option<i64> {
        match self {
            ServerMessage::Snapshot { item_id, .. }
            | ServerMessage::ProgressUpdate { item_id, .. } => Some(*item_id),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> Option<&ItemSnapshot> {
        match self {
            ServerMessage::Snapshot { snapshot, .. }
            | ServerMessage::ProgressUpdate { snapshot, .. } => Some(snapshot),
            _ => None,
        }
    }
}
