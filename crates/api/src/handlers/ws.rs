use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::notifier::Notifier;
use crate::protocol::ClientMessage;
use crate::routes::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state.notifier))
}

/// 一条 WebSocket 连接的完整生命周期
///
/// 写端独占一个协程，从 Notifier 的出站通道取帧发送；通道关闭（连接被驱逐）
/// 时写端结束。读端在当前协程里解析客户端帧。
async fn serve_socket(socket: WebSocket, notifier: Arc<Notifier>) {
    let (connection, mut outbound) = notifier.register().await;
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!("序列化推送帧失败: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("连接 {} 读取失败: {}", connection, e);
                break;
            }
        };

        match frame {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(message) => notifier.handle_client_message(connection, message).await,
                Err(e) => {
                    notifier.touch(connection).await;
                    notifier
                        .send_error(connection, format!("无法解析的消息: {e}"))
                        .await;
                }
            },
            Message::Close(_) => break,
            _ => notifier.touch(connection).await,
        }
    }

    notifier.disconnect(connection).await;
    writer.abort();
}
