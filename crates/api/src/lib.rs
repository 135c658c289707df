//! # Mediaflow API
//!
//! 进度推送与查询的 HTTP 层：
//!
//! - `GET /ws`：WebSocket 推送通道，协议见 [`protocol`]
//! - `GET /api/items/{item_id}/status`：整体快照的拉取接口
//! - `GET /api/items/{item_id}/tasks`、`GET /api/tasks/{task_id}/logs`：任务行与审计日志
//! - `GET /health`
//!
//! [`Notifier`] 同时是任务登记表的状态变更监听者，写入路径每次成功更新后
//! 都会把新的快照推给订阅了该媒体项的连接。

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod notifier;
pub mod protocol;
pub mod response;
pub mod routes;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tracing::info;

use mediaflow_config::ApiConfig;
use mediaflow_domain::{PipelineError, PipelineResult};

pub use error::{ApiError, ApiResult};
pub use notifier::{ConnectionId, Notifier};
pub use protocol::{ClientMessage, ServerMessage};
pub use routes::{create_routes, AppState};

use middleware::{cors_layer, request_logging, trace_layer};

pub fn create_app(state: AppState, api_config: &ApiConfig) -> Router {
    let router = create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    );

    if api_config.cors_enabled {
        router.layer(cors_layer(api_config))
    } else {
        router
    }
}

/// 监听 `bind_address` 提供服务，令牌取消后优雅退出
pub async fn serve(app: Router, bind_address: &str, token: CancellationToken) -> PipelineResult<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .map_err(|e| PipelineError::Transport(format!("无法监听 {bind_address}: {e}")))?;
    info!("API服务监听 {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .map_err(|e| PipelineError::Transport(format!("API服务异常退出: {e}")))?;

    info!("API服务已停止");
    Ok(())
}
