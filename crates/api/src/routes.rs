use axum::{routing::get, Router};
use std::sync::Arc;

use mediaflow_domain::TaskRegistry;

use crate::handlers::{
    health::health_check,
    items::{get_item_status, get_task_logs, list_item_tasks},
    ws::ws_handler,
};
use crate::notifier::Notifier;

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub registry: TaskRegistry,
    pub notifier: Arc<Notifier>,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        // 健康检查
        .route("/health", get(health_check))
        // 推送通道
        .route("/ws", get(ws_handler))
        // 拉取接口
        .route("/api/items/{item_id}/status", get(get_item_status))
        .route("/api/items/{item_id}/tasks", get(list_item_tasks))
        .route("/api/tasks/{task_id}/logs", get(get_task_logs))
        .with_state(state)
}
