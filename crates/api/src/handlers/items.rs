use axum::{
    extract::{Path, State},
    response::IntoResponse,
};
use mediaflow_domain::PipelineError;

use crate::{error::ApiResult, response::success, routes::AppState};

/// 拉取媒体项的整体快照，供不使用 WebSocket 的客户端轮询
pub async fn get_item_status(
    State(state): State<AppState>,
    Path(item_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let snapshot = state.registry.get_item_status(item_id).await?;
    Ok(success(snapshot))
}

/// 媒体项的全部任务行，按阶段和尝试次数排列
pub async fn list_item_tasks(
    State(state): State<AppState>,
    Path(item_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let mut tasks = state.registry.get_tasks(item_id).await?;
    let graph = state.registry.graph();
    tasks.sort_by_key(|t| (graph.position(t.stage), t.attempt));
    Ok(success(tasks))
}

pub async fn get_task_logs(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    if state.registry.get_task(task_id).await?.is_none() {
        return Err(PipelineError::task_not_found(task_id).into());
    }
    let logs = state.registry.get_logs(task_id).await?;
    Ok(success(logs))
}
