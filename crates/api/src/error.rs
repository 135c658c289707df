use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mediaflow_domain::PipelineError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("流水线错误: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("未找到资源: {0}")]
    NotFound(String),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("内部服务器错误: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message, error_type) = match &self {
            ApiError::Pipeline(PipelineError::TaskNotFound { id }) => (
                StatusCode::NOT_FOUND,
                format!("任务 ID {} 不存在", id),
                "TASK_NOT_FOUND",
            ),
            ApiError::Pipeline(e @ PipelineError::Conflict { .. })
            | ApiError::Pipeline(e @ PipelineError::VersionMismatch { .. }) => {
                (StatusCode::CONFLICT, e.user_message().to_string(), "CONFLICT")
            }
            ApiError::Pipeline(e @ PipelineError::InvalidTransition { .. }) => (
                StatusCode::CONFLICT,
                e.to_string(),
                "INVALID_TRANSITION",
            ),
            ApiError::Pipeline(PipelineError::UnknownStage(stage)) => (
                StatusCode::BAD_REQUEST,
                format!("未知的处理阶段: {}", stage),
                "UNKNOWN_STAGE",
            ),
            ApiError::Pipeline(PipelineError::ValidationError(msg)) => (
                StatusCode::BAD_REQUEST,
                format!("数据验证失败: {}", msg),
                "VALIDATION_ERROR",
            ),
            ApiError::Pipeline(e) => {
                tracing::error!("请求处理失败: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    e.user_message().to_string(),
                    "INTERNAL_ERROR",
                )
            }
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                format!("请求的资源不存在: {}", what),
                "NOT_FOUND",
            ),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                format!("请求参数错误: {}", msg),
                "BAD_REQUEST",
            ),
            ApiError::Internal(msg) => {
                tracing::error!("内部错误: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "系统内部错误".to_string(),
                    "INTERNAL_ERROR",
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "type": error_type,
                "code": status.as_u16(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}
