use thiserror::Error;

/// 流水线错误类型定义
///
/// `Conflict` 与 `VersionMismatch` 是预期内的控制信号（"别人已经处理过了"），
/// 调用方不应把它们当作失败记录。
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },
    #[error("阶段 {stage} 已存在活跃任务: 媒体项 {item_id}")]
    Conflict { item_id: i64, stage: String },
    #[error("任务 {task_id} 版本不匹配: 期望 {expected}, 实际 {actual}")]
    VersionMismatch {
        task_id: i64,
        expected: i64,
        actual: i64,
    },
    #[error("任务 {task_id} 的状态转换无效: {from} -> {to}")]
    InvalidTransition {
        task_id: i64,
        from: String,
        to: String,
    },
    #[error("未知的流水线阶段: {0}")]
    UnknownStage(String),
    #[error("消息队列错误: {0}")]
    MessageQueue(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("连接传输错误: {0}")]
    Transport(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn task_not_found(id: i64) -> Self {
        Self::TaskNotFound { id }
    }
    pub fn conflict<S: Into<String>>(item_id: i64, stage: S) -> Self {
        Self::Conflict {
            item_id,
            stage: stage.into(),
        }
    }
    pub fn version_mismatch(task_id: i64, expected: i64, actual: i64) -> Self {
        Self::VersionMismatch {
            task_id,
            expected,
            actual,
        }
    }
    pub fn invalid_transition<F: ToString, T: ToString>(task_id: i64, from: F, to: T) -> Self {
        Self::InvalidTransition {
            task_id,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }

    /// 并发控制信号：调用方应视为"已被其他写入方处理"
    pub fn is_control_signal(&self) -> bool {
        matches!(
            self,
            PipelineError::Conflict { .. } | PipelineError::VersionMismatch { .. }
        )
    }
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, PipelineError::VersionMismatch { .. })
    }
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Internal(_) | PipelineError::Configuration(_)
        )
    }
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Database(_)
                | PipelineError::DatabaseOperation(_)
                | PipelineError::MessageQueue(_)
                | PipelineError::Transport(_)
        )
    }
    pub fn user_message(&self) -> &str {
        match self {
            PipelineError::TaskNotFound { .. } => "请求的任务不存在",
            PipelineError::Conflict { .. } => "该阶段已有正在进行的任务",
            PipelineError::VersionMismatch { .. } => "任务状态已被更新，请刷新后重试",
            PipelineError::InvalidTransition { .. } => "任务当前状态不允许该操作",
            PipelineError::UnknownStage(_) => "未知的处理阶段",
            PipelineError::ValidationError(_) => "输入数据验证失败",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests;
