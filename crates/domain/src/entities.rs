use chrono::{DateTime, Utc};
use mediaflow_errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 任务状态
///
/// PENDING 与 RUNNING 为活跃状态，SUCCESS / FAILURE / REVOKED 为终态，
/// RETRY 表示已安排重新投递、等待下一次执行。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
    Retry,
    Revoked,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Success,
        TaskStatus::Failure,
        TaskStatus::Retry,
        TaskStatus::Revoked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Retry => "RETRY",
            TaskStatus::Revoked => "REVOKED",
        }
    }

    /// 是否占用 (item_id, stage) 的活跃槽位
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "SUCCESS" => Ok(TaskStatus::Success),
            "FAILURE" => Ok(TaskStatus::Failure),
            "RETRY" => Ok(TaskStatus::Retry),
            "REVOKED" => Ok(TaskStatus::Revoked),
            _ => Err(PipelineError::validation_error(format!(
                "无效的任务状态: {s}"
            ))),
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for TaskStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        s.parse::<TaskStatus>()
            .map_err(|_| format!("Invalid task status: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Acquire,
    Audio,
    Transcribe,
    Analyze,
    Segment,
    Export,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Acquire => "acquire",
            Stage::Audio => "audio",
            Stage::Transcribe => "transcribe",
            Stage::Analyze => "analyze",
            Stage::Segment => "segment",
            Stage::Export => "export",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "acquire" => Ok(Stage::Acquire),
            "audio" => Ok(Stage::Audio),
            "transcribe" => Ok(Stage::Transcribe),
            "analyze" => Ok(Stage::Analyze),
            "segment" => Ok(Stage::Segment),
            "export" => Ok(Stage::Export),
            _ => Err(PipelineError::UnknownStage(s.to_string())),
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for Stage {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for Stage {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        s.parse::<Stage>()
            .map_err(|_| format!("Invalid stage: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for Stage {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 某个媒体项某个阶段的一次执行尝试
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub item_id: i64,
    pub stage: Stage,
    pub attempt: i32,
    pub broker_task_id: String,
    pub status: TaskStatus,
    pub progress: i32,
    pub message: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub input_data: Option<serde_json::Value>,
    pub output_data: Option<serde_json::Value>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// 判断陈旧程度时使用的参考时间
    ///
    /// RUNNING 看 started_at，PENDING 看 created_at，RETRY 看 updated_at，
    /// 终态看 completed_at。
    pub fn stale_reference(&self) -> DateTime<Utc> {
        match self.status {
            TaskStatus::Running => self.started_at.unwrap_or(self.updated_at),
            TaskStatus::Pending => self.created_at,
            TaskStatus::Retry => self.updated_at,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked => {
                self.completed_at.unwrap_or(self.updated_at)
            }
        }
    }

    pub fn entity_description(&self) -> String {
        format!(
            "任务 {} (媒体项 {}, 阶段 {}, 第 {} 次尝试)",
            self.id, self.item_id, self.stage, self.attempt
        )
    }
}

/// 新建任务的输入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub item_id: i64,
    pub stage: Stage,
    pub broker_task_id: String,
    pub input_data: Option<serde_json::Value>,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
}

impl NewTask {
    pub const DEFAULT_MAX_RETRIES: i32 = 3;

    pub fn new(item_id: i64, stage: Stage, broker_task_id: impl Into<String>) -> Self {
        Self {
            item_id,
            stage,
            broker_task_id: broker_task_id.into(),
            input_data: None,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
        }
    }

    pub fn with_input(mut self, input_data: serde_json::Value) -> Self {
        self.input_data = Some(input_data);
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries.max(0);
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// 生成第 `attempt` 次尝试的初始行（id 由存储分配）
    pub fn into_task(self, id: i64, attempt: i32) -> Task {
        Task {
            id,
            item_id: self.item_id,
            stage: self.stage,
            attempt,
            broker_task_id: self.broker_task_id,
            status: TaskStatus::Pending,
            progress: 0,
            message: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: self.max_retries,
            input_data: self.input_data,
            output_data: None,
            version: 0,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

/// 一次状态更新请求
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: TaskStatus,
    pub progress: Option<i32>,
    pub message: Option<String>,
    pub error_message: Option<String>,
    pub output_data: Option<serde_json::Value>,
    /// 写入 TaskLog.details 的附加信息
    pub details: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

impl StatusChange {
    pub fn to(status: TaskStatus) -> Self {
        Self {
            status,
            progress: None,
            message: None,
            error_message: None,
            output_data: None,
            details: None,
            at: Utc::now(),
        }
    }

    pub fn with_progress(mut self, progress: i32) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error_message: impl Into<String>) -> Self {
        self.error_message = Some(error_message.into());
        self
    }

    pub fn with_output(mut self, output_data: serde_json::Value) -> Self {
        self.output_data = Some(output_data);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }
}

/// 状态转换审计记录，只追加
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLog {
    pub id: i64,
    pub task_id: i64,
    pub old_status: Option<TaskStatus>,
    pub new_status: TaskStatus,
    pub message: Option<String>,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// 尚未落库的审计记录
#[derive(Debug, Clone, PartialEq)]
pub struct NewTaskLog {
    pub task_id: i64,
    pub old_status: Option<TaskStatus>,
    pub new_status: TaskStatus,
    pub message: Option<String>,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl NewTaskLog {
    pub fn created(task: &Task) -> Self {
        Self {
            task_id: task.id,
            old_status: None,
            new_status: task.status,
            message: Some(format!("第 {} 次尝试已创建", task.attempt)),
            details: None,
            created_at: task.created_at,
        }
    }

    pub fn transition(before: &Task, after: &Task, change: &StatusChange) -> Self {
        Self {
            task_id: after.id,
            old_status: Some(before.status),
            new_status: after.status,
            message: change
                .error_message
                .clone()
                .or_else(|| change.message.clone()),
            details: change.details.clone(),
            created_at: change.at,
        }
    }

    pub fn into_log(self, id: i64) -> TaskLog {
        TaskLog {
            id,
            task_id: self.task_id,
            old_status: self.old_status,
            new_status: self.new_status,
            message: self.message,
            details: self.details,
            created_at: self.created_at,
        }
    }
}
