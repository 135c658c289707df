//! Test data builders for creating test entities
//!
//! Builders start from a freshly created PENDING row and let tests shape
//! status, progress and timestamps directly.

use chrono::{DateTime, Duration, Utc};
use mediaflow_domain::{NewTask, Stage, StageMessage, Task, TaskStatus};
use uuid::Uuid;

/// Builder for creating test Task entities
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new() -> Self {
        let broker_task_id = Uuid::new_v4().to_string();
        Self {
            task: NewTask::new(1, Stage::Acquire, broker_task_id).into_task(1, 1),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.task.id = id;
        self
    }

    pub fn with_item(mut self, item_id: i64) -> Self {
        self.task.item_id = item_id;
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.task.stage = stage;
        self
    }

    pub fn with_attempt(mut self, attempt: i32) -> Self {
        self.task.attempt = attempt;
        self
    }

    pub fn with_broker_id(mut self, broker_task_id: &str) -> Self {
        self.task.broker_task_id = broker_task_id.to_string();
        self
    }

    /// Sets the status together with the timestamps a real transition would leave
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        let now = Utc::now();
        self.task.status = status;
        match status {
            TaskStatus::Running => self.task.started_at = Some(now),
            TaskStatus::Success => {
                self.task.started_at.get_or_insert(now);
                self.task.completed_at = Some(now);
                self.task.progress = 100;
            }
            TaskStatus::Failure | TaskStatus::Revoked => self.task.completed_at = Some(now),
            TaskStatus::Pending | TaskStatus::Retry => {}
        }
        self
    }

    pub fn with_progress(mut self, progress: i32) -> Self {
        self.task.progress = progress;
        self
    }

    pub fn with_retries(mut self, retry_count: i32, max_retries: i32) -> Self {
        self.task.retry_count = retry_count;
        self.task.max_retries = max_retries;
        self
    }

    pub fn with_error(mut self, error_message: &str) -> Self {
        self.task.error_message = Some(error_message.to_string());
        self
    }

    pub fn with_input(mut self, input_data: serde_json::Value) -> Self {
        self.task.input_data = Some(input_data);
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.task.version = version;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.task.created_at = at;
        self.task.updated_at = at;
        self
    }

    pub fn started_ago(mut self, ago: Duration) -> Self {
        self.task.started_at = Some(Utc::now() - ago);
        self
    }

    pub fn completed_ago(mut self, ago: Duration) -> Self {
        self.task.completed_at = Some(Utc::now() - ago);
        self
    }

    pub fn updated_ago(mut self, ago: Duration) -> Self {
        self.task.updated_at = Utc::now() - ago;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for stage execution messages
pub struct StageMessageBuilder {
    message: StageMessage,
}

impl StageMessageBuilder {
    pub fn new(item_id: i64, stage: Stage) -> Self {
        let task = NewTask::new(item_id, stage, Uuid::new_v4().to_string()).into_task(0, 1);
        Self {
            message: StageMessage::for_task(&task),
        }
    }

    pub fn for_task(task: &Task) -> Self {
        Self {
            message: StageMessage::for_task(task),
        }
    }

    pub fn with_broker_id(mut self, broker_task_id: &str) -> Self {
        self.message.broker_task_id = broker_task_id.to_string();
        self
    }

    pub fn with_input(mut self, input_data: serde_json::Value) -> Self {
        self.message.input_data = Some(input_data);
        self
    }

    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.message.eta = Some(eta);
        self
    }

    pub fn build(self) -> StageMessage {
        self.message
    }
}
