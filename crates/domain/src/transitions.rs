//! 任务状态机
//!
//! 所有状态写入都先经过 [`Task::apply`]：它按转换表校验目标状态，
//! 并计算出新行（进度、时间戳、重试计数、版本号）。存储层只负责
//! 用版本号做比较交换，不再重复业务规则。

use crate::entities::{StatusChange, Task, TaskStatus};
use mediaflow_errors::{PipelineError, PipelineResult};

impl TaskStatus {
    /// 转换表（不含重试次数判断，见 [`Task::can_transition_to`]）
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (Pending, Running) | (Pending, Failure) | (Pending, Revoked) => true,
            (Running, Running)
            | (Running, Success)
            | (Running, Failure)
            | (Running, Retry)
            | (Running, Revoked) => true,
            (Retry, Running) | (Retry, Failure) | (Retry, Revoked) => true,
            (Failure, Retry) | (Failure, Revoked) => true,
            (Success, Revoked) => true,
            _ => false,
        }
    }
}

impl Task {
    /// 在转换表之上叠加重试次数限制
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        if to == TaskStatus::Retry && !self.can_retry() {
            return false;
        }
        self.status.can_transition_to(to)
    }

    /// 计算一次状态更新之后的新行，非法转换返回 `InvalidTransition` 且不修改原行
    pub fn apply(&self, change: &StatusChange) -> PipelineResult<Task> {
        let to = change.status;
        if !self.can_transition_to(to) {
            return Err(PipelineError::invalid_transition(self.id, self.status, to));
        }

        let mut next = self.clone();
        next.status = to;

        next.progress = match to {
            TaskStatus::Success => 100,
            _ => {
                let requested = change.progress.unwrap_or(self.progress).clamp(0, 100);
                requested.max(self.progress)
            }
        };

        if let Some(message) = &change.message {
            next.message = Some(message.clone());
        }
        if let Some(error_message) = &change.error_message {
            next.error_message = Some(error_message.clone());
        }
        if let Some(output) = &change.output_data {
            next.output_data = Some(output.clone());
        }

        if to == TaskStatus::Running && self.status != TaskStatus::Running {
            next.started_at = Some(change.at);
        }
        match to {
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked => {
                next.completed_at = Some(change.at);
            }
            TaskStatus::Retry => {
                next.completed_at = None;
                next.retry_count = self.retry_count + 1;
            }
            TaskStatus::Pending | TaskStatus::Running => {}
        }

        next.version = self.version + 1;
        next.updated_at = change.at;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{NewTask, Stage};
    use chrono::{Duration, Utc};

    fn task(status: TaskStatus) -> Task {
        let mut task = NewTask::new(1, Stage::Transcribe, "broker-1").into_task(7, 1);
        task.status = status;
        task
    }

    #[test]
    fn test_transition_table() {
        use TaskStatus::*;
        let allowed = [
            (Pending, Running),
            (Pending, Failure),
            (Pending, Revoked),
            (Running, Running),
            (Running, Success),
            (Running, Failure),
            (Running, Retry),
            (Running, Revoked),
            (Retry, Running),
            (Retry, Failure),
            (Retry, Revoked),
            (Failure, Retry),
            (Failure, Revoked),
            (Success, Revoked),
        ];
        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_revoked_is_final() {
        let revoked = task(TaskStatus::Revoked);
        for to in TaskStatus::ALL {
            assert!(revoked.apply(&StatusChange::to(to)).is_err());
        }
    }

    #[test]
    fn test_invalid_transition_leaves_row_untouched() {
        let pending = task(TaskStatus::Pending);
        let before = pending.clone();
        let err = pending
            .apply(&StatusChange::to(TaskStatus::Success))
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { task_id: 7, .. }));
        assert_eq!(pending, before);
    }

    #[test]
    fn test_running_sets_started_at_and_version() {
        let pending = task(TaskStatus::Pending);
        let at = Utc::now();
        let running = pending
            .apply(&StatusChange::to(TaskStatus::Running).at(at))
            .unwrap();
        assert_eq!(running.started_at, Some(at));
        assert_eq!(running.version, 1);
        assert_eq!(running.updated_at, at);

        // 进度心跳不改变 started_at
        let later = at + Duration::seconds(30);
        let heartbeat = running
            .apply(&StatusChange::to(TaskStatus::Running).with_progress(40).at(later))
            .unwrap();
        assert_eq!(heartbeat.started_at, Some(at));
        assert_eq!(heartbeat.progress, 40);
        assert_eq!(heartbeat.version, 2);
    }

    #[test]
    fn test_progress_is_clamped_and_monotonic() {
        let mut running = task(TaskStatus::Running);
        running.progress = 60;

        let lower = running
            .apply(&StatusChange::to(TaskStatus::Running).with_progress(20))
            .unwrap();
        assert_eq!(lower.progress, 60);

        let over = running
            .apply(&StatusChange::to(TaskStatus::Running).with_progress(250))
            .unwrap();
        assert_eq!(over.progress, 100);

        let done = running.apply(&StatusChange::to(TaskStatus::Success)).unwrap();
        assert_eq!(done.progress, 100);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn test_retry_increments_count_and_clears_completion() {
        let mut failed = task(TaskStatus::Failure);
        failed.completed_at = Some(Utc::now());
        failed.error_message = Some("connection reset".to_string());

        let retry = failed.apply(&StatusChange::to(TaskStatus::Retry)).unwrap();
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.completed_at, None);
        assert_eq!(retry.error_message.as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_retry_refused_when_exhausted() {
        let mut running = task(TaskStatus::Running);
        running.retry_count = 3;
        running.max_retries = 3;
        assert!(!running.can_transition_to(TaskStatus::Retry));
        let err = running.apply(&StatusChange::to(TaskStatus::Retry)).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
        assert!(running.can_transition_to(TaskStatus::Failure));
    }
}
