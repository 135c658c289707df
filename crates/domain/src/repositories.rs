use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mediaflow_errors::PipelineResult;

use crate::entities::{NewTask, StatusChange, Task, TaskLog, TaskStatus};

/// 任务存储，任务与审计记录的唯一持有者
///
/// 所有状态写入都经过 `update_status` 的版本比较交换；
/// 同一 (item_id, stage) 至多一条 PENDING/RUNNING 记录由存储层保证。
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 新建 PENDING 任务，attempt 取该阶段已有最大值加一；已有活跃任务时返回 `Conflict`
    async fn create_task(&self, new_task: &NewTask) -> PipelineResult<Task>;

    async fn get_task(&self, task_id: i64) -> PipelineResult<Option<Task>>;

    async fn find_by_broker_id(&self, broker_task_id: &str) -> PipelineResult<Option<Task>>;

    /// 版本号不一致时返回 `VersionMismatch`，非法转换返回 `InvalidTransition`，均不修改数据
    async fn update_status(
        &self,
        task_id: i64,
        expected_version: i64,
        change: &StatusChange,
    ) -> PipelineResult<Task>;

    /// 按创建顺序返回
    async fn get_tasks(&self, item_id: i64) -> PipelineResult<Vec<Task>>;

    /// 参考时间早于 `older_than` 的任务，参考时间见 [`Task::stale_reference`]
    async fn get_stale(
        &self,
        status: TaskStatus,
        older_than: DateTime<Utc>,
        limit: Option<usize>,
    ) -> PipelineResult<Vec<Task>>;

    /// 按创建顺序返回
    async fn get_logs(&self, task_id: i64) -> PipelineResult<Vec<TaskLog>>;

    /// 物理删除任务及其审计记录
    async fn purge(&self, task_id: i64) -> PipelineResult<()>;

    async fn purge_batch(&self, task_ids: &[i64]) -> PipelineResult<u64>;

    /// 删除媒体项的全部任务及审计记录，返回删除的任务数
    async fn delete_item(&self, item_id: i64) -> PipelineResult<u64>;
}
