use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mediaflow_errors::PipelineResult;
use std::sync::Arc;
use tracing::{debug, info};

use crate::entities::{NewTask, StatusChange, Task, TaskLog, TaskStatus};
use crate::progress::{aggregate, ItemSnapshot};
use crate::repositories::TaskRepository;
use crate::stage_graph::StageGraph;

/// 每次被接受的写入之后收到通知
#[async_trait]
pub trait TransitionListener: Send + Sync {
    async fn on_transition(&self, item_id: i64);
}

/// 任务登记表：存储之上唯一的写入路径
///
/// 工作节点回调、状态适配器和回收器都经过这里写入，
/// 每次写入成功后通知监听者（推送层）。
#[derive(Clone)]
pub struct TaskRegistry {
    repository: Arc<dyn TaskRepository>,
    graph: Arc<StageGraph>,
    listeners: Vec<Arc<dyn TransitionListener>>,
}

impl TaskRegistry {
    pub fn new(repository: Arc<dyn TaskRepository>, graph: StageGraph) -> Self {
        Self {
            repository,
            graph: Arc::new(graph),
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn TransitionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn repository(&self) -> Arc<dyn TaskRepository> {
        Arc::clone(&self.repository)
    }

    async fn notify(&self, item_id: i64) {
        for listener in &self.listeners {
            listener.on_transition(item_id).await;
        }
    }

    pub async fn create_task(&self, new_task: &NewTask) -> PipelineResult<Task> {
        let task = self.repository.create_task(new_task).await?;
        info!(
            task_id = task.id,
            item_id = task.item_id,
            stage = %task.stage,
            attempt = task.attempt,
            "创建任务"
        );
        self.notify(task.item_id).await;
        Ok(task)
    }

    pub async fn update_status(
        &self,
        task_id: i64,
        expected_version: i64,
        change: &StatusChange,
    ) -> PipelineResult<Task> {
        let task = self
            .repository
            .update_status(task_id, expected_version, change)
            .await?;
        debug!(
            task_id,
            item_id = task.item_id,
            status = %task.status,
            progress = task.progress,
            version = task.version,
            "任务状态已更新"
        );
        self.notify(task.item_id).await;
        Ok(task)
    }

    pub async fn get_task(&self, task_id: i64) -> PipelineResult<Option<Task>> {
        self.repository.get_task(task_id).await
    }

    pub async fn find_by_broker_id(&self, broker_task_id: &str) -> PipelineResult<Option<Task>> {
        self.repository.find_by_broker_id(broker_task_id).await
    }

    pub async fn get_tasks(&self, item_id: i64) -> PipelineResult<Vec<Task>> {
        self.repository.get_tasks(item_id).await
    }

    pub async fn get_stale(
        &self,
        status: TaskStatus,
        older_than: DateTime<Utc>,
        limit: Option<usize>,
    ) -> PipelineResult<Vec<Task>> {
        self.repository.get_stale(status, older_than, limit).await
    }

    pub async fn get_logs(&self, task_id: i64) -> PipelineResult<Vec<TaskLog>> {
        self.repository.get_logs(task_id).await
    }

    pub async fn purge(&self, task_id: i64) -> PipelineResult<()> {
        self.repository.purge(task_id).await
    }

    pub async fn purge_batch(&self, task_ids: &[i64]) -> PipelineResult<u64> {
        self.repository.purge_batch(task_ids).await
    }

    pub async fn delete_item(&self, item_id: i64) -> PipelineResult<u64> {
        let deleted = self.repository.delete_item(item_id).await?;
        info!(item_id, deleted, "删除媒体项的全部任务");
        self.notify(item_id).await;
        Ok(deleted)
    }

    pub async fn get_item_status(&self, item_id: i64) -> PipelineResult<ItemSnapshot> {
        let tasks = self.repository.get_tasks(item_id).await?;
        Ok(aggregate(item_id, &tasks, &self.graph))
    }
}
