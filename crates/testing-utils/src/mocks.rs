//! In-memory mock implementations of the repository and broker ports
//!
//! The mock repository enforces the same rules as the SQLite store:
//! version compare-and-swap, the transition table and the one-active-task
//! constraint per (item_id, stage).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mediaflow_domain::{
    BrokerClient, BrokerState, Delivery, Message, NewTask, NewTaskLog, StageMessage,
    StatusChange, Task, TaskLog, TaskRepository, TaskStatus, TransitionListener,
};
use mediaflow_errors::{PipelineError, PipelineResult};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct RepositoryState {
    tasks: BTreeMap<i64, Task>,
    logs: Vec<TaskLog>,
    next_task_id: i64,
    next_log_id: i64,
}

impl RepositoryState {
    fn append_log(&mut self, entry: NewTaskLog) {
        self.next_log_id += 1;
        let id = self.next_log_id;
        self.logs.push(entry.into_log(id));
    }

    fn remove_task(&mut self, task_id: i64) -> bool {
        let removed = self.tasks.remove(&task_id).is_some();
        if removed {
            self.logs.retain(|log| log.task_id != task_id);
        }
        removed
    }
}

/// Mock implementation of TaskRepository for testing
#[derive(Debug, Clone, Default)]
pub struct MockTaskRepository {
    state: Arc<Mutex<RepositoryState>>,
}

impl MockTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed rows as-is, bypassing the write path (backdated timestamps etc.)
    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        let repository = Self::new();
        for task in tasks {
            repository.insert_task(task);
        }
        repository
    }

    pub fn insert_task(&self, task: Task) {
        let mut state = self.state.lock().unwrap();
        state.next_task_id = state.next_task_id.max(task.id);
        state.tasks.insert(task.id, task);
    }

    pub fn count(&self) -> usize {
        self.state.lock().unwrap().tasks.len()
    }

    pub fn log_count(&self) -> usize {
        self.state.lock().unwrap().logs.len()
    }

    pub fn get_all_tasks(&self) -> Vec<Task> {
        self.state.lock().unwrap().tasks.values().cloned().collect()
    }

    pub fn snapshot(&self, task_id: i64) -> Option<Task> {
        self.state.lock().unwrap().tasks.get(&task_id).cloned()
    }

    pub fn clear(&self) {
        *self.state.lock().unwrap() = RepositoryState::default();
    }
}

#[async_trait]
impl TaskRepository for MockTaskRepository {
    async fn create_task(&self, new_task: &NewTask) -> PipelineResult<Task> {
        let mut state = self.state.lock().unwrap();

        let siblings: Vec<&Task> = state
            .tasks
            .values()
            .filter(|t| t.item_id == new_task.item_id && t.stage == new_task.stage)
            .collect();
        if siblings.iter().any(|t| t.is_active()) {
            return Err(PipelineError::conflict(
                new_task.item_id,
                new_task.stage.as_str(),
            ));
        }
        let attempt = siblings.iter().map(|t| t.attempt).max().unwrap_or(0) + 1;

        state.next_task_id += 1;
        let task = new_task.clone().into_task(state.next_task_id, attempt);
        state.tasks.insert(task.id, task.clone());
        state.append_log(NewTaskLog::created(&task));
        Ok(task)
    }

    async fn get_task(&self, task_id: i64) -> PipelineResult<Option<Task>> {
        Ok(self.snapshot(task_id))
    }

    async fn find_by_broker_id(&self, broker_task_id: &str) -> PipelineResult<Option<Task>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tasks
            .values()
            .filter(|t| t.broker_task_id == broker_task_id)
            .max_by_key(|t| t.id)
            .cloned())
    }

    async fn update_status(
        &self,
        task_id: i64,
        expected_version: i64,
        change: &StatusChange,
    ) -> PipelineResult<Task> {
        let mut state = self.state.lock().unwrap();
        let current = state
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| PipelineError::task_not_found(task_id))?;

        if current.version != expected_version {
            return Err(PipelineError::version_mismatch(
                task_id,
                expected_version,
                current.version,
            ));
        }

        let next = current.apply(change)?;
        if next.is_active() && !current.is_active() {
            let occupied = state.tasks.values().any(|t| {
                t.id != task_id && t.item_id == next.item_id && t.stage == next.stage && t.is_active()
            });
            if occupied {
                return Err(PipelineError::conflict(next.item_id, next.stage.as_str()));
            }
        }

        state.tasks.insert(task_id, next.clone());
        state.append_log(NewTaskLog::transition(&current, &next, change));
        Ok(next)
    }

    async fn get_tasks(&self, item_id: i64) -> PipelineResult<Vec<Task>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tasks
            .values()
            .filter(|t| t.item_id == item_id)
            .cloned()
            .collect())
    }

    async fn get_stale(
        &self,
        status: TaskStatus,
        older_than: DateTime<Utc>,
        limit: Option<usize>,
    ) -> PipelineResult<Vec<Task>> {
        let state = self.state.lock().unwrap();
        let mut stale: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.status == status && t.stale_reference() < older_than)
            .cloned()
            .collect();
        stale.sort_by_key(|t| (t.stale_reference(), t.id));
        if let Some(limit) = limit {
            stale.truncate(limit);
        }
        Ok(stale)
    }

    async fn get_logs(&self, task_id: i64) -> PipelineResult<Vec<TaskLog>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .logs
            .iter()
            .filter(|log| log.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn purge(&self, task_id: i64) -> PipelineResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.tasks.get(&task_id).map(|t| t.status) {
            Some(status) if status.is_terminal() => {
                state.remove_task(task_id);
                Ok(())
            }
            Some(status) => Err(PipelineError::validation_error(format!(
                "任务 {} 处于 {} 状态，不能清理",
                task_id, status
            ))),
            None => Err(PipelineError::task_not_found(task_id)),
        }
    }

    async fn purge_batch(&self, task_ids: &[i64]) -> PipelineResult<u64> {
        let mut state = self.state.lock().unwrap();
        let purgeable: Vec<i64> = task_ids
            .iter()
            .copied()
            .filter(|id| state.tasks.get(id).is_some_and(|t| t.status.is_terminal()))
            .collect();
        let removed = purgeable
            .into_iter()
            .filter(|id| state.remove_task(*id))
            .count();
        Ok(removed as u64)
    }

    async fn delete_item(&self, item_id: i64) -> PipelineResult<u64> {
        let mut state = self.state.lock().unwrap();
        let ids: Vec<i64> = state
            .tasks
            .values()
            .filter(|t| t.item_id == item_id)
            .map(|t| t.id)
            .collect();
        for id in &ids {
            state.remove_task(*id);
        }
        Ok(ids.len() as u64)
    }
}

#[derive(Debug, Default)]
struct BrokerRecord {
    enqueued: Vec<StageMessage>,
    revoked: Vec<String>,
    states: HashMap<String, BrokerState>,
    ready: VecDeque<Delivery>,
    acked: Vec<u64>,
    nacked: Vec<(u64, bool)>,
    next_tag: u64,
    fail_enqueue: bool,
}

/// Recording broker: keeps every call for assertions and lets tests
/// script the native state returned by `inspect`.
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    record: Arc<Mutex<BrokerRecord>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueued(&self) -> Vec<StageMessage> {
        self.record.lock().unwrap().enqueued.clone()
    }

    pub fn revoked(&self) -> Vec<String> {
        self.record.lock().unwrap().revoked.clone()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.record.lock().unwrap().acked.clone()
    }

    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.record.lock().unwrap().nacked.clone()
    }

    pub fn set_state(&self, broker_task_id: &str, state: BrokerState) {
        self.record
            .lock()
            .unwrap()
            .states
            .insert(broker_task_id.to_string(), state);
    }

    /// Make every following `enqueue` fail with a message queue error
    pub fn fail_enqueue(&self, fail: bool) {
        self.record.lock().unwrap().fail_enqueue = fail;
    }

    /// Put a message straight onto the consume side, returns its delivery tag
    pub fn push_delivery(&self, message: StageMessage, redelivered: bool) -> u64 {
        let mut record = self.record.lock().unwrap();
        record.next_tag += 1;
        let delivery_tag = record.next_tag;
        record.ready.push_back(Delivery {
            delivery_tag,
            redelivered,
            message: Message::stage_execution(message),
        });
        delivery_tag
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn enqueue(&self, message: &StageMessage) -> PipelineResult<String> {
        let mut record = self.record.lock().unwrap();
        if record.fail_enqueue {
            return Err(PipelineError::MessageQueue("broker unavailable".to_string()));
        }
        record
            .states
            .insert(message.broker_task_id.clone(), BrokerState::Queued);
        record.enqueued.push(message.clone());
        Ok(message.broker_task_id.clone())
    }

    async fn inspect(&self, broker_task_id: &str) -> PipelineResult<Option<BrokerState>> {
        Ok(self.record.lock().unwrap().states.get(broker_task_id).copied())
    }

    async fn revoke(&self, broker_task_id: &str) -> PipelineResult<()> {
        let mut record = self.record.lock().unwrap();
        record.revoked.push(broker_task_id.to_string());
        record
            .states
            .insert(broker_task_id.to_string(), BrokerState::Cancelled);
        Ok(())
    }

    async fn fetch(&self) -> PipelineResult<Option<Delivery>> {
        Ok(self.record.lock().unwrap().ready.pop_front())
    }

    async fn ack(&self, delivery_tag: u64) -> PipelineResult<()> {
        self.record.lock().unwrap().acked.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> PipelineResult<()> {
        self.record.lock().unwrap().nacked.push((delivery_tag, requeue));
        Ok(())
    }
}

/// Collects the item ids the write path reports
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    items: Arc<Mutex<Vec<i64>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<i64> {
        self.items.lock().unwrap().clone()
    }

    pub fn distinct_items(&self) -> HashSet<i64> {
        self.items().into_iter().collect()
    }
}

#[async_trait]
impl TransitionListener for RecordingListener {
    async fn on_transition(&self, item_id: i64) {
        self.items.lock().unwrap().push(item_id);
    }
}
