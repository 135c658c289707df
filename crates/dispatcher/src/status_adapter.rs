//! Broker Status Adapter
//!
//! 把消息代理的原生投递状态翻译成登记表上的状态转换。每次转换前都重新读取
//! 当前行，并在 `VersionMismatch` 时重做"读取-决策-写入"，因此对同一
//! `broker_task_id` 的重复信号是幂等的。

use std::collections::BTreeSet;
use std::sync::Arc;

use metrics::counter;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use mediaflow_domain::{
    BrokerState, ErrorClass, NewTask, PipelineResult, StageMessage, StatusChange, Task,
    TaskStatus,
};

use crate::stage_dispatcher::StageDispatcher;

/// "completed" 载荷的判定结果
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionKind {
    /// 真正的执行结果
    Result,
    /// 仅携带进度的中间心跳，任务保持 RUNNING
    Heartbeat {
        progress: Option<i32>,
        message: Option<String>,
    },
    /// 无法确定，按结果处理并标记人工复核
    Ambiguous { reason: String },
}

pub trait CompletionPolicy: Send + Sync {
    fn classify(&self, payload: &Value) -> CompletionKind;
}

/// 默认判定：字段恰好是 progress/stage/message 三元组时视为心跳
#[derive(Debug, Clone, Default)]
pub struct FieldSetCompletionPolicy;

impl FieldSetCompletionPolicy {
    const HEARTBEAT_FIELDS: [&'static str; 3] = ["message", "progress", "stage"];
}

impl CompletionPolicy for FieldSetCompletionPolicy {
    fn classify(&self, payload: &Value) -> CompletionKind {
        let Some(fields) = payload.as_object() else {
            return CompletionKind::Result;
        };

        let keys: BTreeSet<&str> = fields.keys().map(String::as_str).collect();
        let heartbeat: BTreeSet<&str> = Self::HEARTBEAT_FIELDS.into_iter().collect();

        if keys == heartbeat {
            let Some(progress) = fields.get("progress").and_then(Value::as_f64) else {
                return CompletionKind::Ambiguous {
                    reason: "心跳载荷中的 progress 不是数值".to_string(),
                };
            };
            return CompletionKind::Heartbeat {
                progress: Some(progress.round() as i32),
                message: fields
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            };
        }

        if keys.contains("progress") {
            let keys: Vec<&str> = keys.into_iter().collect();
            return CompletionKind::Ambiguous {
                reason: format!("载荷包含进度字段及其他字段: {}", keys.join(",")),
            };
        }

        CompletionKind::Result
    }
}

pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &str, declared: Option<ErrorClass>) -> ErrorClass;
}

/// 默认错误分类：优先采用执行器声明的类别，否则按关键字匹配，未知错误视为可恢复
#[derive(Debug, Clone, Default)]
pub struct KeywordErrorClassifier;

impl KeywordErrorClassifier {
    const NON_RECOVERABLE: [&'static str; 6] = [
        "invalid",
        "permission",
        "denied",
        "malformed",
        "unsupported",
        "not found",
    ];
    const RECOVERABLE: [&'static str; 5] = [
        "timeout",
        "time limit",
        "connection",
        "unavailable",
        "temporar",
    ];
}

impl ErrorClassifier for KeywordErrorClassifier {
    fn classify(&self, error: &str, declared: Option<ErrorClass>) -> ErrorClass {
        if let Some(class) = declared {
            return class;
        }

        let lowered = error.to_lowercase();
        let non_recoverable = Self::NON_RECOVERABLE.iter().any(|k| lowered.contains(k));
        let recoverable = Self::RECOVERABLE.iter().any(|k| lowered.contains(k));
        match (non_recoverable, recoverable) {
            (true, _) => ErrorClass::NonRecoverable,
            (false, true) => ErrorClass::Recoverable,
            (false, false) => {
                debug!("未识别的错误，按可恢复处理: {}", error);
                ErrorClass::Recoverable
            }
        }
    }
}

/// 来自消息代理或执行端的一次状态信号
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerSignal {
    pub state: BrokerState,
    pub payload: Option<Value>,
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,
}

impl BrokerSignal {
    pub fn new(state: BrokerState) -> Self {
        Self {
            state,
            payload: None,
            error: None,
            error_class: None,
        }
    }

    pub fn completed(payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::new(BrokerState::Completed)
        }
    }

    pub fn errored(error: impl Into<String>, class: Option<ErrorClass>) -> Self {
        Self {
            error: Some(error.into()),
            error_class: class,
            ..Self::new(BrokerState::Errored)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    /// 已写入一次状态转换
    Applied(Task),
    /// 信号与当前状态一致，无需写入
    Unchanged(Task),
    /// 任务已处于终态，信号被忽略
    Duplicate(Task),
    /// 登记表中没有该 broker_task_id
    Unknown,
}

impl SignalOutcome {
    pub fn task(&self) -> Option<&Task> {
        match self {
            SignalOutcome::Applied(task)
            | SignalOutcome::Unchanged(task)
            | SignalOutcome::Duplicate(task) => Some(task),
            SignalOutcome::Unknown => None,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, SignalOutcome::Applied(_))
    }
}

/// 投递到达时的认领结果
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    Execute(Task),
    Skip(&'static str),
}

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// 版本冲突时"读取-决策-写入"的最大轮数
    pub max_cas_attempts: usize,
    /// 阶段成功后自动派发下一阶段
    pub auto_advance: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            max_cas_attempts: 3,
            auto_advance: true,
        }
    }
}

#[derive(Debug)]
struct Decision {
    change: StatusChange,
    /// 先补记 RUNNING，之后还要继续处理同一信号
    intermediate: bool,
    redispatch: bool,
    ambiguous: Option<String>,
}

impl Decision {
    fn step(change: StatusChange) -> Self {
        Self {
            change,
            intermediate: false,
            redispatch: false,
            ambiguous: None,
        }
    }

    fn catch_up() -> Self {
        Self {
            intermediate: true,
            ..Self::step(StatusChange::to(TaskStatus::Running).with_message("补记开始执行"))
        }
    }
}

pub struct StatusAdapter {
    dispatcher: Arc<StageDispatcher>,
    completion_policy: Arc<dyn CompletionPolicy>,
    error_classifier: Arc<dyn ErrorClassifier>,
    config: AdapterConfig,
}

impl StatusAdapter {
    pub fn new(dispatcher: Arc<StageDispatcher>, config: AdapterConfig) -> Self {
        Self {
            dispatcher,
            completion_policy: Arc::new(FieldSetCompletionPolicy),
            error_classifier: Arc::new(KeywordErrorClassifier),
            config,
        }
    }

    pub fn with_completion_policy(mut self, policy: Arc<dyn CompletionPolicy>) -> Self {
        self.completion_policy = policy;
        self
    }

    pub fn with_error_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.error_classifier = classifier;
        self
    }

    pub fn dispatcher(&self) -> &Arc<StageDispatcher> {
        &self.dispatcher
    }

    /// 应用一次原生状态信号
    pub async fn apply(
        &self,
        broker_task_id: &str,
        signal: &BrokerSignal,
    ) -> PipelineResult<SignalOutcome> {
        let registry = self.dispatcher.registry();
        let mut conflicts = 0;

        loop {
            let Some(task) = registry.find_by_broker_id(broker_task_id).await? else {
                warn!("收到未登记任务的状态信号: {} ({})", broker_task_id, signal.state);
                return Ok(SignalOutcome::Unknown);
            };
            if task.is_terminal() {
                debug!(
                    "任务 {} 已处于 {}，忽略重复信号 {}",
                    task.id, task.status, signal.state
                );
                return Ok(SignalOutcome::Duplicate(task));
            }

            let Some(decision) = self.decide(&task, signal) else {
                return Ok(SignalOutcome::Unchanged(task));
            };

            match registry
                .update_status(task.id, task.version, &decision.change)
                .await
            {
                Ok(updated) => {
                    counter!("mediaflow_task_transitions_total", "status" => updated.status.as_str())
                        .increment(1);
                    if decision.intermediate {
                        continue;
                    }
                    self.after_transition(&updated, &decision).await;
                    return Ok(SignalOutcome::Applied(updated));
                }
                Err(e) if e.is_version_mismatch() && conflicts + 1 < self.config.max_cas_attempts => {
                    conflicts += 1;
                    debug!("任务 {} 版本冲突，重新读取: {}", task.id, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn complete(
        &self,
        broker_task_id: &str,
        payload: Value,
    ) -> PipelineResult<SignalOutcome> {
        self.apply(broker_task_id, &BrokerSignal::completed(payload))
            .await
    }

    pub async fn fail(
        &self,
        broker_task_id: &str,
        error: &str,
        class: Option<ErrorClass>,
    ) -> PipelineResult<SignalOutcome> {
        self.apply(broker_task_id, &BrokerSignal::errored(error, class))
            .await
    }

    /// 执行器主动上报进度（RUNNING→RUNNING）
    pub async fn report_progress(
        &self,
        broker_task_id: &str,
        progress: i32,
        message: Option<String>,
    ) -> PipelineResult<SignalOutcome> {
        let registry = self.dispatcher.registry();
        let mut conflicts = 0;

        loop {
            let Some(task) = registry.find_by_broker_id(broker_task_id).await? else {
                return Ok(SignalOutcome::Unknown);
            };
            if task.is_terminal() {
                return Ok(SignalOutcome::Duplicate(task));
            }
            if task.status != TaskStatus::Running {
                return Ok(SignalOutcome::Unchanged(task));
            }

            let mut change = StatusChange::to(TaskStatus::Running).with_progress(progress);
            if let Some(message) = &message {
                change = change.with_message(message.clone());
            }

            match registry.update_status(task.id, task.version, &change).await {
                Ok(updated) => return Ok(SignalOutcome::Applied(updated)),
                Err(e) if e.is_version_mismatch() && conflicts + 1 < self.config.max_cas_attempts => {
                    conflicts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 投递到达时认领任务
    ///
    /// 登记表里没有该消息时按消息补建任务。重投（`redelivered`）的 RUNNING
    /// 任务视为原执行者已丢失，由当前 worker 接管。
    pub async fn claim(
        &self,
        message: &StageMessage,
        redelivered: bool,
    ) -> PipelineResult<Claim> {
        let registry = self.dispatcher.registry();
        let mut conflicts = 0;

        loop {
            let task = match registry.find_by_broker_id(&message.broker_task_id).await? {
                Some(task) => task,
                None => {
                    info!(
                        "登记表中没有 {}，按消息补建任务",
                        message.broker_task_id
                    );
                    let mut new_task =
                        NewTask::new(message.item_id, message.stage, &message.broker_task_id)
                            .with_max_retries(self.dispatcher.default_max_retries());
                    if let Some(input) = &message.input_data {
                        new_task = new_task.with_input(input.clone());
                    }
                    match registry.create_task(&new_task).await {
                        Ok(task) => task,
                        Err(e) if e.is_control_signal() => {
                            debug!("补建任务冲突: {}", e);
                            return Ok(Claim::Skip("该阶段已有活跃任务"));
                        }
                        Err(e) => return Err(e),
                    }
                }
            };

            match task.status {
                TaskStatus::Pending | TaskStatus::Retry => {
                    let change = StatusChange::to(TaskStatus::Running).with_message("开始执行");
                    match registry.update_status(task.id, task.version, &change).await {
                        Ok(running) => return Ok(Claim::Execute(running)),
                        Err(e)
                            if e.is_version_mismatch()
                                && conflicts + 1 < self.config.max_cas_attempts =>
                        {
                            conflicts += 1;
                        }
                        Err(e) if e.is_control_signal() => {
                            return Ok(Claim::Skip("任务已被其他执行者认领"))
                        }
                        Err(e) => return Err(e),
                    }
                }
                TaskStatus::Running if redelivered => {
                    info!("任务 {} 被重新投递，接管执行", task.id);
                    return Ok(Claim::Execute(task));
                }
                TaskStatus::Running => return Ok(Claim::Skip("任务正在执行")),
                TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked => {
                    return Ok(Claim::Skip("任务已结束"))
                }
            }
        }
    }

    /// 查询消息代理上的原生状态并应用，供运维对账使用
    pub async fn reconcile(&self, task: &Task) -> PipelineResult<SignalOutcome> {
        let broker = self.dispatcher.broker();
        match broker.inspect(&task.broker_task_id).await? {
            Some(state) => {
                let signal = match state {
                    BrokerState::Errored => BrokerSignal::errored("消息代理报告执行出错", None),
                    other => BrokerSignal::new(other),
                };
                self.apply(&task.broker_task_id, &signal).await
            }
            None => {
                debug!("消息代理不记得任务 {}", task.broker_task_id);
                Ok(SignalOutcome::Unchanged(task.clone()))
            }
        }
    }

    fn decide(&self, task: &Task, signal: &BrokerSignal) -> Option<Decision> {
        let waiting = matches!(task.status, TaskStatus::Pending | TaskStatus::Retry);

        match signal.state {
            BrokerState::Queued => None,
            BrokerState::Started => waiting.then(|| {
                Decision::step(StatusChange::to(TaskStatus::Running).with_message("开始执行"))
            }),
            BrokerState::Cancelled => Some(Decision::step(
                StatusChange::to(TaskStatus::Revoked).with_message("消息代理已取消投递"),
            )),
            _ if waiting && signal.state == BrokerState::RetryScheduled => None,
            _ if waiting => Some(Decision::catch_up()),
            BrokerState::Completed => Some(self.decide_completion(signal.payload.as_ref())),
            BrokerState::Errored => {
                let error = signal.error.as_deref().unwrap_or("未知错误");
                let class = self.error_classifier.classify(error, signal.error_class);
                Some(self.decide_error(task, error, class, true))
            }
            BrokerState::RetryScheduled => {
                let error = signal.error.as_deref().unwrap_or("消息代理已安排重试");
                Some(self.decide_error(task, error, ErrorClass::Recoverable, false))
            }
        }
    }

    fn decide_completion(&self, payload: Option<&Value>) -> Decision {
        let payload = payload.cloned().unwrap_or(Value::Null);

        match self.completion_policy.classify(&payload) {
            CompletionKind::Heartbeat { progress, message } => {
                let mut change = StatusChange::to(TaskStatus::Running);
                if let Some(progress) = progress {
                    change = change.with_progress(progress);
                }
                if let Some(message) = message {
                    change = change.with_message(message);
                }
                Decision::step(change)
            }
            CompletionKind::Result => Decision::step(success_change(payload)),
            CompletionKind::Ambiguous { reason } => {
                let change = success_change(payload)
                    .with_details(json!({"operator_review": true, "reason": reason}));
                Decision {
                    ambiguous: Some(reason),
                    ..Decision::step(change)
                }
            }
        }
    }

    fn decide_error(
        &self,
        task: &Task,
        error: &str,
        class: ErrorClass,
        redispatch: bool,
    ) -> Decision {
        let details = json!({"error_class": class.to_string()});
        if class.is_recoverable() && task.can_retry() {
            Decision {
                redispatch,
                ..Decision::step(
                    StatusChange::to(TaskStatus::Retry)
                        .with_error(error)
                        .with_details(details),
                )
            }
        } else {
            Decision::step(
                StatusChange::to(TaskStatus::Failure)
                    .with_error(error)
                    .with_details(details),
            )
        }
    }

    async fn after_transition(&self, task: &Task, decision: &Decision) {
        if let Some(reason) = &decision.ambiguous {
            warn!(
                operator_review = true,
                task_id = task.id,
                broker_task_id = %task.broker_task_id,
                reason = %reason,
                "完成载荷含义不明确，已按执行结果处理"
            );
            counter!("mediaflow_ambiguous_completions_total").increment(1);
        }

        match task.status {
            TaskStatus::Retry if decision.redispatch => {
                if let Err(e) = self.dispatcher.redispatch(task).await {
                    warn!("任务 {} 重新发布失败，等待回收器处理: {}", task.id, e);
                }
            }
            TaskStatus::Failure => {
                warn!(
                    "任务 {} ({}) 最终失败: {}",
                    task.id,
                    task.stage,
                    task.error_message.as_deref().unwrap_or("")
                );
            }
            TaskStatus::Success if self.config.auto_advance => {
                if let Err(e) = self.dispatcher.advance(task).await {
                    warn!("任务 {} 成功后派发下一阶段失败: {}", task.id, e);
                }
            }
            _ => {}
        }
    }
}

fn success_change(payload: Value) -> StatusChange {
    let change = StatusChange::to(TaskStatus::Success).with_message("执行完成");
    if payload.is_null() {
        change
    } else {
        change.with_output(payload)
    }
}
