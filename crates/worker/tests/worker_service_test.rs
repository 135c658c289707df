use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use mediaflow_dispatcher::*;
use mediaflow_domain::*;
use mediaflow_testing_utils::*;
use mediaflow_worker::*;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
enum Behaviour {
    Succeed(Value),
    Fail(StageError),
    ReportThenSucceed,
    /// 一直等到被取消
    WaitForCancel,
    /// 无视取消
    Hang,
    Sleep(Duration),
}

#[derive(Default)]
struct Counters {
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

struct ScriptedExecutor {
    behaviour: Behaviour,
    counters: Arc<Counters>,
}

impl ScriptedExecutor {
    fn new(behaviour: Behaviour) -> (Arc<Self>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (
            Arc::new(Self {
                behaviour,
                counters: counters.clone(),
            }),
            counters,
        )
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        context: StageContext,
        reporter: ProgressReporter,
    ) -> Result<Value, StageError> {
        self.counters.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(active, Ordering::SeqCst);

        let result = match self.behaviour.clone() {
            Behaviour::Succeed(output) => Ok(output),
            Behaviour::Fail(error) => Err(error),
            Behaviour::ReportThenSucceed => {
                reporter.report(50, Some("处理中".to_string())).await.ok();
                Ok(json!({"frames": 1200}))
            }
            Behaviour::WaitForCancel => {
                context.cancelled().await;
                Err(StageError::recoverable("cancelled"))
            }
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            }
            Behaviour::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(json!({"item": context.item_id()}))
            }
        };

        self.counters.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct Harness {
    service: Arc<WorkerService>,
    adapter: Arc<StatusAdapter>,
    repo: MockTaskRepository,
    broker: MockBroker,
}

fn options() -> WorkerOptions {
    WorkerOptions {
        worker_id: "worker-test".to_string(),
        max_concurrent_tasks: 4,
        soft_time_limit: Duration::from_secs(5),
        hard_time_limit: Duration::from_secs(10),
        poll_interval: Duration::from_millis(10),
    }
}

fn harness(executors: ExecutorRegistry, options: WorkerOptions) -> Harness {
    let (registry, repo, _listener) = TestEnv::registry();
    let broker = MockBroker::new();
    let dispatcher = Arc::new(StageDispatcher::new(
        registry,
        Arc::new(broker.clone()),
        RetryPolicy::default(),
    ));
    let adapter = Arc::new(StatusAdapter::new(
        dispatcher,
        AdapterConfig {
            auto_advance: false,
            ..AdapterConfig::default()
        },
    ));
    let service = Arc::new(WorkerService::new(
        Arc::new(broker.clone()),
        adapter.clone(),
        executors,
        options,
    ));
    Harness {
        service,
        adapter,
        repo,
        broker,
    }
}

fn single(stage: Stage, behaviour: Behaviour) -> (ExecutorRegistry, Arc<Counters>) {
    let (executor, counters) = ScriptedExecutor::new(behaviour);
    (ExecutorRegistry::new().with(stage, executor), counters)
}

impl Harness {
    /// 派发并把消息放到消费端
    async fn deliver(&self, item_id: i64, stage: Stage) -> (Task, u64) {
        let task = self
            .adapter
            .dispatcher()
            .dispatch(item_id, stage, None)
            .await
            .unwrap();
        let tag = self
            .broker
            .push_delivery(StageMessage::for_task(&task), false);
        (task, tag)
    }

    fn start(&self) -> (CancellationToken, JoinHandle<()>) {
        let token = CancellationToken::new();
        let handle = self.service.clone().spawn(token.clone());
        (token, handle)
    }

    async fn wait_acked(&self, tag: u64) -> bool {
        let broker = self.broker.clone();
        TestEnv::wait_for(
            || {
                let broker = broker.clone();
                async move { broker.acked().contains(&tag) }
            },
            Duration::from_secs(3),
        )
        .await
    }

    fn task(&self, id: i64) -> Task {
        self.repo.snapshot(id).unwrap()
    }
}

#[tokio::test]
async fn test_successful_execution_completes_then_acks() -> Result<()> {
    let (executors, counters) = single(Stage::Acquire, Behaviour::Succeed(json!({"path": "raw/1.mp4"})));
    let h = harness(executors, options());
    let (task, tag) = h.deliver(1, Stage::Acquire).await;

    let (token, handle) = h.start();
    assert!(h.wait_acked(tag).await, "消息应当被确认");

    let done = h.task(task.id);
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.output_data, Some(json!({"path": "raw/1.mp4"})));
    assert_eq!(counters.calls.load(Ordering::SeqCst), 1);
    assert!(h.broker.nacked().is_empty());

    token.cancel();
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn test_progress_reports_are_recorded() -> Result<()> {
    let (executors, _) = single(Stage::Segment, Behaviour::ReportThenSucceed);
    let h = harness(executors, options());
    let (task, tag) = h.deliver(2, Stage::Segment).await;

    let (token, handle) = h.start();
    assert!(h.wait_acked(tag).await);

    let logs = h.repo.get_logs(task.id).await?;
    assert!(logs.iter().any(|log| {
        log.old_status == Some(TaskStatus::Running)
            && log.new_status == TaskStatus::Running
            && log.message.as_deref() == Some("处理中")
    }));
    assert_eq!(h.task(task.id).status, TaskStatus::Success);

    token.cancel();
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn test_recoverable_error_schedules_retry() -> Result<()> {
    let (executors, _) = single(
        Stage::Audio,
        Behaviour::Fail(StageError::recoverable("connection reset by peer")),
    );
    let h = harness(executors, options());
    let (task, tag) = h.deliver(3, Stage::Audio).await;

    let (token, handle) = h.start();
    assert!(h.wait_acked(tag).await);

    let retrying = h.task(task.id);
    assert_eq!(retrying.status, TaskStatus::Retry);
    assert_eq!(retrying.retry_count, 1);
    // 首次派发 + 退避后的重新发布
    let enqueued = h.broker.enqueued();
    assert_eq!(enqueued.len(), 2);
    assert!(enqueued[1].eta.is_some());

    token.cancel();
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn test_non_recoverable_error_fails_task() -> Result<()> {
    let (executors, _) = single(
        Stage::Transcribe,
        Behaviour::Fail(StageError::non_recoverable("audio track missing")),
    );
    let h = harness(executors, options());
    let (task, tag) = h.deliver(4, Stage::Transcribe).await;

    let (token, handle) = h.start();
    assert!(h.wait_acked(tag).await);

    let failed = h.task(task.id);
    assert_eq!(failed.status, TaskStatus::Failure);
    assert_eq!(failed.error_message.as_deref(), Some("audio track missing"));
    assert_eq!(h.broker.enqueued().len(), 1);

    token.cancel();
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn test_stage_without_executor_fails() -> Result<()> {
    let (executors, _) = single(Stage::Acquire, Behaviour::Succeed(Value::Null));
    let h = harness(executors, options());
    let (task, tag) = h.deliver(5, Stage::Export).await;

    let (token, handle) = h.start();
    assert!(h.wait_acked(tag).await);

    let failed = h.task(task.id);
    assert_eq!(failed.status, TaskStatus::Failure);
    assert!(failed
        .error_message
        .unwrap()
        .contains("no executor registered"));

    token.cancel();
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn test_soft_time_limit_cancels_and_retries() -> Result<()> {
    let (executors, _) = single(Stage::Analyze, Behaviour::WaitForCancel);
    let h = harness(
        executors,
        WorkerOptions {
            soft_time_limit: Duration::from_millis(50),
            hard_time_limit: Duration::from_secs(2),
            ..options()
        },
    );
    let (task, tag) = h.deliver(6, Stage::Analyze).await;

    let (token, handle) = h.start();
    assert!(h.wait_acked(tag).await);

    let retrying = h.task(task.id);
    assert_eq!(retrying.status, TaskStatus::Retry);
    assert_eq!(retrying.error_message.as_deref(), Some(SOFT_TIME_LIMIT_ERROR));

    token.cancel();
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn test_hard_time_limit_aborts_execution() -> Result<()> {
    let (executors, _) = single(Stage::Segment, Behaviour::Hang);
    let h = harness(
        executors,
        WorkerOptions {
            soft_time_limit: Duration::from_millis(20),
            hard_time_limit: Duration::from_millis(80),
            ..options()
        },
    );
    let (task, tag) = h.deliver(7, Stage::Segment).await;

    let (token, handle) = h.start();
    assert!(h.wait_acked(tag).await);
    assert_eq!(
        h.task(task.id).error_message.as_deref(),
        Some(HARD_TIME_LIMIT_ERROR)
    );

    token.cancel();
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn test_message_with_future_eta_is_held() -> Result<()> {
    let (executors, counters) = single(Stage::Acquire, Behaviour::Succeed(json!({"ok": true})));
    let h = harness(executors, options());

    let task = h.adapter.dispatcher().dispatch(8, Stage::Acquire, None).await?;
    let message = StageMessage::for_task(&task)
        .with_eta(Utc::now() + chrono::Duration::milliseconds(300));
    let tag = h.broker.push_delivery(message, false);

    let (token, handle) = h.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.task(task.id).status, TaskStatus::Pending);
    assert_eq!(counters.calls.load(Ordering::SeqCst), 0);
    assert!(!h.broker.acked().contains(&tag));

    assert!(h.wait_acked(tag).await);
    assert_eq!(h.task(task.id).status, TaskStatus::Success);

    token.cancel();
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn test_delayed_messages_do_not_block_ready_ones() -> Result<()> {
    let (executors, counters) = single(Stage::Transcribe, Behaviour::Succeed(json!({"ok": true})));
    let h = harness(
        executors,
        WorkerOptions {
            max_concurrent_tasks: 1,
            ..options()
        },
    );

    // 两条重试消息要 30 秒后才到期，占满并发上限也不应挡住后面的消息
    let mut delayed = Vec::new();
    for item_id in 20..22 {
        let task = h
            .adapter
            .dispatcher()
            .dispatch(item_id, Stage::Transcribe, None)
            .await?;
        let message = StageMessage::for_task(&task)
            .with_eta(Utc::now() + chrono::Duration::seconds(30));
        delayed.push((task, h.broker.push_delivery(message, false)));
    }
    let (ready, tag) = h.deliver(22, Stage::Transcribe).await;

    let (token, handle) = h.start();
    assert!(h.wait_acked(tag).await, "到期的消息应当立即执行");
    assert_eq!(h.task(ready.id).status, TaskStatus::Success);
    assert_eq!(counters.calls.load(Ordering::SeqCst), 1);
    for (task, tag) in &delayed {
        assert_eq!(h.task(task.id).status, TaskStatus::Pending);
        assert!(!h.broker.acked().contains(tag));
    }

    // 停止时暂存的消息退回队列
    token.cancel();
    handle.await?;
    let nacked = h.broker.nacked();
    for (_, tag) in &delayed {
        assert!(nacked.contains(&(*tag, true)), "暂存的消息应当退回队列");
    }
    Ok(())
}

#[tokio::test]
async fn test_duplicate_delivery_of_running_task_is_skipped() -> Result<()> {
    let (executors, counters) = single(Stage::Audio, Behaviour::Succeed(Value::Null));
    let h = harness(executors, options());

    let (task, first) = h.deliver(9, Stage::Audio).await;
    // 其他 worker 已在执行
    h.adapter
        .claim(&StageMessage::for_task(&task), false)
        .await?;

    let (token, handle) = h.start();
    assert!(h.wait_acked(first).await);
    assert_eq!(counters.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.task(task.id).status, TaskStatus::Running);

    token.cancel();
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn test_redelivered_running_task_is_taken_over() -> Result<()> {
    let (executors, counters) = single(Stage::Audio, Behaviour::Succeed(json!({"wav": "a.wav"})));
    let h = harness(executors, options());

    let task = h.adapter.dispatcher().dispatch(10, Stage::Audio, None).await?;
    h.adapter
        .claim(&StageMessage::for_task(&task), false)
        .await?;
    let tag = h.broker.push_delivery(StageMessage::for_task(&task), true);

    let (token, handle) = h.start();
    assert!(h.wait_acked(tag).await);
    assert_eq!(counters.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.task(task.id).status, TaskStatus::Success);

    token.cancel();
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn test_concurrency_is_bounded() -> Result<()> {
    let (executors, counters) = single(
        Stage::Acquire,
        Behaviour::Sleep(Duration::from_millis(60)),
    );
    let h = harness(
        executors,
        WorkerOptions {
            max_concurrent_tasks: 2,
            ..options()
        },
    );

    let mut tags = Vec::new();
    for item_id in 1..=5 {
        let (_, tag) = h.deliver(item_id, Stage::Acquire).await;
        tags.push(tag);
    }

    let (token, handle) = h.start();
    for tag in tags {
        assert!(h.wait_acked(tag).await);
    }
    assert_eq!(counters.calls.load(Ordering::SeqCst), 5);
    assert!(counters.peak.load(Ordering::SeqCst) <= 2);
    assert!(h
        .repo
        .get_all_tasks()
        .iter()
        .all(|t| t.status == TaskStatus::Success));

    token.cancel();
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_requeues_in_flight_message() -> Result<()> {
    let (executors, counters) = single(Stage::Export, Behaviour::WaitForCancel);
    let h = harness(executors, options());
    let (task, tag) = h.deliver(11, Stage::Export).await;

    let (token, handle) = h.start();
    let started = TestEnv::wait_for(
        || {
            let counters = counters.clone();
            async move { counters.calls.load(Ordering::SeqCst) == 1 }
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(started);

    token.cancel();
    tokio::time::timeout(Duration::from_secs(3), handle).await??;

    assert_eq!(h.broker.nacked(), vec![(tag, true)]);
    assert!(h.broker.acked().is_empty());
    // 行保持 RUNNING，重投后由接手的 worker 继续
    assert_eq!(h.task(task.id).status, TaskStatus::Running);
    Ok(())
}
