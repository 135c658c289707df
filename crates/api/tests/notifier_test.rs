#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use mediaflow_api::{ClientMessage, Notifier, ServerMessage};
    use mediaflow_domain::{
        CurrentStage, NewTask, OverallStatus, PipelineResult, Stage, StageGraph, StatusChange,
        Task, TaskLog, TaskRegistry, TaskRepository, TaskStatus,
    };
    use mediaflow_infrastructure::{InMemoryBroker, TransitionPublisher};
    use mediaflow_testing_utils::{MockTaskRepository, TaskBuilder, TestEnv};
    use tokio::sync::mpsc::Receiver;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    fn setup(capacity: usize) -> (Arc<Notifier>, TaskRegistry, MockTaskRepository) {
        let repo = MockTaskRepository::new();
        let notifier = Arc::new(Notifier::new(
            Arc::new(repo.clone()),
            StageGraph::standard(),
            capacity,
        ));
        let registry = TaskRegistry::new(Arc::new(repo.clone()), StageGraph::standard())
            .with_listener(notifier.clone());
        (notifier, registry, repo)
    }

    /// 读取之后停顿一次，模拟快照查询被调度延后
    #[derive(Clone)]
    struct SlowReadRepository {
        inner: MockTaskRepository,
        stall_next_read: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TaskRepository for SlowReadRepository {
        async fn create_task(&self, new_task: &NewTask) -> PipelineResult<Task> {
            self.inner.create_task(new_task).await
        }

        async fn get_task(&self, task_id: i64) -> PipelineResult<Option<Task>> {
            self.inner.get_task(task_id).await
        }

        async fn find_by_broker_id(&self, broker_task_id: &str) -> PipelineResult<Option<Task>> {
            self.inner.find_by_broker_id(broker_task_id).await
        }

        async fn update_status(
            &self,
            task_id: i64,
            expected_version: i64,
            change: &StatusChange,
        ) -> PipelineResult<Task> {
            self.inner.update_status(task_id, expected_version, change).await
        }

        async fn get_tasks(&self, item_id: i64) -> PipelineResult<Vec<Task>> {
            let tasks = self.inner.get_tasks(item_id).await?;
            if self.stall_next_read.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(tasks)
        }

        async fn get_stale(
            &self,
            status: TaskStatus,
            older_than: DateTime<Utc>,
            limit: Option<usize>,
        ) -> PipelineResult<Vec<Task>> {
            self.inner.get_stale(status, older_than, limit).await
        }

        async fn get_logs(&self, task_id: i64) -> PipelineResult<Vec<TaskLog>> {
            self.inner.get_logs(task_id).await
        }

        async fn purge(&self, task_id: i64) -> PipelineResult<()> {
            self.inner.purge(task_id).await
        }

        async fn purge_batch(&self, task_ids: &[i64]) -> PipelineResult<u64> {
            self.inner.purge_batch(task_ids).await
        }

        async fn delete_item(&self, item_id: i64) -> PipelineResult<u64> {
            self.inner.delete_item(item_id).await
        }
    }

    async fn next(rx: &mut Receiver<ServerMessage>) -> ServerMessage {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("等待推送超时")
            .expect("通道已关闭")
    }

    /// 前四个阶段成功，segment 进行到 40%
    fn seed_segment_at_40(repo: &MockTaskRepository, item_id: i64) {
        let done = [Stage::Acquire, Stage::Audio, Stage::Transcribe, Stage::Analyze];
        for (i, stage) in done.into_iter().enumerate() {
            repo.insert_task(
                TaskBuilder::new()
                    .with_id(item_id * 10 + i as i64)
                    .with_item(item_id)
                    .with_stage(stage)
                    .with_status(TaskStatus::Success)
                    .build(),
            );
        }
        repo.insert_task(
            TaskBuilder::new()
                .with_id(item_id * 10 + 4)
                .with_item(item_id)
                .with_stage(Stage::Segment)
                .with_status(TaskStatus::Running)
                .with_progress(40)
                .build(),
        );
    }

    #[tokio::test]
    async fn test_subscribe_pushes_cold_start_snapshot() {
        let (notifier, _registry, repo) = setup(16);
        seed_segment_at_40(&repo, 7);

        let (conn, mut rx) = notifier.register().await;
        notifier.subscribe(conn, 7).await.unwrap();

        let message = next(&mut rx).await;
        let ServerMessage::Snapshot { item_id, snapshot } = message else {
            panic!("订阅后应当先收到完整快照: {message:?}");
        };
        assert_eq!(item_id, 7);
        assert_eq!(snapshot.current_stage, CurrentStage::Stage(Stage::Segment));
        assert_eq!(snapshot.overall_status, OverallStatus::Running);
        // 10 + 10 + 20 + 15 + 35 * 0.40
        assert!((snapshot.overall_progress - 69.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_transition_reaches_only_subscribers() {
        let (notifier, registry, _repo) = setup(16);
        let (watcher, mut watcher_rx) = notifier.register().await;
        let (other, mut other_rx) = notifier.register().await;

        notifier.subscribe(watcher, 1).await.unwrap();
        notifier.subscribe(other, 2).await.unwrap();
        next(&mut watcher_rx).await;
        next(&mut other_rx).await;

        let task = registry
            .create_task(&NewTask::new(1, Stage::Acquire, "acq-1"))
            .await
            .unwrap();
        registry
            .update_status(
                task.id,
                task.version,
                &StatusChange::to(TaskStatus::Running).with_progress(50),
            )
            .await
            .unwrap();

        let created = next(&mut watcher_rx).await;
        assert!(matches!(created, ServerMessage::ProgressUpdate { item_id: 1, .. }));

        let running = next(&mut watcher_rx).await;
        let snapshot = running.snapshot().unwrap();
        assert_eq!(snapshot.overall_status, OverallStatus::Running);
        assert!((snapshot.overall_progress - 5.0).abs() < 1e-9);

        assert!(other_rx.try_recv().is_err(), "未订阅的连接不应收到推送");
    }

    #[tokio::test]
    async fn test_request_status_update_pulls_every_subscription() {
        let (notifier, _registry, repo) = setup(16);
        seed_segment_at_40(&repo, 3);

        let (conn, mut rx) = notifier.register().await;
        notifier.subscribe(conn, 3).await.unwrap();
        notifier.subscribe(conn, 4).await.unwrap();
        next(&mut rx).await;
        next(&mut rx).await;

        let pushed = notifier.request_status_update(conn).await.unwrap();
        assert_eq!(pushed, 2);

        let mut items = vec![
            next(&mut rx).await.item_id().unwrap(),
            next(&mut rx).await.item_id().unwrap(),
        ];
        items.sort_unstable();
        assert_eq!(items, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_request_status_update_for_unknown_connection_fails() {
        let (notifier, _registry, _repo) = setup(16);
        assert!(notifier.request_status_update(999).await.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_pushes() {
        let (notifier, registry, _repo) = setup(16);
        let (conn, mut rx) = notifier.register().await;
        notifier.subscribe(conn, 1).await.unwrap();
        next(&mut rx).await;

        notifier.unsubscribe(conn, 1).await;
        assert_eq!(notifier.subscriber_count(1).await, 0);

        registry
            .create_task(&NewTask::new(1, Stage::Acquire, "acq-1"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_removes_all_subscriptions() {
        let (notifier, _registry, _repo) = setup(16);
        let (conn, _rx) = notifier.register().await;
        notifier.subscribe(conn, 1).await.unwrap();
        notifier.subscribe(conn, 2).await.unwrap();
        assert_eq!(notifier.subscriptions(conn).await, vec![1, 2]);

        notifier.disconnect(conn).await;

        assert_eq!(notifier.connection_count().await, 0);
        assert_eq!(notifier.subscriber_count(1).await, 0);
        assert_eq!(notifier.subscriber_count(2).await, 0);
        assert!(notifier.subscriptions(conn).await.is_empty());
    }

    #[tokio::test]
    async fn test_full_channel_evicts_without_blocking_writes() {
        let (notifier, registry, _repo) = setup(1);
        let (conn, _rx) = notifier.register().await;
        // 快照占满容量为 1 的通道，且从不读取
        notifier.subscribe(conn, 1).await.unwrap();

        let task = registry
            .create_task(&NewTask::new(1, Stage::Acquire, "acq-1"))
            .await
            .unwrap();

        // 写入路径照常成功，慢连接被驱逐
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(notifier.connection_count().await, 0);
        assert_eq!(notifier.subscriber_count(1).await, 0);
    }

    #[tokio::test]
    async fn test_closed_receiver_is_evicted() {
        let (notifier, _registry, _repo) = setup(16);
        let (_conn, rx) = notifier.register().await;
        let (_alive, _alive_rx) = notifier.register().await;
        drop(rx);

        assert_eq!(notifier.ping_all().await, 1);
        assert_eq!(notifier.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_idle_connections_are_evicted() {
        let (notifier, _registry, _repo) = setup(16);
        let (idle, _idle_rx) = notifier.register().await;
        let (active, _active_rx) = notifier.register().await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        notifier.touch(active).await;

        let evicted = notifier.evict_stale(Duration::from_millis(50)).await;
        assert_eq!(evicted, 1);
        assert_eq!(notifier.connection_count().await, 1);
        assert!(notifier.subscriptions(idle).await.is_empty());
    }

    #[tokio::test]
    async fn test_client_ping_gets_pong() {
        let (notifier, _registry, _repo) = setup(16);
        let (conn, mut rx) = notifier.register().await;

        notifier.handle_client_message(conn, ClientMessage::Ping).await;
        assert_eq!(next(&mut rx).await, ServerMessage::Pong);

        // pong 只刷新存活时间，不产生回复
        notifier.handle_client_message(conn, ClientMessage::Pong).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_client_subscribe_message() {
        let (notifier, _registry, _repo) = setup(16);
        let (conn, mut rx) = notifier.register().await;

        notifier
            .handle_client_message(conn, ClientMessage::Subscribe { item_id: 5 })
            .await;

        let message = next(&mut rx).await;
        assert_eq!(message.item_id(), Some(5));
        assert_eq!(
            message.snapshot().unwrap().overall_status,
            OverallStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_heartbeat_pings_and_stops_on_cancel() {
        let (notifier, _registry, _repo) = setup(16);
        let (_conn, mut rx) = notifier.register().await;

        let token = CancellationToken::new();
        let handle = notifier.clone().spawn_heartbeat(
            Duration::from_millis(20),
            Duration::from_secs(5),
            token.clone(),
        );

        let message = next(&mut rx).await;
        assert!(matches!(message, ServerMessage::Ping { .. }));

        token.cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_evicts_silent_connection() {
        let (notifier, _registry, _repo) = setup(16);
        let (_conn, _rx) = notifier.register().await;

        let token = CancellationToken::new();
        let _handle = notifier.clone().spawn_heartbeat(
            Duration::from_millis(20),
            Duration::from_millis(30),
            token.clone(),
        );

        let evicted = TestEnv::wait_for(
            || {
                let notifier = notifier.clone();
                async move { notifier.connection_count().await == 0 }
            },
            Duration::from_secs(2),
        )
        .await;
        assert!(evicted, "无入站帧的连接应当被心跳驱逐");
        token.cancel();
    }

    #[tokio::test]
    async fn test_pushes_for_one_item_never_go_backwards() {
        let repo = MockTaskRepository::new();
        let slow = SlowReadRepository {
            inner: repo.clone(),
            stall_next_read: Arc::new(AtomicBool::new(false)),
        };
        let notifier = Arc::new(Notifier::new(
            Arc::new(slow.clone()),
            StageGraph::standard(),
            16,
        ));
        let registry = TaskRegistry::new(Arc::new(repo.clone()), StageGraph::standard())
            .with_listener(notifier.clone());

        let task = registry
            .create_task(&NewTask::new(5, Stage::Acquire, "acq-5"))
            .await
            .unwrap();
        let (conn, mut rx) = notifier.register().await;
        notifier.subscribe(conn, 5).await.unwrap();
        next(&mut rx).await;

        // 第一次变更读到 30% 后停顿，第二次变更在停顿期间提交 60%
        slow.stall_next_read.store(true, Ordering::SeqCst);
        let first_change = StatusChange::to(TaskStatus::Running).with_progress(30);
        let first = registry.update_status(task.id, task.version, &first_change);
        let second = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let current = repo.snapshot(task.id).unwrap();
            registry
                .update_status(
                    task.id,
                    current.version,
                    &StatusChange::to(TaskStatus::Running).with_progress(60),
                )
                .await
        };
        let (first, second) = tokio::join!(first, second);
        first.unwrap();
        second.unwrap();

        let mut progress = Vec::new();
        for _ in 0..2 {
            let message = next(&mut rx).await;
            let snapshot = message.snapshot().unwrap();
            progress.push(snapshot.overall_progress);
        }
        assert!(
            progress[0] <= progress[1],
            "同一媒体项的推送不应倒退: {progress:?}"
        );
        assert!((progress[1] - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_relay_pushes_writes_made_elsewhere() {
        let repo = MockTaskRepository::new();
        let bus = Arc::new(InMemoryBroker::new());
        let notifier = Arc::new(Notifier::new(
            Arc::new(repo.clone()),
            StageGraph::standard(),
            16,
        ));
        // 写入端只知道广播，不持有推送层
        let registry = TaskRegistry::new(Arc::new(repo.clone()), StageGraph::standard())
            .with_listener(Arc::new(TransitionPublisher::new(bus.clone())));

        let token = CancellationToken::new();
        let relay = notifier
            .clone()
            .spawn_relay(bus.clone(), token.clone())
            .await
            .unwrap();

        let (conn, mut rx) = notifier.register().await;
        notifier.subscribe(conn, 11).await.unwrap();
        next(&mut rx).await;

        let task = registry
            .create_task(&NewTask::new(11, Stage::Acquire, "acq-11"))
            .await
            .unwrap();
        registry
            .update_status(
                task.id,
                task.version,
                &StatusChange::to(TaskStatus::Running).with_progress(50),
            )
            .await
            .unwrap();

        let created = next(&mut rx).await;
        assert!(matches!(created, ServerMessage::ProgressUpdate { item_id: 11, .. }));
        let running = next(&mut rx).await;
        let snapshot = running.snapshot().unwrap();
        assert_eq!(snapshot.overall_status, OverallStatus::Running);
        assert!((snapshot.overall_progress - 5.0).abs() < 1e-9);

        token.cancel();
        timeout(Duration::from_secs(1), relay).await.unwrap().unwrap();
    }
}
