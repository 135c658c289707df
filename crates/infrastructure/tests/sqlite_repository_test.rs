use anyhow::Result;
use chrono::{Duration, Utc};
use mediaflow_config::DatabaseConfig;
use mediaflow_domain::{NewTask, Stage, StatusChange, TaskRepository, TaskStatus};
use mediaflow_errors::PipelineError;
use mediaflow_infrastructure::{DatabaseManager, SqliteTaskRepository};
use std::sync::Arc;
use tempfile::TempDir;

async fn setup() -> Result<(DatabaseManager, SqliteTaskRepository)> {
    let config = DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
        min_connections: 1,
        connection_timeout_seconds: 5,
        run_migrations: true,
    };
    let manager = DatabaseManager::new(&config).await?;
    let repo = SqliteTaskRepository::new(manager.pool().clone());
    Ok((manager, repo))
}

#[tokio::test]
async fn test_create_task_starts_pending() -> Result<()> {
    let (manager, repo) = setup().await?;
    manager.health_check().await?;

    let task = repo
        .create_task(
            &NewTask::new(1, Stage::Acquire, "b-1").with_input(serde_json::json!({"url": "s3://raw/1"})),
        )
        .await?;

    assert!(task.id > 0);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempt, 1);
    assert_eq!(task.version, 0);
    assert_eq!(task.progress, 0);
    assert_eq!(task.input_data, Some(serde_json::json!({"url": "s3://raw/1"})));

    let logs = repo.get_logs(task.id).await?;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].old_status, None);
    assert_eq!(logs[0].new_status, TaskStatus::Pending);

    let found = repo.find_by_broker_id("b-1").await?.unwrap();
    assert_eq!(found.id, task.id);
    Ok(())
}

#[tokio::test]
async fn test_second_active_task_conflicts() -> Result<()> {
    let (_manager, repo) = setup().await?;
    repo.create_task(&NewTask::new(1, Stage::Audio, "b-1")).await?;

    let err = repo
        .create_task(&NewTask::new(1, Stage::Audio, "b-2"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Conflict { item_id: 1, .. }));

    // 其他阶段和其他媒体项不受影响
    repo.create_task(&NewTask::new(1, Stage::Transcribe, "b-3")).await?;
    repo.create_task(&NewTask::new(2, Stage::Audio, "b-4")).await?;
    assert_eq!(repo.get_tasks(1).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_creates_have_single_winner() -> Result<()> {
    let (_manager, repo) = setup().await?;
    let repo = Arc::new(repo);

    let mut handles = Vec::new();
    for i in 0..8 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            repo.create_task(&NewTask::new(7, Stage::Transcribe, format!("b-{i}")))
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => winners += 1,
            Err(e) => assert!(matches!(e, PipelineError::Conflict { .. })),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(repo.get_tasks(7).await?.len(), 1);
    Ok(())
}

/// 文件数据库 + 多连接池，并发写者只能得到控制信号，不能是锁错误
async fn setup_pooled(dir: &TempDir) -> Result<(DatabaseManager, SqliteTaskRepository)> {
    let config = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("pooled.db").display()),
        max_connections: 10,
        min_connections: 1,
        connection_timeout_seconds: 5,
        run_migrations: true,
    };
    let manager = DatabaseManager::new(&config).await?;
    let repo = SqliteTaskRepository::new(manager.pool().clone());
    Ok((manager, repo))
}

#[tokio::test]
async fn test_pooled_concurrent_creates_only_conflict() -> Result<()> {
    let dir = TempDir::new()?;
    let (_manager, repo) = setup_pooled(&dir).await?;
    let repo = Arc::new(repo);

    for round in 0..10_i64 {
        let mut handles = Vec::new();
        for i in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.create_task(&NewTask::new(round, Stage::Segment, format!("s-{round}-{i}")))
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await? {
                Ok(_) => winners += 1,
                Err(e) => assert!(
                    matches!(e, PipelineError::Conflict { .. }),
                    "并发创建应当只返回冲突: {e}"
                ),
            }
        }
        assert_eq!(winners, 1, "第 {round} 轮应当只有一个创建成功");
    }
    Ok(())
}

#[tokio::test]
async fn test_pooled_concurrent_updates_only_version_mismatch() -> Result<()> {
    let dir = TempDir::new()?;
    let (_manager, repo) = setup_pooled(&dir).await?;
    let repo = Arc::new(repo);

    for round in 0..10_i64 {
        let task = repo
            .create_task(&NewTask::new(round, Stage::Export, format!("e-{round}")))
            .await?;

        let mut handles = Vec::new();
        for progress in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.update_status(
                    task.id,
                    task.version,
                    &StatusChange::to(TaskStatus::Running).with_progress(progress * 10),
                )
                .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await? {
                Ok(_) => winners += 1,
                Err(e) => assert!(
                    matches!(e, PipelineError::VersionMismatch { .. }),
                    "并发更新应当只返回版本不匹配: {e}"
                ),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(repo.get_task(task.id).await?.unwrap().version, 1);
        assert_eq!(repo.get_logs(task.id).await?.len(), 2);
    }
    Ok(())
}

#[tokio::test]
async fn test_update_status_compare_and_swap() -> Result<()> {
    let (_manager, repo) = setup().await?;
    let task = repo.create_task(&NewTask::new(1, Stage::Acquire, "b-1")).await?;

    let running = repo
        .update_status(
            task.id,
            0,
            &StatusChange::to(TaskStatus::Running).with_message("开始下载"),
        )
        .await?;
    assert_eq!(running.version, 1);
    assert!(running.started_at.is_some());

    let err = repo
        .update_status(task.id, 0, &StatusChange::to(TaskStatus::Success))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::VersionMismatch {
            expected: 0,
            actual: 1,
            ..
        }
    ));

    let stored = repo.get_task(task.id).await?.unwrap();
    assert_eq!(stored.status, TaskStatus::Running);
    assert_eq!(stored.version, 1);

    let done = repo
        .update_status(
            task.id,
            1,
            &StatusChange::to(TaskStatus::Success).with_output(serde_json::json!({"bytes": 42})),
        )
        .await?;
    assert_eq!(done.progress, 100);
    assert!(done.completed_at.is_some());
    assert_eq!(done.output_data, Some(serde_json::json!({"bytes": 42})));

    let logs = repo.get_logs(task.id).await?;
    assert_eq!(logs.len(), 3);
    assert_eq!(logs[2].old_status, Some(TaskStatus::Running));
    assert_eq!(logs[2].new_status, TaskStatus::Success);
    Ok(())
}

#[tokio::test]
async fn test_invalid_transition_leaves_row_untouched() -> Result<()> {
    let (_manager, repo) = setup().await?;
    let task = repo.create_task(&NewTask::new(1, Stage::Export, "b-1")).await?;

    let err = repo
        .update_status(task.id, 0, &StatusChange::to(TaskStatus::Success))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidTransition { .. }));
    assert_eq!(repo.get_task(task.id).await?.unwrap().version, 0);
    assert_eq!(repo.get_logs(task.id).await?.len(), 1);

    let err = repo
        .update_status(9_999, 0, &StatusChange::to(TaskStatus::Running))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::TaskNotFound { id: 9_999 }));
    Ok(())
}

#[tokio::test]
async fn test_new_attempt_after_failure() -> Result<()> {
    let (_manager, repo) = setup().await?;
    let first = repo.create_task(&NewTask::new(3, Stage::Analyze, "b-1")).await?;
    repo.update_status(first.id, 0, &StatusChange::to(TaskStatus::Running))
        .await?;
    repo.update_status(
        first.id,
        1,
        &StatusChange::to(TaskStatus::Failure).with_error("ffmpeg exited with 1"),
    )
    .await?;

    let second = repo.create_task(&NewTask::new(3, Stage::Analyze, "b-2")).await?;
    assert_eq!(second.attempt, 2);
    assert_eq!(second.progress, 0);

    let tasks = repo.get_tasks(3).await?;
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].id, first.id);
    assert_eq!(tasks[0].error_message.as_deref(), Some("ffmpeg exited with 1"));
    Ok(())
}

#[tokio::test]
async fn test_get_stale_uses_reference_time() -> Result<()> {
    let (_manager, repo) = setup().await?;
    let now = Utc::now();

    let old_pending = repo
        .create_task(&NewTask::new(1, Stage::Acquire, "p-old").created_at(now - Duration::hours(3)))
        .await?;
    repo.create_task(&NewTask::new(2, Stage::Acquire, "p-new")).await?;

    let stuck = repo
        .create_task(&NewTask::new(3, Stage::Acquire, "r-old").created_at(now - Duration::days(3)))
        .await?;
    repo.update_status(
        stuck.id,
        0,
        &StatusChange::to(TaskStatus::Running).at(now - Duration::days(2)),
    )
    .await?;
    // 心跳更新了 updated_at，但判断依据是 started_at
    repo.update_status(
        stuck.id,
        1,
        &StatusChange::to(TaskStatus::Running).with_progress(10),
    )
    .await?;

    let pending = repo
        .get_stale(TaskStatus::Pending, now - Duration::hours(1), None)
        .await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, old_pending.id);

    let running = repo
        .get_stale(TaskStatus::Running, now - Duration::days(1), None)
        .await?;
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, stuck.id);

    let limited = repo
        .get_stale(TaskStatus::Pending, now + Duration::hours(1), Some(1))
        .await?;
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].id, old_pending.id);
    Ok(())
}

async fn finish(repo: &SqliteTaskRepository, task_id: i64, status: TaskStatus) -> Result<()> {
    repo.update_status(task_id, 0, &StatusChange::to(TaskStatus::Running))
        .await?;
    repo.update_status(task_id, 1, &StatusChange::to(status)).await?;
    Ok(())
}

#[tokio::test]
async fn test_purge_removes_logs() -> Result<()> {
    let (manager, repo) = setup().await?;
    let a = repo.create_task(&NewTask::new(1, Stage::Acquire, "a")).await?;
    let b = repo.create_task(&NewTask::new(1, Stage::Audio, "b")).await?;
    let c = repo.create_task(&NewTask::new(1, Stage::Transcribe, "c")).await?;
    finish(&repo, a.id, TaskStatus::Success).await?;
    finish(&repo, b.id, TaskStatus::Failure).await?;
    finish(&repo, c.id, TaskStatus::Revoked).await?;

    repo.purge(a.id).await?;
    assert!(repo.get_task(a.id).await?.is_none());
    assert!(repo.get_logs(a.id).await?.is_empty());
    assert!(matches!(
        repo.purge(a.id).await.unwrap_err(),
        PipelineError::TaskNotFound { .. }
    ));

    assert_eq!(repo.purge_batch(&[]).await?, 0);
    assert_eq!(repo.purge_batch(&[b.id, c.id, 12_345]).await?, 2);

    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_logs")
        .fetch_one(manager.pool())
        .await?;
    assert_eq!(remaining, 0);
    Ok(())
}

#[tokio::test]
async fn test_purge_skips_rows_that_became_active() -> Result<()> {
    let (_manager, repo) = setup().await?;
    let done = repo.create_task(&NewTask::new(1, Stage::Acquire, "done")).await?;
    finish(&repo, done.id, TaskStatus::Success).await?;

    // 失败行被查出过期之后，又被重新置为 RETRY
    let retrying = repo.create_task(&NewTask::new(1, Stage::Audio, "retrying")).await?;
    finish(&repo, retrying.id, TaskStatus::Failure).await?;
    repo.update_status(retrying.id, 2, &StatusChange::to(TaskStatus::Retry))
        .await?;

    assert_eq!(repo.purge_batch(&[done.id, retrying.id]).await?, 1);
    assert!(repo.get_task(done.id).await?.is_none());
    assert_eq!(
        repo.get_task(retrying.id).await?.unwrap().status,
        TaskStatus::Retry
    );
    assert_eq!(repo.get_logs(retrying.id).await?.len(), 4);

    let err = repo.purge(retrying.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::ValidationError(_)));
    Ok(())
}

#[tokio::test]
async fn test_delete_item() -> Result<()> {
    let (_manager, repo) = setup().await?;
    repo.create_task(&NewTask::new(1, Stage::Acquire, "a")).await?;
    repo.create_task(&NewTask::new(1, Stage::Audio, "b")).await?;
    let other = repo.create_task(&NewTask::new(2, Stage::Acquire, "c")).await?;

    assert_eq!(repo.delete_item(1).await?, 2);
    assert!(repo.get_tasks(1).await?.is_empty());
    assert_eq!(repo.get_tasks(2).await?[0].id, other.id);
    assert_eq!(repo.delete_item(1).await?, 0);
    Ok(())
}
