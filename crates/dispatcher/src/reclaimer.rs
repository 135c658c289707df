use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mediaflow_config::ReclaimerSettings;
use mediaflow_domain::{PipelineResult, StatusChange, Task, TaskStatus};

use crate::stage_dispatcher::StageDispatcher;

/// 回收器配置
#[derive(Debug, Clone)]
pub struct ReclaimerConfig {
    /// RUNNING 超过该时长视为卡死
    pub running_timeout: Duration,
    /// PENDING/RETRY 超过该时长视为消息丢失
    pub pending_timeout: Duration,
    pub success_retention: Duration,
    /// FAILURE 与 REVOKED 共用
    pub failure_retention: Duration,
    pub batch_size: usize,
    pub dry_run: bool,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self::from(&ReclaimerSettings::default())
    }
}

impl From<&ReclaimerSettings> for ReclaimerConfig {
    fn from(settings: &ReclaimerSettings) -> Self {
        Self {
            running_timeout: Duration::seconds(settings.running_timeout_seconds as i64),
            pending_timeout: Duration::seconds(settings.pending_timeout_seconds as i64),
            success_retention: Duration::days(settings.success_retention_days as i64),
            failure_retention: Duration::days(settings.failure_retention_days as i64),
            batch_size: settings.batch_size.max(1),
            dry_run: settings.dry_run,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryReport {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// 被并发写入抢先（版本冲突）而跳过
    pub skipped: u64,
}

impl CategoryReport {
    fn would_process(count: usize) -> Self {
        Self {
            processed: count as u64,
            succeeded: count as u64,
            ..Self::default()
        }
    }
}

/// 一次回收的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub dry_run: bool,
    pub running_timeout: CategoryReport,
    pub pending_timeout: CategoryReport,
    pub success_retention: CategoryReport,
    pub failure_retention: CategoryReport,
}

impl ReclaimReport {
    pub fn categories(&self) -> [(&'static str, CategoryReport); 4] {
        [
            ("running_timeout", self.running_timeout),
            ("pending_timeout", self.pending_timeout),
            ("success_retention", self.success_retention),
            ("failure_retention", self.failure_retention),
        ]
    }

    pub fn total_processed(&self) -> u64 {
        self.categories().iter().map(|(_, c)| c.processed).sum()
    }
}

/// 回收器
///
/// 周期扫描卡死、丢失和过期的任务。所有状态写入都带版本号，
/// 与 worker 或其他回收器实例并发时，输掉竞争的一方直接跳过。
pub struct Reclaimer {
    dispatcher: Arc<StageDispatcher>,
    config: ReclaimerConfig,
}

impl Reclaimer {
    pub fn new(dispatcher: Arc<StageDispatcher>, config: ReclaimerConfig) -> Self {
        Self { dispatcher, config }
    }

    pub fn config(&self) -> &ReclaimerConfig {
        &self.config
    }

    pub async fn run_cleanup(&self) -> PipelineResult<ReclaimReport> {
        self.run_cleanup_at(Utc::now()).await
    }

    /// 以 `now` 为当前时间执行一次回收
    pub async fn run_cleanup_at(&self, now: DateTime<Utc>) -> PipelineResult<ReclaimReport> {
        let start_time = std::time::Instant::now();
        let dry_run = self.config.dry_run;
        info!("开始回收 (dry_run={})", dry_run);

        let running_cutoff = now - self.config.running_timeout;
        let pending_cutoff = now - self.config.pending_timeout;

        let mut report = ReclaimReport {
            dry_run,
            ..ReclaimReport::default()
        };

        report.running_timeout = self.reclaim_running(running_cutoff).await?;

        let mut pending = self
            .reclaim_waiting(TaskStatus::Pending, pending_cutoff)
            .await?;
        let retry = self
            .reclaim_waiting(TaskStatus::Retry, pending_cutoff)
            .await?;
        pending.processed += retry.processed;
        pending.succeeded += retry.succeeded;
        pending.failed += retry.failed;
        pending.skipped += retry.skipped;
        report.pending_timeout = pending;

        report.success_retention = self
            .purge_expired(&[TaskStatus::Success], now - self.config.success_retention)
            .await?;
        report.failure_retention = self
            .purge_expired(
                &[TaskStatus::Failure, TaskStatus::Revoked],
                now - self.config.failure_retention,
            )
            .await?;

        if !dry_run {
            for (category, stats) in report.categories() {
                if stats.succeeded > 0 {
                    counter!("mediaflow_reclaimed_tasks_total", "category" => category)
                        .increment(stats.succeeded);
                }
            }
        }

        info!(
            "回收完成，耗时 {:?}: running_timeout={:?} pending_timeout={:?} success_retention={:?} failure_retention={:?}",
            start_time.elapsed(),
            report.running_timeout,
            report.pending_timeout,
            report.success_retention,
            report.failure_retention
        );
        Ok(report)
    }

    /// 在 tokio 定时器上周期执行，直到令牌被取消
    pub fn spawn(
        self: Arc<Self>,
        every: std::time::Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("回收器收到停止信号");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_cleanup().await {
                            error!("回收失败: {}", e);
                        }
                    }
                }
            }
            info!("回收器已停止");
        })
    }

    async fn reclaim_running(&self, cutoff: DateTime<Utc>) -> PipelineResult<CategoryReport> {
        let stale = self
            .dispatcher
            .registry()
            .get_stale(TaskStatus::Running, cutoff, None)
            .await?;
        if self.config.dry_run {
            return Ok(CategoryReport::would_process(stale.len()));
        }

        let mut stats = CategoryReport::default();
        for task in stale {
            stats.processed += 1;
            let target = if task.can_retry() {
                TaskStatus::Retry
            } else {
                TaskStatus::Failure
            };
            let change = StatusChange::to(target)
                .with_error("timeout")
                .with_details(serde_json::json!({"reclaimed": "running_timeout"}));

            match self.transition(&task, &change).await {
                Outcome::Done(updated) if updated.status == TaskStatus::Retry => {
                    match self.dispatcher.redispatch(&updated).await {
                        Ok(()) => stats.succeeded += 1,
                        Err(e) => {
                            warn!("超时任务 {} 重新发布失败: {}", updated.id, e);
                            stats.failed += 1;
                        }
                    }
                }
                Outcome::Done(_) => stats.succeeded += 1,
                Outcome::Skipped => stats.skipped += 1,
                Outcome::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn reclaim_waiting(
        &self,
        status: TaskStatus,
        cutoff: DateTime<Utc>,
    ) -> PipelineResult<CategoryReport> {
        let stale = self
            .dispatcher
            .registry()
            .get_stale(status, cutoff, None)
            .await?;
        if self.config.dry_run {
            return Ok(CategoryReport::would_process(stale.len()));
        }

        let mut stats = CategoryReport::default();
        for task in stale {
            stats.processed += 1;
            let change = StatusChange::to(TaskStatus::Failure)
                .with_error("stuck in queue")
                .with_details(serde_json::json!({"reclaimed": "pending_timeout"}));
            match self.transition(&task, &change).await {
                Outcome::Done(_) => stats.succeeded += 1,
                Outcome::Skipped => stats.skipped += 1,
                Outcome::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn purge_expired(
        &self,
        statuses: &[TaskStatus],
        cutoff: DateTime<Utc>,
    ) -> PipelineResult<CategoryReport> {
        let registry = self.dispatcher.registry();
        let mut stats = CategoryReport::default();

        for status in statuses {
            if self.config.dry_run {
                let expired = registry.get_stale(*status, cutoff, None).await?;
                stats.processed += expired.len() as u64;
                stats.succeeded += expired.len() as u64;
                continue;
            }

            loop {
                let batch = registry
                    .get_stale(*status, cutoff, Some(self.config.batch_size))
                    .await?;
                if batch.is_empty() {
                    break;
                }

                let ids: Vec<i64> = batch.iter().map(|t| t.id).collect();
                let purged = registry.purge_batch(&ids).await?;
                debug!("清理 {} 条 {} 任务", purged, status);

                stats.processed += ids.len() as u64;
                stats.succeeded += purged;
                // 查询之后被重新激活的行不会被删除
                stats.skipped += ids.len() as u64 - purged.min(ids.len() as u64);

                if purged == 0 || batch.len() < self.config.batch_size {
                    break;
                }
            }
        }
        Ok(stats)
    }

    async fn transition(&self, task: &Task, change: &StatusChange) -> Outcome {
        match self
            .dispatcher
            .registry()
            .update_status(task.id, task.version, change)
            .await
        {
            Ok(updated) => {
                info!(
                    "回收任务 {}: {} -> {}",
                    task.id, task.status, updated.status
                );
                Outcome::Done(updated)
            }
            Err(e) if e.is_control_signal() => {
                debug!("任务 {} 已被并发更新，跳过: {}", task.id, e);
                Outcome::Skipped
            }
            Err(e) => {
                warn!("回收任务 {} 失败: {}", task.id, e);
                Outcome::Failed
            }
        }
    }
}

enum Outcome {
    Done(Task),
    Skipped,
    Failed,
}
