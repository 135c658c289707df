use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mediaflow_domain::{
    entities::{NewTask, NewTaskLog, StatusChange, Task, TaskLog, TaskStatus},
    repositories::TaskRepository,
};
use mediaflow_errors::{PipelineError, PipelineResult};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, instrument};

const TASK_COLUMNS: &str = "id, item_id, stage, attempt, broker_task_id, status, progress, message, \
     error_message, started_at, completed_at, retry_count, max_retries, input_data, output_data, \
     version, created_at, updated_at";

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> PipelineResult<Task> {
        Ok(Task {
            id: row.try_get("id")?,
            item_id: row.try_get("item_id")?,
            stage: row.try_get("stage")?,
            attempt: row.try_get("attempt")?,
            broker_task_id: row.try_get("broker_task_id")?,
            status: row.try_get("status")?,
            progress: row.try_get("progress")?,
            message: row.try_get("message")?,
            error_message: row.try_get("error_message")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            input_data: decode_json(row.try_get("input_data")?)?,
            output_data: decode_json(row.try_get("output_data")?)?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_log(row: &sqlx::sqlite::SqliteRow) -> PipelineResult<TaskLog> {
        Ok(TaskLog {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            old_status: row.try_get("old_status")?,
            new_status: row.try_get("new_status")?,
            message: row.try_get("message")?,
            details: decode_json(row.try_get("details")?)?,
            created_at: row.try_get("created_at")?,
        })
    }

    /// 写事务一开始就拿写锁，并发写者在锁上排队，之后读到的都是最新版本
    async fn begin_write(&self) -> PipelineResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    async fn fetch_task(
        tx: &mut Transaction<'_, Sqlite>,
        task_id: i64,
    ) -> PipelineResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(task_id)
            .fetch_optional(&mut **tx)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn insert_log(
        tx: &mut Transaction<'_, Sqlite>,
        entry: &NewTaskLog,
    ) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO task_logs (task_id, old_status, new_status, message, details, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.task_id)
        .bind(entry.old_status)
        .bind(entry.new_status)
        .bind(&entry.message)
        .bind(encode_json(&entry.details)?)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn delete_ids(tx: &mut Transaction<'_, Sqlite>, task_ids: &[i64]) -> PipelineResult<u64> {
        let mut logs = QueryBuilder::<Sqlite>::new(
            "DELETE FROM task_logs WHERE task_id IN (SELECT id FROM tasks WHERE ",
        );
        push_purgeable(&mut logs, task_ids);
        logs.push(")");
        logs.build().execute(&mut **tx).await?;

        let mut tasks = QueryBuilder::<Sqlite>::new("DELETE FROM tasks WHERE ");
        push_purgeable(&mut tasks, task_ids);
        let result = tasks.build().execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }
}

/// 只有终态任务可以清理，状态在删除时重新判断
fn push_purgeable(query: &mut QueryBuilder<'_, Sqlite>, task_ids: &[i64]) {
    query.push("status IN ('SUCCESS', 'FAILURE', 'REVOKED') AND id IN (");
    let mut separated = query.separated(", ");
    for id in task_ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

fn decode_json(raw: Option<String>) -> PipelineResult<Option<serde_json::Value>> {
    raw.map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(PipelineError::from)
}

fn encode_json(value: &Option<serde_json::Value>) -> PipelineResult<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(PipelineError::from)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// 判断陈旧程度的参考列，与 `Task::stale_reference` 一致
fn stale_reference_column(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Running => "COALESCE(started_at, updated_at)",
        TaskStatus::Pending => "created_at",
        TaskStatus::Retry => "updated_at",
        TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked => {
            "COALESCE(completed_at, updated_at)"
        }
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    #[instrument(skip(self, new_task), fields(
        item_id = new_task.item_id,
        stage = %new_task.stage,
        broker_task_id = %new_task.broker_task_id,
    ))]
    async fn create_task(&self, new_task: &NewTask) -> PipelineResult<Task> {
        let mut tx = self.begin_write().await?;

        let attempt: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(attempt), 0) + 1 FROM tasks WHERE item_id = ? AND stage = ?",
        )
        .bind(new_task.item_id)
        .bind(new_task.stage)
        .fetch_one(&mut *tx)
        .await?;

        let draft = new_task.clone().into_task(0, attempt);
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO tasks (item_id, stage, attempt, broker_task_id, status, progress,
                               retry_count, max_retries, input_data, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(draft.item_id)
        .bind(draft.stage)
        .bind(draft.attempt)
        .bind(&draft.broker_task_id)
        .bind(draft.status)
        .bind(draft.progress)
        .bind(draft.retry_count)
        .bind(draft.max_retries)
        .bind(encode_json(&draft.input_data)?)
        .bind(draft.version)
        .bind(draft.created_at)
        .bind(draft.updated_at)
        .fetch_one(&mut *tx)
        .await;

        let row = match inserted {
            Ok(row) => row,
            Err(e) if is_unique_violation(&e) => {
                debug!("阶段已有活跃任务，拒绝创建");
                return Err(PipelineError::conflict(
                    new_task.item_id,
                    new_task.stage.as_str(),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let task = Self::row_to_task(&row)?;
        Self::insert_log(&mut tx, &NewTaskLog::created(&task)).await?;
        tx.commit().await?;

        debug!("创建成功: {}", task.entity_description());
        Ok(task)
    }

    async fn get_task(&self, task_id: i64) -> PipelineResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn find_by_broker_id(&self, broker_task_id: &str) -> PipelineResult<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE broker_task_id = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(broker_task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    #[instrument(skip(self, change), fields(status = %change.status))]
    async fn update_status(
        &self,
        task_id: i64,
        expected_version: i64,
        change: &StatusChange,
    ) -> PipelineResult<Task> {
        let mut tx = self.begin_write().await?;

        let current = Self::fetch_task(&mut tx, task_id)
            .await?
            .ok_or_else(|| PipelineError::task_not_found(task_id))?;
        if current.version != expected_version {
            return Err(PipelineError::version_mismatch(
                task_id,
                expected_version,
                current.version,
            ));
        }

        let next = current.apply(change)?;

        let updated = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, progress = ?, message = ?, error_message = ?, started_at = ?,
                completed_at = ?, retry_count = ?, output_data = ?, version = ?, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(next.status)
        .bind(next.progress)
        .bind(&next.message)
        .bind(&next.error_message)
        .bind(next.started_at)
        .bind(next.completed_at)
        .bind(next.retry_count)
        .bind(encode_json(&next.output_data)?)
        .bind(next.version)
        .bind(next.updated_at)
        .bind(task_id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await;

        match updated {
            Ok(result) if result.rows_affected() == 0 => {
                let actual = Self::fetch_task(&mut tx, task_id)
                    .await?
                    .map(|t| t.version)
                    .unwrap_or(expected_version);
                return Err(PipelineError::version_mismatch(
                    task_id,
                    expected_version,
                    actual,
                ));
            }
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(PipelineError::conflict(next.item_id, next.stage.as_str()));
            }
            Err(e) => return Err(e.into()),
        }

        Self::insert_log(&mut tx, &NewTaskLog::transition(&current, &next, change)).await?;
        tx.commit().await?;

        debug!(
            "{}: {} -> {} (version {})",
            next.entity_description(),
            current.status,
            next.status,
            next.version
        );
        Ok(next)
    }

    async fn get_tasks(&self, item_id: i64) -> PipelineResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE item_id = ? ORDER BY id"
        ))
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn get_stale(
        &self,
        status: TaskStatus,
        older_than: DateTime<Utc>,
        limit: Option<usize>,
    ) -> PipelineResult<Vec<Task>> {
        let reference = stale_reference_column(status);
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? AND {reference} < ? \
             ORDER BY {reference}, id LIMIT ?"
        ))
        .bind(status)
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn get_logs(&self, task_id: i64) -> PipelineResult<Vec<TaskLog>> {
        let rows = sqlx::query(
            "SELECT id, task_id, old_status, new_status, message, details, created_at \
             FROM task_logs WHERE task_id = ? ORDER BY id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_log).collect()
    }

    #[instrument(skip(self))]
    async fn purge(&self, task_id: i64) -> PipelineResult<()> {
        let mut tx = self.begin_write().await?;
        let deleted = Self::delete_ids(&mut tx, &[task_id]).await?;
        if deleted == 0 {
            return match Self::fetch_task(&mut tx, task_id).await? {
                Some(task) => Err(PipelineError::validation_error(format!(
                    "任务 {} 处于 {} 状态，不能清理",
                    task_id, task.status
                ))),
                None => Err(PipelineError::task_not_found(task_id)),
            };
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, task_ids), fields(count = task_ids.len()))]
    async fn purge_batch(&self, task_ids: &[i64]) -> PipelineResult<u64> {
        if task_ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.begin_write().await?;
        let deleted = Self::delete_ids(&mut tx, task_ids).await?;
        tx.commit().await?;
        debug!("批量清理任务: {} 条", deleted);
        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn delete_item(&self, item_id: i64) -> PipelineResult<u64> {
        let mut tx = self.begin_write().await?;
        sqlx::query(
            "DELETE FROM task_logs WHERE task_id IN (SELECT id FROM tasks WHERE item_id = ?)",
        )
        .bind(item_id)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM tasks WHERE item_id = ?")
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}
