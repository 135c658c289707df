//! 媒体项整体进度聚合
//!
//! 纯函数：输入某媒体项的全部任务行和阶段图，输出整体快照，不持有状态。

use crate::entities::{Stage, Task, TaskStatus};
use crate::stage_graph::StageGraph;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// 媒体项整体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverallStatus {
    Pending,
    Running,
    Success,
    Failure,
    Revoked,
}

/// 当前阶段：第一个未成功的阶段，全部成功时为 "completed"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentStage {
    Stage(Stage),
    Completed,
}

impl CurrentStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CurrentStage::Stage(stage) => stage.as_str(),
            CurrentStage::Completed => "completed",
        }
    }
}

impl fmt::Display for CurrentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CurrentStage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CurrentStage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == "completed" {
            return Ok(CurrentStage::Completed);
        }
        s.parse::<Stage>()
            .map(CurrentStage::Stage)
            .map_err(serde::de::Error::custom)
    }
}

/// 单个阶段的明细（取该阶段 attempt 最大的任务行）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: Stage,
    pub weight: u32,
    pub status: Option<TaskStatus>,
    pub progress: i32,
    pub attempt: Option<i32>,
    pub task_id: Option<i64>,
    pub message: Option<String>,
    pub error_message: Option<String>,
}

/// 媒体项整体快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub item_id: i64,
    pub overall_status: OverallStatus,
    pub overall_progress: f64,
    pub current_stage: CurrentStage,
    pub error_count: usize,
    pub last_error: Option<String>,
    pub stages: Vec<StageProgress>,
    pub computed_at: DateTime<Utc>,
}

impl ItemSnapshot {
    pub fn stage(&self, stage: Stage) -> Option<&StageProgress> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// 每个阶段 attempt 最大的任务行
fn latest_for(stage: Stage, tasks: &[Task]) -> Option<&Task> {
    tasks
        .iter()
        .filter(|t| t.stage == stage)
        .max_by_key(|t| (t.attempt, t.id))
}

pub fn aggregate(item_id: i64, tasks: &[Task], graph: &StageGraph) -> ItemSnapshot {
    let mut stages = Vec::with_capacity(graph.len());
    let mut weighted_total: u64 = 0;
    let mut current_stage = CurrentStage::Completed;

    for entry in graph.iter() {
        let latest = latest_for(entry.stage, tasks);

        let effective_progress = match latest {
            Some(task) if task.status == TaskStatus::Success => 100,
            Some(task) => task.progress.clamp(0, 100),
            None => 0,
        };
        weighted_total += u64::from(entry.weight) * effective_progress as u64;

        let succeeded = latest.is_some_and(|t| t.status == TaskStatus::Success);
        if !succeeded && current_stage == CurrentStage::Completed {
            current_stage = CurrentStage::Stage(entry.stage);
        }

        stages.push(StageProgress {
            stage: entry.stage,
            weight: entry.weight,
            status: latest.map(|t| t.status),
            progress: effective_progress,
            attempt: latest.map(|t| t.attempt),
            task_id: latest.map(|t| t.id),
            message: latest.and_then(|t| t.message.clone()),
            error_message: latest.and_then(|t| t.error_message.clone()),
        });
    }

    let latest_statuses: Vec<Option<TaskStatus>> = stages.iter().map(|s| s.status).collect();
    let overall_status = overall_status(&latest_statuses);

    let errored: Vec<&Task> = tasks
        .iter()
        .filter(|t| graph.contains(t.stage) && t.error_message.is_some())
        .collect();
    let last_error = errored
        .iter()
        .max_by_key(|t| (t.updated_at, t.id))
        .and_then(|t| t.error_message.clone());

    ItemSnapshot {
        item_id,
        overall_status,
        overall_progress: weighted_total as f64 / 100.0,
        current_stage,
        error_count: errored.len(),
        last_error,
        stages,
        computed_at: Utc::now(),
    }
}

/// FAILURE > RUNNING > SUCCESS > PENDING，其余情况见各分支
fn overall_status(latest: &[Option<TaskStatus>]) -> OverallStatus {
    if latest.iter().any(|s| *s == Some(TaskStatus::Failure)) {
        return OverallStatus::Failure;
    }

    let any_active = latest.iter().any(|s| {
        matches!(
            s,
            Some(TaskStatus::Pending | TaskStatus::Running | TaskStatus::Retry)
        )
    });
    if any_active {
        return OverallStatus::Running;
    }

    if latest.iter().all(|s| *s == Some(TaskStatus::Success)) {
        return OverallStatus::Success;
    }
    if latest.iter().all(|s| s.is_none()) {
        return OverallStatus::Pending;
    }
    if latest.iter().any(|s| *s == Some(TaskStatus::Revoked)) {
        return OverallStatus::Revoked;
    }

    // 部分阶段成功、下一阶段尚未派发
    OverallStatus::Running
}
