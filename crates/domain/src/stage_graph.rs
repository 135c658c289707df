use crate::entities::Stage;
use mediaflow_errors::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};

/// 阶段及其进度权重
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageWeight {
    pub stage: Stage,
    pub weight: u32,
}

/// 流水线阶段图：有序的 (阶段, 权重) 列表，权重之和为 100
///
/// 纯查找表，只用于进度计算和阶段排序。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageGraph {
    stages: Vec<StageWeight>,
}

impl StageGraph {
    pub const TOTAL_WEIGHT: u32 = 100;

    pub fn new(stages: Vec<StageWeight>) -> PipelineResult<Self> {
        if stages.is_empty() {
            return Err(PipelineError::config_error("阶段图不能为空"));
        }

        for (index, entry) in stages.iter().enumerate() {
            if stages[..index].iter().any(|s| s.stage == entry.stage) {
                return Err(PipelineError::config_error(format!(
                    "阶段重复: {}",
                    entry.stage
                )));
            }
        }

        let total: u32 = stages.iter().map(|s| s.weight).sum();
        if total != Self::TOTAL_WEIGHT {
            return Err(PipelineError::config_error(format!(
                "阶段权重之和必须为 {}，实际为 {total}",
                Self::TOTAL_WEIGHT
            )));
        }

        Ok(Self { stages })
    }

    /// acquire 10, audio 10, transcribe 20, analyze 15, segment 35, export 10
    pub fn standard() -> Self {
        let stages = [
            (Stage::Acquire, 10),
            (Stage::Audio, 10),
            (Stage::Transcribe, 20),
            (Stage::Analyze, 15),
            (Stage::Segment, 35),
            (Stage::Export, 10),
        ]
        .into_iter()
        .map(|(stage, weight)| StageWeight { stage, weight })
        .collect();
        Self { stages }
    }

    pub fn first(&self) -> Stage {
        self.stages[0].stage
    }

    pub fn next(&self, stage: Stage) -> Option<Stage> {
        self.position(stage)
            .and_then(|index| self.stages.get(index + 1))
            .map(|s| s.stage)
    }

    /// 不在图中的阶段权重为 0
    pub fn weight(&self, stage: Stage) -> u32 {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| s.weight)
            .unwrap_or(0)
    }

    pub fn position(&self, stage: Stage) -> Option<usize> {
        self.stages.iter().position(|s| s.stage == stage)
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.position(stage).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageWeight> {
        self.stages.iter()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Default for StageGraph {
    fn default() -> Self {
        Self::standard()
    }
}
