use crate::validation::{ConfigValidator, ValidationUtils};
use mediaflow_domain::{PipelineResult, Stage, StageGraph, StageWeight};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageWeightConfig {
    pub stage: String,
    pub weight: u32,
}

/// 阶段顺序与进度权重，默认即标准六阶段流水线
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub default_max_retries: i32,
    /// 阶段成功后自动派发下一阶段
    pub auto_advance: bool,
    pub stages: Vec<StageWeightConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            auto_advance: true,
            stages: StageGraph::standard()
                .iter()
                .map(|s| StageWeightConfig {
                    stage: s.stage.as_str().to_string(),
                    weight: s.weight,
                })
                .collect(),
        }
    }
}

impl PipelineConfig {
    pub fn stage_graph(&self) -> PipelineResult<StageGraph> {
        let stages = self
            .stages
            .iter()
            .map(|s| {
                Ok(StageWeight {
                    stage: s.stage.parse::<Stage>()?,
                    weight: s.weight,
                })
            })
            .collect::<PipelineResult<Vec<_>>>()?;
        StageGraph::new(stages)
    }
}

impl ConfigValidator for PipelineConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.stage_graph()
            .map_err(|e| crate::ConfigError::Validation(format!("pipeline.stages: {e}")))?;
        if !(0..=100).contains(&self.default_max_retries) {
            return Err(crate::ConfigError::Validation(
                "pipeline.default_max_retries must be between 0 and 100".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_seconds: 60,
            max_delay_seconds: 3600,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl ConfigValidator for RetrySettings {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_seconds(self.base_delay_seconds, 86_400, "retry.base_delay_seconds")?;
        if self.max_delay_seconds < self.base_delay_seconds {
            return Err(crate::ConfigError::Validation(
                "retry.max_delay_seconds must be greater than or equal to base_delay_seconds"
                    .to_string(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(crate::ConfigError::Validation(
                "retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(crate::ConfigError::Validation(
                "retry.jitter_factor must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimerSettings {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub running_timeout_seconds: u64,
    pub pending_timeout_seconds: u64,
    pub success_retention_days: u32,
    pub failure_retention_days: u32,
    pub batch_size: usize,
    pub dry_run: bool,
}

impl Default for ReclaimerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 300,
            running_timeout_seconds: 24 * 3600,
            pending_timeout_seconds: 2 * 3600,
            success_retention_days: 30,
            failure_retention_days: 90,
            batch_size: 100,
            dry_run: false,
        }
    }
}

impl ConfigValidator for ReclaimerSettings {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_seconds(self.interval_seconds, 86_400, "reclaimer.interval_seconds")?;
        ValidationUtils::validate_seconds(
            self.running_timeout_seconds,
            30 * 86_400,
            "reclaimer.running_timeout_seconds",
        )?;
        ValidationUtils::validate_seconds(
            self.pending_timeout_seconds,
            30 * 86_400,
            "reclaimer.pending_timeout_seconds",
        )?;
        ValidationUtils::validate_count(self.success_retention_days as usize, "reclaimer.success_retention_days")?;
        ValidationUtils::validate_count(self.failure_retention_days as usize, "reclaimer.failure_retention_days")?;
        ValidationUtils::validate_count(self.batch_size, "reclaimer.batch_size")?;
        Ok(())
    }
}
