use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub worker_id: String,
    pub max_concurrent_tasks: usize,
    /// 超过后取消执行器并按可恢复错误上报
    pub soft_time_limit_seconds: u64,
    /// 超过后直接中止执行
    pub hard_time_limit_seconds: u64,
    /// 为每个阶段注册模拟执行器，本地联调用
    pub simulate_executors: bool,
    pub simulated_step_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_id: "worker-001".to_string(),
            max_concurrent_tasks: 4,
            soft_time_limit_seconds: 3 * 3600,
            hard_time_limit_seconds: 4 * 3600,
            simulate_executors: false,
            simulated_step_ms: 500,
        }
    }
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.worker_id, "worker.worker_id")?;
        ValidationUtils::validate_count(self.max_concurrent_tasks, "worker.max_concurrent_tasks")?;
        ValidationUtils::validate_seconds(
            self.soft_time_limit_seconds,
            7 * 86_400,
            "worker.soft_time_limit_seconds",
        )?;
        ValidationUtils::validate_seconds(
            self.hard_time_limit_seconds,
            7 * 86_400,
            "worker.hard_time_limit_seconds",
        )?;
        if self.hard_time_limit_seconds < self.soft_time_limit_seconds {
            return Err(crate::ConfigError::Validation(
                "worker.hard_time_limit_seconds must be greater than or equal to soft_time_limit_seconds"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_validation() {
        assert!(WorkerConfig::default().validate().is_ok());

        let mut config = WorkerConfig::default();
        config.worker_id = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.hard_time_limit_seconds = config.soft_time_limit_seconds - 1;
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.max_concurrent_tasks = 0;
        assert!(config.validate().is_err());
    }
}
