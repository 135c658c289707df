use chrono::{DateTime, Duration, Utc};
use mediaflow_config::RetrySettings;

/// 指数退避重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 基础重试间隔（秒）
    pub base_interval_seconds: u64,
    /// 最大重试间隔（秒）
    pub max_interval_seconds: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_interval_seconds: 60,
            max_interval_seconds: 3600,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            base_interval_seconds: settings.base_delay_seconds,
            max_interval_seconds: settings.max_delay_seconds,
            backoff_multiplier: settings.backoff_multiplier,
            jitter_factor: settings.jitter_factor,
        }
    }
}

impl RetryPolicy {
    /// 不带抖动的退避间隔，`retry_count` 为进入 RETRY 后的计数（从 1 开始）
    pub fn base_delay(&self, retry_count: i32) -> f64 {
        let exponent = (retry_count - 1).max(0);
        let exponential = self.base_interval_seconds as f64 * self.backoff_multiplier.powi(exponent);
        exponential.min(self.max_interval_seconds as f64)
    }

    pub fn delay(&self, retry_count: i32) -> Duration {
        let capped = self.base_delay(retry_count);
        // 抖动避免同时失败的任务在同一时刻重投
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let seconds = (capped + jitter)
            .max(self.base_interval_seconds as f64)
            .min(self.max_interval_seconds as f64);
        Duration::milliseconds((seconds * 1000.0) as i64)
    }

    pub fn next_retry_at(&self, retry_count: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.delay(retry_count)
    }
}
