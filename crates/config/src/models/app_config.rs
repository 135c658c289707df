use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    api_observability::{ApiConfig, NotifierConfig, ObservabilityConfig},
    broker::BrokerConfig,
    database::DatabaseConfig,
    pipeline::{PipelineConfig, ReclaimerSettings, RetrySettings},
    worker::WorkerConfig,
};
use crate::validation::ConfigValidator;

pub const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/mediaflow.toml",
    "mediaflow.toml",
    "/etc/mediaflow/config.toml",
];

pub const ENV_PREFIX: &str = "MEDIAFLOW";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub retry: RetrySettings,
    pub reclaimer: ReclaimerSettings,
    pub worker: WorkerConfig,
    pub notifier: NotifierConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Built-in defaults
    /// 2. Config file (TOML format), `config_path` or the first existing default path
    /// 3. Environment variable overrides (`MEDIAFLOW__SECTION__KEY`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults =
            ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        match config_path {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(anyhow::anyhow!("配置文件不存在: {}", path));
                }
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
            None => {
                if let Some(path) = DEFAULT_CONFIG_PATHS
                    .iter()
                    .find(|path| Path::new(path).exists())
                {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML string, missing sections fall back to defaults
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let defaults =
            ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?;
        let config: AppConfig = ConfigBuilder::builder()
            .add_source(defaults)
            .add_source(File::from_str(toml_str, FileFormat::Toml))
            .build()
            .context("解析TOML配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// Validate configuration effectiveness
    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.broker.validate().context("消息代理配置验证失败")?;
        self.retry.validate().context("重试配置验证失败")?;
        self.reclaimer.validate().context("回收器配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.notifier.validate().context("推送配置验证失败")?;
        self.api.validate().context("API配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        self.pipeline.validate().context("流水线配置验证失败")?;

        // RETRY 行在退避期间不会更新，等待时限必须长于最长退避
        if self.reclaimer.pending_timeout_seconds <= self.retry.max_delay_seconds {
            return Err(anyhow::anyhow!(
                "reclaimer.pending_timeout_seconds ({}) 必须大于 retry.max_delay_seconds ({})",
                self.reclaimer.pending_timeout_seconds,
                self.retry.max_delay_seconds
            ));
        }
        Ok(())
    }
}
