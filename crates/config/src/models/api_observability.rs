use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub cors_enabled: bool,
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8080".to_string(),
            cors_enabled: true,
            cors_origins: vec!["*".to_string()],
        }
    }
}

impl ConfigValidator for ApiConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_socket_addr(&self.bind_address, "api.bind_address")?;
        if self.cors_enabled && self.cors_origins.is_empty() {
            return Err(crate::ConfigError::Validation(
                "api.cors_origins cannot be empty when CORS is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// 推送连接管理
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    pub heartbeat_interval_seconds: u64,
    /// 超过该时长没有任何入站帧的连接被驱逐
    pub connection_timeout_seconds: u64,
    /// 每个连接的出站缓冲帧数
    pub channel_capacity: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 30,
            connection_timeout_seconds: 90,
            channel_capacity: 64,
        }
    }
}

impl ConfigValidator for NotifierConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_seconds(
            self.heartbeat_interval_seconds,
            3600,
            "notifier.heartbeat_interval_seconds",
        )?;
        ValidationUtils::validate_seconds(
            self.connection_timeout_seconds,
            3600,
            "notifier.connection_timeout_seconds",
        )?;
        if self.connection_timeout_seconds <= self.heartbeat_interval_seconds {
            return Err(crate::ConfigError::Validation(
                "notifier.connection_timeout_seconds must exceed heartbeat_interval_seconds"
                    .to_string(),
            ));
        }
        ValidationUtils::validate_count(self.channel_capacity, "notifier.channel_capacity")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    pub metrics_bind_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_bind_address: "0.0.0.0:9090".to_string(),
        }
    }
}

impl ConfigValidator for ObservabilityConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(crate::ConfigError::Validation(format!(
                "observability.log_level must be one of {valid_levels:?}"
            )));
        }
        if self.metrics_enabled {
            ValidationUtils::validate_socket_addr(
                &self.metrics_bind_address,
                "observability.metrics_bind_address",
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_config_validation() {
        assert!(ApiConfig::default().validate().is_ok());

        let mut config = ApiConfig::default();
        config.bind_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_notifier_config_validation() {
        assert!(NotifierConfig::default().validate().is_ok());

        let mut config = NotifierConfig::default();
        config.connection_timeout_seconds = config.heartbeat_interval_seconds;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_observability_config_validation() {
        assert!(ObservabilityConfig::default().validate().is_ok());

        let mut config = ObservabilityConfig::default();
        config.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }
}
