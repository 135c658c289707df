use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://mediaflow.db?mode=rwc".to_string(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_seconds: 30,
            run_migrations: true,
        }
    }
}

impl ConfigValidator for DatabaseConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_url(&self.url, &["sqlite"], "database.url")?;
        ValidationUtils::validate_count(self.max_connections as usize, "database.max_connections")?;

        if self.min_connections > self.max_connections {
            return Err(crate::ConfigError::Validation(
                "database.min_connections must be less than or equal to max_connections"
                    .to_string(),
            ));
        }

        ValidationUtils::validate_seconds(
            self.connection_timeout_seconds,
            3600,
            "database.connection_timeout_seconds",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_config_validation() {
        let config = DatabaseConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid_config = config.clone();
        invalid_config.url = "postgresql://localhost/test".to_string();
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = config.clone();
        invalid_config.max_connections = 0;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = config.clone();
        invalid_config.min_connections = 15;
        invalid_config.max_connections = 10;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = config;
        invalid_config.connection_timeout_seconds = 0;
        assert!(invalid_config.validate().is_err());
    }
}
