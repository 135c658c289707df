use crate::ConfigResult;

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

/// General validation utilities
pub struct ValidationUtils;

impl ValidationUtils {
    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    /// Validate that a duration is positive and not above `max_seconds`
    pub fn validate_seconds(value: u64, max_seconds: u64, field_name: &str) -> ConfigResult<()> {
        if value == 0 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if value > max_seconds {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be less than or equal to {max_seconds}"
            )));
        }
        Ok(())
    }

    /// Validate that a count is reasonable
    pub fn validate_count(count: usize, field_name: &str) -> ConfigResult<()> {
        if count == 0 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if count > 10000 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be less than or equal to 10000"
            )));
        }
        Ok(())
    }

    /// Validate that a URL carries one of the accepted schemes
    pub fn validate_url(url: &str, schemes: &[&str], field_name: &str) -> ConfigResult<()> {
        Self::validate_not_empty(url, field_name)?;
        if !schemes.iter().any(|scheme| url.starts_with(&format!("{scheme}:"))) {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must start with one of {schemes:?}"
            )));
        }
        Ok(())
    }

    pub fn validate_socket_addr(value: &str, field_name: &str) -> ConfigResult<()> {
        value
            .parse::<std::net::SocketAddr>()
            .map(|_| ())
            .map_err(|e| crate::ConfigError::Validation(format!("{field_name} is invalid: {e}")))
    }
}
