use crate::ConfigResult;

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

/// General validation utilities
pub struct ValidationUtils;

impl ValidationUtils {
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    /// Interval in milliseconds, 1ms..=1h
    pub fn validate_interval_ms(value: u64, field_name: &str) -> ConfigResult<()> {
        if value == 0 || value > 3_600_000 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be within 1..=3600000 ms, got {value}"
            )));
        }
        Ok(())
    }

    pub fn validate_count(count: usize, field_name: &str, max: usize) -> ConfigResult<()> {
        if count == 0 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if count > max {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be less than or equal to {max}"
            )));
        }
        Ok(())
    }

    /// Both thresholds finite and non-negative, warning strictly below critical
    pub fn validate_threshold_pair(
        warning: f64,
        critical: f64,
        field_name: &str,
    ) -> ConfigResult<()> {
        if !warning.is_finite() || !critical.is_finite() || warning < 0.0 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} thresholds must be finite and non-negative"
            )));
        }
        if warning >= critical {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name}: warning ({warning}) must be below critical ({critical})"
            )));
        }
        Ok(())
    }

    pub fn validate_ratio(value: f64, field_name: &str) -> ConfigResult<()> {
        if !(0.0..=1.0).contains(&value) {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be within 0.0..=1.0, got {value}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_not_empty() {
        assert!(ValidationUtils::validate_not_empty("test", "field").is_ok());
        assert!(ValidationUtils::validate_not_empty("   ", "field").is_err());
    }

    #[test]
    fn test_validate_interval_ms() {
        assert!(ValidationUtils::validate_interval_ms(1, "tick").is_ok());
        assert!(ValidationUtils::validate_interval_ms(3_600_000, "tick").is_ok());
        assert!(ValidationUtils::validate_interval_ms(0, "tick").is_err());
        assert!(ValidationUtils::validate_interval_ms(3_600_001, "tick").is_err());
    }

    #[test]
    fn test_validate_count() {
        assert!(ValidationUtils::validate_count(10, "test", 100).is_ok());
        assert!(ValidationUtils::validate_count(0, "test", 100).is_err());
        assert!(ValidationUtils::validate_count(101, "test", 100).is_err());
    }

    #[test]
    fn test_validate_threshold_pair() {
        assert!(ValidationUtils::validate_threshold_pair(80.0, 95.0, "cpu").is_ok());
        assert!(ValidationUtils::validate_threshold_pair(95.0, 80.0, "cpu").is_err());
        assert!(ValidationUtils::validate_threshold_pair(f64::NAN, 80.0, "cpu").is_err());
    }
}
