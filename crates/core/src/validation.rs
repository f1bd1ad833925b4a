//! Configuration validation support

use config::ConfigError;
use serde::{Deserialize, Serialize};

/// Trait for validating configuration values
pub trait ValidateConfig: Serialize + for<'de> Deserialize<'de> {
    /// Validate the configuration
    ///
    /// Returns Ok(()) if valid, or an error describing what's wrong
    fn validate(&self) -> Result<(), ConfigError>;
}

/// Common validation helpers
pub mod validators {
    use config::ConfigError;

    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::Message(format!("{field}: cannot be empty")));
        }
        Ok(())
    }

    /// Validate that a list has at least one element
    pub fn validate_non_empty_list<T>(values: &[T], field: &str) -> Result<(), ConfigError> {
        if values.is_empty() {
            return Err(ConfigError::Message(format!(
                "{field}: at least one entry is required"
            )));
        }
        Ok(())
    }

    /// Validate that a value is within range
    pub fn validate_range<T: PartialOrd + std::fmt::Display>(
        value: T,
        min: T,
        max: T,
        field: &str,
    ) -> Result<(), ConfigError> {
        if value < min || value > max {
            return Err(ConfigError::Message(format!(
                "{field}: must be between {min} and {max}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::validators::*;

    #[test]
    fn test_validate_not_empty() {
        assert!(validate_not_empty("NORMAL", "priorities").is_ok());
        let err = validate_not_empty("   ", "priorities").unwrap_err();
        assert!(err.to_string().contains("priorities: cannot be empty"));
    }

    #[test]
    fn test_validate_non_empty_list() {
        assert!(validate_non_empty_list(&["a"], "cert").is_ok());
        let empty: [&str; 0] = [];
        let err = validate_non_empty_list(&empty, "cert").unwrap_err();
        assert!(err.to_string().contains("cert: at least one entry"));
    }

    #[test]
    fn test_validate_range() {
        assert!(validate_range(3, 1, 256, "keys").is_ok());
        assert!(validate_range(257, 1, 256, "keys").is_err());
        assert!(validate_range(0, 1, 256, "keys").is_err());
    }
}
