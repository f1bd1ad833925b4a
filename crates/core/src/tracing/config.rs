//! Configuration for tracing and instrumentation

use serde::{Deserialize, Serialize};

/// Main instrumentation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentationConfig {
    /// Service name for tracing
    pub service_name: String,
    /// Service version
    pub service_version: String,
    /// Log level filter (e.g., "info", "debug", "trace")
    pub log_level: String,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            service_name: "vpngw".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl InstrumentationConfig {
    /// Configuration for a named service at a given level
    pub fn for_service(service_name: impl Into<String>, log_level: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            log_level: log_level.into(),
            ..Self::default()
        }
    }
}
