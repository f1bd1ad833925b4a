//! Shared ambient support for the VPN gateway crates
//!
//! - `tracing`: subscriber initialization driven by [`tracing::config::InstrumentationConfig`]
//! - `validation`: configuration validation shared by every component config

#[cfg(feature = "tracing")]
pub mod tracing;
pub mod validation;

pub use validation::{ValidateConfig, validators};
