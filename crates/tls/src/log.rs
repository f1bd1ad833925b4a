//! Logging interface handed to the TLS core
//!
//! Components receive a [`TlsLog`] object at construction instead of
//! registering process-wide callbacks, so tests can substitute their own.

use std::fmt::Debug;
use std::sync::Arc;

use tracing::{debug, error, warn};

/// Debug level at which engine-level TLS diagnostics are enabled
pub const DEBUG_TLS: u8 = 9;

/// Audit and debug sink used by the TLS core
pub trait TlsLog: Debug + Send + Sync {
    /// Record a security-relevant warning.
    ///
    /// `session` labels the connection the message concerns; `None` means the
    /// message is not tied to any session.
    fn audit(&self, session: Option<&str>, message: &str);

    /// Record an engine debug message at `level` (higher is noisier).
    fn debug(&self, level: u8, message: &str);

    /// Whether a debug message at `level` would be recorded.
    fn debug_enabled(&self, level: u8) -> bool;
}

/// [`TlsLog`] backed by the `tracing` facade
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog {
    debug_threshold: u8,
}

impl TracingLog {
    /// Debug messages at or below `debug_threshold` are emitted; zero disables them.
    pub const fn new(debug_threshold: u8) -> Self {
        Self { debug_threshold }
    }

    /// Map the configured debug verbosity onto the TLS debug threshold.
    ///
    /// TLS diagnostics are only enabled once the configured level reaches
    /// [`DEBUG_TLS`].
    pub const fn from_debug_level(debug: u8) -> Self {
        if debug >= DEBUG_TLS {
            Self::new(DEBUG_TLS)
        } else {
            Self::new(0)
        }
    }

    pub fn shared(self) -> Arc<dyn TlsLog> {
        Arc::new(self)
    }
}

impl TlsLog for TracingLog {
    fn audit(&self, session: Option<&str>, message: &str) {
        match session {
            None => warn!(target: "vpngw_tls::auth", "warning: {}", message),
            Some(session) => error!(session = %session, "warning: {}", message),
        }
    }

    fn debug(&self, level: u8, message: &str) {
        if self.debug_enabled(level) {
            debug!(target: "vpngw_tls::engine", "TLS[<{}>]: {}", level, message);
        }
    }

    fn debug_enabled(&self, level: u8) -> bool {
        self.debug_threshold > 0 && level <= self.debug_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_gating() {
        let log = TracingLog::new(3);
        assert!(log.debug_enabled(1));
        assert!(log.debug_enabled(3));
        assert!(!log.debug_enabled(4));
    }

    #[test]
    fn test_zero_threshold_disables_debug() {
        let log = TracingLog::new(0);
        assert!(!log.debug_enabled(0));
        assert!(!log.debug_enabled(1));
    }

    #[test]
    fn test_from_debug_level() {
        assert!(!TracingLog::from_debug_level(2).debug_enabled(1));
        let log = TracingLog::from_debug_level(DEBUG_TLS);
        assert!(log.debug_enabled(DEBUG_TLS));
        assert!(!log.debug_enabled(DEBUG_TLS + 1));
    }
}
