//! Error types for the TLS core

use thiserror::Error;

use crate::credentials::CredentialError;
use crate::delegation::DelegationError;
use crate::fingerprint::FingerprintError;
use crate::transport::RecordError;
use crate::verify::VerifyError;

/// Result type alias for TLS core operations
pub type Result<T> = std::result::Result<T, TlsCoreError>;

/// Errors that can occur anywhere in the TLS core
#[derive(Debug, Error)]
pub enum TlsCoreError {
    /// Record layer failure
    #[error("Record transport error: {0}")]
    Record(#[from] RecordError),

    /// Key delegation failure
    #[error("Key delegation error: {0}")]
    Delegation(#[from] DelegationError),

    /// Certificate verification failure
    #[error("Verification error: {0}")]
    Verify(#[from] VerifyError),

    /// Credential loading failure
    #[error("Credential error: {0}")]
    Credentials(#[from] CredentialError),

    /// Fingerprint computation failure
    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wraps_component_errors() {
        let err = TlsCoreError::from(RecordError::DeadlineExceeded);
        assert_eq!(err.to_string(), "Record transport error: retry deadline exceeded");
        assert!(matches!(
            TlsCoreError::from(VerifyError::NoCertificate),
            TlsCoreError::Verify(_)
        ));
    }
}
