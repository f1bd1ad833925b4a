//! TLS-termination core of the VPN gateway
//!
//! This crate owns the pieces of TLS handling that sit on the worker's trust
//! boundary:
//! - [`transport`]: record send/receive with transient-error retry and corking
//! - [`cache`]: session resumption storage that erases secrets on removal
//! - [`delegation`]: sign/decrypt requests forwarded to the key-holding peer,
//!   so the worker never holds private key material
//! - [`verify`]: client certificate verification policy
//! - [`credentials`]: certificate chain, trust anchor, CRL, DH and OCSP loading
//!   and the resulting rustls server configuration
//!
//! The TLS handshake itself is rustls' job; this crate only plugs into the
//! hooks rustls exposes.

pub mod cache;
pub mod config;
pub mod credentials;
pub mod delegation;
pub mod error;
pub mod fingerprint;
pub mod log;
pub mod transport;
pub mod verify;

pub use crate::cache::{SessionCache, SessionCacheEntry, SharedSessionCache};
pub use crate::config::{CertRequest, TlsConfig};
pub use crate::credentials::Credentials;
pub use crate::delegation::{KeyDelegationClient, KeyHandle, KeyIndex, Operation};
pub use crate::error::{Result, TlsCoreError};
pub use crate::log::{TlsLog, TracingLog};
pub use crate::transport::{RecordError, RecordSession, RecordTransport, RetryPolicy};
pub use crate::verify::{ClientAuthPolicy, SessionAuth, SessionKind};
