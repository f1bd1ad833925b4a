//! Client certificate verification policy
//!
//! Verification runs only on the primary stream session; a companion datagram
//! session inherits the trust established by its primary. When verification
//! fails, the compatibility policy decides whether the handshake is aborted
//! or the session continues without certificate authentication, leaving the
//! decision to the authorization layer.

use std::fmt::Debug;
use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};
use thiserror::Error;
use tracing::{debug, info};

use crate::log::TlsLog;

/// Verification errors
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("no client certificate was presented")]
    NoCertificate,

    #[error("client certificate verification failed: {0}")]
    Rejected(#[source] rustls::Error),

    #[error("failed to build certificate verifier: {0}")]
    Build(#[from] VerifierBuilderError),
}

/// Which of a client's sessions is being verified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// The TLS stream session
    Primary,
    /// The datagram session multiplexed under an already verified primary
    Companion,
}

/// How certificate verification failures are treated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientAuthPolicy {
    /// Accept sessions whose certificate failed verification, marking them
    /// unauthenticated instead of failing the handshake
    pub cisco_client_compat: bool,
}

/// Per-session certificate authentication state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionAuth {
    label: Option<String>,
    /// The peer's chain verified against the trust anchors
    pub cert_auth_ok: bool,
    /// The peer presented at least one certificate
    pub peer_presented_cert: bool,
}

impl SessionAuth {
    /// State for a session identified as `label` in audit messages.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::default()
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Verify the peer chain presented on a session.
    ///
    /// Companion sessions are accepted untouched. For primary sessions the
    /// authentication state is reset and recomputed; on failure the error is
    /// returned only when the compatibility policy is off.
    pub fn verify(
        &mut self,
        kind: SessionKind,
        chain: &[CertificateDer<'_>],
        now: UnixTime,
        verifier: &dyn PeerVerifier,
        policy: ClientAuthPolicy,
        log: &dyn TlsLog,
    ) -> Result<(), VerifyError> {
        if kind == SessionKind::Companion {
            return Ok(());
        }

        self.cert_auth_ok = false;
        self.peer_presented_cert = !chain.is_empty();

        let result = match chain.split_first() {
            None => Err(VerifyError::NoCertificate),
            Some((end_entity, intermediates)) => verifier
                .verify_chain(end_entity, intermediates, now)
                .map_err(VerifyError::Rejected),
        };

        match result {
            Ok(()) => {
                self.cert_auth_ok = true;
                info!(session = self.label(), "client certificate verification succeeded");
                Ok(())
            }
            Err(err) => {
                log.audit(self.label(), &err.to_string());
                if policy.cisco_client_compat {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}

/// Whether the session should be treated as carrying a client certificate.
///
/// True once verification succeeded. Under the compatibility policy it is
/// also true when the peer merely presented a certificate, which covers
/// resumed sessions where verification did not run again.
pub const fn has_session_cert(auth: &SessionAuth, policy: ClientAuthPolicy) -> bool {
    if auth.cert_auth_ok {
        return true;
    }
    policy.cisco_client_compat && auth.peer_presented_cert
}

/// Verification state a rustls session binds once its handshake completes
///
/// rustls only asks its client verifier for a yes/no answer, so the
/// per-session outcome is recomputed here from the presented chain.
#[derive(Debug, Clone)]
pub struct SessionVerifier {
    peer: Arc<dyn PeerVerifier>,
    policy: ClientAuthPolicy,
    log: Arc<dyn TlsLog>,
}

impl SessionVerifier {
    pub fn new(
        peer: Arc<dyn PeerVerifier>,
        policy: ClientAuthPolicy,
        log: Arc<dyn TlsLog>,
    ) -> Self {
        Self { peer, policy, log }
    }

    pub const fn policy(&self) -> ClientAuthPolicy {
        self.policy
    }

    /// Compute the authentication state of a primary session labelled `label`.
    ///
    /// A peer that sent no certificate is left unauthenticated without an
    /// audit, since the handshake already decided whether that is allowed.
    pub fn authenticate(
        &self,
        label: &str,
        chain: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<SessionAuth, VerifyError> {
        let mut auth = SessionAuth::new(label);
        if chain.is_empty() {
            return Ok(auth);
        }
        auth.verify(
            SessionKind::Primary,
            chain,
            now,
            self.peer.as_ref(),
            self.policy,
            self.log.as_ref(),
        )?;
        Ok(auth)
    }
}

/// Chain verification against configured trust anchors
pub trait PeerVerifier: Debug + Send + Sync {
    fn verify_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<(), rustls::Error>;
}

/// [`PeerVerifier`] backed by webpki, with optional revocation lists
#[derive(Debug, Clone)]
pub struct WebPkiPeerVerifier {
    inner: Arc<dyn ClientCertVerifier>,
}

impl WebPkiPeerVerifier {
    pub fn new(
        roots: Arc<RootCertStore>,
        crls: Vec<CertificateRevocationListDer<'static>>,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, VerifyError> {
        let inner = WebPkiClientVerifier::builder_with_provider(roots, provider)
            .with_crls(crls)
            .allow_unauthenticated()
            .build()?;
        Ok(Self { inner })
    }
}

impl PeerVerifier for WebPkiPeerVerifier {
    fn verify_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<(), rustls::Error> {
        self.inner
            .verify_client_cert(end_entity, intermediates, now)
            .map(|_| ())
    }
}

/// rustls client verifier applying [`ClientAuthPolicy`] during the handshake
#[derive(Debug)]
pub struct PolicyClientVerifier {
    webpki: WebPkiPeerVerifier,
    policy: ClientAuthPolicy,
    mandatory: bool,
    log: Arc<dyn TlsLog>,
}

impl PolicyClientVerifier {
    /// `mandatory` makes clients without a certificate fail the handshake.
    pub fn new(
        webpki: WebPkiPeerVerifier,
        policy: ClientAuthPolicy,
        mandatory: bool,
        log: Arc<dyn TlsLog>,
    ) -> Self {
        Self {
            webpki,
            policy,
            mandatory,
            log,
        }
    }

    pub const fn policy(&self) -> ClientAuthPolicy {
        self.policy
    }
}

impl ClientCertVerifier for PolicyClientVerifier {
    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.webpki.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        match self.webpki.verify_chain(end_entity, intermediates, now) {
            Ok(()) => {
                info!("client certificate verification succeeded");
                Ok(ClientCertVerified::assertion())
            }
            // the session audits the accepted failure once it is labelled
            Err(err) if self.policy.cisco_client_compat => {
                debug!(error = %err, "accepting unverified client certificate");
                Ok(ClientCertVerified::assertion())
            }
            Err(err) => {
                self.log.audit(
                    None,
                    &format!("client certificate verification failed: {err}"),
                );
                Err(err)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.webpki.inner.supported_verify_schemes()
    }
}
