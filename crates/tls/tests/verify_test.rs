//! Client certificate verification against the fixture CA and CRLs

mod common;

use std::io::Read;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;

use common::{RecordingLog, client_connection_as, fixture};
use rustls::crypto::ring::default_provider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::ClientCertVerifier;
use rustls::{CertificateError, RootCertStore, ServerConfig, ServerConnection};
use vpngw_tls::log::TlsLog;
use vpngw_tls::transport::RustlsRecordSession;
use vpngw_tls::verify::{
    ClientAuthPolicy, PeerVerifier, PolicyClientVerifier, SessionAuth, SessionKind,
    SessionVerifier, VerifyError, WebPkiPeerVerifier, has_session_cert,
};
use vpngw_tls::{RecordError, RecordTransport};

const STRICT: ClientAuthPolicy = ClientAuthPolicy {
    cisco_client_compat: false,
};
const COMPAT: ClientAuthPolicy = ClientAuthPolicy {
    cisco_client_compat: true,
};

fn cert(name: &str) -> CertificateDer<'static> {
    CertificateDer::from_pem_file(fixture(name)).unwrap()
}

fn crl(name: &str) -> Vec<CertificateRevocationListDer<'static>> {
    vec![CertificateRevocationListDer::from_pem_file(fixture(name)).unwrap()]
}

fn verifier(crls: Vec<CertificateRevocationListDer<'static>>) -> WebPkiPeerVerifier {
    let mut roots = RootCertStore::empty();
    roots.add(cert("ca.pem")).unwrap();
    WebPkiPeerVerifier::new(Arc::new(roots), crls, Arc::new(default_provider())).unwrap()
}

#[test]
fn test_trusted_client_verifies() {
    verifier(Vec::new())
        .verify_chain(&cert("client.pem"), &[], UnixTime::now())
        .unwrap();
    verifier(crl("crl.pem"))
        .verify_chain(&cert("client.pem"), &[], UnixTime::now())
        .unwrap();
}

#[test]
fn test_untrusted_client_rejected() {
    let err = verifier(Vec::new())
        .verify_chain(&cert("client-untrusted.pem"), &[], UnixTime::now())
        .unwrap_err();
    assert_eq!(
        err,
        rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)
    );
}

#[test]
fn test_revoked_client_rejected() {
    let err = verifier(crl("crl-revoked.pem"))
        .verify_chain(&cert("client.pem"), &[], UnixTime::now())
        .unwrap_err();
    assert_eq!(
        err,
        rustls::Error::InvalidCertificate(CertificateError::Revoked)
    );
}

#[test]
fn test_session_auth_strict_failure_is_audited() {
    let log = RecordingLog::default();
    let mut auth = SessionAuth::new("10.0.0.7:443");

    let err = auth
        .verify(
            SessionKind::Primary,
            &[cert("client-untrusted.pem")],
            UnixTime::now(),
            &verifier(Vec::new()),
            STRICT,
            &log,
        )
        .unwrap_err();
    assert!(matches!(err, VerifyError::Rejected(_)));
    assert!(auth.peer_presented_cert);
    assert!(!has_session_cert(&auth, STRICT));

    let audits = log.audits();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].0.as_deref(), Some("10.0.0.7:443"));
    assert!(audits[0].1.contains("verification failed"));
}

#[test]
fn test_session_auth_compat_continues_unauthenticated() {
    let log = RecordingLog::default();
    let mut auth = SessionAuth::new("s");

    auth.verify(
        SessionKind::Primary,
        &[cert("client.pem")],
        UnixTime::now(),
        &verifier(crl("crl-revoked.pem")),
        COMPAT,
        &log,
    )
    .unwrap();
    assert!(!auth.cert_auth_ok);
    assert!(has_session_cert(&auth, COMPAT));
    assert_eq!(log.audits().len(), 1);
}

#[test]
fn test_companion_session_inherits_trust() {
    let log = RecordingLog::default();
    let mut auth = SessionAuth::new("dtls");

    auth.verify(
        SessionKind::Companion,
        &[cert("client-untrusted.pem")],
        UnixTime::now(),
        &verifier(Vec::new()),
        STRICT,
        &log,
    )
    .unwrap();
    assert!(log.audits().is_empty());
}

#[test]
fn test_policy_verifier_in_handshake_hook() {
    let log = Arc::new(RecordingLog::default());

    let strict = PolicyClientVerifier::new(verifier(Vec::new()), STRICT, true, log.clone());
    assert!(strict.client_auth_mandatory());
    assert!(strict.offer_client_auth());
    assert!(!strict.root_hint_subjects().is_empty());
    strict
        .verify_client_cert(&cert("client.pem"), &[], UnixTime::now())
        .unwrap();
    assert!(
        strict
            .verify_client_cert(&cert("client-untrusted.pem"), &[], UnixTime::now())
            .is_err()
    );

    let compat = PolicyClientVerifier::new(verifier(Vec::new()), COMPAT, false, log.clone());
    assert!(!compat.client_auth_mandatory());
    compat
        .verify_client_cert(&cert("client-untrusted.pem"), &[], UnixTime::now())
        .unwrap();

    // accepted failures are left for the session to audit
    let audits = log.audits();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].0, None);
}

struct Handshake {
    result: Result<(), RecordError>,
    auth: Option<SessionAuth>,
    has_session_cert: bool,
}

/// Handshake with a client presenting `client_cert`. The rustls hook applies
/// `hook_policy` and the session authenticates under `session_policy`.
fn handshake_as(
    client_cert: &'static str,
    hook_policy: ClientAuthPolicy,
    session_policy: ClientAuthPolicy,
    log: &Arc<RecordingLog>,
) -> Handshake {
    let tls_log: Arc<dyn TlsLog> = log.clone();
    let hook =
        PolicyClientVerifier::new(verifier(Vec::new()), hook_policy, false, tls_log.clone());
    let chain: Vec<CertificateDer<'static>> =
        CertificateDer::pem_file_iter(fixture("server-ecdsa-chain.pem"))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
    let key = PrivateKeyDer::from_pem_file(fixture("server-ecdsa.key")).unwrap();
    let config = ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(hook))
        .with_single_cert(chain, key)
        .unwrap();
    let session_verifier =
        SessionVerifier::new(Arc::new(verifier(Vec::new())), session_policy, tls_log);

    let (server_sock, mut client_sock) = UnixStream::pair().unwrap();
    let client = thread::spawn(move || {
        let mut conn = client_connection_as(client_cert);
        let mut tls = rustls::Stream::new(&mut conn, &mut client_sock);
        let mut rest = Vec::new();
        tls.read_to_end(&mut rest).map(|_| rest)
    });

    let conn = ServerConnection::new(Arc::new(config)).unwrap();
    let mut session = RustlsRecordSession::new(conn, server_sock)
        .with_client_auth("10.0.0.9:443", Arc::new(session_verifier));
    let result = session.handshake();
    let auth = session.session_auth().cloned();
    let has_session_cert = session.has_session_cert();
    if result.is_ok() {
        RecordTransport::new(session).close();
    } else {
        drop(session);
    }
    let _ = client.join().unwrap();

    Handshake {
        result,
        auth,
        has_session_cert,
    }
}

#[test]
fn test_compat_session_records_unverified_certificate() {
    let log = Arc::new(RecordingLog::default());
    let outcome = handshake_as("client-untrusted.pem", COMPAT, COMPAT, &log);

    outcome.result.unwrap();
    let auth = outcome.auth.unwrap();
    assert_eq!(auth.label(), Some("10.0.0.9:443"));
    assert!(!auth.cert_auth_ok);
    assert!(auth.peer_presented_cert);
    assert!(outcome.has_session_cert);

    let audits = log.audits();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].0.as_deref(), Some("10.0.0.9:443"));
    assert!(audits[0].1.contains("verification failed"));
}

#[test]
fn test_trusted_session_is_authenticated() {
    let log = Arc::new(RecordingLog::default());
    let outcome = handshake_as("client.pem", STRICT, STRICT, &log);

    outcome.result.unwrap();
    let auth = outcome.auth.unwrap();
    assert!(auth.cert_auth_ok);
    assert!(auth.peer_presented_cert);
    assert!(outcome.has_session_cert);
    assert!(log.audits().is_empty());
}

#[test]
fn test_strict_hook_aborts_handshake() {
    let log = Arc::new(RecordingLog::default());
    let outcome = handshake_as("client-untrusted.pem", STRICT, STRICT, &log);

    assert!(matches!(
        outcome.result,
        Err(RecordError::Engine(_) | RecordError::Io(_))
    ));
    assert!(outcome.auth.is_none());
    assert!(!outcome.has_session_cert);
    assert_eq!(log.audits().len(), 1);
}

#[test]
fn test_session_policy_can_reject_after_handshake() {
    let log = Arc::new(RecordingLog::default());
    let outcome = handshake_as("client-untrusted.pem", COMPAT, STRICT, &log);

    assert!(matches!(
        outcome.result,
        Err(RecordError::PeerRejected(VerifyError::Rejected(_)))
    ));
    assert!(outcome.auth.is_none());
    assert!(!outcome.has_session_cert);
}
