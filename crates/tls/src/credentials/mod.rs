//! Credential lifecycle
//!
//! [`Credentials::load`] reads every configured certificate chain in order,
//! binds each to a delegated key at the matching index, loads the optional
//! trust anchors, CRL, DH parameters and OCSP response, and builds the rustls
//! [`ServerConfig`]. The server configuration, the revocation lists it was
//! built from and the matching per-session verifier are published together
//! in an [`ArcSwap`] so [`Credentials::reload_crl`] can replace them while
//! sessions are running.

mod files;
pub mod priority;

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig, ServerConnection, SignatureScheme};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::SharedSessionCache;
use crate::config::{CertRequest, CertSource, TlsConfig};
use crate::delegation::{
    DelegatedKey, DelegatedSigningKey, DelegationError, KeyAlgorithm, KeyAllocator,
    KeyDelegationClient, KeyIndex, allowed_in_tls13,
};
use crate::log::{DEBUG_TLS, TlsLog};
use crate::transport::{RecordError, RustlsRecordSession};
use crate::verify::{
    ClientAuthPolicy, PolicyClientVerifier, SessionVerifier, VerifyError, WebPkiPeerVerifier,
};

pub use self::files::{
    DhParams, MAX_CHAIN_LEN, load_chain, load_crl, load_dh_params, load_ocsp_response,
    load_trust_anchors, rsa_without_key_encipherment,
};
pub use self::priority::{PriorityError, PriorityPolicy};

/// Credential loading errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no certificate or key files were specified")]
    NoCertificates,

    #[error("certificate/key count mismatch: {certs} certificates but {keys} keys")]
    CountMismatch { certs: usize, keys: usize },

    #[error("loading a certificate from '{0}' is unsupported")]
    UnsupportedSource(String),

    #[error("error reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("error parsing {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("no certificates found in {path}")]
    EmptyChain { path: PathBuf },

    #[error("certificate chain in {path} has {count} certificates (at most {MAX_CHAIN_LEN})")]
    ChainTooLong { path: PathBuf, count: usize },

    #[error("certificate chain in {path} is not sorted: certificate {position} is not issued by the next one")]
    UnsortedChain { path: PathBuf, position: usize },

    #[error("error setting the CA ({path}) file: {reason}")]
    TrustAnchors { path: PathBuf, reason: String },

    #[error("client certificates are requested but no CA file is configured")]
    MissingCa,

    #[error("empty or unreadable CRL file ({path}); check documentation to generate an empty CRL")]
    CrlUnreadable { path: PathBuf },

    #[error("error reading the CRL ({path}) file: {reason}")]
    CrlParse { path: PathBuf, reason: String },

    #[error("error reading DH params ({path}): {reason}")]
    DhParams { path: PathBuf, reason: String },

    #[error(transparent)]
    Priority(#[from] PriorityError),

    #[error(transparent)]
    Delegation(#[from] DelegationError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error("error building the TLS server configuration: {0}")]
    Engine(#[from] rustls::Error),
}

/// One certificate chain bound to its delegated key
#[derive(Debug)]
pub struct LoadedChain {
    source: PathBuf,
    certs: Vec<CertificateDer<'static>>,
    signing_key: DelegatedSigningKey,
    certified: Arc<CertifiedKey>,
}

impl LoadedChain {
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Certificates, leaf first
    pub fn certs(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }

    pub fn key(&self) -> &Arc<DelegatedKey> {
        self.signing_key.key()
    }

    pub fn index(&self) -> KeyIndex {
        self.key().index()
    }

    /// The chain and key in the form rustls serves them
    pub const fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified
    }
}

/// Everything the TLS engine needs to terminate sessions
#[derive(Debug)]
pub struct Credentials {
    chains: Vec<LoadedChain>,
    ca_count: usize,
    crl_path: Option<PathBuf>,
    dh_params: Option<DhParams>,
    engine: EngineSettings,
    generation: ArcSwap<Generation>,
}

// What a CRL reload replaces as one unit
#[derive(Debug)]
struct Generation {
    crls: Arc<Vec<CertificateRevocationListDer<'static>>>,
    server_config: Arc<ServerConfig>,
    session_verifier: Option<Arc<SessionVerifier>>,
}

impl Credentials {
    /// Load all credentials named by `config`.
    pub fn load(config: &TlsConfig, log: Arc<dyn TlsLog>) -> Result<Self, CredentialError> {
        if config.cert.is_empty() || config.key.is_empty() {
            return Err(CredentialError::NoCertificates);
        }
        if config.cert.len() != config.key.len() {
            return Err(CredentialError::CountMismatch {
                certs: config.cert.len(),
                keys: config.key.len(),
            });
        }

        let dh_params = config
            .dh_params_file
            .as_deref()
            .map(load_dh_params)
            .transpose()?;

        let client = KeyDelegationClient::with_timeout(config.delegation_timeout());
        let mut allocator = KeyAllocator::new(&config.socket_file);
        let mut chains = Vec::with_capacity(config.cert.len());
        for (source, key_ref) in config.cert.iter().zip(&config.key) {
            let path = match source {
                CertSource::File(path) => path,
                CertSource::Url(url) => {
                    return Err(CredentialError::UnsupportedSource(url.clone()));
                }
            };
            let chain = load_keyed_chain(path, &mut allocator, &client, log.as_ref())?;
            debug!(key = %chain.index(), key_ref = %key_ref, "key reference served by delegation peer");
            chains.push(chain);
        }

        if let [only] = chains.as_slice()
            && rsa_without_key_encipherment(&only.certs[0])
        {
            warn!(
                cert = %only.source.display(),
                "server certificate key usage prevents key encipherment; unable to support the RSA ciphersuites"
            );
            if dh_params.is_none() {
                warn!("no DH-params file specified; server will be limited to ECDHE ciphersuites");
            }
        }

        if let Some(path) = &config.ocsp_response {
            let response = load_ocsp_response(path)?;
            if chains.len() > 1 {
                warn!(
                    chains = chains.len(),
                    "OCSP response is only stapled for the first certificate chain"
                );
            }
            let first = &mut chains[0];
            let mut certified = CertifiedKey::clone(&first.certified);
            certified.ocsp = Some(response);
            first.certified = Arc::new(certified);
        }

        let (roots, ca_count, crls) = if config.cert_req.wants_client_cert() {
            let ca = config.ca.as_deref().ok_or(CredentialError::MissingCa)?;
            let (roots, count) = load_trust_anchors(ca)?;
            info!("processed {} CA certificate(s)", count);
            let crls = config.crl.as_deref().map(load_crl).transpose()?;
            (Some(Arc::new(roots)), count, crls.unwrap_or_default())
        } else {
            (None, 0, Vec::new())
        };

        let mut priority = PriorityPolicy::parse(&config.priorities)?;
        if priority.enables_tls13()
            && !chains.iter().any(|chain| chain.key().algorithm().supports_tls13())
        {
            warn!("no configured key can sign a TLS 1.3 handshake; disabling TLS 1.3");
            priority.disable_tls13();
        }
        let provider = Arc::new(priority.crypto_provider()?);
        let tls13 = priority.enables_tls13();

        let engine = EngineSettings {
            provider,
            priority,
            roots,
            cert_req: config.cert_req,
            policy: ClientAuthPolicy {
                cisco_client_compat: config.cisco_client_compat,
            },
            resolver: Arc::new(KeyRingResolver::new(&chains, tls13, Arc::clone(&log))),
            log,
            session_cache: SharedSessionCache::new(),
        };
        let generation = engine.generation(crls)?;

        debug!(chains = chains.len(), ca_count, "credentials loaded");
        Ok(Self {
            chains,
            ca_count,
            crl_path: config.crl.clone(),
            dh_params,
            engine,
            generation: ArcSwap::from_pointee(generation),
        })
    }

    /// Current server configuration for new handshakes
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.generation.load().server_config)
    }

    /// Verifier computing per-session certificate authentication, present
    /// when client certificates are requested
    pub fn session_verifier(&self) -> Option<Arc<SessionVerifier>> {
        self.generation.load().session_verifier.clone()
    }

    /// Start a server session over `sock` with the current configuration.
    ///
    /// The session routes engine diagnostics to the configured log and, when
    /// client certificates are requested, authenticates the peer as `label`
    /// once its handshake completes.
    pub fn new_session<S: Read + Write>(
        &self,
        sock: S,
        label: impl Into<String>,
    ) -> crate::Result<RustlsRecordSession<S>> {
        let generation = self.generation.load();
        let conn = ServerConnection::new(Arc::clone(&generation.server_config))
            .map_err(RecordError::Engine)?;
        let session = RustlsRecordSession::new(conn, sock).with_log(Arc::clone(&self.engine.log));
        Ok(match &generation.session_verifier {
            Some(verifier) => session.with_client_auth(label, Arc::clone(verifier)),
            None => session,
        })
    }

    /// Re-read the CRL file and publish a server configuration using it.
    ///
    /// On failure the previous CRL and server configuration stay active.
    pub fn reload_crl(&self) -> Result<(), CredentialError> {
        let Some(path) = &self.crl_path else {
            return Ok(());
        };
        if self.engine.roots.is_none() {
            return Ok(());
        }

        match load_crl(path).and_then(|crls| self.engine.generation(crls)) {
            Ok(generation) => {
                info!(path = %path.display(), crls = generation.crls.len(), "reloaded CRL");
                self.generation.store(Arc::new(generation));
                Ok(())
            }
            Err(err) => {
                error!("{}; keeping the previously loaded CRL", err);
                Err(err)
            }
        }
    }

    pub fn chains(&self) -> &[LoadedChain] {
        &self.chains
    }

    /// The delegated key at `index`
    pub fn key(&self, index: KeyIndex) -> Option<&Arc<DelegatedKey>> {
        self.chains
            .iter()
            .map(LoadedChain::key)
            .find(|key| key.index() == index)
    }

    pub const fn ca_count(&self) -> usize {
        self.ca_count
    }

    /// Revocation lists currently in force
    pub fn crls(&self) -> Arc<Vec<CertificateRevocationListDer<'static>>> {
        Arc::clone(&self.generation.load().crls)
    }

    pub const fn dh_params(&self) -> Option<&DhParams> {
        self.dh_params.as_ref()
    }

    pub const fn priority(&self) -> &PriorityPolicy {
        &self.engine.priority
    }

    pub const fn cert_req(&self) -> CertRequest {
        self.engine.cert_req
    }

    pub const fn client_auth_policy(&self) -> ClientAuthPolicy {
        self.engine.policy
    }

    pub const fn session_cache(&self) -> &SharedSessionCache {
        &self.engine.session_cache
    }
}

// Inputs that stay fixed across CRL reloads
#[derive(Debug)]
struct EngineSettings {
    provider: Arc<CryptoProvider>,
    priority: PriorityPolicy,
    roots: Option<Arc<RootCertStore>>,
    cert_req: CertRequest,
    policy: ClientAuthPolicy,
    log: Arc<dyn TlsLog>,
    session_cache: SharedSessionCache,
    resolver: Arc<KeyRingResolver>,
}

impl EngineSettings {
    fn generation(
        &self,
        crls: Vec<CertificateRevocationListDer<'static>>,
    ) -> Result<Generation, CredentialError> {
        let builder = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(&self.priority.protocol_versions())?;

        let (builder, session_verifier) = match &self.roots {
            Some(roots) => {
                let webpki = WebPkiPeerVerifier::new(
                    Arc::clone(roots),
                    crls.clone(),
                    Arc::clone(&self.provider),
                )?;
                let session_verifier = SessionVerifier::new(
                    Arc::new(webpki.clone()),
                    self.policy,
                    Arc::clone(&self.log),
                );
                let verifier = PolicyClientVerifier::new(
                    webpki,
                    self.policy,
                    self.cert_req == CertRequest::Require,
                    Arc::clone(&self.log),
                );
                (
                    builder.with_client_cert_verifier(Arc::new(verifier)),
                    Some(Arc::new(session_verifier)),
                )
            }
            None => (builder.with_no_client_auth(), None),
        };

        let resolver: Arc<dyn ResolvesServerCert> = self.resolver.clone();
        let mut config = builder.with_cert_resolver(resolver);
        config.session_storage = Arc::new(self.session_cache.clone());
        config.ignore_client_order = self.priority.server_precedence();
        Ok(Generation {
            crls: Arc::new(crls),
            server_config: Arc::new(config),
            session_verifier,
        })
    }
}

fn load_keyed_chain(
    path: &Path,
    allocator: &mut KeyAllocator,
    client: &KeyDelegationClient,
    log: &dyn TlsLog,
) -> Result<LoadedChain, CredentialError> {
    let certs = load_chain(path)?;
    let algorithm = KeyAlgorithm::from_certificate(&certs[0])?;
    let handle = allocator.allocate()?;
    let key = Arc::new(DelegatedKey::new(handle, client.clone(), algorithm));
    debug!(
        cert = %path.display(),
        key = %key.index(),
        ?algorithm,
        "bound certificate chain to delegated key"
    );
    if log.debug_enabled(DEBUG_TLS) {
        log.debug(
            DEBUG_TLS,
            &format!("{} signs through delegated key {}", path.display(), key.index()),
        );
    }

    let signing_key = DelegatedSigningKey::new(key);
    let certified = Arc::new(CertifiedKey::new(
        certs.clone(),
        Arc::new(signing_key.clone()),
    ));
    Ok(LoadedChain {
        source: path.to_path_buf(),
        certs,
        signing_key,
        certified,
    })
}

/// Chooses among the configured chains by the client's signature schemes
///
/// The first chain whose key can sign with an offered scheme wins. When
/// TLS 1.3 is enabled and the client offers a TLS 1.3 suite, schemes TLS 1.3
/// forbids are not counted, since rustls negotiates 1.3 with such a client.
#[derive(Debug)]
pub struct KeyRingResolver {
    entries: Vec<(Arc<CertifiedKey>, DelegatedSigningKey)>,
    tls13: bool,
    log: Arc<dyn TlsLog>,
}

impl KeyRingResolver {
    pub fn new(chains: &[LoadedChain], tls13: bool, log: Arc<dyn TlsLog>) -> Self {
        Self {
            entries: chains
                .iter()
                .map(|chain| (Arc::clone(&chain.certified), chain.signing_key.clone()))
                .collect(),
            tls13,
            log,
        }
    }

    fn usable_schemes(&self, client_hello: &ClientHello<'_>) -> Vec<SignatureScheme> {
        let offered = client_hello.signature_schemes().iter().copied();
        let tls13 = self.tls13
            && client_hello
                .cipher_suites()
                .iter()
                .any(|suite| u16::from(*suite) >> 8 == 0x13);
        if tls13 {
            offered.filter(|scheme| allowed_in_tls13(*scheme)).collect()
        } else {
            offered.collect()
        }
    }
}

impl ResolvesServerCert for KeyRingResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let usable = self.usable_schemes(&client_hello);
        let found = self
            .entries
            .iter()
            .enumerate()
            .find_map(|(position, (certified, key))| {
                key.preferred_scheme(&usable)
                    .map(|scheme| (position, scheme, Arc::clone(certified)))
            });
        match found {
            Some((position, scheme, certified)) => {
                if self.log.debug_enabled(3) {
                    self.log
                        .debug(3, &format!("serving chain {position} signing with {scheme:?}"));
                }
                Some(certified)
            }
            None => {
                debug!(?usable, "no configured key supports the client's signature schemes");
                None
            }
        }
    }
}
