//! rustls signing keys backed by the delegation peer

use std::sync::Arc;

use rustls::SignatureAlgorithm;
use rustls::SignatureScheme;
use rustls::sign::{Signer, SigningKey};
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::{debug, trace};
use x509_parser::parse_x509_certificate;
use zeroize::Zeroizing;

use super::{DelegationError, KeyDelegationClient, KeyHandle, KeyIndex};

const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_CURVE_P256: &str = "1.2.840.10045.3.1.7";
const OID_CURVE_P384: &str = "1.3.132.0.34";
const OID_CURVE_P521: &str = "1.3.132.0.35";

// DER DigestInfo headers for PKCS#1 v1.5 signatures
const DIGEST_INFO_SHA256: &[u8] = &[
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];
const DIGEST_INFO_SHA384: &[u8] = &[
    0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02,
    0x05, 0x00, 0x04, 0x30,
];
const DIGEST_INFO_SHA512: &[u8] = &[
    0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03,
    0x05, 0x00, 0x04, 0x40,
];

/// Public-key algorithm of a delegated key, taken from its certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    EcdsaP256,
    EcdsaP384,
    EcdsaP521,
}

impl KeyAlgorithm {
    /// Read the key algorithm from a DER certificate's public key info.
    pub fn from_certificate(der: &[u8]) -> Result<Self, DelegationError> {
        let (_, cert) = parse_x509_certificate(der)
            .map_err(|e| DelegationError::InvalidCertificate(e.to_string()))?;
        let spki_algorithm = &cert.public_key().algorithm;

        match spki_algorithm.algorithm.to_id_string().as_str() {
            OID_RSA_ENCRYPTION => Ok(Self::Rsa),
            OID_EC_PUBLIC_KEY => {
                let curve = spki_algorithm
                    .parameters
                    .as_ref()
                    .and_then(|params| params.as_oid().ok())
                    .map(|oid| oid.to_id_string());
                match curve.as_deref() {
                    Some(OID_CURVE_P256) => Ok(Self::EcdsaP256),
                    Some(OID_CURVE_P384) => Ok(Self::EcdsaP384),
                    Some(OID_CURVE_P521) => Ok(Self::EcdsaP521),
                    other => Err(DelegationError::UnsupportedKey(format!(
                        "EC curve {}",
                        other.unwrap_or("(missing)")
                    ))),
                }
            }
            other => Err(DelegationError::UnsupportedKey(other.to_owned())),
        }
    }

    pub const fn signature_algorithm(self) -> SignatureAlgorithm {
        match self {
            Self::Rsa => SignatureAlgorithm::RSA,
            Self::EcdsaP256 | Self::EcdsaP384 | Self::EcdsaP521 => SignatureAlgorithm::ECDSA,
        }
    }

    /// Schemes this key can sign through the peer, most preferred first.
    ///
    /// The peer signs a precomputed digest, so RSA-PSS and EdDSA are absent.
    pub const fn schemes(self) -> &'static [SignatureScheme] {
        match self {
            Self::Rsa => &[
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA256,
            ],
            Self::EcdsaP256 => &[SignatureScheme::ECDSA_NISTP256_SHA256],
            Self::EcdsaP384 => &[SignatureScheme::ECDSA_NISTP384_SHA384],
            Self::EcdsaP521 => &[SignatureScheme::ECDSA_NISTP521_SHA512],
        }
    }

    /// Whether the key is usable for RSA key transport
    /// Whether any scheme this key signs with may be used in TLS 1.3
    pub fn supports_tls13(self) -> bool {
        self.schemes().iter().copied().any(allowed_in_tls13)
    }

    pub const fn can_decrypt(self) -> bool {
        matches!(self, Self::Rsa)
    }
}

/// What the peer is asked to sign for `message` under `scheme`
/// Whether `scheme` may sign a TLS 1.3 handshake.
///
/// TLS 1.3 drops PKCS#1 v1.5 and SHA-1 signatures from CertificateVerify.
pub const fn allowed_in_tls13(scheme: SignatureScheme) -> bool {
    !matches!(
        scheme,
        SignatureScheme::RSA_PKCS1_SHA1
            | SignatureScheme::ECDSA_SHA1_Legacy
            | SignatureScheme::RSA_PKCS1_SHA256
            | SignatureScheme::RSA_PKCS1_SHA384
            | SignatureScheme::RSA_PKCS1_SHA512
    )
}

fn signature_input(scheme: SignatureScheme, message: &[u8]) -> Option<Vec<u8>> {
    let input = match scheme {
        SignatureScheme::ECDSA_NISTP256_SHA256 => Sha256::digest(message).to_vec(),
        SignatureScheme::ECDSA_NISTP384_SHA384 => Sha384::digest(message).to_vec(),
        SignatureScheme::ECDSA_NISTP521_SHA512 => Sha512::digest(message).to_vec(),
        SignatureScheme::RSA_PKCS1_SHA256 => {
            [DIGEST_INFO_SHA256, Sha256::digest(message).as_slice()].concat()
        }
        SignatureScheme::RSA_PKCS1_SHA384 => {
            [DIGEST_INFO_SHA384, Sha384::digest(message).as_slice()].concat()
        }
        SignatureScheme::RSA_PKCS1_SHA512 => {
            [DIGEST_INFO_SHA512, Sha512::digest(message).as_slice()].concat()
        }
        _ => return None,
    };
    Some(input)
}

/// A configured key whose private half lives in the delegation peer.
///
/// Owns the key's [`KeyHandle`]; the handle is released when the key is
/// dropped.
#[derive(Debug)]
pub struct DelegatedKey {
    handle: KeyHandle,
    client: KeyDelegationClient,
    algorithm: KeyAlgorithm,
}

impl DelegatedKey {
    pub const fn new(handle: KeyHandle, client: KeyDelegationClient, algorithm: KeyAlgorithm) -> Self {
        Self {
            handle,
            client,
            algorithm,
        }
    }

    pub const fn handle(&self) -> &KeyHandle {
        &self.handle
    }

    pub const fn index(&self) -> KeyIndex {
        self.handle.index()
    }

    pub const fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Sign an already-hashed input (a digest, or DigestInfo for RSA).
    pub fn sign_prehashed(&self, input: &[u8]) -> Result<Vec<u8>, DelegationError> {
        self.client.sign(&self.handle, input)
    }

    /// Decrypt an RSA-encrypted premaster secret.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, DelegationError> {
        if !self.algorithm.can_decrypt() {
            return Err(DelegationError::UnsupportedKey(format!(
                "{:?} keys cannot decrypt",
                self.algorithm
            )));
        }
        self.client.decrypt(&self.handle, ciphertext)
    }
}

impl Drop for DelegatedKey {
    fn drop(&mut self) {
        trace!(key = %self.handle.index(), "released delegated key");
    }
}

/// [`SigningKey`] that forwards every signature to the delegation peer
#[derive(Debug, Clone)]
pub struct DelegatedSigningKey {
    key: Arc<DelegatedKey>,
}

impl DelegatedSigningKey {
    pub const fn new(key: Arc<DelegatedKey>) -> Self {
        Self { key }
    }

    pub const fn key(&self) -> &Arc<DelegatedKey> {
        &self.key
    }

    /// First of this key's schemes that the peer offered
    pub fn preferred_scheme(&self, offered: &[SignatureScheme]) -> Option<SignatureScheme> {
        self.key
            .algorithm
            .schemes()
            .iter()
            .copied()
            .find(|scheme| offered.contains(scheme))
    }
}

impl SigningKey for DelegatedSigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        let scheme = self.preferred_scheme(offered)?;
        debug!(key = %self.key.index(), ?scheme, "selected delegated signature scheme");
        Some(Box::new(DelegatedSigner {
            key: Arc::clone(&self.key),
            scheme,
        }))
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        self.key.algorithm.signature_algorithm()
    }
}

#[derive(Debug)]
struct DelegatedSigner {
    key: Arc<DelegatedKey>,
    scheme: SignatureScheme,
}

impl Signer for DelegatedSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, rustls::Error> {
        let input = signature_input(self.scheme, message)
            .ok_or_else(|| rustls::Error::General("internal error".into()))?;
        Ok(self.key.sign_prehashed(&input)?)
    }

    fn scheme(&self) -> SignatureScheme {
        self.scheme
    }
}
