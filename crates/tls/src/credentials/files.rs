//! Loading certificate chains, trust anchors, CRLs, DH parameters and OCSP
//! responses from disk

use std::fs;
use std::path::Path;

use rustls::RootCertStore;
use rustls::pki_types::pem::{self, PemObject};
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer};
use tracing::debug;
use x509_parser::der_parser::ber::{BerObject, BerObjectContent};
use x509_parser::der_parser::parse_der;
use x509_parser::pem::Pem;
use x509_parser::{parse_x509_certificate, parse_x509_crl};

use super::CredentialError;

/// Most certificates accepted in one chain file
pub const MAX_CHAIN_LEN: usize = 8;

const DER_SEQUENCE: u8 = 0x30;

fn read(path: &Path) -> Result<Vec<u8>, CredentialError> {
    fs::read(path).map_err(|source| CredentialError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_error(path: &Path, reason: impl ToString) -> CredentialError {
    CredentialError::Parse {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Load a PEM certificate chain, leaf first.
///
/// The chain must be sorted (each certificate issued by the next) and hold
/// at most [`MAX_CHAIN_LEN`] certificates.
pub fn load_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    let contents = read(path)?;
    let chain = CertificateDer::pem_slice_iter(&contents)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| parse_error(path, e))?;

    if chain.is_empty() {
        return Err(CredentialError::EmptyChain {
            path: path.to_path_buf(),
        });
    }
    if chain.len() > MAX_CHAIN_LEN {
        return Err(CredentialError::ChainTooLong {
            path: path.to_path_buf(),
            count: chain.len(),
        });
    }

    let parsed = chain
        .iter()
        .map(|der| parse_x509_certificate(der).map(|(_, cert)| cert))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| parse_error(path, e))?;
    for (position, pair) in parsed.windows(2).enumerate() {
        if pair[0].issuer().as_raw() != pair[1].subject().as_raw() {
            return Err(CredentialError::UnsortedChain {
                path: path.to_path_buf(),
                position,
            });
        }
    }

    debug!(path = %path.display(), certificates = chain.len(), "loaded certificate chain");
    Ok(chain)
}

/// Load PEM trust anchors, returning the store and the number of anchors.
pub fn load_trust_anchors(path: &Path) -> Result<(RootCertStore, usize), CredentialError> {
    let trust_error = |reason: String| CredentialError::TrustAnchors {
        path: path.to_path_buf(),
        reason,
    };

    let contents = read(path)?;
    let certs = CertificateDer::pem_slice_iter(&contents)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| trust_error(e.to_string()))?;

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        debug!(path = %path.display(), ignored, "skipped unusable CA certificates");
    }
    if added == 0 {
        return Err(trust_error("no usable CA certificates".to_string()));
    }
    Ok((roots, added))
}

/// Load a CRL file in PEM or DER form.
///
/// A missing, empty or undecodable file is reported as
/// [`CredentialError::CrlUnreadable`]; a decodable file holding a malformed
/// CRL as [`CredentialError::CrlParse`].
pub fn load_crl(
    path: &Path,
) -> Result<Vec<CertificateRevocationListDer<'static>>, CredentialError> {
    let unreadable = || CredentialError::CrlUnreadable {
        path: path.to_path_buf(),
    };
    let contents = fs::read(path).map_err(|_| unreadable())?;
    if contents.is_empty() {
        return Err(unreadable());
    }

    let mut crls = match CertificateRevocationListDer::pem_slice_iter(&contents)
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(crls) => crls,
        Err(pem::Error::Base64Decode(_)) => return Err(unreadable()),
        Err(err) => {
            return Err(CredentialError::CrlParse {
                path: path.to_path_buf(),
                reason: err.to_string(),
            });
        }
    };
    if crls.is_empty() {
        if contents[0] != DER_SEQUENCE {
            return Err(unreadable());
        }
        crls.push(CertificateRevocationListDer::from(contents));
    }

    for crl in &crls {
        parse_x509_crl(crl).map_err(|e| CredentialError::CrlParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    }
    Ok(crls)
}

/// Finite-field Diffie-Hellman group from a PKCS#3 file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhParams {
    prime: Vec<u8>,
    generator: Vec<u8>,
    der: Vec<u8>,
}

impl DhParams {
    /// Size of the prime in bits
    pub fn prime_bits(&self) -> usize {
        let prime = strip_leading_zeros(&self.prime);
        match prime.first() {
            Some(top) => prime.len() * 8 - top.leading_zeros() as usize,
            None => 0,
        }
    }

    pub fn generator(&self) -> &[u8] {
        strip_leading_zeros(&self.generator)
    }

    /// The `DHParameter` structure as read from the file
    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

fn integer<'a>(object: &BerObject<'a>) -> Option<&'a [u8]> {
    match object.content {
        BerObjectContent::Integer(bytes) => Some(bytes),
        _ => None,
    }
}

/// Load and check a PEM `DH PARAMETERS` block.
pub fn load_dh_params(path: &Path) -> Result<DhParams, CredentialError> {
    let dh_error = |reason: &str| CredentialError::DhParams {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let contents = read(path)?;
    let der = Pem::iter_from_buffer(&contents)
        .filter_map(Result::ok)
        .find(|block| block.label == "DH PARAMETERS")
        .map(|block| block.contents)
        .ok_or_else(|| dh_error("no DH PARAMETERS block found"))?;

    let (_, object) = parse_der(&der).map_err(|_| dh_error("malformed DER"))?;
    let fields = object
        .as_sequence()
        .map_err(|_| dh_error("expected a SEQUENCE"))?;
    if !(2..=3).contains(&fields.len()) {
        return Err(dh_error("expected prime, generator and optional private length"));
    }
    let prime = integer(&fields[0]).ok_or_else(|| dh_error("prime is not an INTEGER"))?;
    let generator = integer(&fields[1]).ok_or_else(|| dh_error("generator is not an INTEGER"))?;
    if let Some(length) = fields.get(2) {
        integer(length).ok_or_else(|| dh_error("private length is not an INTEGER"))?;
    }

    let params = DhParams {
        prime: prime.to_vec(),
        generator: generator.to_vec(),
        der: der.clone(),
    };
    if params.prime_bits() < 2 || params.generator().is_empty() {
        return Err(dh_error("degenerate group"));
    }
    debug!(path = %path.display(), bits = params.prime_bits(), "loaded DH parameters");
    Ok(params)
}

/// Load a DER OCSP response for stapling.
pub fn load_ocsp_response(path: &Path) -> Result<Vec<u8>, CredentialError> {
    let response = read(path)?;
    if response.is_empty() {
        return Err(parse_error(path, "empty OCSP response"));
    }
    Ok(response)
}

/// Whether an RSA leaf certificate forbids key encipherment.
///
/// Returns `false` for non-RSA keys and for certificates without a key
/// usage extension.
pub fn rsa_without_key_encipherment(leaf: &CertificateDer<'_>) -> bool {
    let Ok((_, cert)) = parse_x509_certificate(leaf) else {
        return false;
    };
    if cert.public_key().algorithm.algorithm.to_id_string() != "1.2.840.113549.1.1.1" {
        return false;
    }
    matches!(cert.key_usage(), Ok(Some(usage)) if !usage.value.key_encipherment())
}
