//! SHA-1 fingerprints of files and certificates
//!
//! Fingerprints are rendered as uppercase hex with no separators.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ring::digest::{SHA1_FOR_LEGACY_USE_ONLY, digest};
use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use thiserror::Error;
use x509_parser::parse_x509_certificate;

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path} does not hold a PEM or DER certificate: {reason}")]
    NotCertificate { path: PathBuf, reason: String },
}

/// What a fingerprint is computed over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintInput {
    /// The file bytes as stored
    RawFile,
    /// The DER encoding of the first certificate in the file
    Certificate,
}

/// SHA-1 of `data` as uppercase hex
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode_upper(digest(&SHA1_FOR_LEGACY_USE_ONLY, data))
}

/// Fingerprint the file at `path`.
pub fn fingerprint_file(
    path: impl AsRef<Path>,
    input: FingerprintInput,
) -> Result<String, FingerprintError> {
    let path = path.as_ref();
    let contents = fs::read(path).map_err(|source| FingerprintError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    match input {
        FingerprintInput::RawFile => Ok(sha1_hex(&contents)),
        FingerprintInput::Certificate => {
            let der = certificate_der(&contents).map_err(|reason| {
                FingerprintError::NotCertificate {
                    path: path.to_path_buf(),
                    reason,
                }
            })?;
            Ok(sha1_hex(&der))
        }
    }
}

/// DER encoding of the first certificate in `contents`, read as PEM and
/// falling back to DER.
pub fn certificate_der(contents: &[u8]) -> Result<Vec<u8>, String> {
    let der = match CertificateDer::pem_slice_iter(contents).next() {
        Some(Ok(cert)) => cert.to_vec(),
        Some(Err(err)) => return Err(err.to_string()),
        None => contents.to_vec(),
    };

    // re-encode only what the certificate actually spans
    let (rest, _) = parse_x509_certificate(&der).map_err(|e| e.to_string())?;
    let used = der.len() - rest.len();
    Ok(der[..used].to_vec())
}
