//! TLS core configuration

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use vpngw_core::{ValidateConfig, validators};

use crate::delegation::MAX_KEYS;

const CONFIG_PATHS: [&str; 3] = [
    "vpngw-tls.toml",
    "config/vpngw-tls.toml",
    "/etc/vpngw/tls.toml",
];

/// Where a certificate chain comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CertSource {
    /// A PEM file on disk
    File(PathBuf),
    /// An indirect source such as a `pkcs11:` or `https://` URL
    Url(String),
}

impl CertSource {
    pub fn is_file(&self) -> bool {
        matches!(self, Self::File(_))
    }
}

impl From<String> for CertSource {
    fn from(value: String) -> Self {
        let is_url = value
            .split_once(':')
            .is_some_and(|(scheme, _)| {
                scheme.len() > 1
                    && scheme
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
            });
        if is_url {
            Self::Url(value)
        } else {
            Self::File(PathBuf::from(value))
        }
    }
}

impl From<&str> for CertSource {
    fn from(value: &str) -> Self {
        Self::from(value.to_owned())
    }
}

impl From<CertSource> for String {
    fn from(value: CertSource) -> Self {
        match value {
            CertSource::File(path) => path.to_string_lossy().into_owned(),
            CertSource::Url(url) => url,
        }
    }
}

impl fmt::Display for CertSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Url(url) => f.write_str(url),
        }
    }
}

/// Whether clients are asked for a certificate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertRequest {
    #[default]
    Ignore,
    Request,
    Require,
}

impl CertRequest {
    pub const fn wants_client_cert(self) -> bool {
        !matches!(self, Self::Ignore)
    }
}

/// Configuration of the TLS-termination core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Certificate chains, one per key, in key index order
    #[serde(default)]
    pub cert: Vec<CertSource>,

    /// Key references, one per certificate. The key material itself stays
    /// with the delegation peer.
    #[serde(default)]
    pub key: Vec<String>,

    /// Trust anchors for client certificates
    #[serde(default)]
    pub ca: Option<PathBuf>,

    /// Revocation list for client certificates, PEM or DER
    #[serde(default)]
    pub crl: Option<PathBuf>,

    /// PKCS#3 DH parameters
    #[serde(default)]
    pub dh_params_file: Option<PathBuf>,

    /// DER OCSP response stapled to the first chain
    #[serde(default)]
    pub ocsp_response: Option<PathBuf>,

    /// Cipher suite and protocol version policy
    #[serde(default = "default_priorities")]
    pub priorities: String,

    #[serde(default)]
    pub cert_req: CertRequest,

    /// Keep sessions whose client certificate failed verification
    #[serde(default)]
    pub cisco_client_compat: bool,

    /// Unix socket of the key delegation peer
    #[serde(default = "default_socket_file")]
    pub socket_file: PathBuf,

    /// Debug verbosity; TLS engine diagnostics start at 9
    #[serde(default)]
    pub debug: u8,

    /// Per-operation I/O timeout for key delegation requests
    #[serde(default)]
    pub delegation_timeout_ms: Option<u64>,
}

fn default_priorities() -> String {
    "NORMAL".to_string()
}

fn default_socket_file() -> PathBuf {
    PathBuf::from("/run/vpngw/keys.sock")
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: Vec::new(),
            key: Vec::new(),
            ca: None,
            crl: None,
            dh_params_file: None,
            ocsp_response: None,
            priorities: default_priorities(),
            cert_req: CertRequest::default(),
            cisco_client_compat: false,
            socket_file: default_socket_file(),
            debug: 0,
            delegation_timeout_ms: None,
        }
    }
}

impl TlsConfig {
    /// Load configuration from the usual file locations and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        for path in &CONFIG_PATHS {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path).required(false));
            }
        }

        let config = builder.add_source(environment()).build()?;
        config.try_deserialize()
    }

    /// Load configuration from a specific file, still honoring the environment
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::from(path.as_ref()))
            .add_source(environment())
            .build()?;
        config.try_deserialize()
    }

    pub fn delegation_timeout(&self) -> Option<Duration> {
        self.delegation_timeout_ms.map(Duration::from_millis)
    }
}

// VPNGW__CERT=a.pem,b.pem style overrides
fn environment() -> Environment {
    Environment::with_prefix("VPNGW")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("cert")
        .with_list_parse_key("key")
}

impl ValidateConfig for TlsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        validators::validate_non_empty_list(&self.cert, "cert")?;
        validators::validate_non_empty_list(&self.key, "key")?;
        if self.cert.len() != self.key.len() {
            return Err(ConfigError::Message(format!(
                "cert/key: {} certificates but {} keys configured",
                self.cert.len(),
                self.key.len()
            )));
        }
        validators::validate_range(self.key.len(), 1, MAX_KEYS, "key")?;
        validators::validate_not_empty(&self.priorities, "priorities")?;
        validators::validate_not_empty(&self.socket_file.to_string_lossy(), "socket_file")?;
        Ok(())
    }
}
