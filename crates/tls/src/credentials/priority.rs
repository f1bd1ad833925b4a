//! Cipher suite and protocol version policy strings
//!
//! A priority string is a `:`-separated list. Base keywords (`NORMAL`,
//! `PERFORMANCE`, `SECURE128`, `SECURE192`, `SECURE256`, `NONE`) replace the
//! current selection; `+NAME` appends an item, `-NAME` or `!NAME` removes it;
//! `%FLAG` tokens set options. Example:
//!
//! ```text
//! NORMAL:%SERVER_PRECEDENCE:-VERS-TLS1.0:-CHACHA20-POLY1305
//! ```

use rustls::SupportedCipherSuite;
use rustls::SupportedProtocolVersion;
use rustls::crypto::CryptoProvider;
use rustls::crypto::ring::{cipher_suite, default_provider};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PriorityError {
    #[error("error in TLS priority string: {token}")]
    Syntax { token: String },

    #[error("TLS priority string enables no {0}")]
    Empty(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Version {
    Tls12,
    Tls13,
}

const ALL_VERSIONS: [Version; 2] = [Version::Tls13, Version::Tls12];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cipher {
    Aes128Gcm,
    Aes256Gcm,
    Chacha20Poly1305,
}

const ALL_CIPHERS: [Cipher; 3] = [Cipher::Aes128Gcm, Cipher::Aes256Gcm, Cipher::Chacha20Poly1305];

// names that are valid in a priority string but have no rustls counterpart
const UNAVAILABLE: [&str; 9] = [
    "VERS-SSL3.0",
    "VERS-TLS1.0",
    "VERS-TLS1.1",
    "AES-128-CBC",
    "AES-256-CBC",
    "3DES-CBC",
    "ARCFOUR-128",
    "CAMELLIA-128-CBC",
    "CAMELLIA-256-CBC",
];

enum Item {
    Versions(&'static [Version]),
    Ciphers(&'static [Cipher]),
    Unavailable,
}

fn item(name: &str) -> Option<Item> {
    let item = match name {
        "VERS-TLS1.2" => Item::Versions(&[Version::Tls12]),
        "VERS-TLS1.3" => Item::Versions(&[Version::Tls13]),
        "VERS-ALL" | "VERS-TLS-ALL" => Item::Versions(&ALL_VERSIONS),
        "AES-128-GCM" => Item::Ciphers(&[Cipher::Aes128Gcm]),
        "AES-256-GCM" => Item::Ciphers(&[Cipher::Aes256Gcm]),
        "CHACHA20-POLY1305" => Item::Ciphers(&[Cipher::Chacha20Poly1305]),
        "CIPHER-ALL" => Item::Ciphers(&ALL_CIPHERS),
        other if UNAVAILABLE.contains(&other) => Item::Unavailable,
        _ => return None,
    };
    Some(item)
}

fn add<T: Copy + PartialEq>(list: &mut Vec<T>, items: &[T]) {
    for item in items {
        if !list.contains(item) {
            list.push(*item);
        }
    }
}

fn remove<T: PartialEq>(list: &mut Vec<T>, items: &[T]) {
    list.retain(|existing| !items.contains(existing));
}

/// Parsed priority string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityPolicy {
    versions: Vec<Version>,
    ciphers: Vec<Cipher>,
    server_precedence: bool,
}

impl PriorityPolicy {
    /// Parse a priority string, reporting the first token that is not understood.
    pub fn parse(priorities: &str) -> Result<Self, PriorityError> {
        let mut policy = Self {
            versions: Vec::new(),
            ciphers: Vec::new(),
            server_precedence: false,
        };

        for token in priorities.split(':').map(str::trim) {
            if token.is_empty() {
                continue;
            }
            let syntax = || PriorityError::Syntax {
                token: token.to_string(),
            };

            if let Some(flag) = token.strip_prefix('%') {
                if flag == "SERVER_PRECEDENCE" {
                    policy.server_precedence = true;
                } else {
                    debug!(flag, "ignoring TLS priority flag");
                }
                continue;
            }

            let (adding, name) = match token.as_bytes()[0] {
                b'+' => (true, &token[1..]),
                b'-' | b'!' => (false, &token[1..]),
                _ => {
                    policy.apply_keyword(token).ok_or_else(syntax)?;
                    continue;
                }
            };

            match item(name).ok_or_else(syntax)? {
                Item::Versions(versions) if adding => add(&mut policy.versions, versions),
                Item::Versions(versions) => remove(&mut policy.versions, versions),
                Item::Ciphers(ciphers) if adding => add(&mut policy.ciphers, ciphers),
                Item::Ciphers(ciphers) => remove(&mut policy.ciphers, ciphers),
                Item::Unavailable => debug!(name, "priority item not available, skipping"),
            }
        }

        Ok(policy)
    }

    fn apply_keyword(&mut self, keyword: &str) -> Option<()> {
        let ciphers: &[Cipher] = match keyword {
            "NORMAL" | "PERFORMANCE" | "SECURE128" => &ALL_CIPHERS,
            "SECURE192" | "SECURE256" => &[Cipher::Aes256Gcm, Cipher::Chacha20Poly1305],
            "NONE" => {
                self.versions.clear();
                self.ciphers.clear();
                return Some(());
            }
            _ => return None,
        };
        self.versions = ALL_VERSIONS.to_vec();
        self.ciphers = ciphers.to_vec();
        Some(())
    }

    /// Whether the server's suite order wins over the client's
    pub const fn server_precedence(&self) -> bool {
        self.server_precedence
    }

    pub fn enables_tls13(&self) -> bool {
        self.versions.contains(&Version::Tls13)
    }

    /// Drop TLS 1.3, as when no configured key can sign a TLS 1.3 handshake.
    pub fn disable_tls13(&mut self) {
        remove(&mut self.versions, &[Version::Tls13]);
    }

    /// Enabled protocol versions, newest first
    pub fn protocol_versions(&self) -> Vec<&'static SupportedProtocolVersion> {
        ALL_VERSIONS
            .iter()
            .filter(|v| self.versions.contains(*v))
            .map(|v| match v {
                Version::Tls12 => &rustls::version::TLS12,
                Version::Tls13 => &rustls::version::TLS13,
            })
            .collect()
    }

    /// Enabled cipher suites in preference order
    pub fn cipher_suites(&self) -> Vec<SupportedCipherSuite> {
        let mut suites = Vec::new();
        for version in ALL_VERSIONS {
            if !self.versions.contains(&version) {
                continue;
            }
            for cipher in &self.ciphers {
                suites.extend(suites_for(version, *cipher));
            }
        }
        suites
    }

    /// A ring-backed crypto provider restricted to this policy
    pub fn crypto_provider(&self) -> Result<CryptoProvider, PriorityError> {
        if self.protocol_versions().is_empty() {
            return Err(PriorityError::Empty("protocol versions"));
        }
        let cipher_suites = self.cipher_suites();
        if cipher_suites.is_empty() {
            return Err(PriorityError::Empty("cipher suites"));
        }
        Ok(CryptoProvider {
            cipher_suites,
            ..default_provider()
        })
    }
}

fn suites_for(version: Version, cipher: Cipher) -> Vec<SupportedCipherSuite> {
    match (version, cipher) {
        (Version::Tls13, Cipher::Aes128Gcm) => vec![cipher_suite::TLS13_AES_128_GCM_SHA256],
        (Version::Tls13, Cipher::Aes256Gcm) => vec![cipher_suite::TLS13_AES_256_GCM_SHA384],
        (Version::Tls13, Cipher::Chacha20Poly1305) => {
            vec![cipher_suite::TLS13_CHACHA20_POLY1305_SHA256]
        }
        (Version::Tls12, Cipher::Aes128Gcm) => vec![
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        ],
        (Version::Tls12, Cipher::Aes256Gcm) => vec![
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        ],
        (Version::Tls12, Cipher::Chacha20Poly1305) => vec![
            cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::CipherSuite;

    fn suite_ids(policy: &PriorityPolicy) -> Vec<CipherSuite> {
        policy.cipher_suites().iter().map(|s| s.suite()).collect()
    }

    #[test]
    fn test_normal_enables_everything() {
        let policy = PriorityPolicy::parse("NORMAL").unwrap();
        assert_eq!(policy.protocol_versions().len(), 2);
        assert_eq!(policy.cipher_suites().len(), 9);
        assert!(!policy.server_precedence());
    }

    #[test]
    fn test_modifiers() {
        let policy =
            PriorityPolicy::parse("NORMAL:-VERS-TLS1.2:-CHACHA20-POLY1305:%SERVER_PRECEDENCE")
                .unwrap();
        assert_eq!(policy.protocol_versions(), vec![&rustls::version::TLS13]);
        assert_eq!(
            suite_ids(&policy),
            vec![
                CipherSuite::TLS13_AES_128_GCM_SHA256,
                CipherSuite::TLS13_AES_256_GCM_SHA384
            ]
        );
        assert!(policy.server_precedence());
    }

    #[test]
    fn test_none_then_add() {
        let policy = PriorityPolicy::parse("NONE:+VERS-TLS1.2:+AES-256-GCM").unwrap();
        assert_eq!(
            suite_ids(&policy),
            vec![
                CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
            ]
        );
    }

    #[test]
    fn test_secure256_drops_aes128() {
        let policy = PriorityPolicy::parse("SECURE256:-VERS-TLS1.2").unwrap();
        assert!(!suite_ids(&policy).contains(&CipherSuite::TLS13_AES_128_GCM_SHA256));
    }

    #[test]
    fn test_legacy_items_are_accepted() {
        let policy =
            PriorityPolicy::parse("NORMAL:%COMPAT:-VERS-SSL3.0:-VERS-TLS1.0:-VERS-TLS1.1").unwrap();
        assert_eq!(policy.protocol_versions().len(), 2);
    }

    #[test]
    fn test_syntax_error_reports_token() {
        let err = PriorityPolicy::parse("NORMAL:+BOGUS-CIPHER:-VERS-TLS1.2").unwrap_err();
        assert_eq!(
            err,
            PriorityError::Syntax {
                token: "+BOGUS-CIPHER".into()
            }
        );
        let err = PriorityPolicy::parse("NORML").unwrap_err();
        assert!(err.to_string().contains("NORML"));
    }

    #[test]
    fn test_disable_tls13() {
        let mut policy = PriorityPolicy::parse("NORMAL").unwrap();
        assert!(policy.enables_tls13());
        policy.disable_tls13();
        assert!(!policy.enables_tls13());
        assert_eq!(policy.protocol_versions(), vec![&rustls::version::TLS12]);
        assert_eq!(policy.cipher_suites().len(), 6);

        let mut policy = PriorityPolicy::parse("NORMAL:-VERS-TLS1.2").unwrap();
        policy.disable_tls13();
        assert_eq!(
            policy.crypto_provider().unwrap_err(),
            PriorityError::Empty("protocol versions")
        );
    }

    #[test]
    fn test_empty_selection_rejected() {
        let policy = PriorityPolicy::parse("NONE:+VERS-TLS1.3").unwrap();
        assert_eq!(
            policy.crypto_provider().unwrap_err(),
            PriorityError::Empty("cipher suites")
        );
        let policy = PriorityPolicy::parse("NONE").unwrap();
        assert_eq!(
            policy.crypto_provider().unwrap_err(),
            PriorityError::Empty("protocol versions")
        );
    }
}
