//! Key delegation client
//!
//! The worker never holds private keys. Each sign or decrypt operation is
//! forwarded to a trusted peer process over a local Unix socket:
//!
//! ```text
//! request:  [key index: u8][op: b'S' | b'D'][payload ...]   then write-side shutdown
//! response: [length: u16, host order][payload: length bytes]
//! ```
//!
//! Every request uses a fresh connection and is attempted exactly once.
//! Failures are logged in detail locally and reported to the TLS engine as
//! a single generic internal error.

mod signer;

pub use signer::{DelegatedKey, DelegatedSigningKey, KeyAlgorithm, allowed_in_tls13};

use std::fmt;
use std::io::{self, IoSlice, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{error, trace};
use zeroize::Zeroizing;

/// Largest number of keys addressable with a one-byte index
pub const MAX_KEYS: usize = 256;

/// Position of a key among the configured keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyIndex(u8);

impl KeyIndex {
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for KeyIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Private-key operation requested from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Sign,
    Decrypt,
}

impl Operation {
    /// Wire tag for this operation
    pub const fn tag(self) -> u8 {
        match self {
            Self::Sign => b'S',
            Self::Decrypt => b'D',
        }
    }

    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'S' => Some(Self::Sign),
            b'D' => Some(Self::Decrypt),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sign => f.write_str("sign"),
            Self::Decrypt => f.write_str("decrypt"),
        }
    }
}

/// Address of one delegated key.
///
/// Handles are only minted by [`KeyAllocator`], so every index refers to a
/// configured key. They are deliberately not `Clone`: the owning key object
/// releases its handle when it is dropped.
#[derive(Debug, PartialEq, Eq)]
pub struct KeyHandle {
    index: KeyIndex,
    peer_address: PathBuf,
}

impl KeyHandle {
    pub const fn index(&self) -> KeyIndex {
        self.index
    }

    pub fn peer_address(&self) -> &Path {
        &self.peer_address
    }
}

/// Hands out sequential key indices, one per loaded certificate chain
#[derive(Debug)]
pub struct KeyAllocator {
    peer_address: PathBuf,
    next: usize,
}

impl KeyAllocator {
    pub fn new(peer_address: impl Into<PathBuf>) -> Self {
        Self {
            peer_address: peer_address.into(),
            next: 0,
        }
    }

    /// Allocate the next index. Indices are never reused.
    pub fn allocate(&mut self) -> Result<KeyHandle, DelegationError> {
        let index = u8::try_from(self.next).map_err(|_| DelegationError::TooManyKeys)?;
        self.next += 1;
        Ok(KeyHandle {
            index: KeyIndex(index),
            peer_address: self.peer_address.clone(),
        })
    }

    /// Number of indices handed out so far
    pub const fn allocated(&self) -> usize {
        self.next
    }
}

/// Key delegation errors.
///
/// Exchange failures are deliberately reported as [`DelegationError::Internal`]
/// whatever their cause.
#[derive(Debug, Error)]
pub enum DelegationError {
    #[error("internal error")]
    Internal,

    #[error("too many keys configured (at most {MAX_KEYS})")]
    TooManyKeys,

    #[error("unsupported key algorithm: {0}")]
    UnsupportedKey(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
}

impl From<DelegationError> for rustls::Error {
    fn from(_: DelegationError) -> Self {
        Self::General("internal error".into())
    }
}

/// Detailed cause of a failed exchange, kept for local logs
#[derive(Debug, Error)]
enum ExchangeFailure {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("socket setup failed: {0}")]
    Setup(#[source] io::Error),

    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("reading response length failed: {0}")]
    ReadLength(#[source] io::Error),

    #[error("reading {expected}-byte response failed: {source}")]
    ReadPayload {
        expected: usize,
        #[source]
        source: io::Error,
    },
}

/// Synchronous client for the key delegation protocol
#[derive(Debug, Clone, Default)]
pub struct KeyDelegationClient {
    timeout: Option<Duration>,
}

impl KeyDelegationClient {
    pub const fn new() -> Self {
        Self { timeout: None }
    }

    /// Bound each socket read and write by `timeout`. `None` waits forever.
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            timeout: timeout.filter(|t| !t.is_zero()),
        }
    }

    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Perform one request/response exchange with the peer.
    ///
    /// The response buffer is wiped when dropped, and on every error path.
    pub fn request(
        &self,
        handle: &KeyHandle,
        op: Operation,
        payload: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, DelegationError> {
        match self.exchange(handle, op, payload) {
            Ok(response) => {
                trace!(
                    key = %handle.index,
                    %op,
                    request_len = payload.len(),
                    response_len = response.len(),
                    "key delegation exchange complete"
                );
                Ok(response)
            }
            Err(failure) => {
                error!(
                    key = %handle.index,
                    %op,
                    peer = %handle.peer_address.display(),
                    "key delegation failed: {}",
                    failure
                );
                Err(DelegationError::Internal)
            }
        }
    }

    /// Have the peer sign `input` with the key behind `handle`.
    pub fn sign(&self, handle: &KeyHandle, input: &[u8]) -> Result<Vec<u8>, DelegationError> {
        let mut signature = self.request(handle, Operation::Sign, input)?;
        Ok(std::mem::take(&mut *signature))
    }

    /// Have the peer decrypt `ciphertext` with the key behind `handle`.
    pub fn decrypt(
        &self,
        handle: &KeyHandle,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, DelegationError> {
        self.request(handle, Operation::Decrypt, ciphertext)
    }

    fn exchange(
        &self,
        handle: &KeyHandle,
        op: Operation,
        payload: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, ExchangeFailure> {
        let mut stream =
            UnixStream::connect(&handle.peer_address).map_err(ExchangeFailure::Connect)?;
        stream
            .set_read_timeout(self.timeout)
            .and_then(|()| stream.set_write_timeout(self.timeout))
            .map_err(ExchangeFailure::Setup)?;

        // header and payload leave in a single write
        let header = [handle.index.get(), op.tag()];
        let expected = header.len() + payload.len();
        let written = stream
            .write_vectored(&[IoSlice::new(&header), IoSlice::new(payload)])
            .map_err(ExchangeFailure::Write)?;
        if written != expected {
            return Err(ExchangeFailure::ShortWrite { written, expected });
        }
        stream
            .shutdown(Shutdown::Write)
            .map_err(ExchangeFailure::Write)?;

        let mut length = [0u8; 2];
        stream
            .read_exact(&mut length)
            .map_err(ExchangeFailure::ReadLength)?;
        let expected = usize::from(u16::from_ne_bytes(length));

        let mut response = Zeroizing::new(vec![0u8; expected]);
        stream
            .read_exact(&mut response)
            .map_err(|source| ExchangeFailure::ReadPayload { expected, source })?;
        Ok(response)
    }
}
