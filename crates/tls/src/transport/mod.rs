//! Record I/O over an established TLS session
//!
//! [`RecordTransport`] turns the engine's single-shot record calls into
//! all-or-error operations. Would-block and interrupted results are absorbed
//! and retried under a [`RetryPolicy`]; any other failure is returned to the
//! caller unchanged so it can decide which alert to send.

mod overhead;
mod rustls_session;

pub use overhead::{BulkCipher, MacAlgorithm, RecordProtocol, record_overhead};
pub use rustls_session::RustlsRecordSession;

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::{Duration, Instant};

use rustls::AlertDescription;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::verify::VerifyError;

/// Size of the buffer formatted messages are rendered into.
///
/// One byte is reserved, so at most `FORMAT_BUFFER_SIZE - 1` bytes go out.
pub const FORMAT_BUFFER_SIZE: usize = 1024;

/// Read size used when streaming a file into the session
pub const FILE_CHUNK_SIZE: usize = 512;

/// Errors produced by the record layer
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("operation would block")]
    WouldBlock,

    #[error("operation interrupted")]
    Interrupted,

    #[error("TLS engine error: {0}")]
    Engine(#[from] rustls::Error),

    #[error("transport I/O error: {0}")]
    Io(#[source] io::Error),

    #[error("file error: {0}")]
    File(#[source] io::Error),

    #[error("gave up after {0} transient retries")]
    RetryBudgetExhausted(u32),

    #[error("retry deadline exceeded")]
    DeadlineExceeded,

    #[error("operation cancelled")]
    Cancelled,

    #[error("peer authentication failed: {0}")]
    PeerRejected(#[source] VerifyError),
}

impl RecordError {
    /// Whether the operation should simply be attempted again
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::WouldBlock | Self::Interrupted)
    }

    /// Classify a socket error by its kind.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => Self::WouldBlock,
            io::ErrorKind::Interrupted => Self::Interrupted,
            _ => match err
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<rustls::Error>())
            {
                Some(engine) => Self::Engine(engine.clone()),
                None => Self::Io(err),
            },
        }
    }
}

/// Which way a stalled operation is waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// Single-shot record operations provided by a TLS engine binding.
///
/// Each call makes at most one attempt. Transient conditions are reported as
/// [`RecordError::WouldBlock`] or [`RecordError::Interrupted`] and the caller
/// decides whether to retry.
pub trait RecordSession {
    /// Encrypt and queue up to `data.len()` bytes, returning how many were accepted.
    fn record_send(&mut self, data: &[u8]) -> Result<usize, RecordError>;

    /// Read decrypted application data. `Ok(0)` means the peer closed cleanly.
    fn record_recv(&mut self, buf: &mut [u8]) -> Result<usize, RecordError>;

    /// Start buffering sends instead of emitting records.
    fn cork(&mut self);

    /// Emit everything buffered since [`cork`](Self::cork).
    fn uncork(&mut self) -> Result<(), RecordError>;

    /// Send a graceful close notification.
    fn bye(&mut self) -> Result<(), RecordError>;

    /// Emit a fatal alert.
    fn send_alert(&mut self, alert: AlertDescription) -> Result<(), RecordError>;

    /// Wait until the session is likely to make progress in `direction`.
    ///
    /// Called between retries of a transient failure. The default only yields
    /// the thread; bindings over non-blocking sockets should poll instead.
    fn await_readiness(&mut self, _direction: Direction, _timeout: Option<Duration>) {
        std::thread::yield_now();
    }
}

/// Bounds on how long transient failures are retried.
///
/// The default policy retries forever.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub max_transient_retries: Option<u32>,
    pub deadline: Option<Instant>,
    pub cancel: Option<CancellationToken>,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_transient_retries = Some(retries);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Per-operation retry accounting
struct RetryBudget<'a> {
    policy: &'a RetryPolicy,
    retries: u32,
}

impl<'a> RetryBudget<'a> {
    const fn new(policy: &'a RetryPolicy) -> Self {
        Self { policy, retries: 0 }
    }

    fn check(&self) -> Result<(), RecordError> {
        if self
            .policy
            .cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Err(RecordError::Cancelled);
        }
        if self
            .policy
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            return Err(RecordError::DeadlineExceeded);
        }
        if let Some(max) = self.policy.max_transient_retries
            && self.retries > max
        {
            return Err(RecordError::RetryBudgetExhausted(max));
        }
        Ok(())
    }

    /// Account for one transient failure and wait before the next attempt.
    fn absorb<S: RecordSession>(
        &mut self,
        session: &mut S,
        direction: Direction,
    ) -> Result<(), RecordError> {
        self.retries = self.retries.saturating_add(1);
        self.check()?;
        session.await_readiness(direction, self.policy.remaining());
        Ok(())
    }
}

/// Fixed-size sink for formatted messages that truncates on a char boundary
struct TruncatingBuffer {
    buf: [u8; FORMAT_BUFFER_SIZE],
    len: usize,
}

impl TruncatingBuffer {
    const LIMIT: usize = FORMAT_BUFFER_SIZE - 1;

    const fn new() -> Self {
        Self {
            buf: [0; FORMAT_BUFFER_SIZE],
            len: 0,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Write for TruncatingBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = Self::LIMIT - self.len;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Blocking-style record I/O over a [`RecordSession`]
#[derive(Debug)]
pub struct RecordTransport<S> {
    session: S,
    policy: RetryPolicy,
}

impl<S: RecordSession> RecordTransport<S> {
    /// Wrap `session` with an unbounded retry policy.
    pub fn new(session: S) -> Self {
        Self::with_policy(session, RetryPolicy::default())
    }

    pub const fn with_policy(session: S, policy: RetryPolicy) -> Self {
        Self { session, policy }
    }

    pub const fn session(&self) -> &S {
        &self.session
    }

    pub const fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: RetryPolicy) {
        self.policy = policy;
    }

    pub fn into_inner(self) -> S {
        self.session
    }

    /// Send all of `data`, retrying transient failures.
    ///
    /// Returns `data.len()` on success. Partial progress is resumed from the
    /// first unsent byte.
    pub fn send(&mut self, data: &[u8]) -> Result<usize, RecordError> {
        let mut budget = RetryBudget::new(&self.policy);
        budget.check()?;

        let mut sent = 0;
        while sent < data.len() {
            match self.session.record_send(&data[sent..]) {
                Ok(0) => budget.absorb(&mut self.session, Direction::Send)?,
                Ok(accepted) => sent += accepted.min(data.len() - sent),
                Err(err) if err.is_transient() => {
                    budget.absorb(&mut self.session, Direction::Send)?;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(data.len())
    }

    /// Send `data` without waiting on a full socket.
    ///
    /// Partial accepts are resumed from the first unsent byte, as in
    /// [`send`](Self::send). A would-block result counts as success for the
    /// whole buffer: the engine has queued the record and flushes it on a
    /// later operation. Unlike `send`, an `Ok(0)` accept is also treated as
    /// would-block rather than waited on. Interrupted attempts are retried.
    pub fn send_nonblocking(&mut self, data: &[u8]) -> Result<usize, RecordError> {
        let mut budget = RetryBudget::new(&self.policy);
        let mut sent = 0;
        while sent < data.len() {
            match self.session.record_send(&data[sent..]) {
                Ok(0) | Err(RecordError::WouldBlock) => break,
                Ok(accepted) => sent += accepted.min(data.len() - sent),
                Err(RecordError::Interrupted) => {
                    budget.absorb(&mut self.session, Direction::Send)?;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(data.len())
    }

    /// Stream the contents of the file at `path`, returning the bytes sent.
    ///
    /// The file is closed on every exit path.
    pub fn send_file(&mut self, path: impl AsRef<Path>) -> Result<u64, RecordError> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(RecordError::File)?;
        let mut chunk = [0u8; FILE_CHUNK_SIZE];
        let mut total = 0u64;

        loop {
            let len = match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(len) => len,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(RecordError::File(err)),
            };
            total += self.send(&chunk[..len])? as u64;
        }

        debug!(path = %path.display(), bytes = total, "sent file over TLS");
        Ok(total)
    }

    /// Receive into `buf`, retrying transient failures.
    ///
    /// `Ok(0)` signals the peer closed the session.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, RecordError> {
        let mut budget = RetryBudget::new(&self.policy);
        budget.check()?;

        loop {
            match self.session.record_recv(buf) {
                Err(err) if err.is_transient() => {
                    budget.absorb(&mut self.session, Direction::Receive)?;
                }
                other => return other,
            }
        }
    }

    pub fn cork(&mut self) {
        self.session.cork();
    }

    /// Flush corked data, retrying until everything has been handed off.
    pub fn uncork(&mut self) -> Result<(), RecordError> {
        let mut budget = RetryBudget::new(&self.policy);
        loop {
            match self.session.uncork() {
                Err(err) if err.is_transient() => {
                    budget.absorb(&mut self.session, Direction::Send)?;
                }
                other => return other,
            }
        }
    }

    /// Render `args` and send the result.
    ///
    /// Output longer than `FORMAT_BUFFER_SIZE - 1` bytes is cut at the last
    /// character boundary that fits.
    ///
    /// ```ignore
    /// transport.send_fmt(format_args!("X-CSTP-MTU: {}\r\n", mtu))?;
    /// ```
    pub fn send_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<usize, RecordError> {
        let mut rendered = TruncatingBuffer::new();
        // TruncatingBuffer never reports an error
        let _ = fmt::write(&mut rendered, args);
        self.send(rendered.as_bytes())
    }

    /// Close the session gracefully and release it.
    ///
    /// Failure to deliver the close notification is logged, not returned.
    pub fn close(mut self) {
        if let Err(err) = self.session.bye() {
            debug!(error = %err, "close notification not delivered");
        }
    }

    /// Send a fatal alert and release the session.
    pub fn fatal_close(mut self, alert: AlertDescription) {
        if let Err(err) = self.session.send_alert(alert) {
            warn!(?alert, error = %err, "fatal alert not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Session whose send results are scripted up front
    #[derive(Default)]
    struct Scripted {
        sends: VecDeque<Result<usize, RecordError>>,
        recvs: VecDeque<Result<usize, RecordError>>,
        wire: Vec<u8>,
        calls: usize,
        waits: usize,
    }

    impl RecordSession for Scripted {
        fn record_send(&mut self, data: &[u8]) -> Result<usize, RecordError> {
            self.calls += 1;
            let result = self.sends.pop_front().unwrap_or(Ok(data.len()));
            if let Ok(n) = result {
                self.wire.extend_from_slice(&data[..n.min(data.len())]);
            }
            result
        }

        fn record_recv(&mut self, _buf: &mut [u8]) -> Result<usize, RecordError> {
            self.calls += 1;
            self.recvs.pop_front().unwrap_or(Ok(0))
        }

        fn cork(&mut self) {}

        fn uncork(&mut self) -> Result<(), RecordError> {
            Ok(())
        }

        fn bye(&mut self) -> Result<(), RecordError> {
            Ok(())
        }

        fn send_alert(&mut self, _alert: AlertDescription) -> Result<(), RecordError> {
            Ok(())
        }

        fn await_readiness(&mut self, _direction: Direction, _timeout: Option<Duration>) {
            self.waits += 1;
        }
    }

    #[test]
    fn test_partial_sends_resume_from_offset() {
        let mut session = Scripted::default();
        session.sends.extend([Ok(3), Err(RecordError::Interrupted), Ok(2)]);
        let mut transport = RecordTransport::new(session);

        assert_eq!(transport.send(b"hello world").unwrap(), 11);
        assert_eq!(transport.session().wire, b"hello world");
        assert_eq!(transport.session().waits, 1);
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let mut session = Scripted::default();
        session
            .sends
            .extend((0..10).map(|_| Err(RecordError::WouldBlock)));
        let mut transport =
            RecordTransport::with_policy(session, RetryPolicy::default().with_max_retries(3));

        let err = transport.send(b"data").unwrap_err();
        assert!(matches!(err, RecordError::RetryBudgetExhausted(3)));
        assert_eq!(transport.session().calls, 4);
    }

    #[test]
    fn test_hard_error_passes_through() {
        let mut session = Scripted::default();
        session.recvs.push_back(Err(RecordError::Engine(
            rustls::Error::DecryptError,
        )));
        let mut transport = RecordTransport::new(session);
        let mut buf = [0u8; 16];

        let err = transport.recv(&mut buf).unwrap_err();
        assert!(matches!(err, RecordError::Engine(rustls::Error::DecryptError)));
    }

    #[test]
    fn test_truncating_buffer_respects_char_boundary() {
        use std::fmt::Write;

        let mut buf = TruncatingBuffer::new();
        let filler = "a".repeat(FORMAT_BUFFER_SIZE - 2);
        buf.write_str(&filler).unwrap();
        buf.write_str("é").unwrap();
        assert_eq!(buf.as_bytes().len(), FORMAT_BUFFER_SIZE - 2);
        buf.write_str("b").unwrap();
        assert_eq!(buf.as_bytes().len(), FORMAT_BUFFER_SIZE - 1);
        assert!(std::str::from_utf8(buf.as_bytes()).is_ok());
    }

    #[test]
    fn test_from_io_classification() {
        assert!(RecordError::from_io(io::ErrorKind::WouldBlock.into()).is_transient());
        assert!(RecordError::from_io(io::ErrorKind::Interrupted.into()).is_transient());
        assert!(matches!(
            RecordError::from_io(io::ErrorKind::BrokenPipe.into()),
            RecordError::Io(_)
        ));
        let wrapped = io::Error::new(io::ErrorKind::InvalidData, rustls::Error::DecryptError);
        assert!(matches!(
            RecordError::from_io(wrapped),
            RecordError::Engine(rustls::Error::DecryptError)
        ));
    }
}
