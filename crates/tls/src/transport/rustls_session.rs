//! [`RecordSession`] binding over a rustls server connection

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::UnixTime;
use rustls::{AlertDescription, ServerConnection};
use tracing::{debug, trace};

use super::{RecordError, RecordSession};
use crate::log::TlsLog;
use crate::verify::{SessionAuth, SessionVerifier, has_session_cert};

/// A rustls server connection paired with its socket.
///
/// Works over blocking and non-blocking sockets alike; with a non-blocking
/// socket the would-block results surface as [`RecordError::WouldBlock`].
#[derive(Debug)]
pub struct RustlsRecordSession<S> {
    conn: ServerConnection,
    sock: S,
    corked: Option<Vec<u8>>,
    // plaintext accepted from callers but not yet taken by rustls
    backlog: Vec<u8>,
    log: Option<Arc<dyn TlsLog>>,
    client_auth: Option<(String, Arc<SessionVerifier>)>,
    auth: Option<SessionAuth>,
}

impl<S: Read + Write> RustlsRecordSession<S> {
    pub const fn new(conn: ServerConnection, sock: S) -> Self {
        Self {
            conn,
            sock,
            corked: None,
            backlog: Vec::new(),
            log: None,
            client_auth: None,
            auth: None,
        }
    }

    /// Route engine diagnostics for this session to `log`.
    pub fn with_log(mut self, log: Arc<dyn TlsLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Authenticate the peer's certificate as session `label` once the
    /// handshake completes.
    pub fn with_client_auth(
        mut self,
        label: impl Into<String>,
        verifier: Arc<SessionVerifier>,
    ) -> Self {
        self.client_auth = Some((label.into(), verifier));
        self
    }

    pub const fn connection(&self) -> &ServerConnection {
        &self.conn
    }

    pub const fn socket(&self) -> &S {
        &self.sock
    }

    pub fn into_parts(self) -> (ServerConnection, S) {
        (self.conn, self.sock)
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Certificate authentication state, available after the handshake when
    /// client authentication was attached.
    pub const fn session_auth(&self) -> Option<&SessionAuth> {
        self.auth.as_ref()
    }

    /// Whether the session counts as carrying a client certificate.
    pub fn has_session_cert(&self) -> bool {
        match (&self.auth, &self.client_auth) {
            (Some(auth), Some((_, verifier))) => has_session_cert(auth, verifier.policy()),
            _ => false,
        }
    }

    /// Drive the handshake to completion.
    ///
    /// On a non-blocking socket this returns [`RecordError::WouldBlock`] and
    /// may be called again once the socket is ready. With client
    /// authentication attached, a chain the policy rejects fails with
    /// [`RecordError::PeerRejected`].
    pub fn handshake(&mut self) -> Result<(), RecordError> {
        while self.conn.is_handshaking() {
            match self.conn.complete_io(&mut self.sock) {
                Ok((0, 0)) if self.conn.is_handshaking() => {
                    return Err(RecordError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed during handshake",
                    )));
                }
                Ok(_) => {}
                Err(err) => {
                    self.engine_debug(1, || format!("handshake failed: {err}"));
                    return Err(RecordError::from_io(err));
                }
            }
        }
        self.flush_pending()?;
        self.engine_debug(2, || {
            format!(
                "handshake complete: {:?} {:?}",
                self.conn.protocol_version(),
                self.conn.negotiated_cipher_suite().map(|s| s.suite())
            )
        });
        debug!(
            version = ?self.conn.protocol_version(),
            suite = ?self.conn.negotiated_cipher_suite().map(|s| s.suite()),
            resumed = matches!(self.conn.handshake_kind(), Some(rustls::HandshakeKind::Resumed)),
            "TLS handshake complete"
        );

        if self.auth.is_none()
            && let Some((label, verifier)) = &self.client_auth
        {
            let chain = self.conn.peer_certificates().unwrap_or_default();
            let auth = verifier
                .authenticate(label, chain, UnixTime::now())
                .map_err(RecordError::PeerRejected)?;
            self.auth = Some(auth);
        }
        Ok(())
    }

    fn engine_debug(&self, level: u8, message: impl FnOnce() -> String) {
        if let Some(log) = &self.log
            && log.debug_enabled(level)
        {
            log.debug(level, &message());
        }
    }

    /// Write every queued TLS record to the socket.
    fn flush_pending(&mut self) -> Result<(), RecordError> {
        while self.conn.wants_write() {
            self.conn
                .write_tls(&mut self.sock)
                .map_err(RecordError::from_io)?;
        }
        self.sock.flush().map_err(RecordError::from_io)
    }

    /// Hand the backlog to rustls and flush it out.
    fn drain_backlog(&mut self) -> Result<(), RecordError> {
        while !self.backlog.is_empty() {
            let accepted = self
                .conn
                .writer()
                .write(&self.backlog)
                .map_err(RecordError::from_io)?;
            self.backlog.drain(..accepted);
            self.flush_pending()?;
            if accepted == 0 && !self.backlog.is_empty() {
                return Err(RecordError::WouldBlock);
            }
        }
        Ok(())
    }
}

impl<S: Read + Write> RecordSession for RustlsRecordSession<S> {
    fn record_send(&mut self, data: &[u8]) -> Result<usize, RecordError> {
        if let Some(corked) = self.corked.as_mut() {
            corked.extend_from_slice(data);
            return Ok(data.len());
        }
        self.drain_backlog()?;
        if data.is_empty() {
            return Ok(0);
        }

        let accepted = self
            .conn
            .writer()
            .write(data)
            .map_err(RecordError::from_io)?;
        match self.flush_pending() {
            Ok(()) => {}
            // the accepted bytes stay queued in rustls and go out on the next flush
            Err(err) if err.is_transient() && accepted > 0 => {
                trace!(accepted, "record queued behind a full socket");
            }
            Err(err) => return Err(err),
        }

        if accepted == 0 {
            Err(RecordError::WouldBlock)
        } else {
            Ok(accepted)
        }
    }

    fn record_recv(&mut self, buf: &mut [u8]) -> Result<usize, RecordError> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(len) => return Ok(len),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(RecordError::from_io(err)),
            }

            self.conn
                .read_tls(&mut self.sock)
                .map_err(RecordError::from_io)?;
            if let Err(err) = self.conn.process_new_packets() {
                self.engine_debug(1, || format!("record processing failed: {err}"));
                // rustls has queued an alert describing the failure
                if let Err(flush_err) = self.flush_pending() {
                    debug!(error = %flush_err, "failed to deliver alert");
                }
                return Err(RecordError::Engine(err));
            }
            // key updates and tickets may need answering
            if let Err(err) = self.flush_pending()
                && !err.is_transient()
            {
                return Err(err);
            }
        }
    }

    fn cork(&mut self) {
        self.corked.get_or_insert_with(Vec::new);
    }

    fn uncork(&mut self) -> Result<(), RecordError> {
        if let Some(corked) = self.corked.take() {
            if self.backlog.is_empty() {
                self.backlog = corked;
            } else {
                self.backlog.extend_from_slice(&corked);
            }
        }
        self.drain_backlog()?;
        self.flush_pending()
    }

    fn bye(&mut self) -> Result<(), RecordError> {
        if let Some(corked) = self.corked.take() {
            self.backlog.extend_from_slice(&corked);
        }
        if let Err(err) = self.drain_backlog()
            && !err.is_transient()
        {
            return Err(err);
        }
        self.conn.send_close_notify();
        match self.flush_pending() {
            Err(err) if err.is_transient() => Ok(()),
            other => other,
        }
    }

    fn send_alert(&mut self, alert: AlertDescription) -> Result<(), RecordError> {
        // rustls only emits alerts for failures it detects itself; flush
        // whatever it has queued and drop pending application data
        debug!(?alert, "fatal close");
        self.engine_debug(2, || format!("sending fatal alert {alert:?}"));
        self.corked = None;
        self.backlog.clear();
        match self.flush_pending() {
            Err(err) if err.is_transient() => Ok(()),
            other => other,
        }
    }
}
