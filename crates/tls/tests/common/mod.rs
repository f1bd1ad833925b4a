//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::io::{Read, Write};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use tempfile::TempDir;
use vpngw_tls::delegation::Operation;
use vpngw_tls::log::TlsLog;

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// Client connection trusting the test CA, addressed to the test server name
pub fn client_connection() -> ClientConnection {
    let config = ClientConfig::builder()
        .with_root_certificates(client_roots())
        .with_no_client_auth();
    connect(config)
}

/// Like [`client_connection`], presenting the certificate in fixture `cert`
/// signed by `client.key`
pub fn client_connection_as(cert: &str) -> ClientConnection {
    let chain = vec![CertificateDer::from_pem_file(fixture(cert)).unwrap()];
    let key = PrivateKeyDer::from_pem_file(fixture("client.key")).unwrap();
    let config = ClientConfig::builder()
        .with_root_certificates(client_roots())
        .with_client_auth_cert(chain, key)
        .unwrap();
    connect(config)
}

fn client_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_file_iter(fixture("ca.pem")).unwrap() {
        roots.add(cert.unwrap()).unwrap();
    }
    roots
}

fn connect(config: ClientConfig) -> ClientConnection {
    let name = ServerName::try_from("vpn.example.com").unwrap();
    ClientConnection::new(Arc::new(config), name).unwrap()
}

/// One request as seen by the mock peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub index: u8,
    pub tag: u8,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn operation(&self) -> Option<Operation> {
        Operation::from_tag(self.tag)
    }
}

/// What the mock peer does with a request
pub enum Reply {
    /// Send this payload with a length prefix
    Payload(Vec<u8>),
    /// Announce `announced` bytes but send only `sent`
    Truncated { announced: u16, sent: Vec<u8> },
    /// Close without answering
    Hangup,
}

type Handler = dyn Fn(&Request) -> Reply + Send + Sync;

/// A key delegation peer listening on a Unix socket in a scratch directory.
///
/// Serves `connections` requests and then stops.
pub struct MockPeer {
    dir: TempDir,
    socket: PathBuf,
    requests: Arc<Mutex<Vec<Request>>>,
    worker: Option<JoinHandle<()>>,
}

impl MockPeer {
    pub fn echo(connections: usize) -> Self {
        Self::spawn(connections, |request| Reply::Payload(request.payload.clone()))
    }

    pub fn spawn(
        connections: usize,
        handler: impl Fn(&Request) -> Reply + Send + Sync + 'static,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("keys.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Box<Handler> = Box::new(handler);

        let seen = Arc::clone(&requests);
        let worker = thread::spawn(move || {
            for _ in 0..connections {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut raw = Vec::new();
                if stream.read_to_end(&mut raw).is_err() || raw.len() < 2 {
                    continue;
                }
                let request = Request {
                    index: raw[0],
                    tag: raw[1],
                    payload: raw[2..].to_vec(),
                };
                let reply = handler(&request);
                seen.lock().unwrap().push(request);

                let _ = match reply {
                    Reply::Payload(payload) => {
                        let len = u16::try_from(payload.len()).unwrap();
                        stream
                            .write_all(&len.to_ne_bytes())
                            .and_then(|()| stream.write_all(&payload))
                    }
                    Reply::Truncated { announced, sent } => stream
                        .write_all(&announced.to_ne_bytes())
                        .and_then(|()| stream.write_all(&sent)),
                    Reply::Hangup => Ok(()),
                };
            }
        });

        Self {
            dir,
            socket,
            requests,
            worker: Some(worker),
        }
    }

    pub fn socket(&self) -> &PathBuf {
        &self.socket
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    /// Wait for the peer to finish serving and return what it saw.
    pub fn finish(mut self) -> Vec<Request> {
        if let Some(worker) = self.worker.take() {
            worker.join().unwrap();
        }
        self.requests()
    }
}

/// [`TlsLog`] that keeps every audit message and every debug message it is
/// handed
#[derive(Debug, Default)]
pub struct RecordingLog {
    debug_threshold: u8,
    audits: Mutex<Vec<(Option<String>, String)>>,
    debugs: Mutex<Vec<(u8, String)>>,
}

impl RecordingLog {
    /// Log reporting debug levels up to `debug_threshold` as enabled
    pub fn with_debug(debug_threshold: u8) -> Self {
        Self {
            debug_threshold,
            ..Self::default()
        }
    }

    pub fn audits(&self) -> Vec<(Option<String>, String)> {
        self.audits.lock().unwrap().clone()
    }

    pub fn debugs(&self) -> Vec<(u8, String)> {
        self.debugs.lock().unwrap().clone()
    }
}

impl TlsLog for RecordingLog {
    fn audit(&self, session: Option<&str>, message: &str) {
        self.audits
            .lock()
            .unwrap()
            .push((session.map(str::to_owned), message.to_owned()));
    }

    fn debug(&self, level: u8, message: &str) {
        self.debugs.lock().unwrap().push((level, message.to_owned()));
    }

    fn debug_enabled(&self, level: u8) -> bool {
        self.debug_threshold > 0 && level <= self.debug_threshold
    }
}
