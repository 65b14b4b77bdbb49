//! Shared fakes for engine tests: scripted connections, a canned
//! connector, and a controllable authenticator.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use warpdrop_core::auth::{AuthError, Authenticator, Credentials};
use warpdrop_core::protocol::{
    self, MessageType, RegistrationRequestPayload, RegistrationResponsePayload,
};
use warpdrop_core::transport::{Connection, Connector};

/// What a [`ScriptedConnection`] does once its scripted bytes run out.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tail {
    /// Report end-of-stream (peer closed).
    Eof,
    /// Stay open: further reads never complete.
    Open,
}

/// A connection that serves pre-scripted bytes and records writes.
pub(crate) struct ScriptedConnection {
    to_read: Vec<u8>,
    read_pos: usize,
    tail: Tail,
    written: Arc<Mutex<Vec<u8>>>,
    shutdowns: Arc<AtomicUsize>,
    peer_addr: String,
}

impl ScriptedConnection {
    pub(crate) fn new(to_read: Vec<u8>, tail: Tail) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let conn = Self {
            to_read,
            read_pos: 0,
            tail,
            written: written.clone(),
            shutdowns: Arc::new(AtomicUsize::new(0)),
            peer_addr: "192.168.1.20:42001".into(),
        };
        (conn, written)
    }
}

impl Connection for ScriptedConnection {
    fn peer(&self) -> String {
        self.peer_addr.clone()
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        None
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            let remaining = &self.to_read[self.read_pos..];
            if remaining.is_empty() {
                match self.tail {
                    Tail::Eof => return Ok(0),
                    Tail::Open => std::future::pending::<()>().await,
                }
            }
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            self.read_pos += n;
            Ok(n)
        }
    }

    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

/// Scripted connection that closes after its bytes are consumed — the
/// shape session-handler tests want.
pub(crate) fn script_connection(to_read: Vec<u8>) -> (ScriptedConnection, Arc<Mutex<Vec<u8>>>) {
    ScriptedConnection::new(to_read, Tail::Eof)
}

/// Encoded registration response frame as a peer would answer it.
pub(crate) fn registration_response_bytes(identity: &str) -> Vec<u8> {
    let response = RegistrationResponsePayload {
        identity: identity.into(),
        hostname: identity.into(),
        certificate_b64: protocol::encode_certificate(FakeConnector::PEER_CERT),
    };
    protocol::encode_payload_frame(MessageType::RegistrationResponse, &response)
        .unwrap()
        .to_vec()
}

/// Decodes the registration request a [`ScriptedConnection`] captured.
pub(crate) fn decode_written_request(written: &Mutex<Vec<u8>>) -> RegistrationRequestPayload {
    let mut buf = bytes::BytesMut::from(written.lock().unwrap().as_slice());
    let frame = protocol::try_decode_frame(&mut buf).unwrap().unwrap();
    assert_eq!(frame.header.msg_type, MessageType::RegistrationRequest);
    protocol::decode_payload(&frame.payload).unwrap()
}

enum ConnectBehavior {
    /// Answer the handshake as peer `identity` and keep the channel open.
    Respond { identity: String },
    /// Never complete the connect call.
    Hang,
    /// Fail the connect call with this message.
    Fail { message: String },
}

/// Connector with a canned behavior, counting connection attempts and
/// remembering what was written on the most recent connection.
pub(crate) struct FakeConnector {
    behavior: ConnectBehavior,
    attempts: AtomicUsize,
    shutdowns: Arc<AtomicUsize>,
    last_written: Mutex<Option<Arc<Mutex<Vec<u8>>>>>,
}

impl FakeConnector {
    /// Certificate "DER" the fake peer hands out during registration.
    pub(crate) const PEER_CERT: &'static [u8] = b"fake-peer-cert";

    fn with_behavior(behavior: ConnectBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            attempts: AtomicUsize::new(0),
            shutdowns: Arc::new(AtomicUsize::new(0)),
            last_written: Mutex::new(None),
        })
    }

    pub(crate) fn responding(identity: &str) -> Arc<Self> {
        Self::with_behavior(ConnectBehavior::Respond {
            identity: identity.into(),
        })
    }

    pub(crate) fn hanging() -> Arc<Self> {
        Self::with_behavior(ConnectBehavior::Hang)
    }

    pub(crate) fn failing(message: &str) -> Arc<Self> {
        Self::with_behavior(ConnectBehavior::Fail {
            message: message.into(),
        })
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Total `shutdown` calls across every connection this connector made.
    pub(crate) fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Bytes written on the most recently created connection.
    pub(crate) fn last_written(&self) -> Option<Arc<Mutex<Vec<u8>>>> {
        self.last_written.lock().unwrap().clone()
    }
}

impl Connector for FakeConnector {
    type Conn = ScriptedConnection;

    fn connect<'a>(
        &'a self,
        _addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a {
        async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                ConnectBehavior::Respond { identity } => {
                    let (mut conn, written) =
                        ScriptedConnection::new(registration_response_bytes(identity), Tail::Open);
                    conn.shutdowns = self.shutdowns.clone();
                    *self.last_written.lock().unwrap() = Some(written);
                    Ok(conn)
                }
                ConnectBehavior::Hang => std::future::pending().await,
                ConnectBehavior::Fail { message } => Err(anyhow::anyhow!("{message}")),
            }
        }
    }
}

/// Authenticator returning a fixed pair, with a switch for `verify`.
pub(crate) struct FakeAuthenticator {
    accept: bool,
    deletions: AtomicUsize,
}

impl FakeAuthenticator {
    pub(crate) const CERT: &'static [u8] = b"fake-local-cert";

    pub(crate) fn accepting() -> Self {
        Self {
            accept: true,
            deletions: AtomicUsize::new(0),
        }
    }

    pub(crate) fn rejecting() -> Self {
        Self {
            accept: false,
            deletions: AtomicUsize::new(0),
        }
    }

    pub(crate) fn deletions(&self) -> usize {
        self.deletions.load(Ordering::SeqCst)
    }
}

impl Authenticator for FakeAuthenticator {
    fn server_credentials(&self) -> Result<Credentials, AuthError> {
        Ok(Credentials {
            cert_der: Self::CERT.to_vec(),
            private_key_pkcs8_der: b"fake-key".to_vec(),
        })
    }

    fn verify(&self, _cert_der: &[u8]) -> bool {
        self.accept
    }

    fn delete_credentials(&self) {
        self.deletions.fetch_add(1, Ordering::SeqCst);
    }
}

/// Observer recording peer add/remove notifications in order.
#[derive(Default)]
pub(crate) struct RecordingPeerObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingPeerObserver {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl crate::registry::PeerObserver for RecordingPeerObserver {
    fn peer_added(&self, record: &warpdrop_core::peer::PeerRecord) {
        self.events
            .lock()
            .unwrap()
            .push(format!("added:{}", record.identity));
    }

    fn peer_removed(&self, identity: &str) {
        self.events.lock().unwrap().push(format!("removed:{identity}"));
    }
}
