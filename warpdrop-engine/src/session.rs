//! Per-connection protocol sessions for the service endpoints.

use std::sync::Arc;

use anyhow::{Context, bail};
use bytes::BytesMut;
use tracing::{debug, info, warn};

use warpdrop_core::auth::Authenticator;
use warpdrop_core::config::Settings;
use warpdrop_core::protocol::{
    self, Frame, HelloAckPayload, HelloPayload, MessageType, RegistrationRequestPayload,
    RegistrationResponsePayload,
};
use warpdrop_core::transport::Connection;

use crate::trust::TrustStore;

/// Trait for handling accepted connections.
///
/// The server calls [`handle`](SessionHandler::handle) for every inbound
/// connection, each in its own spawned task. Implementations carry the
/// actual protocol logic.
///
/// Wrap shared state in the implementor itself — the server clones an
/// `Arc<H>` for every spawned task.
pub trait SessionHandler<C: Connection>: Send + Sync + 'static {
    fn handle(&self, conn: C) -> impl Future<Output = ()> + Send;
}

/// Reads one complete frame from `conn`, accumulating partial reads.
///
/// # Errors
///
/// Returns an error if the peer closes the connection mid-frame or the
/// bytes violate the protocol.
pub async fn read_frame<C: Connection>(conn: &mut C) -> anyhow::Result<Frame> {
    let mut accum = BytesMut::with_capacity(4096);
    let mut buf = [0u8; 2048];
    loop {
        if let Some(frame) = protocol::try_decode_frame(&mut accum)? {
            return Ok(frame);
        }
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            bail!("connection closed before a complete frame arrived");
        }
        accum.extend_from_slice(&buf[..n]);
    }
}

/// Encodes `payload` as a frame of `msg_type` and writes it to `conn`.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub async fn write_frame<C: Connection, T: serde::Serialize>(
    conn: &mut C,
    msg_type: MessageType,
    payload: &T,
) -> anyhow::Result<()> {
    let bytes = protocol::encode_payload_frame(msg_type, payload)?;
    conn.write_all(&bytes).await
}

/// Session handler for the transfer endpoint.
///
/// Answers the duplex hello so a freshly connected peer can confirm the
/// channel, then keeps draining frames. The transfer payload protocol
/// itself is layered on top by the transfer service and is not part of
/// this engine.
pub struct TransferSessionHandler {
    settings: Settings,
}

impl TransferSessionHandler {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    async fn process<C: Connection>(&self, conn: &mut C, frame: Frame) -> anyhow::Result<bool> {
        match frame.header.msg_type {
            MessageType::Hello => {
                let hello: HelloPayload = protocol::decode_payload(&frame.payload)?;
                info!(
                    peer = %hello.identity,
                    api_version = %hello.api_version,
                    "Transfer channel hello"
                );
                let ack = HelloAckPayload {
                    ok: true,
                    identity: self.settings.device_identity.clone(),
                };
                write_frame(conn, MessageType::HelloAck, &ack).await?;
                Ok(true)
            }
            MessageType::Error => {
                let err: protocol::ErrorPayload = protocol::decode_payload(&frame.payload)?;
                warn!(code = %err.code, message = %err.message, "Peer reported an error");
                Ok(false)
            }
            other => {
                debug!(msg_type = ?other, "Ignoring message on transfer channel");
                Ok(true)
            }
        }
    }
}

impl<C: Connection> SessionHandler<C> for TransferSessionHandler {
    async fn handle(&self, mut conn: C) {
        let peer = conn.peer();
        debug!(peer = %peer, "Transfer session started");
        loop {
            let frame = match read_frame(&mut conn).await {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(peer = %peer, reason = %e, "Transfer session ended");
                    return;
                }
            };
            match self.process(&mut conn, frame).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Error processing frame, closing session");
                    return;
                }
            }
        }
    }
}

/// Session handler for the registration endpoint.
///
/// One exchange per connection: the caller sends its identity and
/// certificate, we pin the certificate and answer with our own. After
/// this both sides can authenticate each other on the transfer endpoint.
pub struct RegistrationSessionHandler {
    settings: Settings,
    authenticator: Arc<dyn Authenticator>,
    trust: Arc<TrustStore>,
}

impl RegistrationSessionHandler {
    #[must_use]
    pub fn new(
        settings: Settings,
        authenticator: Arc<dyn Authenticator>,
        trust: Arc<TrustStore>,
    ) -> Self {
        Self {
            settings,
            authenticator,
            trust,
        }
    }

    async fn register<C: Connection>(&self, conn: &mut C) -> anyhow::Result<()> {
        let frame = read_frame(conn).await?;
        if frame.header.msg_type != MessageType::RegistrationRequest {
            bail!(
                "expected a registration request, got {:?}",
                frame.header.msg_type
            );
        }

        let request: RegistrationRequestPayload = protocol::decode_payload(&frame.payload)?;
        let peer_cert = protocol::decode_certificate(&request.certificate_b64)?;
        if !self.authenticator.verify(&peer_cert) {
            let refusal = protocol::ErrorPayload {
                code: "invalid-certificate".into(),
                message: "presented certificate failed validation".into(),
            };
            write_frame(conn, MessageType::Error, &refusal).await.ok();
            bail!("peer {} presented an invalid certificate", request.identity);
        }

        self.trust.pin(request.identity.clone(), peer_cert);
        info!(
            peer = %request.identity,
            hostname = %request.hostname,
            "Registered peer"
        );

        let credentials = self
            .authenticator
            .server_credentials()
            .context("no credentials available to answer registration")?;
        let response = RegistrationResponsePayload {
            identity: self.settings.device_identity.clone(),
            hostname: self.settings.hostname.clone(),
            certificate_b64: protocol::encode_certificate(&credentials.cert_der),
        };
        write_frame(conn, MessageType::RegistrationResponse, &response).await
    }
}

impl<C: Connection> SessionHandler<C> for RegistrationSessionHandler {
    async fn handle(&self, mut conn: C) {
        let peer = conn.peer();
        debug!(peer = %peer, "Registration session started");
        if let Err(e) = self.register(&mut conn).await {
            warn!(peer = %peer, error = %e, "Registration failed");
        }
        let _ = conn.shutdown().await;
    }
}
