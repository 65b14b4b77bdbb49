//! Per-peer connection state machine.
//!
//! One [`RemoteConnection`] exists per discovered peer. It owns the
//! secured channel to that peer and is the only component allowed to
//! change the peer's status. Retry is deliberately external: a failed
//! attempt parks the peer in `Error` until re-discovery or a user action
//! asks for another try.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use anyhow::{Context, bail};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use warpdrop_core::auth::Authenticator;
use warpdrop_core::config::Settings;
use warpdrop_core::peer::{PeerRecord, PeerStatus};
use warpdrop_core::protocol::{
    self, MessageType, RegistrationRequestPayload, RegistrationResponsePayload,
};
use warpdrop_core::transport::{Connection, Connector};

use crate::session::{read_frame, write_frame};
use crate::trust::TrustStore;

/// An in-flight connection attempt.
struct Attempt {
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct Inner<Conn> {
    attempt: Option<Attempt>,
    channel: Option<Conn>,
}

/// State machine owning the channel to one peer.
///
/// Status transitions: `Disconnected → Connecting → Connected`, with
/// `Error` on failure and `Canceled` when a disconnect supersedes an
/// attempt. Every transition is also published on a watch channel so
/// observers never have to poll.
pub struct RemoteConnection<C: Connector> {
    record: StdMutex<PeerRecord>,
    status_tx: watch::Sender<PeerStatus>,
    connector: Arc<C>,
    authenticator: Arc<dyn Authenticator>,
    trust: Arc<TrustStore>,
    settings: Settings,
    inner: Mutex<Inner<C::Conn>>,
    disconnect_gate: Mutex<()>,
}

impl<C: Connector> RemoteConnection<C> {
    #[must_use]
    pub fn new(
        record: PeerRecord,
        connector: Arc<C>,
        authenticator: Arc<dyn Authenticator>,
        trust: Arc<TrustStore>,
        settings: Settings,
    ) -> Self {
        let (status_tx, _) = watch::channel(record.status);
        Self {
            record: StdMutex::new(record),
            status_tx,
            connector,
            authenticator,
            trust,
            settings,
            inner: Mutex::new(Inner {
                attempt: None,
                channel: None,
            }),
            disconnect_gate: Mutex::new(()),
        }
    }

    /// The peer's identity (registry key).
    #[must_use]
    pub fn identity(&self) -> String {
        self.record.lock().expect("record lock poisoned").identity.clone()
    }

    /// Snapshot of the peer record.
    #[must_use]
    pub fn record(&self) -> PeerRecord {
        self.record.lock().expect("record lock poisoned").clone()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> PeerStatus {
        self.record.lock().expect("record lock poisoned").status
    }

    /// Watch channel publishing every status transition.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<PeerStatus> {
        self.status_tx.subscribe()
    }

    fn set_status(&self, status: PeerStatus) {
        self.record.lock().expect("record lock poisoned").status = status;
        self.status_tx.send_replace(status);
    }

    /// Starts a connection attempt.
    ///
    /// Valid from `Idle`, `Disconnected` and `Error`; a no-op while
    /// already `Connecting` or `Connected`. The attempt runs on its own
    /// task: endpoint resolution, secured channel, registration
    /// handshake. Success records the resolved address and moves to
    /// `Connected`; failure records the cause and moves to `Error`
    /// without retrying.
    pub async fn start_connection(self: Arc<Self>) {
        let mut inner = self.inner.lock().await;

        {
            let mut record = self.record.lock().expect("record lock poisoned");
            if !record.status.can_start_connection() {
                debug!(
                    identity = %record.identity,
                    status = %record.status,
                    "Ignoring connection request"
                );
                return;
            }
            record.status = PeerStatus::Connecting;
            record.last_error = None;
        }
        self.status_tx.send_replace(PeerStatus::Connecting);

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let this = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel_rx => {
                    debug!(identity = %this.identity(), "Connection attempt canceled");
                    this.set_status(PeerStatus::Canceled);
                    this.set_status(PeerStatus::Disconnected);
                }
                result = this.attempt_connect() => match result {
                    Ok((channel, ip_address)) => {
                        this.inner.lock().await.channel = Some(channel);
                        {
                            let mut record = this.record.lock().expect("record lock poisoned");
                            record.ip_address = Some(ip_address);
                            record.status = PeerStatus::Connected;
                        }
                        this.status_tx.send_replace(PeerStatus::Connected);
                        info!(identity = %this.identity(), "Peer connected");
                    }
                    Err(e) => {
                        {
                            let mut record = this.record.lock().expect("record lock poisoned");
                            record.status = PeerStatus::Error;
                            record.last_error = Some(format!("{e:#}"));
                        }
                        this.status_tx.send_replace(PeerStatus::Error);
                        warn!(identity = %this.identity(), error = %e, "Connection attempt failed");
                    }
                }
            }
        });

        inner.attempt = Some(Attempt {
            cancel: cancel_tx,
            handle,
        });
    }

    /// Resolves the peer, secures a channel and runs the registration
    /// handshake. Returns the open channel and the resolved address.
    async fn attempt_connect(&self) -> anyhow::Result<(C::Conn, String)> {
        let (addr, identity) = {
            let record = self.record.lock().expect("record lock poisoned");
            (record.registration_address(), record.identity.clone())
        };

        let credentials = self
            .authenticator
            .server_credentials()
            .context("no credentials for the registration handshake")?;

        let mut channel = self
            .connector
            .connect(&addr)
            .await
            .with_context(|| format!("failed to reach {identity} at {addr}"))?;

        let request = RegistrationRequestPayload {
            identity: self.settings.device_identity.clone(),
            hostname: self.settings.hostname.clone(),
            certificate_b64: protocol::encode_certificate(&credentials.cert_der),
        };
        write_frame(&mut channel, MessageType::RegistrationRequest, &request).await?;

        let frame = read_frame(&mut channel).await?;
        let response: RegistrationResponsePayload = match frame.header.msg_type {
            MessageType::RegistrationResponse => protocol::decode_payload(&frame.payload)?,
            MessageType::Error => {
                let err: protocol::ErrorPayload = protocol::decode_payload(&frame.payload)?;
                bail!("peer refused registration: {} ({})", err.message, err.code);
            }
            other => bail!("unexpected reply to registration request: {other:?}"),
        };

        let peer_cert = protocol::decode_certificate(&response.certificate_b64)?;
        if !self.authenticator.verify(&peer_cert) {
            bail!("certificate presented by {identity} failed validation");
        }
        if response.identity != identity {
            warn!(
                expected = %identity,
                got = %response.identity,
                "Registration response identity differs from the advertised one"
            );
        }
        self.trust.pin(identity.clone(), peer_cert);

        let peer_addr = channel.peer();
        let ip_address = peer_addr
            .rsplit_once(':')
            .map_or(peer_addr.clone(), |(host, _)| host.to_string());

        Ok((channel, ip_address))
    }

    /// Tears down the connection, whatever state it is in.
    ///
    /// Cancels an in-flight attempt (`Connecting → Canceled →
    /// Disconnected`), gracefully closes an open channel, and resolves
    /// immediately when already settled. Safe to call concurrently:
    /// teardown work happens once, later callers wait on the same gate
    /// and return after it completes.
    pub async fn disconnect(&self) {
        let _gate = self.disconnect_gate.lock().await;

        let (attempt, mut channel) = {
            let mut inner = self.inner.lock().await;
            (inner.attempt.take(), inner.channel.take())
        };

        if let Some(attempt) = attempt {
            let _ = attempt.cancel.send(());
            if attempt.handle.await.is_err() {
                warn!(identity = %self.identity(), "Connection task panicked");
            }
            // The attempt may have completed between our take and the
            // cancel; pick up the channel it stored.
            if channel.is_none() {
                channel = self.inner.lock().await.channel.take();
            }
        }

        if let Some(mut channel) = channel {
            if let Err(e) = channel.shutdown().await {
                debug!(identity = %self.identity(), error = %e, "Channel shutdown failed");
            }
        }

        let needs_update = {
            let record = self.record.lock().expect("record lock poisoned");
            record.status != PeerStatus::Disconnected
        };
        if needs_update {
            self.set_status(PeerStatus::Disconnected);
        }
    }
}
