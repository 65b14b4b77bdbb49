//! The authoritative registry of discovered peers.
//!
//! Exactly one [`RemoteConnection`] exists per peer identity, and only
//! the registry mutates the map. Discovery events, inbound registration
//! and user actions all funnel through here.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use warpdrop_core::auth::Authenticator;
use warpdrop_core::config::Settings;
use warpdrop_core::peer::PeerRecord;
use warpdrop_core::transport::Connector;

use crate::discovery::DiscoveryObserver;
use crate::remote::RemoteConnection;
use crate::trust::TrustStore;

/// View-layer notifications about registry mutations.
///
/// Implemented by the presentation collaborator; the registry only ever
/// holds it behind this interface so tests can substitute a recorder.
pub trait PeerObserver: Send + Sync + 'static {
    fn peer_added(&self, record: &PeerRecord);
    fn peer_removed(&self, identity: &str);
}

/// Identity-keyed map of peers and their connections.
pub struct RemoteRegistry<C: Connector> {
    peers: Mutex<HashMap<String, Arc<RemoteConnection<C>>>>,
    connector: Arc<C>,
    authenticator: Arc<dyn Authenticator>,
    trust: Arc<TrustStore>,
    observer: Arc<dyn PeerObserver>,
    settings: Settings,
}

impl<C: Connector> RemoteRegistry<C> {
    #[must_use]
    pub fn new(
        connector: Arc<C>,
        authenticator: Arc<dyn Authenticator>,
        trust: Arc<TrustStore>,
        observer: Arc<dyn PeerObserver>,
        settings: Settings,
    ) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            connector,
            authenticator,
            trust,
            observer,
            settings,
        }
    }

    /// Registers a newly discovered peer and starts connecting to it.
    ///
    /// Re-adding an identity that is still present is a caller error;
    /// the registry keeps its uniqueness invariant by ignoring the
    /// duplicate. Use the discovery path
    /// ([`handle_discovery_found`](Self::handle_discovery_found)), which
    /// checks for existing entries first.
    pub async fn add_peer(&self, record: PeerRecord) {
        let identity = record.identity.clone();
        let connection = {
            let mut peers = self.peers.lock().await;
            if peers.contains_key(&identity) {
                warn!(identity = %identity, "Peer already registered, ignoring duplicate add");
                return;
            }
            let connection = Arc::new(RemoteConnection::new(
                record.clone(),
                self.connector.clone(),
                self.authenticator.clone(),
                self.trust.clone(),
                self.settings.clone(),
            ));
            peers.insert(identity.clone(), connection.clone());
            connection
        };

        info!(identity = %identity, hostname = %record.hostname, "Peer added");
        self.observer.peer_added(&record);
        connection.start_connection().await;
    }

    /// Removes a peer: disconnect completes first, then the map entry
    /// goes, then the view layer hears about it. Unknown identities are
    /// a logged no-op.
    pub async fn remove_peer(&self, identity: &str) {
        let Some(connection) = self.peers.lock().await.get(identity).cloned() else {
            debug!(identity = %identity, "Remove requested for unknown peer");
            return;
        };

        connection.disconnect().await;

        let removed = self.peers.lock().await.remove(identity).is_some();
        if removed {
            info!(identity = %identity, "Peer removed");
            self.observer.peer_removed(identity);
        }
    }

    /// Pure lookup, no side effects.
    pub async fn find_peer(&self, identity: &str) -> Option<Arc<RemoteConnection<C>>> {
        self.peers.lock().await.get(identity).cloned()
    }

    /// Asks the peer's connection to start connecting; no-op if the
    /// peer is unknown.
    pub async fn start_connection(&self, identity: &str) {
        match self.find_peer(identity).await {
            Some(connection) => connection.start_connection().await,
            None => debug!(identity = %identity, "Connection requested for unknown peer"),
        }
    }

    /// Disconnects every current peer concurrently and resolves once
    /// all of them have finished, success or not. Individual failures
    /// are logged, never propagated; the map itself is left untouched.
    pub async fn shutdown_all(&self) {
        let connections: Vec<_> = self.peers.lock().await.values().cloned().collect();
        info!(count = connections.len(), "Disconnecting all peers");

        let handles: Vec<_> = connections
            .into_iter()
            .map(|connection| tokio::spawn(async move { connection.disconnect().await }))
            .collect();
        for handle in handles {
            if handle.await.is_err() {
                warn!("A disconnect task panicked during bulk shutdown");
            }
        }
    }

    /// Destructive cleanup used at process teardown, after
    /// [`shutdown_all`](Self::shutdown_all) has resolved: drops every
    /// entry and tells the view layer.
    pub async fn clear_after_shutdown(&self) {
        let drained: Vec<String> = self.peers.lock().await.drain().map(|(id, _)| id).collect();
        for identity in drained {
            self.observer.peer_removed(&identity);
        }
    }

    /// Snapshot of every known peer record, for display.
    pub async fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers
            .lock()
            .await
            .values()
            .map(|connection| connection.record())
            .collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Applies a discovery found-result: known peers in a settled state
    /// get a reconnect attempt, unknown peers are added. A peer that is
    /// already connecting or connected is left alone.
    pub async fn handle_discovery_found(&self, record: PeerRecord) {
        if let Some(existing) = self.find_peer(&record.identity).await {
            if existing.status().can_start_connection() {
                debug!(identity = %record.identity, "Known peer re-discovered, reconnecting");
                existing.start_connection().await;
            } else {
                debug!(
                    identity = %record.identity,
                    status = %existing.status(),
                    "Known peer re-discovered, nothing to do"
                );
            }
            return;
        }
        self.add_peer(record).await;
    }

    /// Applies a discovery loss-result.
    pub async fn handle_discovery_lost(&self, identity: &str) {
        self.remove_peer(identity).await;
    }
}

/// Adapter feeding discovery events into the registry.
///
/// Discovery callbacks are synchronous; registry work is not. The
/// bridge hops onto the runtime so the browser task never blocks on
/// peer teardown.
pub struct RegistryDiscoveryBridge<C: Connector> {
    registry: Arc<RemoteRegistry<C>>,
}

impl<C: Connector> RegistryDiscoveryBridge<C> {
    #[must_use]
    pub fn new(registry: Arc<RemoteRegistry<C>>) -> Self {
        Self { registry }
    }
}

impl<C: Connector> DiscoveryObserver for RegistryDiscoveryBridge<C> {
    fn peer_found(&self, record: PeerRecord) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            registry.handle_discovery_found(record).await;
        });
    }

    fn peer_lost(&self, identity: &str) {
        let registry = self.registry.clone();
        let identity = identity.to_string();
        tokio::spawn(async move {
            registry.handle_discovery_lost(&identity).await;
        });
    }
}
