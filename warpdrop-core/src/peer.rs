use serde::{Deserialize, Serialize};

use crate::record::DEFAULT_PORT;

/// Connection status of a discovered peer.
///
/// Owned by the peer's `RemoteConnection` — no other component sets it.
/// `Idle` means the registry knows of the peer but no connection attempt
/// has been made yet; `Canceled` is the transient result of a disconnect
/// that superseded an in-flight attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    Idle,
    Disconnected,
    Connecting,
    Connected,
    Error,
    Canceled,
}

impl PeerStatus {
    /// Whether a new connection attempt may start from this status.
    ///
    /// Mirrors the re-discovery rule: a peer that is already connecting
    /// or connected is left alone.
    #[must_use]
    pub fn can_start_connection(self) -> bool {
        matches!(self, Self::Idle | Self::Disconnected | Self::Error)
    }

}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Network location of a peer's endpoints as learned from discovery.
///
/// The host is whatever the discovery layer handed us (usually a numeric
/// address, possibly a hostname) — resolution to a concrete socket
/// address happens when a connection is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub host: String,
    pub port: u16,
}

impl PeerEndpoint {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form usable by a connector.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Everything known about a discovered peer.
///
/// `identity` is the registry's primary key; `hostname` is display-only
/// and not guaranteed unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub identity: String,
    pub hostname: String,
    pub endpoint: PeerEndpoint,
    pub api_version: String,
    pub transfer_port: u16,
    pub registration_port: u16,
    /// Resolved numeric address, filled in once a connection succeeds.
    pub ip_address: Option<String>,
    pub status: PeerStatus,
    /// Cause of the most recent failure, present while status is `Error`.
    pub last_error: Option<String>,
}

impl PeerRecord {
    /// A fresh record for a peer just learned from discovery.
    #[must_use]
    pub fn new(identity: impl Into<String>, endpoint: PeerEndpoint) -> Self {
        let identity = identity.into();
        Self {
            hostname: identity.clone(),
            identity,
            endpoint,
            api_version: "1".into(),
            transfer_port: DEFAULT_PORT,
            registration_port: DEFAULT_PORT,
            ip_address: None,
            status: PeerStatus::Disconnected,
            last_error: None,
        }
    }

    /// Address of the peer's registration endpoint.
    #[must_use]
    pub fn registration_address(&self) -> String {
        format!("{}:{}", self.endpoint.host, self.registration_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_fresh_record_when_created_then_defaults_match_protocol() {
        let record = PeerRecord::new("p1", PeerEndpoint::new("192.168.1.20", 42000));
        assert_eq!(record.hostname, "p1");
        assert_eq!(record.api_version, "1");
        assert_eq!(record.transfer_port, 42000);
        assert_eq!(record.registration_port, 42000);
        assert_eq!(record.status, PeerStatus::Disconnected);
        assert!(record.ip_address.is_none());
        assert!(record.last_error.is_none());
    }

    #[test]
    fn given_idle_disconnected_and_error_when_checked_then_connection_may_start() {
        for status in [PeerStatus::Idle, PeerStatus::Disconnected, PeerStatus::Error] {
            assert!(status.can_start_connection(), "{status} should allow connecting");
        }
    }

    #[test]
    fn given_connecting_and_connected_when_checked_then_connection_may_not_start() {
        for status in [PeerStatus::Connecting, PeerStatus::Connected, PeerStatus::Canceled] {
            assert!(!status.can_start_connection(), "{status} should not allow connecting");
        }
    }

    #[test]
    fn given_endpoint_when_formatting_address_then_host_and_port_joined() {
        let endpoint = PeerEndpoint::new("10.0.0.7", 42001);
        assert_eq!(endpoint.address(), "10.0.0.7:42001");
    }

    #[test]
    fn given_record_when_formatting_registration_address_then_auth_port_used() {
        let mut record = PeerRecord::new("p1", PeerEndpoint::new("10.0.0.7", 42000));
        record.registration_port = 42001;
        assert_eq!(record.registration_address(), "10.0.0.7:42001");
    }
}
