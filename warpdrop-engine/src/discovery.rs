//! mDNS advertisement and browsing.
//!
//! The publisher half advertises this device's service record; the
//! browser half watches for other devices and translates raw results
//! into typed peer-found / peer-lost events. Translation is pure and
//! separately testable: flush re-announcements are dropped entirely,
//! our own record is ignored, and TXT metadata parses with defaults.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use local_ip_address::local_ip;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use warpdrop_core::config::Settings;
use warpdrop_core::peer::{PeerEndpoint, PeerRecord, PeerStatus};
use warpdrop_core::record::{
    self, DEFAULT_API_VERSION, RecordMetadata, SERVICE_TYPE, TXT_API_VERSION, TXT_AUTH_PORT,
    TXT_HOSTNAME, TXT_TYPE, TYPE_FLUSH, TYPE_REAL,
};

/// Error type for discovery operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("discovery is already running")]
    AlreadyRunning,
    #[error("discovery failed: {0}")]
    Daemon(String),
}

impl From<mdns_sd::Error> for DiscoveryError {
    fn from(e: mdns_sd::Error) -> Self {
        Self::Daemon(e.to_string())
    }
}

/// Receiver of translated discovery events.
///
/// Callbacks fire on the browser task; implementations hop onto their
/// own executor if they need to do real work.
pub trait DiscoveryObserver: Send + Sync + 'static {
    fn peer_found(&self, record: PeerRecord);
    fn peer_lost(&self, identity: &str);
}

/// A raw discovery result, already lifted out of the mDNS library's
/// types so the translation rules below stay independent of it.
#[derive(Debug, Clone)]
pub(crate) struct RawResult {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub txt: HashMap<String, String>,
}

/// Translates a found-result into a peer record.
///
/// Returns `None` for flush re-announcements and for our own record.
pub(crate) fn translate_found(local_identity: &str, raw: &RawResult) -> Option<PeerRecord> {
    if record::is_flush_record(&raw.txt) {
        debug!(name = %raw.name, "Ignoring flush record");
        return None;
    }
    if raw.name == local_identity {
        debug!("Ignoring our own record");
        return None;
    }

    let meta = RecordMetadata::parse(&raw.name, &raw.txt);
    let mut peer = PeerRecord::new(&raw.name, PeerEndpoint::new(&raw.host, raw.port));
    peer.hostname = meta.hostname;
    peer.api_version = meta.api_version;
    peer.transfer_port = raw.port;
    peer.registration_port = meta.registration_port;
    peer.status = PeerStatus::Disconnected;
    Some(peer)
}

/// Translates a removed-result into the identity to drop.
///
/// The same flush and self filters apply; removal results that carry no
/// metadata simply have nothing to filter on.
pub(crate) fn translate_lost(
    local_identity: &str,
    name: &str,
    txt: &HashMap<String, String>,
) -> Option<String> {
    if record::is_flush_record(txt) {
        debug!(name = %name, "Ignoring flush removal");
        return None;
    }
    if name == local_identity {
        return None;
    }
    Some(name.to_string())
}

fn instance_name(fullname: &str) -> &str {
    fullname.split('.').next().unwrap_or(fullname)
}

/// Advertises this device's service record.
pub struct MdnsPublisher {
    settings: Settings,
    daemon: ServiceDaemon,
    registered: StdMutex<Option<String>>,
}

impl MdnsPublisher {
    /// # Errors
    ///
    /// Returns an error if the mDNS daemon cannot be created.
    pub fn new(settings: Settings) -> Result<Self, DiscoveryError> {
        Ok(Self {
            settings,
            daemon: ServiceDaemon::new()?,
            registered: StdMutex::new(None),
        })
    }

    fn service_info(&self, record_type: &str, ip: &str) -> Result<ServiceInfo, DiscoveryError> {
        let auth_port = self.settings.registration_port.to_string();
        let properties = [
            (TXT_HOSTNAME, self.settings.hostname.as_str()),
            (TXT_API_VERSION, DEFAULT_API_VERSION),
            (TXT_AUTH_PORT, auth_port.as_str()),
            (TXT_TYPE, record_type),
        ];
        let host_name = format!("{}.local.", self.settings.device_identity);
        Ok(ServiceInfo::new(
            SERVICE_TYPE,
            &self.settings.device_identity,
            &host_name,
            ip,
            self.settings.transfer_port,
            &properties[..],
        )?)
    }

    /// Starts advertising.
    ///
    /// Publishes a transient flush record first so peers discard any
    /// stale registration, then the durable one.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::AlreadyRunning`] when already advertising, or
    /// a daemon error.
    pub fn start(&self) -> Result<(), DiscoveryError> {
        let mut registered = self.registered.lock().expect("publisher lock poisoned");
        if registered.is_some() {
            return Err(DiscoveryError::AlreadyRunning);
        }

        let ip = local_ip()
            .map_err(|e| DiscoveryError::Daemon(format!("no usable address: {e}")))?
            .to_string();

        let flush = self.service_info(TYPE_FLUSH, &ip)?;
        let flush_name = flush.get_fullname().to_string();
        self.daemon.register(flush)?;
        let _ = self.daemon.unregister(&flush_name)?;

        let service = self.service_info(TYPE_REAL, &ip)?;
        let fullname = service.get_fullname().to_string();
        self.daemon.register(service)?;

        info!(
            identity = %self.settings.device_identity,
            addr = %ip,
            port = self.settings.transfer_port,
            "Advertising service"
        );
        *registered = Some(fullname);
        Ok(())
    }

    /// Withdraws the advertisement; trivially succeeds when stopped.
    pub fn stop(&self) {
        let fullname = self
            .registered
            .lock()
            .expect("publisher lock poisoned")
            .take();
        if let Some(fullname) = fullname {
            if let Err(e) = self.daemon.unregister(&fullname) {
                warn!(error = %e, "Failed to withdraw service record");
            } else {
                info!(identity = %self.settings.device_identity, "Advertisement withdrawn");
            }
        }
    }
}

/// Watches for other devices' service records.
pub struct MdnsBrowser {
    local_identity: String,
    daemon: ServiceDaemon,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl MdnsBrowser {
    /// # Errors
    ///
    /// Returns an error if the mDNS daemon cannot be created.
    pub fn new(local_identity: impl Into<String>) -> Result<Self, DiscoveryError> {
        Ok(Self {
            local_identity: local_identity.into(),
            daemon: ServiceDaemon::new()?,
            task: StdMutex::new(None),
        })
    }

    /// Starts browsing, feeding translated events into `observer`.
    /// Idempotent: a second start while browsing is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a daemon error if browsing cannot start.
    pub fn start<O: DiscoveryObserver>(&self, observer: Arc<O>) -> Result<(), DiscoveryError> {
        let mut task = self.task.lock().expect("browser lock poisoned");
        if task.is_some() {
            debug!("Browser already running");
            return Ok(());
        }

        let receiver = self.daemon.browse(SERVICE_TYPE)?;
        let local_identity = self.local_identity.clone();

        let handle = tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let Some(address) = info.get_addresses().iter().next().cloned() else {
                            debug!(name = %info.get_fullname(), "Resolved service has no address");
                            continue;
                        };
                        let raw = RawResult {
                            name: instance_name(info.get_fullname()).to_string(),
                            host: address.to_string(),
                            port: info.get_port(),
                            txt: info
                                .get_properties()
                                .iter()
                                .map(|p| (p.key().to_string(), p.val_str().to_string()))
                                .collect(),
                        };
                        if let Some(record) = translate_found(&local_identity, &raw) {
                            info!(identity = %record.identity, "Peer discovered");
                            observer.peer_found(record);
                        }
                    }
                    ServiceEvent::ServiceRemoved(_ty, fullname) => {
                        let name = instance_name(&fullname);
                        // Removal results carry no TXT metadata, so the
                        // flush filter sees an empty record here.
                        if let Some(identity) =
                            translate_lost(&local_identity, name, &HashMap::new())
                        {
                            info!(identity = %identity, "Peer lost");
                            observer.peer_lost(&identity);
                        }
                    }
                    other => {
                        debug!(event = ?other, "Ignoring discovery event");
                    }
                }
            }
            debug!("Browse loop ended");
        });

        *task = Some(handle);
        Ok(())
    }

    /// Stops browsing. Idempotent.
    pub fn stop(&self) {
        let task = self.task.lock().expect("browser lock poisoned").take();
        if let Some(handle) = task {
            if let Err(e) = self.daemon.stop_browse(SERVICE_TYPE) {
                warn!(error = %e, "Failed to stop browsing");
            }
            handle.abort();
            debug!("Browser stopped");
        }
    }
}

/// Both discovery halves, started and stopped together.
///
/// The publisher starts first so our record is up before we begin
/// reacting to others.
pub struct Discovery<O: DiscoveryObserver> {
    publisher: MdnsPublisher,
    browser: MdnsBrowser,
    observer: Arc<O>,
}

impl<O: DiscoveryObserver> Discovery<O> {
    /// # Errors
    ///
    /// Returns an error if either mDNS daemon cannot be created.
    pub fn new(settings: Settings, observer: Arc<O>) -> Result<Self, DiscoveryError> {
        let browser = MdnsBrowser::new(settings.device_identity.clone())?;
        Ok(Self {
            publisher: MdnsPublisher::new(settings)?,
            browser,
            observer,
        })
    }

    /// Starts advertising and browsing.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::AlreadyRunning`] when the advertisement is
    /// already up, or a daemon error.
    pub fn start(&self) -> Result<(), DiscoveryError> {
        self.publisher.start()?;
        self.browser.start(self.observer.clone())
    }

    /// Withdraws the advertisement and stops browsing.
    pub fn stop(&self) {
        self.browser.stop();
        self.publisher.stop();
    }
}
