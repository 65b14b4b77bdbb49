//! Startup, shutdown and restart sequencing across the services.
//!
//! The orchestrator owns the process-wide lifecycle flags and is the
//! only place that starts or stops discovery, the two endpoints and the
//! peer registry. Operations serialize on one gate: a restart arriving
//! while another lifecycle operation runs queues behind it, never
//! interleaves with it.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use warpdrop_core::auth::{Authenticator, Credentials};
use warpdrop_core::config::Settings;
use warpdrop_core::transport::{Connector, Listener, ListenerFactory};

use crate::discovery::{Discovery, DiscoveryError, DiscoveryObserver};
use crate::registry::RemoteRegistry;
use crate::server::{RpcServer, ServerError};
use crate::session::SessionHandler;

/// Failure classification handed to the error reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connectivity,
    Credentials,
    Server,
    Discovery,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connectivity => "connectivity",
            Self::Credentials => "credentials",
            Self::Server => "server",
            Self::Discovery => "discovery",
        };
        f.write_str(s)
    }
}

/// User-facing error sink, implemented by the presentation layer.
pub trait ErrorReporter: Send + Sync + 'static {
    fn report(&self, kind: ErrorKind, message: &str);
}

/// Connectivity precondition probe.
pub trait NetworkMonitor: Send + Sync + 'static {
    fn interface_available(&self) -> bool;
}

/// Monitor backed by the host's routing table: we are on a network iff
/// a local address can be determined.
pub struct LanMonitor;

impl NetworkMonitor for LanMonitor {
    fn interface_available(&self) -> bool {
        local_ip_address::local_ip().is_ok()
    }
}

/// Lifecycle surface of one service endpoint.
pub trait ServerControl: Send + Sync + 'static {
    fn start(&self) -> impl Future<Output = Result<(), ServerError>> + Send + '_;
    fn stop(&self) -> impl Future<Output = ()> + Send + '_;
    fn is_running(&self) -> bool;
}

/// Lifecycle surface of the discovery pair.
pub trait DiscoveryControl: Send + Sync + 'static {
    fn publish(&self) -> impl Future<Output = Result<(), DiscoveryError>> + Send + '_;
    fn withdraw(&self) -> impl Future<Output = ()> + Send + '_;
}

/// Bulk-shutdown surface of the peer registry.
pub trait PeerRegistryControl: Send + Sync + 'static {
    fn shutdown_all(&self) -> impl Future<Output = ()> + Send + '_;
    fn clear(&self) -> impl Future<Output = ()> + Send + '_;
}

/// Error type for orchestrated lifecycle operations.
///
/// Component errors pass through transparently; the reporter always
/// sees the root-cause description.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("no network interface available")]
    NoInterfaceAvailable,
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

impl OrchestratorError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoInterfaceAvailable => ErrorKind::Connectivity,
            Self::Server(
                ServerError::CredentialsUnavailable
                | ServerError::CredentialsGeneration(_)
                | ServerError::CredentialsInvalid,
            ) => ErrorKind::Credentials,
            Self::Server(_) => ErrorKind::Server,
            Self::Discovery(_) => ErrorKind::Discovery,
        }
    }
}

/// Process-wide lifecycle flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceState {
    pub discovery_active: bool,
    pub servers_running: bool,
}

/// Sequences discovery, both endpoints and the registry through
/// coordinated startup / shutdown / restart.
pub struct ServiceOrchestrator<D, T, R, P, N, E>
where
    D: DiscoveryControl,
    T: ServerControl,
    R: ServerControl,
    P: PeerRegistryControl,
    N: NetworkMonitor,
    E: ErrorReporter,
{
    discovery: Arc<D>,
    transfer_server: Arc<T>,
    registration_server: Arc<R>,
    peers: Arc<P>,
    network: N,
    reporter: Arc<E>,
    authenticator: Arc<dyn Authenticator>,
    settings: Settings,
    state: StdMutex<ServiceState>,
    op_gate: Mutex<()>,
    loading_tx: watch::Sender<bool>,
}

impl<D, T, R, P, N, E> ServiceOrchestrator<D, T, R, P, N, E>
where
    D: DiscoveryControl,
    T: ServerControl,
    R: ServerControl,
    P: PeerRegistryControl,
    N: NetworkMonitor,
    E: ErrorReporter,
{
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        discovery: Arc<D>,
        transfer_server: Arc<T>,
        registration_server: Arc<R>,
        peers: Arc<P>,
        network: N,
        reporter: Arc<E>,
        authenticator: Arc<dyn Authenticator>,
        settings: Settings,
    ) -> Self {
        let (loading_tx, _) = watch::channel(false);
        Self {
            discovery,
            transfer_server,
            registration_server,
            peers,
            network,
            reporter,
            authenticator,
            settings,
            state: StdMutex::new(ServiceState::default()),
            op_gate: Mutex::new(()),
            loading_tx,
        }
    }

    /// Snapshot of the lifecycle flags.
    #[must_use]
    pub fn state(&self) -> ServiceState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Loading indicator for the presentation layer: `true` while a
    /// server startup is in progress.
    #[must_use]
    pub fn subscribe_loading(&self) -> watch::Receiver<bool> {
        self.loading_tx.subscribe()
    }

    /// Starts the service endpoints: transfer server first, then the
    /// registration server. Fails fast without touching TLS when no
    /// network interface is available.
    ///
    /// # Errors
    ///
    /// `NoInterfaceAvailable`, or the first endpoint failure
    /// (short-circuits, the second server is not started).
    pub async fn startup(&self) -> Result<(), OrchestratorError> {
        let _op = self.op_gate.lock().await;
        self.startup_locked().await
    }

    /// Stops everything in strict order: discovery is withdrawn first
    /// so no new peers race the teardown, every peer disconnect
    /// resolves next, and only then do the endpoints stop.
    pub async fn shutdown(&self) {
        let _op = self.op_gate.lock().await;
        self.shutdown_locked().await;
    }

    /// Publishes the discovery record and starts browsing.
    ///
    /// # Errors
    ///
    /// `Discovery` when advertising cannot start.
    pub async fn publish_discovery(&self) -> Result<(), OrchestratorError> {
        let _op = self.op_gate.lock().await;
        self.publish_locked().await.map_err(Into::into)
    }

    /// Withdraws the discovery record and stops browsing.
    pub async fn withdraw_discovery(&self) {
        let _op = self.op_gate.lock().await;
        self.withdraw_locked().await;
    }

    /// Full restart: withdraw discovery, shut everything down, start it
    /// back up, re-publish.
    ///
    /// Failure handling: "discovery already running" is benign and
    /// swallowed; every other failure goes to the error reporter with
    /// its root-cause description and the device stays undiscoverable
    /// rather than advertise a non-functional endpoint.
    pub async fn restart(&self) {
        let _op = self.op_gate.lock().await;
        info!("Restarting services");

        self.withdraw_locked().await;
        self.shutdown_locked().await;

        let composed: Result<(), OrchestratorError> = async {
            self.startup_locked().await?;
            self.publish_locked().await?;
            Ok(())
        }
        .await;

        match composed {
            Ok(()) => info!("Restart complete"),
            Err(OrchestratorError::Discovery(DiscoveryError::AlreadyRunning)) => {
                debug!("Discovery already running, keeping the advertisement");
                self.state.lock().expect("state lock poisoned").discovery_active = true;
            }
            Err(e) => {
                warn!(error = %e, "Restart failed");
                self.reporter.report(
                    e.kind(),
                    &format!("Server encountered an error starting up: {e}"),
                );
            }
        }
    }

    async fn startup_locked(&self) -> Result<(), OrchestratorError> {
        self.loading_tx.send_replace(true);
        let result = self.start_servers().await;
        self.loading_tx.send_replace(false);
        result
    }

    async fn start_servers(&self) -> Result<(), OrchestratorError> {
        if !self.network.interface_available() {
            warn!("No network interface available, refusing to start servers");
            return Err(OrchestratorError::NoInterfaceAvailable);
        }

        if self.settings.refresh_credentials {
            info!("Refresh requested, deleting stored credentials");
            self.authenticator.delete_credentials();
        }

        self.transfer_server.start().await?;
        self.registration_server.start().await?;

        self.state.lock().expect("state lock poisoned").servers_running = true;
        info!("Servers running");
        Ok(())
    }

    async fn shutdown_locked(&self) {
        info!("Shutting down services");
        self.withdraw_locked().await;
        self.peers.shutdown_all().await;
        self.peers.clear().await;
        self.registration_server.stop().await;
        self.transfer_server.stop().await;
        self.state.lock().expect("state lock poisoned").servers_running = false;
        info!("Shutdown complete");
    }

    async fn publish_locked(&self) -> Result<(), DiscoveryError> {
        self.discovery.publish().await?;
        self.state.lock().expect("state lock poisoned").discovery_active = true;
        Ok(())
    }

    async fn withdraw_locked(&self) {
        self.discovery.withdraw().await;
        self.state.lock().expect("state lock poisoned").discovery_active = false;
    }
}

// ── Wiring: concrete services behind the control traits ─────────────

impl<F, H, B> ServerControl for RpcServer<F, H, B>
where
    F: ListenerFactory,
    H: SessionHandler<<F::L as Listener>::Conn>,
    B: Fn(&Credentials) -> anyhow::Result<F> + Send + Sync + 'static,
{
    fn start(&self) -> impl Future<Output = Result<(), ServerError>> + Send + '_ {
        RpcServer::start(self)
    }

    fn stop(&self) -> impl Future<Output = ()> + Send + '_ {
        RpcServer::stop(self)
    }

    fn is_running(&self) -> bool {
        RpcServer::is_running(self)
    }
}

impl<O: DiscoveryObserver> DiscoveryControl for Discovery<O> {
    fn publish(&self) -> impl Future<Output = Result<(), DiscoveryError>> + Send + '_ {
        async move { Discovery::start(self) }
    }

    fn withdraw(&self) -> impl Future<Output = ()> + Send + '_ {
        async move { Discovery::stop(self) }
    }
}

impl<C: Connector> PeerRegistryControl for RemoteRegistry<C> {
    fn shutdown_all(&self) -> impl Future<Output = ()> + Send + '_ {
        RemoteRegistry::shutdown_all(self)
    }

    fn clear(&self) -> impl Future<Output = ()> + Send + '_ {
        RemoteRegistry::clear_after_shutdown(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use tokio::time::timeout;

    type Log = Arc<StdMutex<Vec<String>>>;

    fn log_push(log: &Log, entry: impl Into<String>) {
        log.lock().unwrap().push(entry.into());
    }

    struct FakeServer {
        name: &'static str,
        log: Log,
        fail_with: Option<ServerError>,
        running: AtomicBool,
    }

    impl FakeServer {
        fn ok(name: &'static str, log: Log) -> Arc<Self> {
            Arc::new(Self {
                name,
                log,
                fail_with: None,
                running: AtomicBool::new(false),
            })
        }

        fn failing(name: &'static str, log: Log, error: ServerError) -> Arc<Self> {
            Arc::new(Self {
                name,
                log,
                fail_with: Some(error),
                running: AtomicBool::new(false),
            })
        }
    }

    impl ServerControl for FakeServer {
        fn start(&self) -> impl Future<Output = Result<(), ServerError>> + Send + '_ {
            async move {
                tokio::task::yield_now().await;
                log_push(&self.log, format!("start {}", self.name));
                match &self.fail_with {
                    Some(e) => Err(e.clone()),
                    None => {
                        self.running.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                }
            }
        }

        fn stop(&self) -> impl Future<Output = ()> + Send + '_ {
            async move {
                tokio::task::yield_now().await;
                log_push(&self.log, format!("stop {}", self.name));
                self.running.store(false, Ordering::SeqCst);
            }
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    struct FakeDiscovery {
        log: Log,
        publish_result: StdMutex<Result<(), DiscoveryError>>,
    }

    impl FakeDiscovery {
        fn ok(log: Log) -> Arc<Self> {
            Arc::new(Self {
                log,
                publish_result: StdMutex::new(Ok(())),
            })
        }

        fn already_running(log: Log) -> Arc<Self> {
            Arc::new(Self {
                log,
                publish_result: StdMutex::new(Err(DiscoveryError::AlreadyRunning)),
            })
        }
    }

    impl DiscoveryControl for FakeDiscovery {
        fn publish(&self) -> impl Future<Output = Result<(), DiscoveryError>> + Send + '_ {
            async move {
                tokio::task::yield_now().await;
                log_push(&self.log, "publish");
                self.publish_result.lock().unwrap().clone()
            }
        }

        fn withdraw(&self) -> impl Future<Output = ()> + Send + '_ {
            async move {
                tokio::task::yield_now().await;
                log_push(&self.log, "withdraw");
            }
        }
    }

    struct FakePeers {
        log: Log,
    }

    impl PeerRegistryControl for FakePeers {
        fn shutdown_all(&self) -> impl Future<Output = ()> + Send + '_ {
            async move {
                tokio::task::yield_now().await;
                log_push(&self.log, "shutdown_all");
            }
        }

        fn clear(&self) -> impl Future<Output = ()> + Send + '_ {
            async move {
                tokio::task::yield_now().await;
                log_push(&self.log, "clear");
            }
        }
    }

    #[derive(Default)]
    struct FakeReporter {
        reports: StdMutex<Vec<(ErrorKind, String)>>,
    }

    impl FakeReporter {
        fn reports(&self) -> Vec<(ErrorKind, String)> {
            self.reports.lock().unwrap().clone()
        }
    }

    impl ErrorReporter for FakeReporter {
        fn report(&self, kind: ErrorKind, message: &str) {
            self.reports
                .lock()
                .unwrap()
                .push((kind, message.to_string()));
        }
    }

    struct FakeNetwork(bool);

    impl NetworkMonitor for FakeNetwork {
        fn interface_available(&self) -> bool {
            self.0
        }
    }

    struct Harness {
        orchestrator: Arc<
            ServiceOrchestrator<
                FakeDiscovery,
                FakeServer,
                FakeServer,
                FakePeers,
                FakeNetwork,
                FakeReporter,
            >,
        >,
        log: Log,
        reporter: Arc<FakeReporter>,
        authenticator: Arc<crate::test_support::FakeAuthenticator>,
    }

    fn make_harness(network_up: bool, settings: Settings) -> Harness {
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        make_harness_with(
            network_up,
            settings,
            FakeDiscovery::ok(log.clone()),
            FakeServer::ok("transfer", log.clone()),
            log,
        )
    }

    fn make_harness_with(
        network_up: bool,
        settings: Settings,
        discovery: Arc<FakeDiscovery>,
        transfer: Arc<FakeServer>,
        log: Log,
    ) -> Harness {
        let reporter = Arc::new(FakeReporter::default());
        let authenticator = Arc::new(crate::test_support::FakeAuthenticator::accepting());
        let peers = Arc::new(FakePeers { log: log.clone() });
        let orchestrator = Arc::new(ServiceOrchestrator::new(
            discovery,
            transfer,
            FakeServer::ok("registration", log.clone()),
            peers,
            FakeNetwork(network_up),
            reporter.clone(),
            authenticator.clone(),
            settings,
        ));
        Harness {
            orchestrator,
            log,
            reporter,
            authenticator,
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn when_startup_succeeds_expect_transfer_then_registration() {
        let h = make_harness(true, Settings::for_identity("me"));

        h.orchestrator.startup().await.unwrap();

        assert_eq!(entries(&h.log), vec!["start transfer", "start registration"]);
        assert!(h.orchestrator.state().servers_running);
    }

    #[tokio::test]
    async fn when_no_interface_expect_fast_failure_without_server_starts() {
        let h = make_harness(false, Settings::for_identity("me"));

        let result = h.orchestrator.startup().await;

        assert_eq!(result, Err(OrchestratorError::NoInterfaceAvailable));
        assert!(entries(&h.log).is_empty());
        assert!(!h.orchestrator.state().servers_running);
    }

    #[tokio::test]
    async fn when_transfer_start_fails_expect_registration_never_started() {
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        let h = make_harness_with(
            true,
            Settings::for_identity("me"),
            FakeDiscovery::ok(log.clone()),
            FakeServer::failing("transfer", log.clone(), ServerError::CredentialsUnavailable),
            log,
        );

        let result = h.orchestrator.startup().await;

        assert_eq!(
            result,
            Err(OrchestratorError::Server(ServerError::CredentialsUnavailable))
        );
        assert_eq!(entries(&h.log), vec!["start transfer"]);
        assert!(!h.orchestrator.state().servers_running);
    }

    #[tokio::test]
    async fn when_refresh_credentials_flag_set_expect_deletion_before_startup() {
        let mut settings = Settings::for_identity("me");
        settings.refresh_credentials = true;
        let h = make_harness(true, settings);

        h.orchestrator.startup().await.unwrap();

        assert_eq!(h.authenticator.deletions(), 1);
    }

    #[tokio::test]
    async fn when_startup_runs_expect_loading_state_pulses() {
        let h = make_harness(true, Settings::for_identity("me"));

        let mut rx = h.orchestrator.subscribe_loading();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let collector = {
            let seen = seen.clone();
            tokio::spawn(async move {
                loop {
                    if rx.changed().await.is_err() {
                        return;
                    }
                    let value = *rx.borrow();
                    seen.lock().unwrap().push(value);
                    if !value {
                        return;
                    }
                }
            })
        };

        h.orchestrator.startup().await.unwrap();
        timeout(Duration::from_secs(5), collector).await.unwrap().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn when_shutdown_runs_expect_strict_ordering() {
        let h = make_harness(true, Settings::for_identity("me"));
        h.orchestrator.startup().await.unwrap();
        h.log.lock().unwrap().clear();

        h.orchestrator.shutdown().await;

        assert_eq!(
            entries(&h.log),
            vec![
                "withdraw",
                "shutdown_all",
                "clear",
                "stop registration",
                "stop transfer"
            ]
        );
        assert!(!h.orchestrator.state().servers_running);
        assert!(!h.orchestrator.state().discovery_active);
    }

    #[tokio::test]
    async fn when_restart_succeeds_expect_republish_at_the_end() {
        let h = make_harness(true, Settings::for_identity("me"));

        h.orchestrator.restart().await;

        let log = entries(&h.log);
        assert_eq!(log.last().map(String::as_str), Some("publish"));
        assert!(h.orchestrator.state().discovery_active);
        assert!(h.orchestrator.state().servers_running);
        assert!(h.reporter.reports().is_empty());
    }

    #[tokio::test]
    async fn when_restart_hits_discovery_already_running_expect_benign_swallow() {
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        let h = make_harness_with(
            true,
            Settings::for_identity("me"),
            FakeDiscovery::already_running(log.clone()),
            FakeServer::ok("transfer", log.clone()),
            log,
        );

        h.orchestrator.restart().await;

        assert!(h.reporter.reports().is_empty());
        assert!(h.orchestrator.state().discovery_active);
    }

    #[tokio::test]
    async fn when_restart_fails_without_network_expect_one_report_and_no_publish() {
        let h = make_harness(false, Settings::for_identity("me"));

        h.orchestrator.restart().await;

        let reports = h.reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, ErrorKind::Connectivity);
        assert!(
            reports[0].1.contains("no network interface available"),
            "report must carry the root cause, got: {}",
            reports[0].1
        );
        assert!(
            !entries(&h.log).iter().any(|e| e == "publish"),
            "discovery must not be re-published after a failed restart"
        );
        assert!(!h.orchestrator.state().discovery_active);
    }

    #[tokio::test]
    async fn when_restarts_race_expect_no_interleaving() {
        let h = make_harness(true, Settings::for_identity("me"));

        let first = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.restart().await })
        };
        let second = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.restart().await })
        };
        first.await.unwrap();
        second.await.unwrap();

        let expected_cycle = [
            "withdraw",
            "withdraw",
            "shutdown_all",
            "clear",
            "stop registration",
            "stop transfer",
            "start transfer",
            "start registration",
            "publish",
        ];
        let log = entries(&h.log);
        assert_eq!(log.len(), expected_cycle.len() * 2);
        assert_eq!(log[..expected_cycle.len()], expected_cycle);
        assert_eq!(log[expected_cycle.len()..], expected_cycle);
    }

    #[test]
    fn given_orchestrator_errors_when_classified_then_kinds_match() {
        assert_eq!(
            OrchestratorError::NoInterfaceAvailable.kind(),
            ErrorKind::Connectivity
        );
        assert_eq!(
            OrchestratorError::Server(ServerError::CredentialsUnavailable).kind(),
            ErrorKind::Credentials
        );
        assert_eq!(
            OrchestratorError::Server(ServerError::Stopped).kind(),
            ErrorKind::Server
        );
        assert_eq!(
            OrchestratorError::Discovery(DiscoveryError::AlreadyRunning).kind(),
            ErrorKind::Discovery
        );
    }

    #[test]
    fn given_wrapped_error_when_displayed_then_root_cause_is_preserved() {
        let e = OrchestratorError::Server(ServerError::CredentialsGeneration(
            "key generation failed".into(),
        ));
        assert!(e.to_string().contains("key generation failed"));
    }
}
