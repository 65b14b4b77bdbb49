//! TLS service endpoint lifecycle.
//!
//! The transfer and registration endpoints share one lifecycle: fetch
//! credentials, bind with a fixed backoff until it works or someone
//! stops us, then accept connections into handler sessions. They differ
//! only in the listener factory and the session handler plugged in.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use warpdrop_core::auth::{AuthError, Authenticator, Credentials};
use warpdrop_core::transport::{Connection, Listener, ListenerFactory};

use crate::session::SessionHandler;

/// Delay between bind attempts. Retries continue until the bind
/// succeeds or the server is stopped.
pub const BIND_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Error type for server lifecycle operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServerError {
    #[error("server certificate and/or private key could not be found")]
    CredentialsUnavailable,
    #[error("server credentials could not be created: {0}")]
    CredentialsGeneration(String),
    #[error("server certificate and/or private key are invalid")]
    CredentialsInvalid,
    /// The pending start was cancelled by an explicit `stop()`. Only
    /// ever seen by the caller that also requested the shutdown.
    #[error("server start was cancelled")]
    Stopped,
}

impl From<AuthError> for ServerError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Unavailable => Self::CredentialsUnavailable,
            AuthError::GenerationFailed(message) => Self::CredentialsGeneration(message),
            AuthError::Invalid => Self::CredentialsInvalid,
        }
    }
}

/// One RPC endpoint: a named listener bound from fresh credentials,
/// serving each accepted connection through a [`SessionHandler`].
pub struct RpcServer<F, H, B>
where
    F: ListenerFactory,
    H: SessionHandler<<F::L as Listener>::Conn>,
    B: Fn(&Credentials) -> anyhow::Result<F> + Send + Sync + 'static,
{
    name: String,
    bind_addr: String,
    authenticator: Arc<dyn Authenticator>,
    build_factory: B,
    handler: Arc<H>,
    running_tx: watch::Sender<bool>,
    start_gate: Mutex<()>,
    stop_signal: StdMutex<Option<watch::Sender<bool>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    bound_addr: StdMutex<Option<String>>,
}

impl<F, H, B> RpcServer<F, H, B>
where
    F: ListenerFactory,
    H: SessionHandler<<F::L as Listener>::Conn>,
    B: Fn(&Credentials) -> anyhow::Result<F> + Send + Sync + 'static,
{
    /// Creates a stopped server. The listener factory is rebuilt from
    /// the current credentials on every start, so a credential refresh
    /// takes effect on the next lifecycle.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        bind_addr: impl Into<String>,
        authenticator: Arc<dyn Authenticator>,
        build_factory: B,
        handler: Arc<H>,
    ) -> Self {
        let (running_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            bind_addr: bind_addr.into(),
            authenticator,
            build_factory,
            handler,
            running_tx,
            start_gate: Mutex::new(()),
            stop_signal: StdMutex::new(None),
            accept_task: Mutex::new(None),
            bound_addr: StdMutex::new(None),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.running_tx.borrow()
    }

    /// Address the listener is currently bound to, while running.
    #[must_use]
    pub fn bound_addr(&self) -> Option<String> {
        self.bound_addr.lock().expect("address lock poisoned").clone()
    }

    /// Starts the endpoint.
    ///
    /// Resolves immediately with a credential error when the
    /// authenticator cannot supply a pair. Otherwise binds, retrying
    /// every [`BIND_RETRY_BACKOFF`] until success or until `stop()`
    /// cancels the attempt. Calling `start` while already running is a
    /// successful no-op; concurrent callers serialize and every one of
    /// them resolves.
    ///
    /// # Errors
    ///
    /// `CredentialsUnavailable` / `CredentialsGeneration` /
    /// `CredentialsInvalid` for credential problems, `Stopped` when a
    /// concurrent `stop()` cancelled the pending bind.
    pub async fn start(&self) -> Result<(), ServerError> {
        let _gate = self.start_gate.lock().await;
        if self.is_running() {
            debug!(server = %self.name, "Start requested but already running");
            return Ok(());
        }

        let credentials = self.authenticator.server_credentials()?;
        let factory = (self.build_factory)(&credentials).map_err(|e| {
            warn!(server = %self.name, error = %e, "Credentials rejected by TLS setup");
            ServerError::CredentialsInvalid
        })?;

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_signal.lock().expect("stop signal lock poisoned") = Some(stop_tx);

        let listener = self.bind_with_retry(&factory, stop_rx.clone()).await?;
        let addr = listener.local_addr();
        *self.bound_addr.lock().expect("address lock poisoned") = Some(addr.clone());

        let task = tokio::spawn(accept_loop(
            listener,
            self.handler.clone(),
            stop_rx,
            self.name.clone(),
        ));
        *self.accept_task.lock().await = Some(task);

        self.running_tx.send_replace(true);
        info!(server = %self.name, addr = %addr, "Server running");
        Ok(())
    }

    async fn bind_with_retry(
        &self,
        factory: &F,
        stop_rx: watch::Receiver<bool>,
    ) -> Result<F::L, ServerError> {
        loop {
            let mut stop_rx_outer = stop_rx.clone();
            tokio::select! {
                biased;
                _ = async { let _ = stop_rx_outer.wait_for(|stopped| *stopped).await; } => return Err(ServerError::Stopped),
                result = factory.bind(&self.bind_addr) => match result {
                    Ok(listener) => return Ok(listener),
                    Err(e) => {
                        warn!(
                            server = %self.name,
                            addr = %self.bind_addr,
                            error = %e,
                            "Bind failed, retrying in {}s",
                            BIND_RETRY_BACKOFF.as_secs()
                        );
                        let mut stop_rx_retry = stop_rx.clone();
                        tokio::select! {
                            biased;
                            _ = async { let _ = stop_rx_retry.wait_for(|stopped| *stopped).await; } => {
                                return Err(ServerError::Stopped)
                            }
                            () = tokio::time::sleep(BIND_RETRY_BACKOFF) => {}
                        }
                    }
                }
            }
        }
    }

    /// Stops the endpoint: cancels a pending bind-retry, closes the
    /// listener, waits for in-flight sessions to drain, then clears
    /// `running`. A no-op when not running.
    pub async fn stop(&self) {
        let stop_tx = self
            .stop_signal
            .lock()
            .expect("stop signal lock poisoned")
            .take();
        let Some(stop_tx) = stop_tx else {
            debug!(server = %self.name, "Stop requested but not running");
            return;
        };
        let _ = stop_tx.send(true);

        if let Some(task) = self.accept_task.lock().await.take() {
            if task.await.is_err() {
                warn!(server = %self.name, "Accept loop panicked");
            }
        }

        self.running_tx.send_replace(false);
        *self.bound_addr.lock().expect("address lock poisoned") = None;
        info!(server = %self.name, "Server stopped");
    }
}

/// Accepts connections until stopped, then drains in-flight sessions.
async fn accept_loop<L, H>(
    mut listener: L,
    handler: Arc<H>,
    mut stop_rx: watch::Receiver<bool>,
    name: String,
) where
    L: Listener,
    H: SessionHandler<L::Conn>,
{
    let mut sessions: Vec<JoinHandle<()>> = Vec::new();
    loop {
        tokio::select! {
            biased;
            _ = stop_rx.wait_for(|stopped| *stopped) => break,
            result = listener.accept() => match result {
                Ok(conn) => {
                    debug!(server = %name, peer = %conn.peer(), "Connection accepted");
                    let handler = handler.clone();
                    sessions.retain(|session| !session.is_finished());
                    sessions.push(tokio::spawn(async move {
                        handler.handle(conn).await;
                    }));
                }
                Err(e) => {
                    warn!(server = %name, error = %e, "Failed to accept connection");
                }
            }
        }
    }

    // New connections are refused from here on; let accepted sessions
    // run to completion.
    drop(listener);
    for session in sessions {
        let _ = session.await;
    }
    debug!(server = %name, "Accept loop stopped");
}
