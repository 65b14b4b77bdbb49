//! TLS-over-TCP implementations of the core transport seams.
//!
//! Both service endpoints and outbound peer connections run mutually
//! verified TLS built from the device's self-issued credential pair.
//! Trust is pinned certificates only (see [`crate::trust`]) — no CA
//! chain is ever consulted.

use std::sync::Arc;

use anyhow::Context;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector as RustlsConnector, TlsStream};
use tracing::{debug, info};

use warpdrop_core::auth::{Authenticator, Credentials};
use warpdrop_core::transport::{Connection, Connector, Listener, ListenerFactory};

use crate::trust::{FirstContactVerifier, PinnedClientVerifier, PinnedServerVerifier, TrustStore};

/// SNI name presented on outbound connections. Peer verification is
/// pin-based, so the name carries no trust meaning.
const SERVER_NAME: &str = "warpdrop";

fn ensure_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn credential_parts(
    credentials: &Credentials,
) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let cert = CertificateDer::from(credentials.cert_der.clone());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        credentials.private_key_pkcs8_der.clone(),
    ));
    (vec![cert], key)
}

/// Server config for the transfer endpoint: our certificate, and client
/// certificates required and checked against the trust store.
fn build_transfer_server_config(
    credentials: &Credentials,
    trust: Arc<TrustStore>,
) -> anyhow::Result<rustls::ServerConfig> {
    ensure_crypto_provider();
    let (certs, key) = credential_parts(credentials);
    rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(PinnedClientVerifier::new(trust)))
        .with_single_cert(certs, key)
        .context("failed to build transfer endpoint TLS config")
}

/// Server config for the registration endpoint: our certificate, no
/// client authentication. Callers are not yet trusted — the handshake
/// payload exchange is what establishes trust.
fn build_registration_server_config(
    credentials: &Credentials,
) -> anyhow::Result<rustls::ServerConfig> {
    ensure_crypto_provider();
    let (certs, key) = credential_parts(credentials);
    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to build registration endpoint TLS config")
}

fn build_client_config(
    credentials: &Credentials,
    verifier: Arc<dyn rustls::client::danger::ServerCertVerifier>,
) -> anyhow::Result<rustls::ClientConfig> {
    ensure_crypto_provider();
    let (certs, key) = credential_parts(credentials);
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(certs, key)
        .context("failed to build client TLS config")
}

/// A TLS connection over TCP, either direction.
pub struct TlsConnection {
    stream: TlsStream<TcpStream>,
    peer_addr: String,
}

impl Connection for TlsConnection {
    fn peer(&self) -> String {
        self.peer_addr.clone()
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        let (_, state) = self.stream.get_ref();
        state
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec())
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            self.stream
                .read(buf)
                .await
                .context("failed to read from TLS connection")
        }
    }

    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.stream
                .write_all(buf)
                .await
                .context("failed to write to TLS connection")?;
            self.stream
                .flush()
                .await
                .context("failed to flush TLS connection")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.stream
                .shutdown()
                .await
                .context("failed to shut down TLS connection")
        }
    }
}

/// A TLS listener: TCP accept followed by the rustls handshake.
pub struct TlsListener {
    inner: TokioTcpListener,
    acceptor: TlsAcceptor,
    local_addr: String,
}

impl Listener for TlsListener {
    type Conn = TlsConnection;

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_ {
        async move {
            let (stream, addr) = self
                .inner
                .accept()
                .await
                .context("failed to accept TCP connection")?;
            let peer_addr = addr.to_string();
            let tls = self
                .acceptor
                .accept(stream)
                .await
                .with_context(|| format!("TLS handshake with {peer_addr} failed"))?;
            debug!(peer = %peer_addr, "Accepted TLS connection");
            Ok(TlsConnection {
                stream: TlsStream::from(tls),
                peer_addr,
            })
        }
    }
}

/// Factory that binds [`TlsListener`] instances for one endpoint.
///
/// Built from the credential pair at server start time, so a credential
/// refresh always takes effect on the next start.
pub struct TlsListenerFactory {
    config: Arc<rustls::ServerConfig>,
}

impl TlsListenerFactory {
    /// Factory for the transfer endpoint (mutual TLS, pinned clients).
    ///
    /// # Errors
    ///
    /// Returns an error if the credential pair cannot back a TLS config.
    pub fn transfer(credentials: &Credentials, trust: Arc<TrustStore>) -> anyhow::Result<Self> {
        Ok(Self {
            config: Arc::new(build_transfer_server_config(credentials, trust)?),
        })
    }

    /// Factory for the registration endpoint (server-only TLS).
    ///
    /// # Errors
    ///
    /// Returns an error if the credential pair cannot back a TLS config.
    pub fn registration(credentials: &Credentials) -> anyhow::Result<Self> {
        Ok(Self {
            config: Arc::new(build_registration_server_config(credentials)?),
        })
    }
}

impl ListenerFactory for TlsListenerFactory {
    type L = TlsListener;

    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a {
        async move {
            let inner = TokioTcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind TLS listener on {addr}"))?;
            let local_addr = inner
                .local_addr()
                .context("failed to retrieve local address")?
                .to_string();
            info!(addr = %local_addr, "TLS listener bound");
            Ok(TlsListener {
                inner,
                acceptor: TlsAcceptor::from(self.config.clone()),
                local_addr,
            })
        }
    }
}

enum ConnectorTrust {
    FirstContact,
    Pinned(Vec<u8>),
}

/// Connector that dials peers over TLS, presenting our credentials as
/// the client certificate.
///
/// The client config is rebuilt from the authenticator on every dial,
/// so a credential refresh is picked up without recreating connectors.
pub struct TlsPeerConnector {
    authenticator: Arc<dyn Authenticator>,
    trust_mode: ConnectorTrust,
}

impl TlsPeerConnector {
    /// Connector for first contact with a peer whose certificate is not
    /// yet pinned (registration endpoint only).
    #[must_use]
    pub fn first_contact(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            trust_mode: ConnectorTrust::FirstContact,
        }
    }

    /// Connector that only accepts the given pinned peer certificate.
    #[must_use]
    pub fn pinned(authenticator: Arc<dyn Authenticator>, peer_cert_der: Vec<u8>) -> Self {
        Self {
            authenticator,
            trust_mode: ConnectorTrust::Pinned(peer_cert_der),
        }
    }

    fn client_config(&self) -> anyhow::Result<rustls::ClientConfig> {
        let credentials = self
            .authenticator
            .server_credentials()
            .context("no credentials to dial with")?;
        let verifier: Arc<dyn rustls::client::danger::ServerCertVerifier> = match &self.trust_mode {
            ConnectorTrust::FirstContact => Arc::new(FirstContactVerifier),
            ConnectorTrust::Pinned(der) => Arc::new(PinnedServerVerifier::new(der.clone())),
        };
        build_client_config(&credentials, verifier)
    }
}

impl Connector for TlsPeerConnector {
    type Conn = TlsConnection;

    fn connect<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a {
        async move {
            let config = self.client_config()?;
            let tcp = TcpStream::connect(addr)
                .await
                .with_context(|| format!("failed to connect to {addr}"))?;
            let server_name = ServerName::try_from(SERVER_NAME)
                .expect("static server name is valid")
                .to_owned();
            let connector = RustlsConnector::from(Arc::new(config));
            let tls = connector
                .connect(server_name, tcp)
                .await
                .with_context(|| format!("TLS handshake with {addr} failed"))?;
            debug!(peer = %addr, "Opened TLS connection");
            Ok(TlsConnection {
                stream: TlsStream::from(tls),
                peer_addr: addr.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use warpdrop_core::auth::{Authenticator, SelfSignedAuthenticator};

    fn make_auth(name: &str) -> Arc<SelfSignedAuthenticator> {
        Arc::new(SelfSignedAuthenticator::new(name, name))
    }

    #[tokio::test]
    async fn when_first_contact_client_connects_expect_server_certificate_visible() {
        let server_auth = make_auth("server");
        let client_auth = make_auth("client");
        let server_creds = server_auth.server_credentials().unwrap();

        let factory = TlsListenerFactory::registration(&server_creds).unwrap();
        let mut listener = factory.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let server_task = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            let n = conn.read(&mut buf).await.unwrap();
            (buf[..n].to_vec(), conn.peer_certificate())
        });

        let connector = TlsPeerConnector::first_contact(client_auth);
        let mut conn = connector.connect(&addr).await.unwrap();
        conn.write_all(b"hello").await.unwrap();

        assert_eq!(conn.peer_certificate().unwrap(), server_creds.cert_der);

        let (received, server_saw_cert) = server_task.await.unwrap();
        assert_eq!(received, b"hello");
        // Registration endpoint does not request client certificates.
        assert!(server_saw_cert.is_none());
    }

    #[tokio::test]
    async fn when_pinned_client_connects_to_transfer_endpoint_expect_mutual_certificates() {
        let server_auth = make_auth("server");
        let client_auth = make_auth("client");
        let server_creds = server_auth.server_credentials().unwrap();
        let client_creds = client_auth.server_credentials().unwrap();

        let trust = Arc::new(TrustStore::new());
        trust.pin("client", client_creds.cert_der.clone());

        let factory = TlsListenerFactory::transfer(&server_creds, trust).unwrap();
        let mut listener = factory.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let server_task = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            let n = conn.read(&mut buf).await.unwrap();
            (buf[..n].to_vec(), conn.peer_certificate())
        });

        let connector = TlsPeerConnector::pinned(client_auth, server_creds.cert_der.clone());
        let mut conn = connector.connect(&addr).await.unwrap();
        conn.write_all(b"ping").await.unwrap();

        let (received, server_saw_cert) = server_task.await.unwrap();
        assert_eq!(received, b"ping");
        assert_eq!(server_saw_cert.unwrap(), client_creds.cert_der);
    }

    #[tokio::test]
    async fn when_unpinned_client_dials_transfer_endpoint_expect_handshake_rejected() {
        let server_auth = make_auth("server");
        let client_auth = make_auth("client");
        let server_creds = server_auth.server_credentials().unwrap();

        // Empty trust store: nobody is pinned yet.
        let trust = Arc::new(TrustStore::new());
        let factory = TlsListenerFactory::transfer(&server_creds, trust).unwrap();
        let mut listener = factory.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let server_task = tokio::spawn(async move { listener.accept().await });

        let connector = TlsPeerConnector::pinned(client_auth, server_creds.cert_der.clone());
        let client_result = async {
            let mut conn = connector.connect(&addr).await?;
            conn.write_all(b"ping").await?;
            let mut buf = [0u8; 1];
            conn.read(&mut buf).await
        }
        .await;

        let server_result = server_task.await.unwrap();
        assert!(
            server_result.is_err() || client_result.is_err(),
            "handshake with an unpinned client certificate must fail"
        );
    }

    #[tokio::test]
    async fn when_binding_invalid_address_expect_error() {
        let auth = make_auth("server");
        let creds = auth.server_credentials().unwrap();
        let factory = TlsListenerFactory::registration(&creds).unwrap();
        let result = factory.bind("999.999.999.999:0").await;
        assert!(result.is_err());
    }
}
