use std::sync::Mutex;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

/// Error type for credential operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("server certificate and/or private key could not be found")]
    Unavailable,
    #[error("server credentials could not be created: {0}")]
    GenerationFailed(String),
    #[error("server certificate and/or private key are invalid")]
    Invalid,
}

/// Raw DER-encoded certificate and private key material.
///
/// Issued by an [`Authenticator`] and shared read-only with the service
/// endpoints for the duration of one server lifetime. Transport code
/// wraps the bytes in whatever TLS library types it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub cert_der: Vec<u8>,
    pub private_key_pkcs8_der: Vec<u8>,
}

impl Credentials {
    /// Hex SHA-256 fingerprint of the certificate, used for pinning keys
    /// and log lines.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.cert_der))
    }
}

/// Supplies and validates the TLS credential pair.
///
/// Implementations own the credential lifecycle; everything else only
/// ever borrows a [`Credentials`] value. `delete_credentials` discards
/// stored material so the next request regenerates.
pub trait Authenticator: Send + Sync + 'static {
    /// Returns the current credential pair, creating it if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unavailable`] or
    /// [`AuthError::GenerationFailed`] when no usable pair can be
    /// supplied.
    fn server_credentials(&self) -> Result<Credentials, AuthError>;

    /// Checks that a DER certificate is structurally valid.
    fn verify(&self, cert_der: &[u8]) -> bool;

    /// Discards any stored credentials, forcing regeneration on the next
    /// [`server_credentials`](Authenticator::server_credentials) call.
    fn delete_credentials(&self);
}

/// Authenticator that lazily generates a self-signed certificate for
/// this device and caches it for the process lifetime.
pub struct SelfSignedAuthenticator {
    identity: String,
    hostname: String,
    cached: Mutex<Option<Credentials>>,
}

impl SelfSignedAuthenticator {
    #[must_use]
    pub fn new(identity: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            hostname: hostname.into(),
            cached: Mutex::new(None),
        }
    }

    fn generate(&self) -> Result<Credentials, AuthError> {
        let subjects = vec![
            self.identity.clone(),
            self.hostname.clone(),
            "localhost".to_string(),
        ];

        let certified_key = rcgen::generate_simple_self_signed(subjects)
            .map_err(|e| AuthError::GenerationFailed(e.to_string()))?;

        let credentials = Credentials {
            cert_der: certified_key.cert.der().to_vec(),
            private_key_pkcs8_der: certified_key.key_pair.serialize_der(),
        };

        info!(
            identity = %self.identity,
            fingerprint = %credentials.fingerprint(),
            "Generated self-signed credentials"
        );
        Ok(credentials)
    }
}

impl Authenticator for SelfSignedAuthenticator {
    fn server_credentials(&self) -> Result<Credentials, AuthError> {
        let mut cached = self.cached.lock().expect("credentials lock poisoned");
        if let Some(credentials) = cached.as_ref() {
            return Ok(credentials.clone());
        }
        let credentials = self.generate()?;
        *cached = Some(credentials.clone());
        Ok(credentials)
    }

    fn verify(&self, cert_der: &[u8]) -> bool {
        if cert_der.is_empty() {
            return false;
        }
        // RootCertStore::add parses the DER; garbage fails there.
        let cert = rustls::pki_types::CertificateDer::from(cert_der.to_vec());
        let mut probe = rustls::RootCertStore::empty();
        probe.add(cert).is_ok()
    }

    fn delete_credentials(&self) {
        debug!(identity = %self.identity, "Deleting stored credentials");
        *self.cached.lock().expect("credentials lock poisoned") = None;
    }
}
