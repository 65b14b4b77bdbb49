//! Pinned-certificate trust.
//!
//! Peers trust each other through the exact certificates exchanged
//! during registration — there is no CA chain. The [`TrustStore`] holds
//! the pinned certificate per peer identity, and the verifiers in this
//! module wire that rule into rustls on both sides of a handshake.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rustls::DigitallySignedStruct;
use rustls::SignatureScheme;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Hex SHA-256 fingerprint of a DER certificate.
#[must_use]
pub fn fingerprint(cert_der: &[u8]) -> String {
    hex::encode(Sha256::digest(cert_der))
}

/// Certificates pinned during registration, keyed by peer identity.
///
/// Shared read-mostly between the registration handler (which pins) and
/// the TLS verifiers (which check).
#[derive(Default)]
pub struct TrustStore {
    pinned: Mutex<HashMap<String, Vec<u8>>>,
}

impl TrustStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins `cert_der` as the one certificate trusted for `identity`.
    /// Re-registration replaces the previous pin.
    pub fn pin(&self, identity: impl Into<String>, cert_der: Vec<u8>) {
        let identity = identity.into();
        info!(identity = %identity, fingerprint = %fingerprint(&cert_der), "Pinning peer certificate");
        self.pinned
            .lock()
            .expect("trust store lock poisoned")
            .insert(identity, cert_der);
    }

    /// Drops the pin for `identity`, if any.
    pub fn unpin(&self, identity: &str) {
        if self
            .pinned
            .lock()
            .expect("trust store lock poisoned")
            .remove(identity)
            .is_some()
        {
            debug!(identity = %identity, "Unpinned peer certificate");
        }
    }

    /// Returns the pinned certificate for `identity`.
    #[must_use]
    pub fn pinned_for(&self, identity: &str) -> Option<Vec<u8>> {
        self.pinned
            .lock()
            .expect("trust store lock poisoned")
            .get(identity)
            .cloned()
    }

    /// Whether `cert_der` is pinned for any known peer.
    #[must_use]
    pub fn is_trusted(&self, cert_der: &[u8]) -> bool {
        self.pinned
            .lock()
            .expect("trust store lock poisoned")
            .values()
            .any(|pinned| pinned == cert_der)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pinned.lock().expect("trust store lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Signature schemes offered by our self-issued certificates (rcgen
/// defaults to ECDSA P-256) plus the common alternatives peers may use.
fn supported_schemes() -> Vec<SignatureScheme> {
    vec![
        SignatureScheme::ECDSA_NISTP256_SHA256,
        SignatureScheme::ECDSA_NISTP384_SHA384,
        SignatureScheme::ED25519,
        SignatureScheme::RSA_PSS_SHA256,
        SignatureScheme::RSA_PSS_SHA384,
        SignatureScheme::RSA_PSS_SHA512,
    ]
}

/// Client-side verifier that accepts exactly one expected certificate.
///
/// Used for connections to a peer whose certificate is already pinned.
#[derive(Debug)]
pub struct PinnedServerVerifier {
    expected: Vec<u8>,
}

impl PinnedServerVerifier {
    #[must_use]
    pub fn new(expected_cert_der: Vec<u8>) -> Self {
        Self {
            expected: expected_cert_der,
        }
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.expected.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}

/// Client-side verifier for first contact with a not-yet-trusted peer.
///
/// Only the registration endpoint is ever dialled this way: the
/// handshake that follows exchanges and pins certificates, and every
/// later connection verifies against the pin.
#[derive(Debug)]
pub struct FirstContactVerifier;

impl ServerCertVerifier for FirstContactVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}

/// Server-side verifier requiring the client to present a certificate
/// pinned in the [`TrustStore`].
///
/// Guards the transfer endpoint: only registered peers get through.
pub struct PinnedClientVerifier {
    trust: Arc<TrustStore>,
}

impl std::fmt::Debug for PinnedClientVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedClientVerifier")
            .field("pinned", &self.trust.len())
            .finish()
    }
}

impl PinnedClientVerifier {
    #[must_use]
    pub fn new(trust: Arc<TrustStore>) -> Self {
        Self { trust }
    }
}

impl ClientCertVerifier for PinnedClientVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        if self.trust.is_trusted(end_entity.as_ref()) {
            Ok(ClientCertVerified::assertion())
        } else {
            debug!(
                fingerprint = %fingerprint(end_entity.as_ref()),
                "Rejecting client with unpinned certificate"
            );
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}
