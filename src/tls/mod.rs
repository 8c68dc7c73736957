//! TLS configuration for HTTPS listeners.
//!
//! Certificates are PEM chain + private key pairs. Any number can be added;
//! the handshake picks the first one whose subject names cover the client's
//! SNI name, falling back to the first certificate added.
//!
//! The default policy runs on the `ring` provider, puts TLS 1.3 AEAD suites
//! first, then ECDHE with AES-GCM, with ChaCha20 as the last resort. The
//! server's order wins over the client's and only `http/1.1` is offered via
//! ALPN.

use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{CipherSuite, ServerConfig};
use thiserror::Error;
use tracing::debug;

/// The single application protocol offered during the handshake.
pub const ALPN_HTTP_1_1: &[u8] = b"http/1.1";

/// Cipher suites in descending order of preference.
pub const CIPHER_SUITE_PREFERENCE: &[CipherSuite] = &[
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
];

/// Errors produced while loading certificates or building the TLS config.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed PEM data: {0}")]
    Pem(#[source] std::io::Error),

    #[error("no certificates found in PEM data")]
    NoCertificates,

    #[error("no private key found in PEM data")]
    NoPrivateKey,

    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Returns the `ring` provider with its cipher suites sorted by
/// [`CIPHER_SUITE_PREFERENCE`].
pub fn default_provider() -> CryptoProvider {
    let mut provider = rustls::crypto::ring::default_provider();
    provider
        .cipher_suites
        .sort_by_key(|suite| preference_rank(suite.suite()));
    provider
}

fn preference_rank(suite: CipherSuite) -> usize {
    CIPHER_SUITE_PREFERENCE
        .iter()
        .position(|preferred| *preferred == suite)
        .unwrap_or(CIPHER_SUITE_PREFERENCE.len())
}

/// The set of certificates a server can present, plus the crypto provider.
#[derive(Clone)]
pub struct TlsSettings {
    provider: Arc<CryptoProvider>,
    certificates: Vec<Arc<CertifiedKey>>,
}

impl TlsSettings {
    pub fn new() -> Self {
        Self::with_provider(default_provider())
    }

    /// Uses `provider` instead of [`default_provider`].
    pub fn with_provider(provider: CryptoProvider) -> Self {
        Self {
            provider: Arc::new(provider),
            certificates: Vec::new(),
        }
    }

    /// Parses a PEM certificate chain and private key and adds the pair.
    ///
    /// # Errors
    ///
    /// Returns a [`TlsError`] if either input is malformed or empty, or if
    /// the key type is not supported by the provider.
    pub fn add_certificate(&mut self, cert_pem: &[u8], key_pem: &[u8]) -> Result<(), TlsError> {
        let chain = parse_certs(cert_pem)?;
        let key = parse_key(key_pem)?;
        let signing_key = self.provider.key_provider.load_private_key(key)?;
        self.certificates
            .push(Arc::new(CertifiedKey::new(chain, signing_key)));
        debug!(certificates = self.certificates.len(), "TLS certificate added");
        Ok(())
    }

    /// Reads a PEM certificate chain and private key from disk and adds the pair.
    ///
    /// # Errors
    ///
    /// [`TlsError::Read`] if a file cannot be read, otherwise as
    /// [`add_certificate`](Self::add_certificate).
    pub fn add_certificate_from_file(
        &mut self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<(), TlsError> {
        let cert_pem = read_file(cert_path.as_ref())?;
        let key_pem = read_file(key_path.as_ref())?;
        self.add_certificate(&cert_pem, &key_pem)
    }

    /// Number of certificates added so far.
    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// Builds a server config over the current certificates.
    ///
    /// Returns `None` when no certificate has been added, meaning the server
    /// should listen in plaintext.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Rustls`] if the provider cannot satisfy the
    /// protocol versions or ticketer.
    pub fn server_config(&self) -> Result<Option<Arc<ServerConfig>>, TlsError> {
        if self.certificates.is_empty() {
            return Ok(None);
        }

        let resolver = CertificateResolver {
            certificates: self.certificates.clone(),
        };
        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));

        config.alpn_protocols = vec![ALPN_HTTP_1_1.to_vec()];
        config.ignore_client_order = true;
        config.ticketer = rustls::crypto::ring::Ticketer::new()?;

        Ok(Some(Arc::new(config)))
    }
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("certificates", &self.certificates.len())
            .finish()
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_owned(),
        source,
    })
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::Pem)?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates);
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = BufReader::new(pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(TlsError::Pem)?
        .ok_or(TlsError::NoPrivateKey)
}

/// Picks a certificate by SNI name.
#[derive(Debug)]
struct CertificateResolver {
    certificates: Vec<Arc<CertifiedKey>>,
}

impl CertificateResolver {
    fn select(&self, sni: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let by_name = sni
            .and_then(|name| ServerName::try_from(name).ok())
            .and_then(|name| {
                self.certificates
                    .iter()
                    .find(|certified| covers(certified, &name))
            });
        by_name.or_else(|| self.certificates.first()).cloned()
    }
}

impl ResolvesServerCert for CertificateResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.select(client_hello.server_name())
    }
}

fn covers(certified: &CertifiedKey, name: &ServerName<'_>) -> bool {
    let Ok(end_entity) = certified.end_entity_cert() else {
        return false;
    };
    webpki::EndEntityCert::try_from(end_entity)
        .and_then(|cert| cert.verify_is_valid_for_subject_name(name))
        .is_ok()
}
