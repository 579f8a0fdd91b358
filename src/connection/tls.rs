//! TLS certificate context, session setup and server identity verification.
//!
//! The certificate context (trust store, protocol versions, rustls client
//! configuration) is built once per distinct [`ServerConfig`] and shared through a
//! [`TlsContextCache`]. Certificates are not judged during the handshake itself;
//! once it completes, [`CertContext::verify_peer`] applies the acceptance rules:
//!
//! 1. a leaf certificate byte-identical to one from the configured certificate
//!    file is accepted outright;
//! 2. otherwise the chain must verify against the trust store and a DNS subject
//!    alternative name, or failing that the common name, must match the host.

use super::config::{ServerConfig, TlsVersion};
use crate::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{
    verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms,
};
use rustls::server::ParsedCertificate;
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme,
    SupportedProtocolVersion,
};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use sha2::Digest;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;
use x509_parser::extensions::GeneralName;

/// Process-wide TLS initialization.
///
/// Installs the default rustls crypto provider. Call once at startup; calling it
/// again is harmless.
pub fn init() {
    if CryptoProvider::get_default().is_none() {
        // a concurrent installer winning the race is fine
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}

fn provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Does `pattern` (a certificate name) cover `host`?
///
/// `*.example.com` matches any host whose part after the first `.` equals
/// `example.com`. Anything else must equal the host. Comparison ignores ASCII
/// case; an empty host or pattern never matches.
pub fn host_matches(host: &str, pattern: &str) -> bool {
    let (host, pattern) = match pattern.strip_prefix("*.") {
        Some(rest) => match host.split_once('.') {
            Some((_, tail)) => (tail, rest),
            None => return false,
        },
        None => (host, pattern),
    };

    !host.is_empty() && !pattern.is_empty() && host.eq_ignore_ascii_case(pattern)
}

/// Check the certificate's DNS subject alternative names, then its common name,
/// against `host`.
pub fn verify_hostname(cert: &CertificateDer<'_>, host: &str) -> Result<()> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| Error::Verify(format!("cannot parse server certificate: {}", e)))?;

    if let Ok(Some(san)) = parsed.subject_alternative_name() {
        let found = san.value.general_names.iter().any(|name| match name {
            GeneralName::DNSName(pattern) => {
                !pattern.contains('\0') && host_matches(host, pattern)
            }
            _ => false,
        });
        if found {
            return Ok(());
        }
    }

    let common_name = parsed
        .subject()
        .iter_common_name()
        .next()
        .ok_or_else(|| Error::Verify("cannot get certificate common name".to_string()))?
        .as_str()
        .map_err(|_| Error::Verify("cannot get certificate common name".to_string()))?;

    if !common_name.contains('\0') && host_matches(host, common_name) {
        return Ok(());
    }

    Err(Error::Verify(format!(
        "certificate owner does not match hostname {}",
        host
    )))
}

/// SHA-256 fingerprint as colon-separated hex, for diagnostics
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    sha2::Sha256::digest(cert.as_ref())
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Server name sent in the handshake
///
/// Tunnels without a configured host send no SNI.
pub fn server_name(host: Option<&str>) -> Result<ServerName<'static>> {
    match host {
        Some(host) => ServerName::try_from(host.trim_end_matches('.').to_string())
            .map_err(|_| Error::Config(format!("Invalid hostname for TLS: {}", host))),
        None => Ok(ServerName::from(IpAddr::V4(Ipv4Addr::LOCALHOST))),
    }
}

/// Accepts any certificate during the handshake (signatures are still checked);
/// identity is decided afterwards by [`CertContext::verify_peer`].
#[derive(Debug)]
struct DeferredVerifier {
    algs: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for DeferredVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algs.supported_schemes()
    }
}

/// Certificate context shared by all connections to one server configuration
pub struct CertContext {
    client_config: Arc<ClientConfig>,
    roots: RootCertStore,
    trusted: Vec<CertificateDer<'static>>,
    algs: WebPkiSupportedAlgorithms,
}

impl CertContext {
    /// Build the context for `config`.
    ///
    /// # Errors
    ///
    /// Fails when the certificate file cannot be read or holds no certificate, or
    /// when none of the configured TLS versions can be negotiated.
    pub fn build(config: &ServerConfig) -> Result<Self> {
        let versions = protocol_versions(config)?;

        let mut roots = RootCertStore::empty();
        let mut trusted = Vec::new();

        if let Some(path) = &config.cert_file {
            trusted = load_cert_file(path)?;
            let (added, ignored) = roots.add_parsable_certificates(trusted.iter().cloned());
            tracing::debug!(
                "loaded {} trusted certificates from '{}' ({} not usable as roots)",
                added,
                path.display(),
                ignored
            );
        }

        if config.system_certs {
            add_system_roots(&mut roots);
        }

        let provider = provider();
        let algs = provider.signature_verification_algorithms;
        let verifier = Arc::new(DeferredVerifier { algs });

        let client_config = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&versions)?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();

        Ok(Self {
            client_config: Arc::new(client_config),
            roots,
            trusted,
            algs,
        })
    }

    /// Number of explicitly trusted certificates
    pub fn num_trusted(&self) -> usize {
        self.trusted.len()
    }

    /// Number of trust anchors (trusted file plus system store)
    pub fn num_roots(&self) -> usize {
        self.roots.len()
    }

    /// rustls client configuration
    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }

    /// Start a client session for `host`
    pub fn new_session(&self, host: Option<&str>) -> Result<ClientConnection> {
        let name = server_name(host)?;
        Ok(ClientConnection::new(self.client_config(), name)?)
    }

    /// Decide whether the peer of a completed handshake is who we wanted
    pub fn verify_peer(&self, tls: &ClientConnection, host: Option<&str>) -> Result<()> {
        let certs = tls
            .peer_certificates()
            .filter(|certs| !certs.is_empty())
            .ok_or_else(|| Error::Verify("no server certificate".to_string()))?;
        let leaf = &certs[0];

        if self.trusted.iter().any(|t| t.as_ref() == leaf.as_ref()) {
            tracing::debug!("server certificate explicitly trusted");
            return Ok(());
        }

        let parsed = ParsedCertificate::try_from(leaf)
            .map_err(|e| Error::Verify(format!("cannot parse server certificate: {}", e)))?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &parsed,
            &self.roots,
            &certs[1..],
            UnixTime::now(),
            self.algs.all,
        )
        .map_err(|e| Error::Verify(e.to_string()))?;

        let host = host.ok_or_else(|| {
            Error::Verify("neither host nor matching certificate specified".to_string())
        })?;
        verify_hostname(leaf, host)
    }
}

impl std::fmt::Debug for CertContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertContext")
            .field("roots", &self.roots.len())
            .field("trusted", &self.trusted.len())
            .field("client_config", &"<ClientConfig>")
            .finish()
    }
}

fn protocol_versions(config: &ServerConfig) -> Result<Vec<&'static SupportedProtocolVersion>> {
    let mut versions = Vec::new();
    for version in &config.tls_versions {
        match version {
            TlsVersion::TlsV1_2 => versions.push(&rustls::version::TLS12),
            TlsVersion::TlsV1_3 => versions.push(&rustls::version::TLS13),
            other => tracing::warn!("{} is not supported, ignoring", other),
        }
    }
    if versions.is_empty() {
        return Err(Error::Config(format!(
            "no supported TLS version enabled for server '{}'",
            config.display_host()
        )));
    }
    Ok(versions)
}

fn load_cert_file(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        Error::Config(format!(
            "Error while loading certificate file '{}': {}",
            path.display(),
            e
        ))
    })?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::Config(format!(
                "Error while loading certificate file '{}': {}",
                path.display(),
                e
            ))
        })?;

    if certs.is_empty() {
        return Err(Error::Config(format!(
            "No valid certificates found in '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

fn add_system_roots(roots: &mut RootCertStore) {
    let result = rustls_native_certs::load_native_certs();
    let (added, _) = roots.add_parsable_certificates(result.certs);

    if added == 0 {
        tracing::warn!(
            "Unable to load default certificate files ({} errors), using bundled roots",
            result.errors.len()
        );
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
}

/// Memoized certificate contexts, keyed by server configuration.
///
/// Building happens at most once per distinct configuration; a failed build is
/// remembered too, so a broken certificate file is reported without re-reading
/// it for every connection.
#[derive(Default)]
pub struct TlsContextCache {
    contexts: RefCell<HashMap<ServerConfig, std::result::Result<Arc<CertContext>, String>>>,
}

impl TlsContextCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the context for `config`, building it on first use
    pub fn get_or_build(&self, config: &ServerConfig) -> Result<Arc<CertContext>> {
        if let Some(entry) = self.contexts.borrow().get(config) {
            return entry.clone().map_err(Error::Tls);
        }

        let entry = CertContext::build(config)
            .map(Arc::new)
            .map_err(|e| e.to_string());
        if let Err(e) = &entry {
            tracing::error!("{}", e);
        }
        self.contexts
            .borrow_mut()
            .insert(config.clone(), entry.clone());
        entry.map_err(Error::Tls)
    }

    /// Number of configurations seen
    pub fn len(&self) -> usize {
        self.contexts.borrow().len()
    }

    /// Whether no context was built yet
    pub fn is_empty(&self) -> bool {
        self.contexts.borrow().is_empty()
    }
}

impl std::fmt::Debug for TlsContextCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContextCache")
            .field("contexts", &self.len())
            .finish()
    }
}
