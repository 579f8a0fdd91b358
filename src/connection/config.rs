//! Server configuration consumed by connections

use crate::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// TLS protocol version a server configuration may allow.
///
/// Legacy versions are accepted so existing configuration files keep parsing,
/// but only TLS 1.2 and 1.3 are ever offered on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum TlsVersion {
    /// SSL 3.0 (never negotiated)
    SslV3,
    /// TLS 1.0 (never negotiated)
    TlsV1,
    /// TLS 1.1 (never negotiated)
    TlsV1_1,
    /// TLS 1.2
    TlsV1_2,
    /// TLS 1.3
    TlsV1_3,
}

impl TlsVersion {
    /// Whether the TLS stack can actually negotiate this version
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::TlsV1_2 | Self::TlsV1_3)
    }
}

impl std::fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SslV3 => write!(f, "SSLv3"),
            Self::TlsV1 => write!(f, "TLSv1"),
            Self::TlsV1_1 => write!(f, "TLSv1.1"),
            Self::TlsV1_2 => write!(f, "TLSv1.2"),
            Self::TlsV1_3 => write!(f, "TLSv1.3"),
        }
    }
}

impl std::str::FromStr for TlsVersion {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "SSLv3" => Ok(Self::SslV3),
            "TLSv1" => Ok(Self::TlsV1),
            "TLSv1.1" => Ok(Self::TlsV1_1),
            "TLSv1.2" => Ok(Self::TlsV1_2),
            "TLSv1.3" => Ok(Self::TlsV1_3),
            _ => Err(Error::Config(format!(
                "invalid TLS version '{}': expected SSLv3, TLSv1, TLSv1.1, TLSv1.2 or TLSv1.3",
                s
            ))),
        }
    }
}

impl TryFrom<String> for TlsVersion {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

fn default_tls_versions() -> BTreeSet<TlsVersion> {
    [TlsVersion::TlsV1_2, TlsVersion::TlsV1_3].into_iter().collect()
}

fn default_true() -> bool {
    true
}

/// Immutable description of one server.
///
/// Shared by every connection to that server (`Arc<ServerConfig>`). Two equal
/// configurations share one TLS certificate context, see
/// [`TlsContextCache`](super::TlsContextCache).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct ServerConfig {
    /// Host name used for resolution and certificate verification
    #[serde(default)]
    pub host: Option<String>,
    /// TCP port
    #[serde(default)]
    pub port: u16,
    /// Shell command whose stdin/stdout replace the network connection
    #[serde(default)]
    pub tunnel: Option<String>,
    /// Acceptable TLS protocol versions
    #[serde(default = "default_tls_versions")]
    pub tls_versions: BTreeSet<TlsVersion>,
    /// PEM file with additional, explicitly trusted certificates
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    /// Also trust the system certificate store
    #[serde(default = "default_true")]
    pub system_certs: bool,
    /// Start TLS right after connecting (implicit TLS, e.g. IMAPS)
    #[serde(default)]
    pub use_tls: bool,
}

impl ServerConfig {
    /// Create a builder
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let config = ServerConfig::builder()
    ///     .host("imap.example.com")
    ///     .port(993)
    ///     .use_tls(true)
    ///     .build()?;
    /// ```
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Check that the configuration can produce a connection
    pub fn validate(&self) -> Result<()> {
        if self.tunnel.is_some() {
            return Ok(());
        }
        match &self.host {
            None => Err(Error::Config(
                "neither host nor tunnel specified".to_string(),
            )),
            Some(host) if host.is_empty() => Err(Error::Config("empty host".to_string())),
            Some(_) if self.port == 0 => Err(Error::Config("port required".to_string())),
            Some(_) => Ok(()),
        }
    }

    /// Host label for log messages
    pub fn display_host(&self) -> &str {
        self.host.as_deref().unwrap_or("<tunnel>")
    }
}

/// Builder for [`ServerConfig`]
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    host: Option<String>,
    port: u16,
    tunnel: Option<String>,
    tls_versions: BTreeSet<TlsVersion>,
    cert_file: Option<PathBuf>,
    system_certs: bool,
    use_tls: bool,
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self {
            host: None,
            port: 0,
            tunnel: None,
            tls_versions: default_tls_versions(),
            cert_file: None,
            system_certs: true,
            use_tls: false,
        }
    }
}

impl ServerConfigBuilder {
    /// Set the server host name
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the server port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Use a shell command instead of a network connection
    pub fn tunnel(mut self, command: impl Into<String>) -> Self {
        self.tunnel = Some(command.into());
        self
    }

    /// Replace the set of acceptable TLS versions
    pub fn tls_versions(mut self, versions: impl IntoIterator<Item = TlsVersion>) -> Self {
        self.tls_versions = versions.into_iter().collect();
        self
    }

    /// Add a PEM file of explicitly trusted certificates
    pub fn cert_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(path.into());
        self
    }

    /// Trust (or not) the system certificate store (default: trusted)
    pub fn system_certs(mut self, enabled: bool) -> Self {
        self.system_certs = enabled;
        self
    }

    /// Negotiate TLS immediately after connecting
    pub fn use_tls(mut self, enabled: bool) -> Self {
        self.use_tls = enabled;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<ServerConfig> {
        let config = ServerConfig {
            host: self.host,
            port: self.port,
            tunnel: self.tunnel,
            tls_versions: self.tls_versions,
            cert_file: self.cert_file,
            system_certs: self.system_certs,
            use_tls: self.use_tls,
        };
        config.validate()?;
        Ok(config)
    }
}
