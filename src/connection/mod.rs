//! Connection management
//!
//! This module handles:
//! * Transport abstraction (TCP socket vs tunnel subprocess)
//! * Address resolution and retry across candidates
//! * Connection lifecycle and state machine enforcement
//! * TLS setup, handshake and certificate verification
//! * Raw deflate stream compression

mod compress;
mod config;
mod conn;
mod event;
mod resolve;
mod state;
mod tls;
mod transport;

pub use compress::Compressor;
pub use config::{ServerConfig, ServerConfigBuilder, TlsVersion};
pub use conn::{Connection, WriteStatus};
pub use event::{ConnectionHandler, EventLoop, Interest, Readiness};
pub use resolve::{address_name, spawn_tunnel, tunnel_name, AddressIter};
pub use state::ConnectionState;
pub use tls::{fingerprint, host_matches, init, verify_hostname, CertContext, TlsContextCache};
pub use transport::{HandshakeStatus, Stream, Transport};
