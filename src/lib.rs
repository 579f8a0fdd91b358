//! mailwire: non-blocking connection core for mail protocol clients
//!
//! A [`Connection`] talks to one server over TCP or a tunnel subprocess, with
//! optional TLS and raw-deflate compression. It never blocks and owns no
//! thread: the application's poller reports readiness through
//! [`Connection::handle_event`], and results come back through a
//! [`ConnectionHandler`].
//!
//! ```ignore
//! mailwire::init();
//!
//! let config = Arc::new(ServerConfig::builder().host("imap.example.com").port(993).use_tls(true).build()?);
//! let mut conn = Connection::new(config, event_loop, Rc::new(TlsContextCache::new()));
//! conn.connect(&mut handler);
//! // later, from the poller:
//! conn.handle_event(readiness, &mut handler);
//! ```

#![warn(missing_docs)]

pub mod connection;
pub mod error;
pub mod metrics;
pub mod stream;

pub use connection::{
    init, AddressIter, Connection, ConnectionHandler, ConnectionState, EventLoop, Interest,
    Readiness, ServerConfig, ServerConfigBuilder, TlsContextCache, TlsVersion, WriteStatus,
};
pub use error::{Error, Result};
pub use stream::{Payload, READ_BUFFER_SIZE};
