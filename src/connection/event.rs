//! Contracts with the external event loop and with the connection's owner

use super::conn::Connection;
use crate::Error;
use std::os::fd::RawFd;

/// Readiness a descriptor should be watched for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    /// Wake when readable
    pub read: bool,
    /// Wake when writable
    pub write: bool,
}

impl Interest {
    /// Not watched
    pub const NONE: Interest = Interest {
        read: false,
        write: false,
    };
    /// Readable only
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    /// Writable only
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };
    /// Readable and writable
    pub const READ_WRITE: Interest = Interest {
        read: true,
        write: true,
    };
}

/// Readiness reported by the event loop for one descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    /// Descriptor is readable
    pub readable: bool,
    /// Descriptor is writable
    pub writable: bool,
    /// Descriptor is in an error state
    pub error: bool,
}

impl Readiness {
    /// Readable event
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
        error: false,
    };
    /// Writable event
    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
        error: false,
    };
    /// Error event
    pub const ERROR: Readiness = Readiness {
        readable: false,
        writable: false,
        error: true,
    };
}

/// Poller owned by the application.
///
/// The connection registers its descriptor and adjusts interest; the loop
/// calls [`Connection::handle_event`] when the descriptor becomes ready.
/// Methods take `&self`: a loop is shared by every connection on the thread.
pub trait EventLoop {
    /// Start watching `fd`
    fn register(&self, fd: RawFd);

    /// Stop watching `fd`
    fn deregister(&self, fd: RawFd);

    /// Change what `fd` is watched for
    fn reconfigure(&self, fd: RawFd, interest: Interest);

    /// Deliver a readable event for `fd` on the next iteration even if the
    /// kernel reports nothing; used when TLS or inflate state still holds data.
    fn fake_readable(&self, fd: RawFd);
}

/// Callbacks of a connection's owner.
///
/// The implementing value is the caller's context. Every callback gets the
/// connection back so it can read, write, start TLS or close from inside.
pub trait ConnectionHandler {
    /// Connect attempt finished; `ok == false` means no candidate worked
    fn on_connect(&mut self, conn: &mut Connection, ok: bool);

    /// TLS handshake and certificate verification finished
    fn on_tls(&mut self, conn: &mut Connection, ok: bool) {
        let _ = (conn, ok);
    }

    /// New bytes are in the read buffer; return `false` to stop processing
    /// the current event
    fn on_readable(&mut self, conn: &mut Connection) -> bool;

    /// Every queued byte was transmitted
    fn on_writable(&mut self, conn: &mut Connection) -> bool {
        let _ = conn;
        true
    }

    /// Fatal transport, TLS record or compression failure. The connection is
    /// not closed automatically but must not be used for further I/O.
    fn on_failure(&mut self, conn: &mut Connection, error: &Error);
}
