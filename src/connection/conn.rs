//! Core connection type

use super::compress::Compressor;
use super::config::ServerConfig;
use super::event::{ConnectionHandler, EventLoop, Interest, Readiness};
use super::resolve::{self, AddressIter};
use super::state::ConnectionState;
use super::tls::{self, CertContext, TlsContextCache};
use super::transport::{HandshakeStatus, Stream, Transport};
use crate::metrics::counters;
use crate::stream::{Payload, ReadBuffer, WriteQueue};
use crate::{Error, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::process::Child;
use std::rc::Rc;
use std::sync::Arc;

/// Scratch space for compressed bytes read from the transport in one go
const RAW_READ_CHUNK: usize = 16 * 1024;

/// Outcome of [`Connection::write`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Everything was handed to the transport. No `on_writable` follows,
    /// even if TLS records still wait to be flushed.
    Complete,
    /// Some or all bytes wait in the queue; `on_writable` fires once it drains
    Queued,
    /// Nothing was accepted. On a transport failure `on_failure` has already
    /// been called.
    Failed,
}

/// Non-blocking connection to a mail server.
///
/// Owns the descriptor, read buffer, write queue and optional TLS and
/// compression state. Progress is made only from [`handle_event`], which the
/// application calls when its [`EventLoop`] reports the descriptor ready.
///
/// [`handle_event`]: Connection::handle_event
pub struct Connection {
    config: Arc<ServerConfig>,
    event_loop: Rc<dyn EventLoop>,
    tls_cache: Rc<TlsContextCache>,
    transport: Option<Transport>,
    tunnel: Option<Child>,
    name: Option<String>,
    state: ConnectionState,
    addrs: Option<AddressIter>,
    interest: Interest,
    read_buf: ReadBuffer,
    write_queue: WriteQueue,
    compressor: Option<Compressor>,
    tls_ctx: Option<Arc<CertContext>>,
    /// Set once a fatal failure was reported; further events are ignored
    failed: bool,
    /// A write returned `Queued` and `on_writable` has not fired since
    writable_owed: bool,
    /// Bumped on every close so callers of callbacks can tell the descriptor changed
    epoch: u64,
}

impl Connection {
    /// Create an unconnected connection for `config`
    pub fn new(
        config: Arc<ServerConfig>,
        event_loop: Rc<dyn EventLoop>,
        tls_cache: Rc<TlsContextCache>,
    ) -> Self {
        Self {
            config,
            event_loop,
            tls_cache,
            transport: None,
            tunnel: None,
            name: None,
            state: ConnectionState::Closed,
            addrs: None,
            interest: Interest::NONE,
            read_buf: ReadBuffer::new(),
            write_queue: WriteQueue::new(),
            compressor: None,
            tls_ctx: None,
            failed: false,
            writable_owed: false,
            epoch: 0,
        }
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Display name: `host (address)`, `tunnel 'command'`, or the bare host
    /// before an address was picked
    pub fn name(&self) -> &str {
        self.name
            .as_deref()
            .unwrap_or_else(|| self.config.display_host())
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a descriptor is held
    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Whether TLS protects the stream
    pub fn is_encrypted(&self) -> bool {
        self.transport.as_ref().is_some_and(Transport::is_tls) && self.state.is_ready()
    }

    /// Whether stream compression is active
    pub fn is_compressed(&self) -> bool {
        self.compressor.is_some()
    }

    /// Unconsumed bytes in the read buffer
    pub fn buffered(&self) -> usize {
        self.read_buf.len()
    }

    /// Bytes waiting in the write queue, plus compressed output the
    /// transport has not taken yet
    pub fn pending_output(&self) -> usize {
        let residue = self.compressor.as_ref().map_or(0, Compressor::residue_len);
        self.write_queue.pending_bytes() + residue
    }

    /// Descriptor registered with the event loop
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.transport.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Start connecting.
    ///
    /// With a tunnel command the subprocess is spawned and the connection is
    /// established immediately. Otherwise the host is resolved and candidates
    /// are tried in order. Either way the outcome arrives through
    /// [`ConnectionHandler::on_connect`], exactly once.
    pub fn connect(&mut self, handler: &mut dyn ConnectionHandler) {
        let span = tracing::info_span!("connect", server = %self.config.display_host());
        let _enter = span.enter();

        self.reset();

        if let Err(e) = self.config.validate() {
            self.connect_bail(handler, e);
            return;
        }

        if let Some(command) = self.config.tunnel.clone() {
            tracing::info!("Starting tunnel '{}'...", command);
            match resolve::spawn_tunnel(&command) {
                Ok((stream, child)) => {
                    self.name = Some(resolve::tunnel_name(&command));
                    self.tunnel = Some(child);
                    self.attach(Stream::Tunnel(stream), Interest::READ);
                    self.connected(handler);
                }
                Err(e) => self.connect_bail(handler, e),
            }
            return;
        }

        let host = self.config.host.clone().unwrap_or_default();
        tracing::info!("Resolving {}...", host);
        match AddressIter::resolve(&host, self.config.port) {
            Ok(addrs) => {
                self.addrs = Some(addrs);
                self.connect_next(handler);
            }
            Err(e) => self.connect_bail(handler, e),
        }
    }

    /// Like [`connect`](Self::connect), with an already known candidate list
    pub fn connect_with(&mut self, addrs: AddressIter, handler: &mut dyn ConnectionHandler) {
        let span = tracing::info_span!("connect", server = %addrs.host());
        let _enter = span.enter();

        self.reset();
        self.addrs = Some(addrs);
        self.connect_next(handler);
    }

    /// Upgrade a plaintext `Ready` connection to TLS (STARTTLS).
    ///
    /// The handshake result arrives through [`ConnectionHandler::on_tls`].
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] when the connection is not ready or already
    /// encrypted; no callback fires in that case.
    pub fn start_tls(&mut self, handler: &mut dyn ConnectionHandler) -> Result<()> {
        if !self.state.is_ready() || self.transport.is_none() {
            return Err(Error::InvalidState {
                expected: "ready".to_string(),
                actual: self.state.to_string(),
            });
        }
        if self.transport.as_ref().is_some_and(Transport::is_tls) {
            return Err(Error::InvalidState {
                expected: "plaintext connection".to_string(),
                actual: "encrypted".to_string(),
            });
        }

        let span = tracing::info_span!("start_tls", server = %self.name());
        let _enter = span.enter();

        match self.install_tls() {
            Ok(()) => self.continue_handshake(handler),
            Err(e) => self.tls_failed(handler, e),
        }
        Ok(())
    }

    /// Enable raw-deflate compression in both directions; repeated calls do nothing
    pub fn start_compression(&mut self) {
        if self.compressor.is_none() {
            tracing::debug!("enabling compression on {}", self.name());
            self.compressor = Some(Compressor::new());
        }
    }

    /// Dispatch a readiness notification for this connection's descriptor
    pub fn handle_event(&mut self, readiness: Readiness, handler: &mut dyn ConnectionHandler) {
        if self.failed || self.transport.is_none() {
            return;
        }

        if readiness.error || self.state == ConnectionState::Connecting {
            let pending = match self.transport.as_ref().map(|t| t.stream().take_error()) {
                Some(Ok(pending)) => pending,
                Some(Err(e)) => Some(e),
                None => None,
            };

            if self.state == ConnectionState::Connecting {
                match pending {
                    Some(source) => {
                        self.connect_failed(source);
                        self.connect_next(handler);
                    }
                    None => self.connected(handler),
                }
                return;
            }

            let source = pending.unwrap_or_else(|| io::Error::other("error condition"));
            let e = Error::Io {
                op: "error from",
                name: self.name().to_string(),
                source,
            };
            self.fail(handler, e);
            return;
        }

        if readiness.writable {
            self.set_interest(Interest::READ);
        }

        match self.state {
            ConnectionState::HandshakingTls => {
                self.continue_handshake(handler);
                return;
            }
            ConnectionState::Ready => {}
            ConnectionState::Connecting | ConnectionState::Closed => return,
        }

        let epoch = self.epoch;
        if self.transport.as_ref().is_some_and(Transport::is_tls) {
            // records may be needed in either direction regardless of the event
            if !self.drain(handler) || !self.is_current(epoch) {
                return;
            }
            self.fill(handler);
            return;
        }

        if readiness.writable && (!self.drain(handler) || !self.is_current(epoch)) {
            return;
        }
        if readiness.readable {
            self.fill(handler);
        }
    }

    /// Copy up to `buf.len()` buffered bytes out
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        self.read_buf.read(buf)
    }

    /// Next complete line without its terminator, if one has arrived
    pub fn read_line(&mut self) -> Option<&[u8]> {
        self.read_buf.read_line()
    }

    /// Send `data`, queueing whatever the transport does not take right away.
    ///
    /// Bytes never overtake earlier queued bytes. Before the connection is
    /// ready everything is queued and sent once it is.
    pub fn write<'a>(
        &mut self,
        data: impl Into<Payload<'a>>,
        handler: &mut dyn ConnectionHandler,
    ) -> WriteStatus {
        let payload = data.into();

        if self.state == ConnectionState::Closed || self.failed {
            tracing::debug!(
                "dropping {} bytes written to {} {}",
                payload.len(),
                if self.failed { "failed" } else { "closed" },
                self.name()
            );
            return WriteStatus::Failed;
        }
        if payload.is_empty() {
            return WriteStatus::Complete;
        }

        if !self.write_queue.is_empty() || !self.state.is_ready() {
            counters::write_queued();
            self.write_queue.push(payload.into_chunk(0));
            self.writable_owed = true;
            return WriteStatus::Queued;
        }

        match self.transmit(payload.as_slice()) {
            Ok(n) if n == payload.len() && self.has_residue() => {
                self.writable_owed = true;
                WriteStatus::Queued
            }
            Ok(n) if n == payload.len() => WriteStatus::Complete,
            Ok(n) => {
                counters::write_queued();
                self.write_queue.push(payload.into_chunk(n));
                self.writable_owed = true;
                self.arm_write();
                WriteStatus::Queued
            }
            Err(e) => {
                self.fail(handler, e);
                WriteStatus::Failed
            }
        }
    }

    /// Tear the connection down at once.
    ///
    /// Queued output is discarded without being sent and without `on_writable`.
    pub fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            tracing::debug!("closing {}", self.name());
            self.event_loop.deregister(transport.as_raw_fd());
        }
        if let Some(mut child) = self.tunnel.take() {
            match child.try_wait() {
                Ok(Some(status)) => tracing::debug!("tunnel exited: {}", status),
                Ok(None) => tracing::debug!("tunnel still running after close"),
                Err(e) => tracing::warn!("cannot query tunnel status: {}", e),
            }
        }
        self.write_queue.clear();
        self.addrs = None;
        self.compressor = None;
        self.tls_ctx = None;
        self.interest = Interest::NONE;
        self.failed = false;
        self.writable_owed = false;
        self.epoch += 1;
        if self.state != ConnectionState::Closed {
            self.enter(ConnectionState::Closed);
        }
    }

    fn reset(&mut self) {
        if self.state != ConnectionState::Closed || self.transport.is_some() {
            self.close();
        }
        self.read_buf.clear();
        self.name = None;
        self.enter(ConnectionState::Connecting);
    }

    fn enter(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        let result = self.state.transition(next);
        debug_assert!(result.is_ok(), "{:?}", result);
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && !self.failed && self.transport.is_some()
    }

    fn attach(&mut self, stream: Stream, interest: Interest) {
        let fd = stream.as_raw_fd();
        self.transport = Some(Transport::new(stream));
        self.event_loop.register(fd);
        self.set_interest(interest);
    }

    fn drop_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            self.event_loop.deregister(transport.as_raw_fd());
        }
        self.interest = Interest::NONE;
    }

    fn set_interest(&mut self, interest: Interest) {
        self.interest = interest;
        if let Some(transport) = &self.transport {
            self.event_loop.reconfigure(transport.as_raw_fd(), interest);
        }
    }

    fn arm_write(&mut self) {
        if !self.interest.write && !self.failed {
            self.set_interest(Interest::READ_WRITE);
        }
    }

    fn wake_readable(&self) {
        if let Some(transport) = &self.transport {
            self.event_loop.fake_readable(transport.as_raw_fd());
        }
    }

    fn connect_next(&mut self, handler: &mut dyn ConnectionHandler) {
        loop {
            let Some(addrs) = self.addrs.as_mut() else {
                return;
            };
            let Some(addr) = addrs.next() else {
                let e = Error::NoAddress(addrs.host().to_string());
                self.connect_bail(handler, e);
                return;
            };

            let name = resolve::address_name(addrs.host(), &addr);
            tracing::info!("Connecting to {}...", name);
            self.name = Some(name);

            match open_socket(addr) {
                Ok((stream, false)) => {
                    self.attach(Stream::Tcp(stream), Interest::READ);
                    self.connected(handler);
                    return;
                }
                Ok((stream, true)) => {
                    self.attach(Stream::Tcp(stream), Interest::WRITE);
                    return;
                }
                Err(source) => self.connect_failed(source),
            }
        }
    }

    fn connect_failed(&mut self, source: io::Error) {
        let e = Error::Connect {
            name: self.name().to_string(),
            source,
        };
        tracing::warn!("{}", e);
        counters::connect_attempt("failed");
        self.drop_transport();
    }

    fn connect_bail(&mut self, handler: &mut dyn ConnectionHandler, e: Error) {
        tracing::error!("{}", e);
        counters::failure(e.category());
        self.drop_transport();
        self.addrs = None;
        self.enter(ConnectionState::Closed);
        handler.on_connect(self, false);
    }

    fn connected(&mut self, handler: &mut dyn ConnectionHandler) {
        self.addrs = None;
        counters::connect_attempt("ok");
        tracing::info!("Connected to {}", self.name());
        self.set_interest(Interest::READ);
        self.enter(ConnectionState::Ready);

        let tls_setup = if self.config.use_tls {
            self.install_tls().err()
        } else {
            self.resume_output();
            None
        };
        let implicit_tls = self.config.use_tls;

        let epoch = self.epoch;
        handler.on_connect(self, true);
        if !implicit_tls || !self.is_current(epoch) {
            return;
        }
        match tls_setup {
            Some(e) => self.tls_failed(handler, e),
            None if self.state == ConnectionState::HandshakingTls => {
                self.continue_handshake(handler)
            }
            None => {}
        }
    }

    fn install_tls(&mut self) -> Result<()> {
        let ctx = self.tls_cache.get_or_build(&self.config)?;
        let session = ctx.new_session(self.config.host.as_deref())?;
        let transport = self.transport.as_mut().ok_or_else(|| Error::InvalidState {
            expected: "open".to_string(),
            actual: "closed".to_string(),
        })?;
        transport.start_tls(session);
        self.tls_ctx = Some(ctx);
        self.enter(ConnectionState::HandshakingTls);
        Ok(())
    }

    fn continue_handshake(&mut self, handler: &mut dyn ConnectionHandler) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        match transport.continue_handshake() {
            Ok(HandshakeStatus::WantRead) => self.set_interest(Interest::READ),
            Ok(HandshakeStatus::WantWrite) => self.set_interest(Interest::READ_WRITE),
            Ok(HandshakeStatus::Complete) => self.handshake_done(handler),
            Err(e) => {
                let e = Error::Tls(format!("handshake with {}: {}", self.name(), e));
                self.tls_failed(handler, e);
            }
        }
    }

    fn handshake_done(&mut self, handler: &mut dyn ConnectionHandler) {
        let host = self.config.host.as_deref();
        let verdict = match (
            self.transport.as_ref().and_then(Transport::tls),
            self.tls_ctx.as_ref(),
        ) {
            (Some(session), Some(ctx)) => ctx.verify_peer(session, host).map_err(|e| {
                if let Some(leaf) = session.peer_certificates().and_then(|c| c.first()) {
                    tracing::warn!(
                        "server certificate of {} has SHA256 fingerprint {}",
                        self.name(),
                        tls::fingerprint(leaf)
                    );
                }
                e
            }),
            _ => Err(Error::Tls("no TLS session".to_string())),
        };

        if let Err(e) = verdict {
            self.tls_failed(handler, e);
            return;
        }

        tracing::info!("Connection is now encrypted");
        counters::tls_handshake("ok");
        self.enter(ConnectionState::Ready);
        self.set_interest(Interest::READ);
        self.resume_output();
        if self
            .transport
            .as_mut()
            .is_some_and(Transport::has_buffered_plaintext)
        {
            self.wake_readable();
        }
        handler.on_tls(self, true);
    }

    fn tls_failed(&mut self, handler: &mut dyn ConnectionHandler, e: Error) {
        tracing::error!("{}", e);
        counters::tls_handshake(match e {
            Error::Verify(_) => "verify_error",
            _ => "handshake_error",
        });
        if let Some(transport) = self.transport.as_mut() {
            transport.drop_tls();
        }
        self.tls_ctx = None;
        self.enter(ConnectionState::Ready);
        self.set_interest(Interest::READ);
        handler.on_tls(self, false);
    }

    /// Arm write interest if output accumulated while not ready
    fn resume_output(&mut self) {
        if !self.write_queue.is_empty() || self.has_residue() {
            self.arm_write();
        }
    }

    fn has_residue(&self) -> bool {
        self.compressor.as_ref().is_some_and(Compressor::has_residue)
    }

    fn fail(&mut self, handler: &mut dyn ConnectionHandler, e: Error) {
        tracing::error!("{}", e);
        counters::failure(e.category());
        self.set_interest(Interest::NONE);
        self.failed = true;
        handler.on_failure(self, &e);
    }

    /// Read or inflate into the buffer and notify the handler
    fn fill(&mut self, handler: &mut dyn ConnectionHandler) {
        match self.fill_buffer() {
            Ok(Some(_)) => {
                handler.on_readable(self);
            }
            Ok(None) => {}
            Err(e) => self.fail(handler, e),
        }
    }

    /// `Ok(None)` when the transport had nothing for us
    fn fill_buffer(&mut self) -> Result<Option<usize>> {
        let Some(transport) = self.transport.as_mut() else {
            return Ok(None);
        };
        let name = self.name.as_deref().unwrap_or("<unnamed>");
        let spare = self.read_buf.spare_mut()?;
        let space = spare.len();

        let n = match self.compressor.as_mut() {
            Some(z) => loop {
                let n = z.inflate_into(spare)?;
                if n > 0 {
                    break n;
                }
                let mut raw = [0u8; RAW_READ_CHUNK];
                match transport.read(&mut raw) {
                    Ok(0) => return Err(eof("read from", name)),
                    Ok(m) => z.feed(&raw[..m]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                    Err(e) => return Err(read_error(transport, name, e)),
                }
            },
            None => match transport.read(spare) {
                Ok(0) => return Err(eof("read from", name)),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(read_error(transport, name, e)),
            },
        };

        self.read_buf.commit(n);
        counters::bytes_read(n);

        let more_inflate = self
            .compressor
            .as_ref()
            .is_some_and(|z| z.has_pending_input() || n == space);
        if more_inflate || transport.has_buffered_plaintext() {
            self.wake_readable();
        }
        Ok(Some(n))
    }

    /// Push queued output; returns `false` when processing must stop
    fn drain(&mut self, handler: &mut dyn ConnectionHandler) -> bool {
        let tls_pending = self.transport.as_ref().is_some_and(Transport::wants_write);
        if self.write_queue.is_empty() && !self.has_residue() && !tls_pending {
            return true;
        }

        match self.flush_residue() {
            Ok(true) => {}
            Ok(false) => return true,
            Err(e) => {
                self.fail(handler, e);
                return false;
            }
        }

        while let Some(chunk) = self.write_queue.front() {
            match self.transmit(&chunk) {
                Ok(n) => {
                    if !self.write_queue.advance(n) {
                        self.arm_write();
                        return true;
                    }
                }
                Err(e) => {
                    self.fail(handler, e);
                    return false;
                }
            }
        }

        let flushed = match self.transport.as_mut().map(Transport::flush_tls) {
            Some(Ok(flushed)) => flushed,
            Some(Err(e)) => {
                let e = write_error(self.name(), e);
                self.fail(handler, e);
                return false;
            }
            None => return false,
        };
        if !flushed || self.has_residue() {
            self.arm_write();
            return true;
        }

        if self
            .transport
            .as_mut()
            .is_some_and(Transport::has_buffered_plaintext)
        {
            self.wake_readable();
        }

        if !std::mem::take(&mut self.writable_owed) {
            return true;
        }
        let epoch = self.epoch;
        handler.on_writable(self) && self.is_current(epoch)
    }

    /// Hand `data` to the codec and transport; returns how much of `data`
    /// was taken
    fn transmit(&mut self, data: &[u8]) -> Result<usize> {
        if self.compressor.is_none() {
            return self.raw_write(data);
        }
        if !self.flush_residue()? {
            return Ok(0);
        }

        let compressed = match self.compressor.as_mut() {
            Some(z) => z.deflate(data)?,
            None => return Ok(0),
        };
        let n = self.raw_write(&compressed)?;
        if n < compressed.len() {
            if let Some(z) = self.compressor.as_mut() {
                z.set_residue(compressed.slice(n..));
            }
        }
        Ok(data.len())
    }

    /// Retry compressed output left over from an earlier write; `Ok(true)`
    /// when nothing is left
    fn flush_residue(&mut self) -> Result<bool> {
        let residue = match self.compressor.as_mut() {
            Some(z) if z.has_residue() => z.take_residue(),
            _ => return Ok(true),
        };
        let n = self.raw_write(&residue)?;
        if n < residue.len() {
            if let Some(z) = self.compressor.as_mut() {
                z.set_residue(residue.slice(n..));
            }
            return Ok(false);
        }
        Ok(true)
    }

    fn raw_write(&mut self, data: &[u8]) -> Result<usize> {
        let Some(transport) = self.transport.as_mut() else {
            return Ok(0);
        };
        let n = match transport.write(data) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                return Err(if transport.is_tls() && e.kind() == io::ErrorKind::InvalidData {
                    Error::Tls(format!("write to {}: {}", self.name(), e))
                } else {
                    write_error(self.name(), e)
                })
            }
        };
        counters::bytes_written(n);
        if n < data.len() || transport.wants_write() {
            self.arm_write();
        }
        Ok(n)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name())
            .field("state", &self.state)
            .field("transport", &self.transport)
            .field("interest", &self.interest)
            .field("buffered", &self.read_buf.len())
            .field("queued", &self.write_queue.len())
            .field("compressed", &self.compressor.is_some())
            .finish()
    }
}

/// Create a non-blocking socket and start connecting it.
///
/// The flag is `true` while the connect is still in progress.
fn open_socket(addr: SocketAddr) -> io::Result<(TcpStream, bool)> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    let in_progress = match socket.connect(&addr.into()) {
        Ok(()) => false,
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::WouldBlock =>
        {
            true
        }
        Err(e) => return Err(e),
    };
    Ok((socket.into(), in_progress))
}

fn eof(op: &'static str, name: &str) -> Error {
    Error::UnexpectedEof {
        op,
        name: name.to_string(),
    }
}

fn read_error(transport: &Transport, name: &str, e: io::Error) -> Error {
    if transport.is_tls() && e.kind() == io::ErrorKind::InvalidData {
        return Error::Tls(format!("read from {}: {}", name, e));
    }
    if e.kind() == io::ErrorKind::UnexpectedEof {
        return eof("read from", name);
    }
    Error::Io {
        op: "read from",
        name: name.to_string(),
        source: e,
    }
}

fn write_error(name: &str, e: io::Error) -> Error {
    Error::Io {
        op: "write to",
        name: name.to_string(),
        source: e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    #[derive(Default)]
    struct RecordingLoop {
        registered: RefCell<HashMap<RawFd, Interest>>,
        deregistered: RefCell<Vec<RawFd>>,
        fake: RefCell<Vec<RawFd>>,
    }

    impl EventLoop for RecordingLoop {
        fn register(&self, fd: RawFd) {
            self.registered.borrow_mut().insert(fd, Interest::NONE);
        }

        fn deregister(&self, fd: RawFd) {
            self.registered.borrow_mut().remove(&fd);
            self.deregistered.borrow_mut().push(fd);
        }

        fn reconfigure(&self, fd: RawFd, interest: Interest) {
            self.registered.borrow_mut().insert(fd, interest);
        }

        fn fake_readable(&self, fd: RawFd) {
            self.fake.borrow_mut().push(fd);
        }
    }

    #[derive(Default)]
    struct Recorder {
        connects: Vec<bool>,
        tls: Vec<bool>,
        lines: Vec<Vec<u8>>,
        writable: usize,
        failures: Vec<String>,
    }

    impl ConnectionHandler for Recorder {
        fn on_connect(&mut self, _conn: &mut Connection, ok: bool) {
            self.connects.push(ok);
        }

        fn on_tls(&mut self, _conn: &mut Connection, ok: bool) {
            self.tls.push(ok);
        }

        fn on_readable(&mut self, conn: &mut Connection) -> bool {
            while let Some(line) = conn.read_line() {
                self.lines.push(line.to_vec());
            }
            true
        }

        fn on_writable(&mut self, _conn: &mut Connection) -> bool {
            self.writable += 1;
            true
        }

        fn on_failure(&mut self, _conn: &mut Connection, error: &Error) {
            self.failures.push(error.category().to_string());
        }
    }

    fn config() -> Arc<ServerConfig> {
        Arc::new(
            ServerConfig::builder()
                .host("mail.example.com")
                .port(143)
                .build()
                .unwrap(),
        )
    }

    /// A ready connection over one end of a socket pair
    fn paired() -> (Connection, Rc<RecordingLoop>, UnixStream, Recorder) {
        let event_loop = Rc::new(RecordingLoop::default());
        let mut conn = Connection::new(
            config(),
            event_loop.clone(),
            Rc::new(TlsContextCache::new()),
        );
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();

        let mut rec = Recorder::default();
        conn.reset();
        conn.name = Some("test pair".to_string());
        conn.attach(Stream::Tunnel(ours), Interest::READ);
        conn.connected(&mut rec);
        (conn, event_loop, theirs, rec)
    }

    #[test]
    fn test_new_connection_is_closed() {
        let conn = Connection::new(
            config(),
            Rc::new(RecordingLoop::default()),
            Rc::new(TlsContextCache::new()),
        );
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.is_open());
        assert_eq!(conn.name(), "mail.example.com");
        assert_eq!(conn.buffered(), 0);
    }

    #[test]
    fn test_connected_registers_read_interest() {
        let (conn, event_loop, _peer, rec) = paired();
        assert_eq!(rec.connects, vec![true]);
        assert_eq!(conn.state(), ConnectionState::Ready);
        let fd = conn.raw_fd().unwrap();
        assert_eq!(event_loop.registered.borrow()[&fd], Interest::READ);
    }

    #[test]
    fn test_write_then_read_lines() {
        let (mut conn, _loop, mut peer, mut rec) = paired();

        assert_eq!(conn.write(&b"a1 NOOP\r\n"[..], &mut rec), WriteStatus::Complete);
        let mut buf = [0u8; 9];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"a1 NOOP\r\n");

        peer.write_all(b"* OK\r\na1 OK done\npartial").unwrap();
        conn.handle_event(Readiness::READABLE, &mut rec);
        assert_eq!(rec.lines, vec![b"* OK".to_vec(), b"a1 OK done".to_vec()]);
        assert_eq!(conn.buffered(), 7);
    }

    #[test]
    fn test_readable_without_data_is_not_an_error() {
        let (mut conn, _loop, _peer, mut rec) = paired();
        conn.handle_event(Readiness::READABLE, &mut rec);
        assert!(rec.failures.is_empty());
        assert!(rec.lines.is_empty());
    }

    #[test]
    fn test_eof_reported_once() {
        let (mut conn, event_loop, peer, mut rec) = paired();
        drop(peer);

        conn.handle_event(Readiness::READABLE, &mut rec);
        conn.handle_event(Readiness::READABLE, &mut rec);
        assert_eq!(rec.failures, vec!["eof".to_string()]);
        // not closed automatically, but no longer watched
        assert!(conn.is_open());
        let fd = conn.raw_fd().unwrap();
        assert_eq!(event_loop.registered.borrow()[&fd], Interest::NONE);
        assert_eq!(conn.write(&b"x"[..], &mut rec), WriteStatus::Failed);
    }

    #[test]
    fn test_backpressure_queues_and_drains_in_order() {
        let (mut conn, event_loop, mut peer, mut rec) = paired();
        let fd = conn.raw_fd().unwrap();

        let mut expected = Vec::new();
        let mut queued = false;
        for i in 0..4096u32 {
            let chunk = format!("{:08} {}\r\n", i, "x".repeat(200));
            expected.extend_from_slice(chunk.as_bytes());
            if conn.write(chunk, &mut rec) == WriteStatus::Queued {
                queued = true;
            }
        }
        assert!(queued, "socket pair never pushed back");
        assert!(conn.pending_output() > 0);
        assert!(event_loop.registered.borrow()[&fd].write);

        let mut received = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        peer.set_nonblocking(true).unwrap();
        while received.len() < expected.len() {
            match peer.read(&mut buf) {
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    conn.handle_event(Readiness::WRITABLE, &mut rec);
                }
                Err(e) => panic!("peer read failed: {}", e),
            }
        }

        assert_eq!(received, expected);
        assert_eq!(conn.pending_output(), 0);
        assert_eq!(rec.writable, 1);
        assert!(rec.failures.is_empty());
    }

    #[test]
    fn test_close_discards_queued_output() {
        let (mut conn, event_loop, _peer, mut rec) = paired();
        let fd = conn.raw_fd().unwrap();

        let block = vec![b'z'; 64 * 1024];
        while conn.write(&block[..], &mut rec) != WriteStatus::Queued {}
        conn.write(&b"tail\r\n"[..], &mut rec);
        assert!(conn.pending_output() > 0);

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.pending_output(), 0);
        assert_eq!(rec.writable, 0);
        assert_eq!(*event_loop.deregistered.borrow(), vec![fd]);

        conn.handle_event(Readiness::WRITABLE, &mut rec);
        assert_eq!(rec.writable, 0);
    }

    #[test]
    fn test_buffer_full_is_fatal() {
        let (mut conn, _loop, mut peer, mut rec) = paired();

        let writer = std::thread::spawn(move || {
            let junk = vec![b'a'; crate::stream::READ_BUFFER_SIZE + 1];
            let _ = peer.write_all(&junk);
            peer
        });

        for _ in 0..10_000 {
            conn.handle_event(Readiness::READABLE, &mut rec);
            if !rec.failures.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(rec.failures, vec!["buffer_full".to_string()]);
        assert_eq!(conn.buffered(), crate::stream::READ_BUFFER_SIZE);
        drop(writer.join().unwrap());
    }

    /// Two ready, compressed connections joined by a socket pair
    fn compressed_pair() -> (Connection, Recorder, Connection, Recorder, Rc<RecordingLoop>) {
        let event_loop = Rc::new(RecordingLoop::default());
        let cache = Rc::new(TlsContextCache::new());
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        let mut rec_a = Recorder::default();
        let mut rec_b = Recorder::default();
        let mut conn_a = Connection::new(config(), event_loop.clone(), cache.clone());
        let mut conn_b = Connection::new(config(), event_loop.clone(), cache);
        for (conn, stream, rec) in [
            (&mut conn_a, a, &mut rec_a),
            (&mut conn_b, b, &mut rec_b),
        ] {
            conn.reset();
            conn.attach(Stream::Tunnel(stream), Interest::READ);
            conn.connected(rec);
            conn.start_compression();
            conn.start_compression();
            assert!(conn.is_compressed());
        }
        (conn_a, rec_a, conn_b, rec_b, event_loop)
    }

    #[test]
    fn test_compressed_round_trip_between_connections() {
        let (mut conn_a, mut rec_a, mut conn_b, mut rec_b, _loop) = compressed_pair();

        let lines = ["a1 SELECT INBOX", "a2 FETCH 1:* (FLAGS)", "a3 LOGOUT"];
        for line in lines {
            let status = conn_a.write(format!("{}\r\n", line), &mut rec_a);
            assert_eq!(status, WriteStatus::Complete);
        }
        conn_b.handle_event(Readiness::READABLE, &mut rec_b);
        for _ in 0..8 {
            if rec_b.lines.len() == lines.len() {
                break;
            }
            conn_b.handle_event(Readiness::READABLE, &mut rec_b);
        }

        let got: Vec<&[u8]> = rec_b.lines.iter().map(Vec::as_slice).collect();
        let want: Vec<&[u8]> = lines.iter().map(|l| l.as_bytes()).collect();
        assert_eq!(got, want);
        assert!(rec_b.failures.is_empty());
    }

    #[test]
    fn test_compressed_residue_goes_out_before_queued_lines() {
        let (mut conn_a, mut rec_a, mut conn_b, mut rec_b, _loop) = compressed_pair();

        // pseudo-random line bodies so deflate cannot shrink them
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut expected = Vec::new();
        let mut queued = 0;
        let mut saw_residue = false;
        for _ in 0..3000 {
            let body: Vec<u8> = (0..100)
                .map(|_| {
                    seed = seed
                        .wrapping_mul(6_364_136_223_846_793_005)
                        .wrapping_add(1_442_695_040_888_963_407);
                    match (seed >> 33) as u8 {
                        b'\n' | b'\r' => b'.',
                        b => b,
                    }
                })
                .collect();
            let mut line = body.clone();
            line.extend_from_slice(b"\r\n");
            expected.push(body);

            if conn_a.write(line, &mut rec_a) == WriteStatus::Queued {
                queued += 1;
            }
            saw_residue |= conn_a.has_residue();
        }
        assert!(queued > 0, "socket pair never pushed back");
        assert!(saw_residue);
        assert!(conn_a.pending_output() > 0);
        assert_eq!(rec_a.writable, 0);

        for _ in 0..100_000 {
            if rec_b.lines.len() == expected.len() && conn_a.pending_output() == 0 {
                break;
            }
            conn_b.handle_event(Readiness::READABLE, &mut rec_b);
            conn_a.handle_event(Readiness::WRITABLE, &mut rec_a);
        }

        assert_eq!(rec_b.lines.len(), expected.len());
        assert!(rec_b.lines == expected, "lines arrived out of order or damaged");
        assert_eq!(conn_a.pending_output(), 0);
        assert_eq!(rec_a.writable, 1);
        assert!(rec_a.failures.is_empty());
        assert!(rec_b.failures.is_empty());
    }

    #[test]
    fn test_inflate_filling_buffer_requests_another_read() {
        let (mut conn, event_loop, mut peer, mut rec) = paired();
        let fd = conn.raw_fd().unwrap();
        conn.start_compression();

        // 150 000 bytes once inflated; only a few hundred on the wire
        let line = format!("{}\r\n", "x".repeat(98));
        let text = line.repeat(1500);
        let mut z = Compressor::new();
        peer.write_all(&z.deflate(text.as_bytes()).unwrap()).unwrap();

        conn.handle_event(Readiness::READABLE, &mut rec);
        assert_eq!(rec.lines.len(), crate::stream::READ_BUFFER_SIZE / line.len());
        assert_eq!(*event_loop.fake.borrow(), vec![fd]);

        conn.handle_event(Readiness::READABLE, &mut rec);
        assert_eq!(rec.lines.len(), 1500);
        assert!(rec.failures.is_empty());
    }

    #[test]
    fn test_complete_write_fires_no_writable() {
        let (mut conn, _loop, mut peer, mut rec) = paired();
        assert_eq!(conn.write(&b"a1 NOOP\r\n"[..], &mut rec), WriteStatus::Complete);
        conn.handle_event(Readiness::WRITABLE, &mut rec);
        assert_eq!(rec.writable, 0);

        let mut buf = [0u8; 9];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"a1 NOOP\r\n");
    }

    #[test]
    fn test_garbage_on_compressed_stream_is_fatal() {
        let (mut conn, _loop, mut peer, mut rec) = paired();
        conn.start_compression();
        peer.write_all(&[0xff; 64]).unwrap();
        conn.handle_event(Readiness::READABLE, &mut rec);
        assert_eq!(rec.failures, vec!["compression".to_string()]);
    }

    #[test]
    fn test_start_tls_requires_ready_plaintext() {
        let mut conn = Connection::new(
            config(),
            Rc::new(RecordingLoop::default()),
            Rc::new(TlsContextCache::new()),
        );
        let mut rec = Recorder::default();
        let err = conn.start_tls(&mut rec).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert!(rec.tls.is_empty());
    }

    #[test]
    fn test_writes_before_ready_are_queued() {
        let event_loop = Rc::new(RecordingLoop::default());
        let mut conn = Connection::new(config(), event_loop.clone(), Rc::new(TlsContextCache::new()));
        let mut rec = Recorder::default();
        conn.reset();
        assert_eq!(conn.write(&b"a1 CAPABILITY\r\n"[..], &mut rec), WriteStatus::Queued);

        let (ours, mut theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        conn.attach(Stream::Tunnel(ours), Interest::READ);
        conn.connected(&mut rec);

        let fd = conn.raw_fd().unwrap();
        assert!(event_loop.registered.borrow()[&fd].write);
        conn.handle_event(Readiness::WRITABLE, &mut rec);
        assert_eq!(rec.writable, 1);

        let mut buf = [0u8; 15];
        theirs.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"a1 CAPABILITY\r\n");
        assert_eq!(event_loop.registered.borrow()[&fd], Interest::READ);
    }

    #[test]
    fn test_connect_exhausts_refused_candidates() {
        // bind and drop listeners to get ports nobody listens on
        let closed: Vec<SocketAddr> = (0..2)
            .map(|_| {
                std::net::TcpListener::bind("127.0.0.1:0")
                    .unwrap()
                    .local_addr()
                    .unwrap()
            })
            .collect();

        let event_loop = Rc::new(RecordingLoop::default());
        let mut conn = Connection::new(config(), event_loop.clone(), Rc::new(TlsContextCache::new()));
        let mut rec = Recorder::default();
        conn.connect_with(AddressIter::from_addrs("localhost", closed), &mut rec);

        while rec.connects.is_empty() {
            let fd = conn.raw_fd().expect("connect in progress");
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLOUT,
                revents: 0,
            };
            let n = unsafe { libc::poll(&mut pfd, 1, 5000) };
            assert_eq!(n, 1, "connect did not finish");
            let readiness = Readiness {
                readable: false,
                writable: pfd.revents & libc::POLLOUT != 0,
                error: pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0,
            };
            conn.handle_event(readiness, &mut rec);
        }
        assert_eq!(rec.connects, vec![false]);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.is_open());
        assert!(event_loop.registered.borrow().is_empty());
    }

    #[test]
    fn test_tunnel_connect_echo() {
        let config = Arc::new(ServerConfig::builder().tunnel("cat").build().unwrap());
        let mut conn = Connection::new(
            config,
            Rc::new(RecordingLoop::default()),
            Rc::new(TlsContextCache::new()),
        );
        let mut rec = Recorder::default();
        conn.connect(&mut rec);
        assert_eq!(rec.connects, vec![true]);
        assert_eq!(conn.name(), "tunnel 'cat'");

        conn.write(&b"* OK echo\r\n"[..], &mut rec);
        for _ in 0..1000 {
            conn.handle_event(Readiness::READABLE, &mut rec);
            if !rec.lines.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(rec.lines, vec![b"* OK echo".to_vec()]);
        conn.close();
    }

    #[test]
    fn test_missing_host_fails_connect() {
        let config = Arc::new(ServerConfig {
            host: None,
            ..(*config()).clone()
        });
        let mut conn = Connection::new(
            config,
            Rc::new(RecordingLoop::default()),
            Rc::new(TlsContextCache::new()),
        );
        let mut rec = Recorder::default();
        conn.connect(&mut rec);
        assert_eq!(rec.connects, vec![false]);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
