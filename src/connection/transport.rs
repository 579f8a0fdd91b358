//! Transport abstraction (TCP socket or tunnel pipe, with optional TLS)

use rustls::ClientConnection;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// Upper bound on plaintext rustls buffers before writes report back-pressure
const TLS_BUFFER_LIMIT: usize = 64 * 1024;

/// Underlying byte stream
#[derive(Debug)]
pub enum Stream {
    /// Non-blocking TCP socket
    Tcp(TcpStream),
    /// One end of the socket pair shared with a tunnel subprocess
    Tunnel(UnixStream),
}

impl Stream {
    /// Pending socket error (`SO_ERROR`), cleared by reading it
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Stream::Tcp(s) => s.take_error(),
            Stream::Tunnel(s) => s.take_error(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Tunnel(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Tunnel(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Tunnel(s) => s.as_raw_fd(),
        }
    }
}

/// Outcome of one handshake step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Handshake finished and all its records were sent
    Complete,
    /// Waiting for the peer
    WantRead,
    /// Our records could not all be sent yet
    WantWrite,
}

/// Byte transport of a connection.
///
/// Reads and writes go through the TLS session when one is installed, directly
/// to the stream otherwise. All calls are non-blocking and surface
/// `ErrorKind::WouldBlock` unchanged.
pub struct Transport {
    stream: Stream,
    tls: Option<ClientConnection>,
}

impl Transport {
    /// Wrap a connected stream
    pub fn new(stream: Stream) -> Self {
        Self { stream, tls: None }
    }

    /// Underlying stream
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Install a TLS client session; application data flows through it from now on
    pub fn start_tls(&mut self, mut tls: ClientConnection) {
        tls.set_buffer_limit(Some(TLS_BUFFER_LIMIT));
        self.tls = Some(tls);
    }

    /// Remove the TLS session, e.g. after a failed handshake
    pub fn drop_tls(&mut self) {
        self.tls = None;
    }

    /// Whether TLS is installed
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// TLS session, if installed
    pub fn tls(&self) -> Option<&ClientConnection> {
        self.tls.as_ref()
    }

    /// Advance the handshake as far as possible without blocking
    pub fn continue_handshake(&mut self) -> io::Result<HandshakeStatus> {
        let Some(tls) = self.tls.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no TLS session"));
        };

        loop {
            while tls.wants_write() {
                match tls.write_tls(&mut self.stream) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(HandshakeStatus::WantWrite)
                    }
                    Err(e) => return Err(e),
                }
            }

            if !tls.is_handshaking() {
                return Ok(HandshakeStatus::Complete);
            }

            match tls.read_tls(&mut self.stream) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed connection during handshake",
                    ))
                }
                Ok(_) => {
                    if let Err(e) = tls.process_new_packets() {
                        // best effort: let the peer see our alert
                        let _ = tls.write_tls(&mut self.stream);
                        return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(HandshakeStatus::WantRead)
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read application bytes
    ///
    /// `Ok(0)` means the peer ended the stream.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(tls) = self.tls.as_mut() else {
            return self.stream.read(buf);
        };

        loop {
            match tls.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            match tls.read_tls(&mut self.stream) {
                Ok(0) => {
                    // lets the reader report a clean close or a truncation
                    tls.process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    return match tls.reader().read(buf) {
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                        other => other,
                    };
                }
                Ok(_) => {
                    if let Err(e) = tls.process_new_packets() {
                        let _ = tls.write_tls(&mut self.stream);
                        return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write application bytes; returns how many were accepted
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.tls.is_none() {
            return self.stream.write(buf);
        }

        self.flush_tls()?;
        let n = match self.tls.as_mut() {
            Some(tls) => tls.writer().write(buf)?,
            None => 0,
        };
        self.flush_tls()?;
        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(n)
    }

    /// Push encrypted records to the stream; `Ok(true)` when nothing is left
    pub fn flush_tls(&mut self) -> io::Result<bool> {
        let Some(tls) = self.tls.as_mut() else {
            return Ok(true);
        };
        while tls.wants_write() {
            match tls.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Whether encrypted records are waiting for the stream
    pub fn wants_write(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| tls.wants_write())
    }

    /// Whether decrypted bytes are buffered inside the TLS session
    pub fn has_buffered_plaintext(&mut self) -> bool {
        match self.tls.as_mut() {
            Some(tls) => tls
                .process_new_packets()
                .map(|state| state.plaintext_bytes_to_read() > 0)
                .unwrap_or(false),
            None => false,
        }
    }
}

impl AsRawFd for Transport {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("stream", &self.stream)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}
