//! Address resolution and tunnel spawning

use crate::{Error, Result};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, Stdio};
use std::vec;

/// Candidate addresses for one connect attempt, consumed front to back.
///
/// Iteration cannot be rewound; a new connect attempt resolves again.
#[derive(Debug)]
pub struct AddressIter {
    host: String,
    addrs: vec::IntoIter<SocketAddr>,
}

impl AddressIter {
    /// Resolve `host:port`
    ///
    /// # Errors
    ///
    /// [`Error::Resolve`] when the resolver fails or returns no address.
    pub fn resolve(host: &str, port: u16) -> Result<Self> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|source| Error::Resolve {
                host: host.to_string(),
                source,
            })?
            .collect();

        if addrs.is_empty() {
            return Err(Error::Resolve {
                host: host.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
            });
        }

        Ok(Self::from_addrs(host, addrs))
    }

    /// Use an already known candidate list
    pub fn from_addrs(host: impl Into<String>, addrs: Vec<SocketAddr>) -> Self {
        Self {
            host: host.into(),
            addrs: addrs.into_iter(),
        }
    }

    /// Host the candidates belong to
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Candidates not tried yet
    pub fn remaining(&self) -> usize {
        self.addrs.len()
    }
}

impl Iterator for AddressIter {
    type Item = SocketAddr;

    fn next(&mut self) -> Option<SocketAddr> {
        self.addrs.next()
    }
}

/// Display name of a connection to one candidate
pub fn address_name(host: &str, addr: &SocketAddr) -> String {
    format!("{} ({})", host, addr)
}

/// Display name of a tunnel connection
pub fn tunnel_name(command: &str) -> String {
    format!("tunnel '{}'", command)
}

/// Start `/bin/sh -c <command>` with stdin and stdout connected to a socket pair.
///
/// Returns our end of the pair, already non-blocking, and the child handle.
pub fn spawn_tunnel(command: &str) -> Result<(UnixStream, Child)> {
    let spawn_err = |source| Error::Tunnel {
        command: command.to_string(),
        source,
    };

    let (ours, theirs) = UnixStream::pair().map_err(spawn_err)?;
    let theirs_out = theirs.try_clone().map_err(spawn_err)?;

    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::from(OwnedFd::from(theirs)))
        .stdout(Stdio::from(OwnedFd::from(theirs_out)))
        .spawn()
        .map_err(spawn_err)?;

    ours.set_nonblocking(true).map_err(spawn_err)?;
    Ok((ours, child))
}
