//! Shared helpers for integration tests: a `poll(2)` event loop and a
//! recording handler.

#![allow(dead_code)]

use mailwire::{Connection, ConnectionHandler, Error, EventLoop, Interest, Readiness};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Install a test subscriber once; `RUST_LOG=mailwire=debug` shows connection logs
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Minimal single-descriptor poller
#[derive(Default)]
pub struct PollLoop {
    fds: RefCell<HashMap<RawFd, Interest>>,
    fake: RefCell<HashSet<RawFd>>,
}

impl PollLoop {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.fds.borrow().get(&fd).copied()
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.fds.borrow().contains_key(&fd)
    }

    /// Wait up to `timeout_ms` for `fd` to become ready
    pub fn poll_once(&self, fd: RawFd, timeout_ms: i32) -> Option<Readiness> {
        let interest = self.interest(fd)?;
        let faked = self.fake.borrow_mut().remove(&fd);

        let mut events = 0;
        if interest.read {
            events |= libc::POLLIN;
        }
        if interest.write {
            events |= libc::POLLOUT;
        }
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let timeout = if faked { 0 } else { timeout_ms };
        let n = unsafe { libc::poll(&mut pfd, 1, timeout) };
        assert!(n >= 0, "poll failed: {}", std::io::Error::last_os_error());

        let readiness = Readiness {
            readable: faked || pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0,
            writable: pfd.revents & libc::POLLOUT != 0,
            error: pfd.revents & libc::POLLERR != 0,
        };
        (readiness != Readiness::default()).then_some(readiness)
    }
}

impl EventLoop for PollLoop {
    fn register(&self, fd: RawFd) {
        self.fds.borrow_mut().insert(fd, Interest::NONE);
    }

    fn deregister(&self, fd: RawFd) {
        self.fds.borrow_mut().remove(&fd);
        self.fake.borrow_mut().remove(&fd);
    }

    fn reconfigure(&self, fd: RawFd, interest: Interest) {
        self.fds.borrow_mut().insert(fd, interest);
    }

    fn fake_readable(&self, fd: RawFd) {
        self.fake.borrow_mut().insert(fd);
    }
}

/// Dispatch events until `done` holds; panics after ten seconds
pub fn drive<H: ConnectionHandler>(
    event_loop: &PollLoop,
    conn: &mut Connection,
    handler: &mut H,
    mut done: impl FnMut(&H, &Connection) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done(handler, conn) {
        assert!(Instant::now() < deadline, "timed out, connection: {:?}", conn);
        let fd = conn
            .raw_fd()
            .expect("connection closed before the condition was met");
        if let Some(readiness) = event_loop.poll_once(fd, 50) {
            conn.handle_event(readiness, handler);
        }
    }
}

/// Handler that records every callback
#[derive(Default)]
pub struct Recorder {
    pub connects: Vec<bool>,
    pub tls: Vec<bool>,
    pub lines: Vec<String>,
    pub writable: usize,
    pub failures: Vec<String>,
    /// Issue STARTTLS when this line arrives
    pub starttls_on: Option<String>,
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
            let line = String::from_utf8_lossy(line).into_owned();
            let upgrade = self.starttls_on.as_deref() == Some(line.as_str());
            self.lines.push(line);
            if upgrade {
                conn.start_tls(self).expect("STARTTLS on a ready connection");
                return true;
            }
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
