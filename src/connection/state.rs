//! Connection state machine

use crate::{Error, Result};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Resolving or waiting for a non-blocking connect to complete
    Connecting,

    /// TLS handshake in progress
    HandshakingTls,

    /// Connected; application data flows
    Ready,

    /// Closed by the caller
    Closed,
}

impl ConnectionState {
    /// Check if transition is valid
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Connecting, HandshakingTls)
                | (Connecting, Ready)
                | (HandshakingTls, Ready)
                // STARTTLS upgrade of an established plaintext stream
                | (Ready, HandshakingTls)
                | (_, Closed)
                // a new connect attempt on a closed connection
                | (Closed, Connecting)
        )
    }

    /// Transition to new state
    pub fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState {
                expected: format!("valid transition from {:?}", self),
                actual: format!("{:?}", next),
            });
        }
        *self = next;
        Ok(())
    }

    /// Whether application callbacks may fire
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::HandshakingTls => write!(f, "handshaking_tls"),
            Self::Ready => write!(f, "ready"),
            Self::Closed => write!(f, "closed"),
        }
    }
}
