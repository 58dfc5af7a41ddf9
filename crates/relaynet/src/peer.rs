//! # Peer Addressing
//!
//! A `Peer` names one end of a channel: a host and a port. Peers are plain
//! values, compared and hashed structurally, and travel inside every envelope
//! so the receiver knows where to reply.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Reasons a peer cannot be used as a send target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The host is empty.
    EmptyHost,
    /// The port is the unbound sentinel `0`.
    UnboundPort,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyHost => write!(f, "host is empty"),
            Self::UnboundPort => write!(f, "port is not bound"),
        }
    }
}

impl std::error::Error for Error {}

/// Identity of a transport endpoint.
///
/// Port `0` is the unbound sentinel: transports treat it as "pick an
/// ephemeral port" when binding, and channels refuse it as a target.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    host: String,
    port: u16,
}

impl Peer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// A peer on the IPv4 loopback interface.
    pub fn localhost(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns true when the port has been resolved to a concrete value.
    pub fn is_bound(&self) -> bool {
        self.port != 0
    }

    /// Same host, different port. Used when a transport resolves an
    /// ephemeral bind.
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.host.clone(), port)
    }

    /// Checks that this peer can receive a message.
    pub fn validate_target(&self) -> Result<(), Error> {
        if self.host.trim().is_empty() {
            return Err(Error::EmptyHost);
        }
        if !self.is_bound() {
            return Err(Error::UnboundPort);
        }
        Ok(())
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
