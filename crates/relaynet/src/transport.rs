//! # Transport Abstraction
//!
//! A minimal, async interface for moving envelopes between peers.
//!
//! ## Philosophy
//!
//! - **Envelope-Oriented**: The Transport knows nothing about invocations,
//!   sequence numbers or callbacks. It moves one `Envelope` to one `Peer`.
//! - **Fire-and-Forget**: `send` completes when the envelope has been handed
//!   to the wire. There is no acknowledgement and no retry.
//! - **Push Delivery**: Inbound envelopes are pushed into an `Inbox` that was
//!   supplied at bind time. The inbox must not block.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use crate::envelope::Envelope;
use crate::peer::Peer;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Nothing is listening at the target peer.
    ConnectionRefused(Peer),
    /// The connection broke while writing.
    ConnectionLost(String),
    /// Connecting took longer than the configured limit.
    Timeout,
    /// The encoded envelope exceeds the frame limit.
    PayloadTooLarge { len: usize, max: usize },
    /// The envelope could not be encoded or decoded.
    Codec(String),
    /// The local address is already bound.
    AddressInUse(Peer),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionRefused(peer) => write!(f, "Connection refused by {}", peer),
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Timeout => write!(f, "Connect timed out"),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "Payload of {} bytes exceeds the {} byte frame limit", len, max)
            }
            Self::Codec(msg) => write!(f, "Codec error: {}", msg),
            Self::AddressInUse(peer) => write!(f, "Address already in use: {}", peer),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Receives envelopes accepted by a bound transport.
///
/// Called from transport tasks. Implementations hand work off and return.
pub trait Inbox: Send + Sync + 'static {
    fn receive(&self, envelope: Envelope);
}

impl<F> Inbox for F
where
    F: Fn(Envelope) + Send + Sync + 'static,
{
    fn receive(&self, envelope: Envelope) {
        self(envelope)
    }
}

/// A live listener. Dropping it stops accepting envelopes.
pub struct Binding {
    local: Peer,
    stop: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Binding {
    pub fn new(local: Peer, stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            local,
            stop: Mutex::new(Some(Box::new(stop))),
        }
    }

    /// The address peers should send to. Ephemeral ports are resolved.
    pub fn local_peer(&self) -> &Peer {
        &self.local
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        let stop = self
            .stop
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stop) = stop {
            stop();
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding").field("local", &self.local).finish()
    }
}

/// A mechanism to deliver one envelope per call and to accept envelopes.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`), so a
/// pooled or streaming transport can replace the connection-per-message one
/// without touching the protocol layer.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Delivers `envelope` to `target`.
    ///
    /// # invariants
    /// - Opens whatever resources it needs and releases them before returning,
    ///   on success and on failure alike.
    /// - Must not interpret the payload.
    async fn send(&self, target: &Peer, envelope: &Envelope) -> Result<()>;

    /// Starts accepting envelopes addressed to `local` and pushes them into
    /// `inbox` until the returned `Binding` is dropped.
    async fn bind(&self, local: &Peer, inbox: Arc<dyn Inbox>) -> Result<Binding>;
}
