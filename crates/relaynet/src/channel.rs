//! # Message Channel
//!
//! A point-to-point, fire-and-forget send primitive bound to one target peer.
//!
//! ## Invariants
//!
//! - `send` never blocks on I/O: it wraps the payload and submits the write
//!   to the `SendExecutor`, then returns.
//! - Failures never surface on the caller's thread. They reach the optional
//!   per-send `ErrorCallback`, exactly once, or are dropped.
//! - Targets are validated when the channel is built, not when it sends.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::envelope::Envelope;
use crate::peer;
use crate::peer::Peer;
use crate::transport;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The target peer cannot receive messages.
    InvalidPeer { peer: Peer, reason: peer::Error },
    /// No tokio runtime is available to run sends on.
    NoRuntime,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPeer { peer, reason } => write!(f, "Invalid peer '{}': {}", peer, reason),
            Self::NoRuntime => write!(f, "No tokio runtime available for sends"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Receives the failure of one send.
pub type ErrorCallback = Box<dyn FnOnce(transport::Error) + Send + 'static>;

/// Shared worker pool that runs sends off the caller's thread.
///
/// Unbounded by default; `max_inflight` caps how many writes run at once.
/// Waiting for capacity happens inside the submitted task.
#[derive(Clone, Debug)]
pub struct SendExecutor {
    handle: Handle,
    permits: Option<Arc<Semaphore>>,
}

impl SendExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle, permits: None }
    }

    /// Uses the runtime the caller is running on.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| Error::NoRuntime)
    }

    /// The runtime sends are spawned on.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn max_inflight(mut self, limit: usize) -> Self {
        self.permits = Some(Arc::new(Semaphore::new(limit.max(1))));
        self
    }

    pub(crate) fn submit<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        self.handle.spawn(async move {
            let _permit = match permits {
                Some(permits) => permits.acquire_owned().await.ok(),
                None => None,
            };
            work.await;
        });
    }
}

/// A channel from a local peer to one remote peer.
#[derive(Clone)]
pub struct MessageChannel {
    local: Peer,
    target: Peer,
    transport: Arc<dyn Transport>,
    executor: SendExecutor,
}

impl MessageChannel {
    /// Creates a channel to `target`, failing fast when the target is invalid.
    pub fn new(
        local: Peer,
        target: Peer,
        transport: Arc<dyn Transport>,
        executor: SendExecutor,
    ) -> Result<Self> {
        if let Err(reason) = target.validate_target() {
            return Err(Error::InvalidPeer { peer: target, reason });
        }
        Ok(Self {
            local,
            target,
            transport,
            executor,
        })
    }

    /// The reply address stamped on every envelope.
    pub fn local(&self) -> &Peer {
        &self.local
    }

    pub fn executor(&self) -> &SendExecutor {
        &self.executor
    }

    pub fn target(&self) -> &Peer {
        &self.target
    }

    /// Sends `payload` to the target without waiting for delivery.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T, on_error: Option<ErrorCallback>) {
        let envelope = match Envelope::wrap(self.local.clone(), payload) {
            Ok(envelope) => envelope,
            Err(e) => return report(&self.target, e, on_error),
        };

        let transport = Arc::clone(&self.transport);
        let target = self.target.clone();
        self.executor.submit(async move {
            if let Err(e) = transport.send(&target, &envelope).await {
                report(&target, e, on_error);
            }
        });
    }
}

impl fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageChannel")
            .field("local", &self.local)
            .field("target", &self.target)
            .finish()
    }
}

fn report(target: &Peer, error: transport::Error, on_error: Option<ErrorCallback>) {
    match on_error {
        Some(callback) => callback(error),
        None => debug!(%target, %error, "send failed, no error callback"),
    }
}
