//! # Local Transport
//!
//! An in-process network. Bound inboxes live in a shared map keyed by peer;
//! sending looks the target up and hands it the envelope. Envelopes are still
//! pushed through the wire encoding so payloads behave exactly as they would
//! over TCP.
//!
//! Clones share the same network, so one `LocalTransport` can serve several
//! brokers in a test.

use std::sync::Arc;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::envelope::Envelope;
use crate::peer::Peer;
use crate::transport::Binding;
use crate::transport::Error;
use crate::transport::Inbox;
use crate::transport::Result;
use crate::transport::Transport;

/// First port handed out for ephemeral binds.
pub const FIRST_EPHEMERAL_PORT: u16 = 49152;

#[derive(Clone)]
pub struct LocalTransport {
    inner: Arc<Network>,
}

struct Network {
    inboxes: DashMap<Peer, Arc<dyn Inbox>>,
    next_port: AtomicU16,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Network {
                inboxes: DashMap::new(),
                next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
            }),
        }
    }

    /// Number of peers currently bound on this network.
    pub fn bound_peers(&self) -> usize {
        self.inner.inboxes.len()
    }

    fn ephemeral_port(&self) -> u16 {
        let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        if port == 0 {
            // wrapped around; skip the sentinel
            return self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        }
        port
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    async fn send(&self, target: &Peer, envelope: &Envelope) -> Result<()> {
        let inbox = self
            .inner
            .inboxes
            .get(target)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::ConnectionRefused(target.clone()))?;

        let delivered = Envelope::from_bytes(&envelope.to_bytes()?)?;
        inbox.receive(delivered);
        Ok(())
    }

    async fn bind(&self, local: &Peer, inbox: Arc<dyn Inbox>) -> Result<Binding> {
        let bound = loop {
            let peer = if local.is_bound() {
                local.clone()
            } else {
                local.with_port(self.ephemeral_port())
            };
            match self.inner.inboxes.entry(peer.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(inbox.clone());
                    break peer;
                }
                Entry::Occupied(_) if local.is_bound() => {
                    return Err(Error::AddressInUse(peer));
                }
                Entry::Occupied(_) => continue,
            }
        };

        let network = Arc::clone(&self.inner);
        let released = bound.clone();
        Ok(Binding::new(bound, move || {
            network.inboxes.remove(&released);
        }))
    }
}
