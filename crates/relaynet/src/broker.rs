//! # Broker Registry
//!
//! A broker id names one logical client/server pair. The server side owns a
//! listener at the configured host and port; the client side owns a reply
//! listener plus a channel to the server. Both sides push inbound envelopes
//! through the registry to the single receiver registered for that broker
//! and side.
//!
//! The registry is an ordinary value: whoever builds it passes it around.
//! Lookups and registration use DashMap so brokers can be added while others
//! are carrying traffic.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;
use tracing::warn;

use crate::channel;
use crate::channel::ErrorCallback;
use crate::channel::MessageChannel;
use crate::channel::SendExecutor;
use crate::envelope::Envelope;
use crate::peer::Peer;
use crate::transport;
use crate::transport::Binding;
use crate::transport::Inbox;
use crate::transport::Transport;

/// Logical name of a client/server pair.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BrokerId(String);

impl BrokerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BrokerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for BrokerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Which half of a broker an item belongs to.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A client or server was already built for this broker.
    DuplicateBroker(BrokerId, Side),
    /// No client or server was built for this broker.
    UnknownBroker(BrokerId, Side),
    /// A receiver was already registered for this broker and side.
    DuplicateReceiver(BrokerId, Side),
    Channel(channel::Error),
    Transport(transport::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateBroker(id, side) => write!(f, "Broker '{}' already has a {}", id, side),
            Self::UnknownBroker(id, side) => write!(f, "Broker '{}' has no {}", id, side),
            Self::DuplicateReceiver(id, side) => {
                write!(f, "Broker '{}' already has a {} receiver", id, side)
            }
            Self::Channel(e) => write!(f, "Channel error: {}", e),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<channel::Error> for Error {
    fn from(e: channel::Error) -> Self {
        Self::Channel(e)
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Host and port configuration for one broker.
///
/// `host`/`port` name the server listener. `local_host`/`local_port` name the
/// client's reply listener; the server replies to that address, so it must be
/// reachable from the server. Port `0` binds an ephemeral port.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    id: BrokerId,
    host: String,
    port: u16,
    local_host: String,
    local_port: u16,
}

impl BrokerConfig {
    pub fn new(id: impl Into<BrokerId>) -> Self {
        Self {
            id: id.into(),
            host: "127.0.0.1".into(),
            port: 0,
            local_host: "127.0.0.1".into(),
            local_port: 0,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = host.into();
        self
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    pub fn id(&self) -> &BrokerId {
        &self.id
    }

    pub fn server_peer(&self) -> Peer {
        Peer::new(self.host.clone(), self.port)
    }

    pub fn local_peer(&self) -> Peer {
        Peer::new(self.local_host.clone(), self.local_port)
    }
}

/// Client half of a broker: sends to the server, receives replies on its own
/// listener.
#[derive(Clone)]
pub struct MessageClient {
    broker_id: BrokerId,
    channel: MessageChannel,
    _binding: Arc<Binding>,
}

impl MessageClient {
    pub fn broker_id(&self) -> &BrokerId {
        &self.broker_id
    }

    /// Where the server sends replies.
    pub fn local_peer(&self) -> &Peer {
        self.channel.local()
    }

    pub fn server_peer(&self) -> &Peer {
        self.channel.target()
    }

    pub fn channel(&self) -> &MessageChannel {
        &self.channel
    }

    pub fn send<T: serde::Serialize + ?Sized>(&self, payload: &T, on_error: Option<ErrorCallback>) {
        self.channel.send(payload, on_error)
    }
}

/// Server half of a broker: receives on its listener and opens channels back
/// to whichever client sent a message.
#[derive(Clone)]
pub struct MessageServer {
    broker_id: BrokerId,
    binding: Arc<Binding>,
    transport: Arc<dyn Transport>,
    executor: SendExecutor,
}

impl MessageServer {
    pub fn broker_id(&self) -> &BrokerId {
        &self.broker_id
    }

    pub fn local_peer(&self) -> &Peer {
        self.binding.local_peer()
    }

    /// A channel from this server to `client`.
    pub fn channel_to(&self, client: &Peer) -> channel::Result<MessageChannel> {
        MessageChannel::new(
            self.local_peer().clone(),
            client.clone(),
            Arc::clone(&self.transport),
            self.executor.clone(),
        )
    }
}

type Receivers = DashMap<(BrokerId, Side), Arc<dyn Inbox>>;

/// Registry of brokers and their receivers.
pub struct Brokers {
    transport: Arc<dyn Transport>,
    executor: SendExecutor,
    clients: DashMap<BrokerId, MessageClient>,
    servers: DashMap<BrokerId, MessageServer>,
    receivers: Arc<Receivers>,
}

impl Brokers {
    pub fn new(transport: Arc<dyn Transport>, executor: SendExecutor) -> Self {
        Self {
            transport,
            executor,
            clients: DashMap::new(),
            servers: DashMap::new(),
            receivers: Arc::new(DashMap::new()),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn executor(&self) -> &SendExecutor {
        &self.executor
    }

    /// Binds the server listener for `config` and registers it.
    pub async fn build_server(&self, config: &BrokerConfig) -> Result<MessageServer> {
        let id = config.id().clone();
        if self.servers.contains_key(&id) {
            return Err(Error::DuplicateBroker(id, Side::Server));
        }

        let binding = self
            .transport
            .bind(&config.server_peer(), self.dispatch(&id, Side::Server))
            .await?;

        let server = MessageServer {
            broker_id: id.clone(),
            binding: Arc::new(binding),
            transport: Arc::clone(&self.transport),
            executor: self.executor.clone(),
        };

        match self.servers.entry(id) {
            Entry::Occupied(entry) => Err(Error::DuplicateBroker(entry.key().clone(), Side::Server)),
            Entry::Vacant(slot) => {
                debug!(broker = %server.broker_id, peer = %server.local_peer(), "server built");
                slot.insert(server.clone());
                Ok(server)
            }
        }
    }

    /// Binds the client's reply listener and opens its channel to the server.
    pub async fn build_client(&self, config: &BrokerConfig) -> Result<MessageClient> {
        let id = config.id().clone();
        if self.clients.contains_key(&id) {
            return Err(Error::DuplicateBroker(id, Side::Client));
        }

        // validate before binding so a bad config leaves nothing behind
        let server_peer = config.server_peer();
        if let Err(reason) = server_peer.validate_target() {
            return Err(channel::Error::InvalidPeer { peer: server_peer, reason }.into());
        }

        let binding = self
            .transport
            .bind(&config.local_peer(), self.dispatch(&id, Side::Client))
            .await?;

        let channel = MessageChannel::new(
            binding.local_peer().clone(),
            server_peer,
            Arc::clone(&self.transport),
            self.executor.clone(),
        )?;

        let client = MessageClient {
            broker_id: id.clone(),
            channel,
            _binding: Arc::new(binding),
        };

        match self.clients.entry(id) {
            Entry::Occupied(entry) => Err(Error::DuplicateBroker(entry.key().clone(), Side::Client)),
            Entry::Vacant(slot) => {
                debug!(broker = %client.broker_id, peer = %client.local_peer(), "client built");
                slot.insert(client.clone());
                Ok(client)
            }
        }
    }

    pub fn client(&self, id: &BrokerId) -> Result<MessageClient> {
        self.clients
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownBroker(id.clone(), Side::Client))
    }

    pub fn server(&self, id: &BrokerId) -> Result<MessageServer> {
        self.servers
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownBroker(id.clone(), Side::Server))
    }

    /// Registers the one receiver for a broker side.
    pub fn set_receiver(&self, id: &BrokerId, side: Side, receiver: Arc<dyn Inbox>) -> Result<()> {
        match self.receivers.entry((id.clone(), side)) {
            Entry::Occupied(_) => Err(Error::DuplicateReceiver(id.clone(), side)),
            Entry::Vacant(slot) => {
                slot.insert(receiver);
                Ok(())
            }
        }
    }

    /// Drops both halves of a broker and their receivers. Listeners stop once
    /// the last handle to them is gone.
    pub fn shutdown(&self, id: &BrokerId) {
        self.clients.remove(id);
        self.servers.remove(id);
        self.receivers.remove(&(id.clone(), Side::Client));
        self.receivers.remove(&(id.clone(), Side::Server));
    }

    fn dispatch(&self, id: &BrokerId, side: Side) -> Arc<dyn Inbox> {
        Arc::new(Dispatch {
            key: (id.clone(), side),
            receivers: Arc::clone(&self.receivers),
        })
    }
}

/// Inbox installed on every listener; forwards to the registered receiver.
struct Dispatch {
    key: (BrokerId, Side),
    receivers: Arc<Receivers>,
}

impl Inbox for Dispatch {
    fn receive(&self, envelope: Envelope) {
        let receiver = self
            .receivers
            .get(&self.key)
            .map(|entry| entry.value().clone());

        match receiver {
            Some(receiver) => receiver.receive(envelope),
            None => {
                let (id, side) = &self.key;
                warn!(broker = %id, %side, sender = %envelope.sender, "no receiver registered, dropping envelope");
            }
        }
    }
}
