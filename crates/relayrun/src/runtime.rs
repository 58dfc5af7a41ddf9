//! # Invocation Runtime
//!
//! Owns the broker registry and the invocation servers and clients built on
//! it. There is no process-wide instance: build one with
//! `InvocationRuntime::builder()` and pass it to whoever needs it.
//!
//! Uses DashMap so brokers can be served and connected from several tasks
//! while others carry traffic.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use relaynet::BrokerConfig;
use relaynet::BrokerId;
use relaynet::Brokers;
use relaynet::SendExecutor;
use relaynet::Side;
use relaynet::Transport;
use relaynet::broker;
use relaynet::channel;
use tokio::runtime::Handle;
use tracing::debug;

use crate::client::InvocationClient;
use crate::server::InvocationServer;

/// How often a running invocation's progress is checked by default.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_REORDER_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The builder was never given a transport.
    MissingTransport,
    /// No invocation server or client was built for this broker.
    UnknownBroker(BrokerId, Side),
    Broker(broker::Error),
    Channel(channel::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingTransport => write!(f, "No transport configured"),
            Self::UnknownBroker(id, side) => write!(f, "Broker '{}' has no invocation {}", id, side),
            Self::Broker(e) => write!(f, "Broker error: {}", e),
            Self::Channel(e) => write!(f, "Channel error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<broker::Error> for Error {
    fn from(e: broker::Error) -> Self {
        Self::Broker(e)
    }
}

impl From<channel::Error> for Error {
    fn from(e: channel::Error) -> Self {
        Self::Channel(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Caps concurrent outbound sends. Unbounded when `None`.
    pub max_inflight_sends: Option<usize>,
    pub progress_interval: Duration,
    /// How long a client holds a terminal frame waiting for lost ones.
    pub reorder_grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_inflight_sends: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            reorder_grace: DEFAULT_REORDER_GRACE,
        }
    }
}

#[derive(Default)]
pub struct RuntimeBuilder {
    transport: Option<Arc<dyn Transport>>,
    handle: Option<Handle>,
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn max_inflight_sends(mut self, limit: usize) -> Self {
        self.config.max_inflight_sends = Some(limit);
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.config.progress_interval = interval;
        self
    }

    pub fn reorder_grace(mut self, grace: Duration) -> Self {
        self.config.reorder_grace = grace;
        self
    }

    /// Runs sends on `handle` instead of the caller's runtime.
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn build(self) -> Result<InvocationRuntime> {
        let transport = self.transport.ok_or(Error::MissingTransport)?;
        let mut executor = match self.handle {
            Some(handle) => SendExecutor::new(handle),
            None => SendExecutor::current()?,
        };
        if let Some(limit) = self.config.max_inflight_sends {
            executor = executor.max_inflight(limit);
        }

        Ok(InvocationRuntime {
            brokers: Brokers::new(transport, executor),
            config: self.config,
            servers: DashMap::new(),
            clients: DashMap::new(),
        })
    }
}

pub struct InvocationRuntime {
    brokers: Brokers,
    config: RuntimeConfig,
    servers: DashMap<BrokerId, InvocationServer>,
    clients: DashMap<BrokerId, InvocationClient>,
}

impl InvocationRuntime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn brokers(&self) -> &Brokers {
        &self.brokers
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Binds the server side of a broker and starts serving invocations on
    /// it. Register methods on the returned server.
    pub async fn serve(&self, config: &BrokerConfig) -> Result<InvocationServer> {
        let message_server = self.brokers.build_server(config).await?;
        let server = InvocationServer::new(message_server, self.config.progress_interval);
        self.brokers
            .set_receiver(config.id(), Side::Server, server.receiver())?;

        debug!(broker = %config.id(), peer = %server.local_peer(), "serving invocations");
        self.servers.insert(config.id().clone(), server.clone());
        Ok(server)
    }

    /// Builds the client side of a broker.
    pub async fn connect(&self, config: &BrokerConfig) -> Result<InvocationClient> {
        let message_client = self.brokers.build_client(config).await?;
        let client = InvocationClient::new(message_client, self.config.reorder_grace);
        self.brokers
            .set_receiver(config.id(), Side::Client, client.receiver())?;

        debug!(broker = %config.id(), server = %config.server_peer(), "connected");
        self.clients.insert(config.id().clone(), client.clone());
        Ok(client)
    }

    pub fn server(&self, id: &BrokerId) -> Result<InvocationServer> {
        self.servers
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownBroker(id.clone(), Side::Server))
    }

    pub fn client(&self, id: &BrokerId) -> Result<InvocationClient> {
        self.clients
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownBroker(id.clone(), Side::Client))
    }

    /// Forgets both sides of a broker and releases their listeners once no
    /// other handle holds them.
    pub fn shutdown(&self, id: &BrokerId) {
        self.servers.remove(id);
        self.clients.remove(id);
        self.brokers.shutdown(id);
    }
}
