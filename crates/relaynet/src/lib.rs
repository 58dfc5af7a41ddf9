//! # relaynet
//!
//! Broker-addressed point-to-point channels. A `MessageChannel` sends one
//! envelope per connection to one peer and reports failures through a
//! callback instead of the caller's stack. `Brokers` pairs a client and a
//! server under one broker id and routes inbound envelopes to the receiver
//! registered for each side.
//!
//! Transports are pluggable behind the `Transport` trait. `TcpTransport`
//! speaks real sockets; `LocalTransport` is an in-process network.

pub mod broker;
pub mod channel;
pub mod envelope;
pub mod local;
pub mod peer;
pub mod tcp;
pub mod transport;

pub use broker::BrokerConfig;
pub use broker::BrokerId;
pub use broker::Brokers;
pub use broker::MessageClient;
pub use broker::MessageServer;
pub use broker::Side;
pub use channel::ErrorCallback;
pub use channel::MessageChannel;
pub use channel::SendExecutor;
pub use envelope::Envelope;
pub use local::LocalTransport;
pub use peer::Peer;
pub use tcp::TcpTransport;
pub use transport::Binding;
pub use transport::Inbox;
pub use transport::Transport;
