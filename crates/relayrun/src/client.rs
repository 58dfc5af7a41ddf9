//! # Invocation Client
//!
//! Starts invocations on a remote server and turns the frames that come
//! back into an ordered stream of events per invocation.
//!
//! Pending invocations live in a `DashMap` keyed by invocation id. Each entry
//! owns a reorder buffer and the sender half of the invocation's event
//! channel. Released messages are pushed into the channel while the entry is
//! held, so two frames landing on different tasks cannot swap their events.
//! The entry is removed after the terminal message, which closes the stream.
//!
//! Delivery is at most once. When the terminal frame arrives behind a gap,
//! the client waits `reorder_grace` for the missing frames, then releases
//! what it has and ends the invocation anyway.

use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use relaynet::BrokerId;
use relaynet::Envelope;
use relaynet::Inbox;
use relaynet::MessageClient;
use relaynet::transport;
use relayrpc::ClientBound;
use relayrpc::ClientFrame;
use relayrpc::InterimResponse;
use relayrpc::InvocationId;
use relayrpc::RemoteError;
use relayrpc::Reorder;
use relayrpc::RequestId;
use relayrpc::ServerBound;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The invocation ended in an exception.
    Remote(RemoteError),
    /// The server asked a question that `result` cannot answer.
    UnansweredRequest(RequestId),
    /// The event stream ended without a terminal message.
    Disconnected,
    /// The invoke never reached the server.
    Undelivered(transport::Error),
    /// The parameter could not be encoded as JSON.
    Encode(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(e) => write!(f, "Remote exception: {}", e),
            Self::UnansweredRequest(id) => write!(f, "Server asked question {} with no one to answer", id),
            Self::Disconnected => write!(f, "Invocation ended without a result"),
            Self::Undelivered(e) => write!(f, "Invoke not delivered: {}", e),
            Self::Encode(msg) => write!(f, "Encode error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        Self::Remote(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// One observation of a running invocation, in send order.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationEvent {
    Interim(InterimResponse),
    Request { request_id: RequestId, request: Value },
    Finished(Value),
    Exception(RemoteError),
    /// The invoke never reached the server. Nothing follows.
    Undelivered(transport::Error),
}

impl InvocationEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_) | Self::Exception(_))
    }
}

impl From<ClientBound> for InvocationEvent {
    fn from(message: ClientBound) -> Self {
        match message {
            ClientBound::InterimResponse { response, .. } => Self::Interim(response),
            ClientBound::InterimRequest {
                request_id, request, ..
            } => Self::Request { request_id, request },
            ClientBound::Finished { result, .. } => Self::Finished(result),
            ClientBound::Exception { exception, .. } => Self::Exception(exception),
        }
    }
}

#[derive(Clone)]
pub struct InvocationClient {
    inner: Arc<Inner>,
}

struct Inner {
    message_client: MessageClient,
    pending: DashMap<InvocationId, Pending>,
    reorder_grace: Duration,
}

struct Pending {
    reorder: Reorder,
    events: mpsc::UnboundedSender<InvocationEvent>,
    flush_armed: bool,
}

impl InvocationClient {
    /// `reorder_grace` bounds how long a terminal frame waits for the
    /// frames sent before it.
    pub fn new(message_client: MessageClient, reorder_grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                message_client,
                pending: DashMap::new(),
                reorder_grace,
            }),
        }
    }

    pub fn broker_id(&self) -> &BrokerId {
        self.inner.message_client.broker_id()
    }

    pub fn message_client(&self) -> &MessageClient {
        &self.inner.message_client
    }

    /// Invocations still waiting for their terminal message.
    pub fn in_flight(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn method(&self, name: impl Into<String>) -> MethodProxy {
        MethodProxy {
            client: self.clone(),
            method: name.into(),
        }
    }

    /// Starts `method` on the server. Delivery problems show up on the
    /// returned invocation, never here.
    pub fn invoke(&self, method: &str, parameter: Value) -> Invocation {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut pending = Some(Pending {
            reorder: Reorder::new(),
            events: tx,
            flush_armed: false,
        });
        let invocation_id = loop {
            if let Entry::Vacant(slot) = self.inner.pending.entry(InvocationId::random()) {
                let id = *slot.key();
                if let Some(pending) = pending.take() {
                    slot.insert(pending);
                }
                break id;
            }
        };

        debug!(broker = %self.broker_id(), invocation = %invocation_id, %method, "invoking");
        self.send(
            ServerBound::Invoke {
                invocation_id,
                method: method.to_string(),
                parameter,
            },
            true,
        );

        Invocation {
            id: invocation_id,
            client: self.clone(),
            events: rx,
        }
    }

    /// Inbox to register as this broker's client receiver. Holds the client
    /// weakly so the registry does not keep it alive.
    pub fn receiver(&self) -> Arc<dyn Inbox> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move |envelope: Envelope| {
            if let Some(inner) = weak.upgrade() {
                InvocationClient { inner }.receive(envelope);
            }
        })
    }

    /// Sends to the server. A lost message is logged; when
    /// `ends_invocation` is set the invocation also ends with `Undelivered`.
    fn send(&self, message: ServerBound, ends_invocation: bool) {
        let id = message.invocation_id();
        let weak = Arc::downgrade(&self.inner);
        self.inner.message_client.send(
            &message,
            Some(Box::new(move |error: transport::Error| {
                warn!(invocation = %id, %error, "server-bound message lost");
                if !ends_invocation {
                    return;
                }
                let removed = weak.upgrade().and_then(|inner| inner.pending.remove(&id));
                if let Some((_, pending)) = removed {
                    let _ = pending.events.send(InvocationEvent::Undelivered(error));
                }
            })),
        );
    }

    fn receive(&self, envelope: Envelope) {
        let frame = match ClientFrame::decode(&envelope.payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(sender = %envelope.sender, error = %e, "undecodable client-bound frame");
                return;
            }
        };

        let id = frame.invocation_id();
        let (terminal, stalled) = {
            let Some(mut pending) = self.inner.pending.get_mut(&id) else {
                debug!(invocation = %id, seq = frame.seq, "frame for unknown invocation");
                return;
            };

            let released = pending.reorder.push(frame);
            let terminal = pending.deliver(released);
            let stalled = !terminal && !pending.flush_armed && pending.reorder.terminal_waiting();
            pending.flush_armed |= stalled;
            (terminal, stalled)
        };

        if terminal {
            self.inner.pending.remove(&id);
        } else if stalled {
            self.flush_after_grace(id);
        }
    }

    /// Gives the frames missing before a terminal one `reorder_grace` to
    /// arrive, then releases the rest and ends the invocation.
    fn flush_after_grace(&self, id: InvocationId) {
        let weak = Arc::downgrade(&self.inner);
        let grace = self.inner.reorder_grace;
        let handle = self.inner.message_client.channel().executor().handle();
        handle.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                InvocationClient { inner }.flush(id);
            }
        });
    }

    fn flush(&self, id: InvocationId) {
        let terminal = {
            let Some(mut pending) = self.inner.pending.get_mut(&id) else {
                return;
            };
            let released = pending.reorder.flush();
            warn!(
                invocation = %id,
                skipped = pending.reorder.skipped(),
                "gave up on lost client-bound frames"
            );
            pending.deliver(released)
        };

        if terminal {
            self.inner.pending.remove(&id);
        }
    }
}

impl Pending {
    /// Pushes released messages into the event stream. True when the
    /// terminal one was among them.
    fn deliver(&self, released: Vec<ClientBound>) -> bool {
        let mut terminal = false;
        for message in released {
            terminal |= message.is_terminal();
            let _ = self.events.send(message.into());
        }
        terminal
    }
}

/// A method name bound to a client.
#[derive(Clone)]
pub struct MethodProxy {
    client: InvocationClient,
    method: String,
}

impl MethodProxy {
    pub fn name(&self) -> &str {
        &self.method
    }

    pub fn invoke(&self, parameter: Value) -> Invocation {
        self.client.invoke(&self.method, parameter)
    }

    /// Invokes and waits for the result, encoding `parameter` first.
    pub async fn call<T: Serialize + ?Sized>(&self, parameter: &T) -> Result<Value> {
        let parameter = serde_json::to_value(parameter)?;
        self.invoke(parameter).result().await
    }
}

/// Client-side handle of one running invocation.
pub struct Invocation {
    id: InvocationId,
    client: InvocationClient,
    events: mpsc::UnboundedReceiver<InvocationEvent>,
}

impl Invocation {
    pub fn id(&self) -> InvocationId {
        self.id
    }

    /// The next event in send order. `None` once the terminal event was
    /// taken or the invocation was abandoned.
    pub async fn next_event(&mut self) -> Option<InvocationEvent> {
        self.events.recv().await
    }

    /// Answers a question the server asked through `InvocationEvent::Request`.
    pub fn respond(&self, request_id: RequestId, response: Value) {
        self.client.send(
            ServerBound::Response {
                invocation_id: self.id,
                request_id,
                response,
            },
            false,
        );
    }

    /// Asks the server to cancel. The invocation still ends with a terminal
    /// event, normally a `Canceled` exception.
    pub fn cancel(&self) {
        self.client.send(
            ServerBound::Cancel {
                invocation_id: self.id,
            },
            false,
        );
    }

    /// Waits for the terminal event, skipping interim responses.
    pub async fn result(mut self) -> Result<Value> {
        loop {
            match self.next_event().await {
                Some(InvocationEvent::Interim(_)) => continue,
                Some(InvocationEvent::Request { request_id, .. }) => {
                    return Err(Error::UnansweredRequest(request_id));
                }
                Some(InvocationEvent::Finished(result)) => return Ok(result),
                Some(InvocationEvent::Exception(e)) => return Err(Error::Remote(e)),
                Some(InvocationEvent::Undelivered(e)) => return Err(Error::Undelivered(e)),
                None => return Err(Error::Disconnected),
            }
        }
    }
}

/// Dropping a handle before its terminal event forgets the invocation and
/// asks the server to cancel it.
impl Drop for Invocation {
    fn drop(&mut self) {
        if self.client.inner.pending.remove(&self.id).is_some() {
            debug!(invocation = %self.id, "invocation dropped while running");
            self.cancel();
        }
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation").field("id", &self.id).finish()
    }
}
