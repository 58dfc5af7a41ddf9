//! # Callback Service
//!
//! The server's voice toward one client for one invocation. Every message is
//! stamped with the next sequence number and sent fire-and-forget on the
//! channel back to the client.
//!
//! ## Invariants
//!
//! - Sequence numbers start at 0 and have no gaps among sent messages.
//! - `finished` and `exception` are terminal. Once either was sent, every
//!   call returns `Error::Terminated` and sends nothing.
//! - Delivery failures are logged, never returned: the wire gives no
//!   acknowledgement to wait for.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use relaynet::MessageChannel;
use relaynet::Peer;
use relaynet::transport;
use relayrpc::ClientBound;
use relayrpc::ClientFrame;
use relayrpc::InterimResponse;
use relayrpc::InvocationId;
use relayrpc::Progress;
use relayrpc::RemoteError;
use relayrpc::RequestId;
use serde::Serialize;
use serde_json::Value;
use tracing::trace;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The invocation already sent its terminal message.
    Terminated(InvocationId),
    /// The payload could not be encoded as JSON.
    Encode(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminated(id) => write!(f, "Invocation {} already terminated", id),
            Self::Encode(msg) => write!(f, "Encode error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone)]
pub struct CallbackService {
    inner: Arc<Inner>,
}

struct Inner {
    invocation_id: InvocationId,
    channel: MessageChannel,
    state: Mutex<SendState>,
}

#[derive(Default)]
struct SendState {
    next_seq: u64,
    terminated: bool,
}

impl CallbackService {
    pub fn new(invocation_id: InvocationId, channel: MessageChannel) -> Self {
        Self {
            inner: Arc::new(Inner {
                invocation_id,
                channel,
                state: Mutex::new(SendState::default()),
            }),
        }
    }

    pub fn invocation_id(&self) -> InvocationId {
        self.inner.invocation_id
    }

    /// The client this service talks to.
    pub fn client_peer(&self) -> &Peer {
        self.inner.channel.target()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .terminated
    }

    pub fn interim_response(&self, response: InterimResponse) -> Result<()> {
        self.send(ClientBound::InterimResponse {
            invocation_id: self.inner.invocation_id,
            response,
        })
    }

    pub fn progress(&self, progress: Progress) -> Result<()> {
        self.interim_response(InterimResponse::Progress(progress))
    }

    /// Sends an arbitrary serializable value as interim data.
    pub fn interim_data<T: Serialize + ?Sized>(&self, data: &T) -> Result<()> {
        self.interim_response(InterimResponse::Data(serde_json::to_value(data)?))
    }

    /// Asks the client a question. The answer comes back as a server-bound
    /// `Response` carrying `request_id`.
    pub fn interim_request(&self, request_id: RequestId, request: Value) -> Result<()> {
        self.send(ClientBound::InterimRequest {
            invocation_id: self.inner.invocation_id,
            request_id,
            request,
        })
    }

    pub fn finished(&self, result: Value) -> Result<()> {
        self.send(ClientBound::Finished {
            invocation_id: self.inner.invocation_id,
            result,
        })
    }

    pub fn exception(&self, exception: RemoteError) -> Result<()> {
        self.send(ClientBound::Exception {
            invocation_id: self.inner.invocation_id,
            exception,
        })
    }

    fn send(&self, message: ClientBound) -> Result<()> {
        let id = self.inner.invocation_id;
        let terminal = message.is_terminal();

        // held across the send so frames leave in sequence order
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.terminated {
            return Err(Error::Terminated(id));
        }

        let seq = state.next_seq;
        let payload = serde_json::to_value(ClientFrame::new(seq, message))?;
        state.next_seq += 1;
        state.terminated = terminal;

        trace!(invocation = %id, seq, terminal, "client-bound frame");
        self.inner.channel.send(
            &payload,
            Some(Box::new(move |error: transport::Error| {
                warn!(invocation = %id, seq, %error, "client-bound frame lost");
            })),
        );
        Ok(())
    }
}

impl fmt::Debug for CallbackService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackService")
            .field("invocation_id", &self.inner.invocation_id)
            .field("client", self.client_peer())
            .finish()
    }
}
