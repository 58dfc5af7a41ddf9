//! # Wire Messages
//!
//! Two directions, two closed sets of messages. Every message names the
//! invocation it belongs to.
//!
//! ## Invariants
//!
//! - Client-bound messages for one invocation are `InterimResponse` or
//!   `InterimRequest` any number of times, then exactly one of `Finished` or
//!   `Exception`. Nothing follows the terminal message.
//! - Client-bound messages travel inside a `ClientFrame` whose `seq` counts
//!   from 0 per invocation, so the client can restore send order.
//! - Server-bound messages carry no sequence number.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::RemoteError;
use crate::error::Result;
use crate::id::InvocationId;
use crate::id::RequestId;
use crate::progress::Progress;

/// Messages the client sends to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerBound {
    Invoke {
        invocation_id: InvocationId,
        method: String,
        #[serde(default)]
        parameter: Value,
    },
    Cancel {
        invocation_id: InvocationId,
    },
    /// The client's answer to an `InterimRequest`.
    Response {
        invocation_id: InvocationId,
        request_id: RequestId,
        response: Value,
    },
}

impl ServerBound {
    /// Reads a message out of an envelope payload.
    pub fn decode(payload: &Value) -> Result<Self> {
        Ok(Self::deserialize(payload)?)
    }

    pub fn invocation_id(&self) -> InvocationId {
        match self {
            Self::Invoke { invocation_id, .. }
            | Self::Cancel { invocation_id }
            | Self::Response { invocation_id, .. } => *invocation_id,
        }
    }
}

/// Non-terminal data pushed to the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InterimResponse {
    Progress(Progress),
    Data(Value),
}

/// Messages the server sends to the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientBound {
    InterimResponse {
        invocation_id: InvocationId,
        response: InterimResponse,
    },
    /// Asks the client a question; answered by `ServerBound::Response`.
    InterimRequest {
        invocation_id: InvocationId,
        request_id: RequestId,
        request: Value,
    },
    Finished {
        invocation_id: InvocationId,
        result: Value,
    },
    Exception {
        invocation_id: InvocationId,
        exception: RemoteError,
    },
}

impl ClientBound {
    pub fn invocation_id(&self) -> InvocationId {
        match self {
            Self::InterimResponse { invocation_id, .. }
            | Self::InterimRequest { invocation_id, .. }
            | Self::Finished { invocation_id, .. }
            | Self::Exception { invocation_id, .. } => *invocation_id,
        }
    }

    /// True for `Finished` and `Exception`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Exception { .. })
    }
}

/// A client-bound message with its per-invocation sequence number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub seq: u64,
    pub message: ClientBound,
}

impl ClientFrame {
    pub fn new(seq: u64, message: ClientBound) -> Self {
        Self { seq, message }
    }

    /// Reads a frame out of an envelope payload.
    pub fn decode(payload: &Value) -> Result<Self> {
        Ok(Self::deserialize(payload)?)
    }

    pub fn invocation_id(&self) -> InvocationId {
        self.message.invocation_id()
    }
}
