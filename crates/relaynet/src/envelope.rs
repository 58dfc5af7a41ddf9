//! # Envelope
//!
//! The unit of transfer: the sender's reply address plus an opaque payload.
//! One envelope travels per connection. The wire form is a single JSON
//! document; the transport never looks inside `payload`.

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::peer::Peer;
use crate::transport::Result;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: Peer,
    pub payload: Value,
}

impl Envelope {
    pub fn new(sender: Peer, payload: Value) -> Self {
        Self { sender, payload }
    }

    /// Serializes `payload` and wraps it with the sender's address.
    pub fn wrap<T: Serialize + ?Sized>(sender: Peer, payload: &T) -> Result<Self> {
        let payload = serde_json::to_value(payload)?;
        Ok(Self { sender, payload })
    }

    /// Decodes the payload into a typed message without consuming the envelope.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.payload)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
