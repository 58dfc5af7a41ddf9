//! # relayrpc
//!
//! The protocol of long-running invocations: correlation ids, the messages
//! exchanged in each direction, progress snapshots and the client-side
//! reorder buffer. Nothing here touches the network; payloads are
//! `serde_json::Value` and messages serialize as tagged JSON objects.

pub mod error;
pub mod id;
pub mod message;
pub mod progress;
pub mod sequence;

pub use error::Error;
pub use error::ErrorKind;
pub use error::RemoteError;
pub use error::Result;
pub use id::InvocationId;
pub use id::RequestId;
pub use id::TaskId;
pub use message::ClientBound;
pub use message::ClientFrame;
pub use message::InterimResponse;
pub use message::ServerBound;
pub use progress::Progress;
pub use sequence::DEFAULT_MAX_BUFFERED;
pub use sequence::Reorder;
