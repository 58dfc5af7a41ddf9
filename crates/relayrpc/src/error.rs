//! # Error Definitions
//!
//! `Error` is a local failure to handle a message. `RemoteError` is the
//! payload of a terminal exception: the server failing, not the wire.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An id was not 32 hex characters.
    InvalidId(String),
    /// A message could not be encoded or decoded.
    Codec(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidId(raw) => write!(f, "Invalid id '{}'", raw),
            Self::Codec(msg) => write!(f, "Codec error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why an invocation ended in an exception.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The handler returned an error.
    Application,
    /// No handler is registered under the requested method name.
    MethodNotFound,
    /// The invocation observed a cancel and stopped.
    Canceled,
    /// The handler panicked.
    Panicked,
    /// The invoke message could not be understood.
    BadRequest,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Application => "application error",
            Self::MethodNotFound => "method not found",
            Self::Canceled => "canceled",
            Self::Panicked => "panicked",
            Self::BadRequest => "bad request",
        };
        f.write_str(name)
    }
}

/// The exception carried by a terminal `Exception` message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Application, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(ErrorKind::MethodNotFound, format!("no method named '{}'", method))
    }

    pub fn canceled() -> Self {
        Self::new(ErrorKind::Canceled, "invocation canceled")
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Panicked, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}
