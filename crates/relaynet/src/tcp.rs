//! # TCP Transport
//!
//! Connection-per-message over `tokio::net`: every send connects, writes one
//! JSON envelope, shuts the write half down and drops the socket. The
//! receiving side reads each accepted connection to EOF and decodes exactly
//! one envelope from it.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::envelope::Envelope;
use crate::peer::Peer;
use crate::transport::Binding;
use crate::transport::Error;
use crate::transport::Inbox;
use crate::transport::Result;
use crate::transport::Transport;

/// Largest envelope accepted by default.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct TcpTransport {
    connect_timeout: Option<Duration>,
    max_frame_len: usize,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            connect_timeout: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Bounds how long a connect may take. Unbounded by default.
    pub fn connect_timeout(mut self, limit: Duration) -> Self {
        self.connect_timeout = Some(limit);
        self
    }

    /// Bounds the encoded size of one envelope, on both ends.
    pub fn max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    async fn connect(&self, target: &Peer) -> Result<TcpStream> {
        let connecting = TcpStream::connect((target.host(), target.port()));
        let connected = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| Error::Timeout)?,
            None => connecting.await,
        };
        connected.map_err(|e| connect_error(target, e))
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn connect_error(target: &Peer, e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => Error::ConnectionRefused(target.clone()),
        _ => Error::Io(format!("connect to {}: {}", target, e)),
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, target: &Peer, envelope: &Envelope) -> Result<()> {
        let bytes = envelope.to_bytes()?;
        if bytes.len() > self.max_frame_len {
            return Err(Error::PayloadTooLarge {
                len: bytes.len(),
                max: self.max_frame_len,
            });
        }

        let mut stream = self.connect(target).await?;
        let written = stream.write_all(&bytes).await;

        // close regardless of how the write went; a close error must not
        // mask the write error
        if let Err(e) = stream.shutdown().await {
            trace!(%target, error = %e, "shutdown after send failed");
        }
        drop(stream);

        written.map_err(|e| Error::ConnectionLost(format!("write to {}: {}", target, e)))
    }

    async fn bind(&self, local: &Peer, inbox: Arc<dyn Inbox>) -> Result<Binding> {
        let listener = TcpListener::bind((local.host(), local.port()))
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::AddrInUse => Error::AddressInUse(local.clone()),
                _ => Error::from(e),
            })?;
        let bound = local.with_port(listener.local_addr()?.port());
        debug!(peer = %bound, "tcp listener bound");

        let task = tokio::spawn(accept_loop(listener, inbox, self.max_frame_len));
        Ok(Binding::new(bound, move || task.abort()))
    }
}

async fn accept_loop(listener: TcpListener, inbox: Arc<dyn Inbox>, max_frame_len: usize) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::task::yield_now().await;
                continue;
            }
        };

        let inbox = inbox.clone();
        tokio::spawn(async move {
            match read_envelope(stream, max_frame_len).await {
                Ok(envelope) => inbox.receive(envelope),
                Err(e) => warn!(%remote, error = %e, "dropping inbound connection"),
            }
        });
    }
}

/// Reads one envelope from a connection, up to EOF.
async fn read_envelope(stream: TcpStream, max_frame_len: usize) -> Result<Envelope> {
    let mut buf = Vec::new();
    let mut limited = stream.take(max_frame_len as u64 + 1);
    limited.read_to_end(&mut buf).await?;

    if buf.len() > max_frame_len {
        return Err(Error::PayloadTooLarge {
            len: buf.len(),
            max: max_frame_len,
        });
    }

    Envelope::from_bytes(&buf)
}
