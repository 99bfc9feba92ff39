//! Live transport connections
//!
//! A `Connection` is the handle the rest of the engine holds for one peer.
//! Frames are written by a separate writer task that owns the transport
//! sink; every text write is acknowledged so callers learn about transport
//! failures immediately instead of through a timeout.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::identity::Identity;

/// Depth of the outbound frame queue per connection
const OUTBOUND_QUEUE: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection number
pub type ConnectionId = u64;

/// Frame handed to a connection's writer task
#[derive(Debug)]
pub enum Outbound {
    Text {
        text: String,
        written: oneshot::Sender<Result<(), TransportError>>,
    },
    Close {
        reason: String,
    },
}

/// Handle to one live, bidirectional transport channel
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    remote_addr: Option<SocketAddr>,
    established_at: DateTime<Utc>,
    outbound: mpsc::Sender<Outbound>,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Create a connection and the receiving end its writer task drains
    pub fn new(identity: Identity, remote_addr: Option<SocketAddr>) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (closed, _) = watch::channel(false);

        let connection = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            identity,
            remote_addr,
            established_at: Utc::now(),
            outbound,
            closed,
        });

        (connection, outbound_rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Write one text frame and wait until the transport accepted it
    pub async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let (written, written_rx) = oneshot::channel();
        self.outbound
            .send(Outbound::Text { text, written })
            .await
            .map_err(|_| TransportError::Closed)?;

        written_rx.await.map_err(|_| TransportError::Closed)?
    }

    /// Close the connection (best effort; never fails)
    pub fn close(&self, reason: &str) {
        if self.closed.send_replace(true) {
            return;
        }

        if let Err(e) = self.outbound.try_send(Outbound::Close {
            reason: reason.to_string(),
        }) {
            debug!(
                "Connection {} ({}): close frame not queued: {}",
                self.id, self.identity, e
            );
        }
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so wait_for only errors after drop
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Drain a connection's outbound queue into a WebSocket sink.
///
/// A failed write closes `connection`, so it is unbound before anyone else
/// tries to use it.
pub async fn write_frames<S>(mut sink: S, mut outbound: mpsc::Receiver<Outbound>, connection: Arc<Connection>)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let identity = connection.identity().clone();
    // Weak, so the queue still ends once every other handle is dropped
    let handle = Arc::downgrade(&connection);
    drop(connection);
    while let Some(frame) = outbound.recv().await {
        match frame {
            Outbound::Text { text, written } => {
                debug!("Sending to {}: {}", identity, text);
                match sink.send(Message::Text(text.into())).await {
                    Ok(()) => {
                        let _ = written.send(Ok(()));
                    }
                    Err(e) => {
                        warn!("Failed to send WebSocket message to {}: {}", identity, e);
                        if let Some(connection) = handle.upgrade() {
                            connection.close("write failed");
                        }
                        let _ = written.send(Err(TransportError::Write(e.to_string())));
                        break;
                    }
                }
            }
            Outbound::Close { reason } => {
                debug!("Closing connection to {}: {}", identity, reason);
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    // Fail whatever is still queued
    outbound.close();
    while let Some(frame) = outbound.recv().await {
        if let Outbound::Text { written, .. } = frame {
            let _ = written.send(Err(TransportError::Closed));
        }
    }

    let _ = sink.close().await;
}
