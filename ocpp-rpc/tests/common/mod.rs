//! In-memory peers for driving endpoints without sockets

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ocpp_rpc::connection::{Connection, Outbound};
use ocpp_rpc::{Endpoint, Identity, TransportError};
use serde_json::Value;
use tokio::sync::mpsc;

/// How long a test waits for a frame that should arrive
pub const FRAME_WAIT: Duration = Duration::from_secs(5);

/// Test-side end of a connection: writes raw frames into the endpoint and
/// reads what the endpoint writes back.
pub struct RawPeer {
    pub connection: Arc<Connection>,
    to_endpoint: Option<mpsc::Sender<String>>,
    from_endpoint: mpsc::UnboundedReceiver<String>,
}

impl RawPeer {
    pub async fn send(&self, text: &str) {
        self.to_endpoint
            .as_ref()
            .expect("peer still connected")
            .send(text.to_string())
            .await
            .expect("endpoint reads frames");
    }

    /// Next frame written by the endpoint
    pub async fn recv(&mut self) -> String {
        tokio::time::timeout(FRAME_WAIT, self.from_endpoint.recv())
            .await
            .expect("frame within deadline")
            .expect("connection open")
    }

    pub async fn recv_json(&mut self) -> Value {
        let text = self.recv().await;
        serde_json::from_str(&text).unwrap_or_else(|e| panic!("endpoint wrote invalid JSON {text:?}: {e}"))
    }

    /// Nothing is written within `wait`
    pub async fn assert_silent(&mut self, wait: Duration) {
        if let Ok(Some(frame)) = tokio::time::timeout(wait, self.from_endpoint.recv()).await {
            panic!("unexpected frame {frame}");
        }
    }

    /// End the inbound stream, as if the peer hung up
    pub fn hang_up(&mut self) {
        self.to_endpoint = None;
    }
}

/// Attach a raw peer to `endpoint` under `identity` and run its receive loop
pub async fn attach(endpoint: &Arc<Endpoint>, identity: &str) -> RawPeer {
    let (connection, mut outbound) = Connection::new(Identity::new(identity), None);
    let (to_endpoint, inbound) = mpsc::channel(16);
    let (written_tx, from_endpoint) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match frame {
                Outbound::Text { text, written } => {
                    let _ = written_tx.send(text);
                    let _ = written.send(Ok(()));
                }
                Outbound::Close { .. } => break,
            }
        }
    });

    tokio::spawn(endpoint.clone().run_connection(connection.clone(), inbound));
    wait_bound(endpoint, &connection).await;

    RawPeer {
        connection,
        to_endpoint: Some(to_endpoint),
        from_endpoint,
    }
}

/// Connect two endpoints back to back.
///
/// `a` sees the link as peer `b_name`, `b` sees it as peer `a_name`.
pub async fn link(a: &Arc<Endpoint>, a_name: &str, b: &Arc<Endpoint>, b_name: &str) {
    let (a_side, a_outbound) = Connection::new(Identity::new(b_name), None);
    let (b_side, b_outbound) = Connection::new(Identity::new(a_name), None);
    let (a_inbound_tx, a_inbound) = mpsc::channel(16);
    let (b_inbound_tx, b_inbound) = mpsc::channel(16);

    tokio::spawn(pump(a_outbound, b_inbound_tx));
    tokio::spawn(pump(b_outbound, a_inbound_tx));

    tokio::spawn(a.clone().run_connection(a_side.clone(), a_inbound));
    tokio::spawn(b.clone().run_connection(b_side.clone(), b_inbound));
    wait_bound(a, &a_side).await;
    wait_bound(b, &b_side).await;
}

/// Yield until the receive loop has bound `connection`
pub async fn wait_bound(endpoint: &Endpoint, connection: &Connection) {
    let bound = async {
        while endpoint.registry().lookup(connection.identity()).map(|c| c.id()) != Some(connection.id()) {
            tokio::task::yield_now().await;
        }
    };
    tokio::time::timeout(FRAME_WAIT, bound)
        .await
        .expect("connection bound within deadline");
}

/// Move frames written on one side into the other side's inbound stream
async fn pump(mut outbound: mpsc::Receiver<Outbound>, peer_inbound: mpsc::Sender<String>) {
    while let Some(frame) = outbound.recv().await {
        match frame {
            Outbound::Text { text, written } => {
                let result = peer_inbound.send(text).await.map_err(|_| TransportError::Closed);
                let _ = written.send(result);
            }
            Outbound::Close { .. } => break,
        }
    }
}
