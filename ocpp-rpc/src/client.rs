//! Uplink WebSocket client
//!
//! Connects this endpoint upward (networking node to CSMS, or station to its
//! central system). The upstream peer is served like any accepted peer and
//! registered under `UplinkConfig::upstream_identity`, so requests to it
//! and routes through it use the normal send path.
//! Handles:
//! - WebSocket connection with the OCPP subprotocol
//! - Optional HTTP Basic credentials
//! - Automatic reconnection with exponential backoff

use std::sync::Arc;
use std::time::Duration;

use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        protocol::WebSocketConfig,
    },
};
use tracing::{error, info, warn};

use crate::config::UplinkConfig;
use crate::endpoint::Endpoint;
use crate::error::NodeError;
use crate::server::BasicCredentials;

/// Reconnecting connection to an upstream peer
pub struct Uplink {
    endpoint: Arc<Endpoint>,
    config: UplinkConfig,
}

impl Uplink {
    pub fn new(endpoint: Arc<Endpoint>, config: UplinkConfig) -> Self {
        Self { endpoint, config }
    }

    pub fn config(&self) -> &UplinkConfig {
        &self.config
    }

    /// Keep the uplink connected until the task is cancelled
    pub async fn run(self) {
        let mut backoff = Backoff::new(self.config.reconnect_delay, self.config.max_reconnect_delay);

        loop {
            info!("Connecting uplink to {}", self.config.endpoint_url());

            match self.connect_and_serve().await {
                Ok(()) => {
                    info!("Uplink to {} closed", self.config.upstream_identity);
                    backoff.reset();
                }
                Err(e) => error!("Uplink connection error: {}", e),
            }

            let delay = backoff.next_delay();
            info!("Reconnecting uplink in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// Connect once and serve the connection until it ends
    pub async fn connect_and_serve(&self) -> Result<(), NodeError> {
        let url = self.config.endpoint_url();
        let subprotocol = self.endpoint.config().subprotocol.clone();

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| NodeError::InvalidUrl(format!("{url}: {e}")))?;

        let protocol =
            HeaderValue::from_str(&subprotocol).map_err(|_| NodeError::SubprotocolRejected(subprotocol.clone()))?;
        request.headers_mut().insert(header::SEC_WEBSOCKET_PROTOCOL, protocol);

        if let Some(password) = &self.config.password {
            let credentials = BasicCredentials::new(self.config.identity.as_str(), password.as_str());
            let value = HeaderValue::from_str(&credentials.to_header())
                .map_err(|e| NodeError::Connect(format!("invalid credentials header: {e}")))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        let ws_config = WebSocketConfig {
            max_message_size: Some(self.endpoint.config().max_message_size),
            ..Default::default()
        };

        let (ws_stream, response) = connect_async_with_config(request, Some(ws_config), false)
            .await
            .map_err(|e| NodeError::Connect(e.to_string()))?;

        let accepted = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted != Some(subprotocol.as_str()) {
            warn!("Upstream did not accept {}, got: {:?}", subprotocol, accepted);
            return Err(NodeError::SubprotocolRejected(subprotocol));
        }

        info!("Uplink connected to {} as {}", url, self.config.identity);
        self.endpoint
            .clone()
            .serve_websocket(ws_stream, self.config.upstream_identity.clone(), None)
            .await;
        Ok(())
    }
}

/// Exponential reconnect delay: doubles up to a cap
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following one doubles
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
