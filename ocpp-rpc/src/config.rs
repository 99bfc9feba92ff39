//! Configuration for an OCPP RPC endpoint
//!
//! `EndpointConfig` describes the local node; `UplinkConfig` describes an
//! optional upstream connection (networking node to CSMS, or a station
//! connecting to its central system).

use std::collections::HashMap;
use std::time::Duration;

use crate::envelope::WireFormat;
use crate::identity::Identity;

/// OCPP 1.6 WebSocket subprotocol
pub const OCPP16: &str = "ocpp1.6";

/// OCPP 2.0.1 WebSocket subprotocol
pub const OCPP201: &str = "ocpp2.0.1";

/// Local endpoint configuration
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Own identity (used as hop name when routing)
    pub identity: Identity,

    /// Subprotocol token required on upgrade and offered upstream
    pub subprotocol: String,

    /// Framing spoken on every connection of this endpoint
    pub wire_format: WireFormat,

    /// Default timeout for outgoing requests
    pub request_timeout: Duration,

    /// Maximum inbound WebSocket message size
    pub max_message_size: usize,

    /// Inbound CALLs queued per connection before the reader applies backpressure
    pub inbound_queue: usize,

    /// Static routes: destination → neighbour
    pub routes: HashMap<Identity, Identity>,

    /// Neighbour for destinations without a direct binding or route
    pub default_uplink: Option<Identity>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            identity: Identity::new("CSMS"),
            subprotocol: OCPP201.to_string(),
            wire_format: WireFormat::Standard,
            request_timeout: Duration::from_secs(30),
            max_message_size: 64 * 1024,
            inbound_queue: 16,
            routes: HashMap::new(),
            default_uplink: None,
        }
    }
}

impl EndpointConfig {
    pub fn new(identity: impl Into<Identity>) -> Self {
        Self {
            identity: identity.into(),
            ..Default::default()
        }
    }

    pub fn with_subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocol = subprotocol.into();
        self
    }

    /// Speak the networking-node framing
    pub fn routed(mut self) -> Self {
        self.wire_format = WireFormat::Routed;
        self
    }

    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn with_inbound_queue(mut self, depth: usize) -> Self {
        self.inbound_queue = depth.max(1);
        self
    }

    /// Reach `destination` through neighbour `via`
    pub fn with_route(mut self, destination: impl Into<Identity>, via: impl Into<Identity>) -> Self {
        self.routes.insert(destination.into(), via.into());
        self
    }

    pub fn with_default_uplink(mut self, uplink: impl Into<Identity>) -> Self {
        self.default_uplink = Some(uplink.into());
        self
    }
}

/// Upstream connection configuration
#[derive(Debug, Clone)]
pub struct UplinkConfig {
    /// Upstream WebSocket URL (without identity)
    pub url: String,

    /// Identity presented upstream (appended to the URL)
    pub identity: Identity,

    /// Identity the upstream peer is registered under locally
    pub upstream_identity: Identity,

    /// Basic-auth password presented upstream (optional)
    pub password: Option<String>,

    /// Initial reconnect delay
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_reconnect_delay: Duration,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8180/ocpp".to_string(),
            identity: Identity::new("NN1"),
            upstream_identity: Identity::new("CSMS"),
            password: None,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
        }
    }
}

impl UplinkConfig {
    pub fn new(url: impl Into<String>, identity: impl Into<Identity>) -> Self {
        Self {
            url: url.into(),
            identity: identity.into(),
            ..Default::default()
        }
    }

    pub fn with_upstream_identity(mut self, identity: impl Into<Identity>) -> Self {
        self.upstream_identity = identity.into();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max.max(initial);
        self
    }

    /// Full URL: base URL with the presented identity as last path segment
    pub fn endpoint_url(&self) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), self.identity)
    }
}
