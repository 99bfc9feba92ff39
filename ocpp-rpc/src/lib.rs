//! # OCPP RPC
//!
//! Message-exchange core of an OCPP stack: turns the WebSocket text stream
//! between a central system (or networking node) and a charging station
//! into correlated request/response pairs, and back.
//!
//! ## Architecture
//!
//! ```text
//!  inbound text frame
//!       │
//!       ▼
//! ┌──────────────┐  CALL   ┌────────────┐  verify  ┌────────────────┐
//! │   Codec      ├────────►│ Dispatcher ├─────────►│  subscribers   │
//! │ (envelope)   │         │            │◄─────────┤ (first answer) │
//! └──────┬───────┘         └─────┬──────┘   sign   └────────────────┘
//!        │ CALLRESULT            │ reply
//!        │ CALLERROR             ▼
//!        ▼                 ┌────────────┐
//! ┌──────────────┐         │  Router    │ routed envelopes for
//! │ Correlation  │         │ (hop path) ├──► other nodes
//! │  (pending)   │         └────────────┘
//! └──────▲───────┘
//!        │ register
//! ┌──────┴───────┐  lookup ┌────────────┐
//! │ Endpoint::   ├────────►│  Registry  │ identity → connection
//! │   send       │         └────────────┘
//! └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use ocpp_rpc::actions::{HeartbeatRequest, HeartbeatResponse};
//! use ocpp_rpc::{AllowAll, Endpoint, EndpointConfig, Listener};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let endpoint = Endpoint::new(EndpointConfig::new("CSMS").with_subprotocol("ocpp1.6"));
//!
//!     endpoint
//!         .dispatcher()
//!         .subscribe::<HeartbeatRequest, _, _>(|ctx, _request| async move {
//!             tracing::info!("Heartbeat from {}", ctx.origin);
//!             Ok(Some(HeartbeatResponse {
//!                 current_time: chrono::Utc::now(),
//!             }))
//!         });
//!
//!     let listener = Listener::bind("0.0.0.0:9000", endpoint, AllowAll).await?;
//!     listener.run().await?;
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod client;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod dispatcher;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod registry;
pub mod router;
pub mod server;
pub mod signature;

pub use client::Uplink;
pub use config::{EndpointConfig, UplinkConfig, OCPP16, OCPP201};
pub use connection::{Connection, ConnectionId};
pub use correlation::{CorrelationEngine, PendingRequest};
pub use dispatcher::{ActionDispatcher, CallContext, HandlerError};
pub use endpoint::{Endpoint, EndpointBuilder, ProcessingOutcome};
pub use envelope::{Call, CallError, CallResult, Codec, DecodeError, Envelope, RoutedError, Routing, WireFormat};
pub use error::{ErrorCode, NodeError, SendError, TransportError};
pub use identity::{EventTrackingId, Identity, NetworkPath, RequestId};
pub use registry::{ConnectionEvent, ConnectionRegistry};
pub use router::{Router, RoutingError};
pub use server::{AllowAll, Authenticator, BasicAuth, Listener};
pub use signature::{HmacSignatures, NoSignatures, SignatureOutcome, SignaturePolicy};
