//! WebSocket listener and upgrade admission
//!
//! A peer is admitted when its upgrade request names an identity in the
//! last URL path segment, offers the configured OCPP subprotocol and passes
//! the authenticator. Rejections are answered with a plain HTTP status:
//! 400 for identity/subprotocol problems, 401 for failed authentication.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};

use crate::endpoint::Endpoint;
use crate::error::NodeError;
use crate::identity::Identity;

/// Credentials of an `Authorization: Basic` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl BasicCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parse `Basic <base64(user:password)>`
    pub fn from_header(value: &str) -> Option<Self> {
        let encoded = value.strip_prefix("Basic ")?.trim();
        let decoded = base64::decode(encoded).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(Self::new(username, password))
    }

    /// Header value for these credentials
    pub fn to_header(&self) -> String {
        format!("Basic {}", base64::encode(format!("{}:{}", self.username, self.password)))
    }
}

/// Yes/no gate on the credentials a peer presents
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, identity: &Identity, credentials: Option<&BasicCredentials>) -> bool;
}

/// Admits every peer
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _identity: &Identity, _credentials: Option<&BasicCredentials>) -> bool {
        true
    }
}

/// Identity → password table checked against HTTP Basic credentials.
/// The username must be the identity the peer connects as.
#[derive(Debug, Clone, Default)]
pub struct BasicAuth {
    passwords: HashMap<Identity, String>,
}

impl BasicAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(mut self, identity: impl Into<Identity>, password: impl Into<String>) -> Self {
        self.passwords.insert(identity.into(), password.into());
        self
    }

    pub fn len(&self) -> usize {
        self.passwords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passwords.is_empty()
    }
}

impl Authenticator for BasicAuth {
    fn authenticate(&self, identity: &Identity, credentials: Option<&BasicCredentials>) -> bool {
        let Some(credentials) = credentials else {
            return false;
        };
        credentials.username == identity.as_str()
            && self
                .passwords
                .get(identity)
                .is_some_and(|password| *password == credentials.password)
    }
}

/// Why an upgrade was refused
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("upgrade path carries no identity")]
    MissingIdentity,

    #[error("subprotocol {expected} not offered (got {offered:?})")]
    SubprotocolMismatch { expected: String, offered: Option<String> },

    #[error("{0} failed authentication")]
    Unauthorized(Identity),
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::MissingIdentity | Rejection::SubprotocolMismatch { .. } => StatusCode::BAD_REQUEST,
            Rejection::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }

    fn into_response(self) -> ErrorResponse {
        let status = self.status();
        let mut response = ErrorResponse::new(Some(self.to_string()));
        *response.status_mut() = status;
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"OCPP\""),
            );
        }
        response
    }
}

/// Upgrade gate: identity, subprotocol and credentials
pub struct Admission {
    subprotocol: String,
    authenticator: Arc<dyn Authenticator>,
}

impl Admission {
    pub fn new(subprotocol: impl Into<String>, authenticator: impl Authenticator + 'static) -> Self {
        Self {
            subprotocol: subprotocol.into(),
            authenticator: Arc::new(authenticator),
        }
    }

    pub fn subprotocol(&self) -> &str {
        &self.subprotocol
    }

    /// Decide on one upgrade request
    pub fn admit(&self, request: &Request) -> Result<Identity, Rejection> {
        let identity = Identity::from_upgrade_path(request.uri().path()).ok_or(Rejection::MissingIdentity)?;

        let offered = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        let accepted = offered
            .map(|list| list.split(',').any(|p| p.trim() == self.subprotocol))
            .unwrap_or(false);
        if !accepted {
            return Err(Rejection::SubprotocolMismatch {
                expected: self.subprotocol.clone(),
                offered: offered.map(str::to_string),
            });
        }

        let credentials = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(BasicCredentials::from_header);
        if !self.authenticator.authenticate(&identity, credentials.as_ref()) {
            return Err(Rejection::Unauthorized(identity));
        }

        Ok(identity)
    }
}

/// TCP listener accepting OCPP WebSocket peers into an endpoint
pub struct Listener {
    endpoint: Arc<Endpoint>,
    admission: Arc<Admission>,
    listener: TcpListener,
}

impl Listener {
    pub async fn bind(
        addr: &str,
        endpoint: Arc<Endpoint>,
        authenticator: impl Authenticator + 'static,
    ) -> Result<Self, NodeError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| NodeError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let admission = Admission::new(endpoint.config().subprotocol.clone(), authenticator);

        Ok(Self {
            endpoint,
            admission: Arc::new(admission),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NodeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept peers until the task is cancelled
    pub async fn run(self) -> Result<(), NodeError> {
        info!(
            "Listening on {} for {} peers",
            self.local_addr()?,
            self.admission.subprotocol()
        );

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    continue;
                }
            };

            let endpoint = self.endpoint.clone();
            let admission = self.admission.clone();
            tokio::spawn(async move {
                accept_peer(endpoint, admission, stream, addr).await;
            });
        }
    }
}

async fn accept_peer(endpoint: Arc<Endpoint>, admission: Arc<Admission>, stream: TcpStream, addr: SocketAddr) {
    let ws_config = WebSocketConfig {
        max_message_size: Some(endpoint.config().max_message_size),
        ..Default::default()
    };

    let mut admitted = None;
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let identity = admission.admit(request).map_err(|rejection| {
            warn!("Rejecting upgrade from {}: {}", addr, rejection);
            rejection.into_response()
        })?;

        let protocol = HeaderValue::from_str(admission.subprotocol()).map_err(|_| {
            Rejection::SubprotocolMismatch {
                expected: admission.subprotocol().to_string(),
                offered: None,
            }
            .into_response()
        })?;
        response.headers_mut().insert(header::SEC_WEBSOCKET_PROTOCOL, protocol);
        admitted = Some(identity);
        Ok(response)
    };

    let ws = match accept_hdr_async_with_config(stream, callback, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let Some(identity) = admitted else {
        return;
    };

    info!("{} connected from {}", identity, addr);
    endpoint.serve_websocket(ws, identity.clone(), Some(addr)).await;
    info!("{} disconnected", identity);
}
