//! OCPP RPC endpoint
//!
//! One `Endpoint` per process node. It owns the shared tables (connection
//! registry, pending requests, action handlers) and runs one receive loop
//! per connection:
//!
//! - responses are resolved by the reader as soon as they arrive
//! - CALLs for this node are handed to a per-connection worker and
//!   answered strictly one at a time, in arrival order
//! - routed envelopes for other nodes are relayed without keeping state

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::actions::Request;
use crate::config::EndpointConfig;
use crate::connection::{self, Connection};
use crate::correlation::{CorrelationEngine, PendingRequest};
use crate::dispatcher::{ActionDispatcher, CallContext};
use crate::envelope::{Call, CallError, CallResult, Codec, DecodeError, Envelope, RoutedError, WireFormat};
use crate::error::{ErrorCode, SendError};
use crate::identity::{EventTrackingId, Identity, RequestId};
use crate::registry::{ConnectionEvent, ConnectionRegistry};
use crate::router::{ReplyStep, RequestStep, Router};
use crate::signature::{NoSignatures, SignaturePolicy};

/// Terminal outcome of processing one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// CALL answered with a CALLRESULT
    JsonResponse,
    /// CALL answered with a CALLERROR / REQUESTERROR
    ErrorResponse(ErrorCode),
    /// Frame could not be decoded
    CouldNotParse,
    /// A subscriber failed; the CALL was answered with its message
    ExceptionOccurred,
    /// CALL handed to the connection's worker
    Queued,
    /// Routed envelope relayed to the next hop
    Forwarded(Identity),
    /// Reply matched a pending request
    Resolved,
    /// Reply matched nothing or could not be delivered
    Dropped,
    /// Keep-alive or rejection notice; nothing to resolve
    Acknowledged,
}

/// Builder for an endpoint
pub struct EndpointBuilder {
    config: EndpointConfig,
    dispatcher: Option<ActionDispatcher>,
    signatures: Arc<dyn SignaturePolicy>,
}

impl EndpointBuilder {
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            dispatcher: None,
            signatures: Arc::new(NoSignatures),
        }
    }

    /// Use a prepared action table instead of the core actions
    pub fn with_dispatcher(mut self, dispatcher: ActionDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_signatures(mut self, policy: impl SignaturePolicy + 'static) -> Self {
        self.signatures = Arc::new(policy);
        self
    }

    pub fn build(self) -> Arc<Endpoint> {
        let registry = ConnectionRegistry::new();
        let router = Router::new(self.config.identity.clone(), registry.clone())
            .with_routes(self.config.routes.clone())
            .with_default_uplink(self.config.default_uplink.clone());

        Arc::new(Endpoint {
            codec: Codec::new(self.config.wire_format),
            registry,
            correlation: CorrelationEngine::new(),
            dispatcher: self.dispatcher.unwrap_or_else(ActionDispatcher::with_core_actions),
            router,
            signatures: self.signatures,
            config: self.config,
        })
    }
}

/// Message-exchange core of one node
pub struct Endpoint {
    config: EndpointConfig,
    codec: Codec,
    registry: ConnectionRegistry,
    correlation: CorrelationEngine,
    dispatcher: ActionDispatcher,
    router: Router,
    signatures: Arc<dyn SignaturePolicy>,
}

impl Endpoint {
    pub fn builder(config: EndpointConfig) -> EndpointBuilder {
        EndpointBuilder::new(config)
    }

    /// Endpoint with the core actions and no signatures
    pub fn new(config: EndpointConfig) -> Arc<Self> {
        EndpointBuilder::new(config).build()
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn identity(&self) -> &Identity {
        &self.config.identity
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn correlation(&self) -> &CorrelationEngine {
        &self.correlation
    }

    /// Action table, for registering subscribers and hooks
    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Bound/unbound lifecycle events
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.registry.subscribe()
    }

    // ------------------------------------------------------------------
    // Outgoing requests
    // ------------------------------------------------------------------

    /// Send a CALL and return the handle to await its outcome.
    ///
    /// Fails with `UnknownClient` before anything is registered when there is
    /// no connection to reach `target`.
    pub async fn send(
        &self,
        target: &Identity,
        action: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<PendingRequest, SendError> {
        let timeout = timeout.unwrap_or(self.config.request_timeout);
        let mut call = Call {
            request_id: RequestId::generate(),
            action: action.to_string(),
            payload,
            routing: None,
        };

        let next_hop = match self.codec.format() {
            WireFormat::Standard => target.clone(),
            WireFormat::Routed => {
                let (routing, next) = self
                    .router
                    .originate(target)
                    .map_err(|_| SendError::UnknownClient(target.clone()))?;
                call.routing = Some(routing);
                next
            }
        };

        let connection = self
            .registry
            .lookup(&next_hop)
            .ok_or_else(|| SendError::UnknownClient(target.clone()))?;

        let call = match self.signatures.sign_request(call.clone()) {
            Ok(signed) => signed,
            Err(e) => {
                warn!("Signing {} to {} failed, sending unsigned: {}", action, target, e);
                call
            }
        };

        let pending = self.correlation.register(
            call.request_id.clone(),
            target.clone(),
            call.action.clone(),
            connection.id(),
            timeout,
        )?;

        debug!("Sending {} {} to {} via {}", action, call.request_id, target, next_hop);
        // A stalled writer counts against the same deadline as the reply
        let frame = Envelope::Call(call).encode();
        match tokio::time::timeout_at(pending.deadline(), connection.send_text(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Could not send {} to {}: {}", action, target, e);
                self.correlation
                    .resolve(pending.request_id(), Err(SendError::TransmissionFailed(e.to_string())));
            }
            Err(_) => {
                warn!("Writing {} to {} did not finish before its deadline", action, target);
                self.correlation.resolve(pending.request_id(), Err(SendError::Timeout));
            }
        }

        Ok(pending)
    }

    /// Send a CALL and wait for its outcome
    pub async fn call(&self, target: &Identity, action: &str, payload: Value) -> Result<Value, SendError> {
        self.send(target, action, payload, None).await?.resolution().await
    }

    /// Send a typed request and parse the typed response
    pub async fn send_request<R: Request>(&self, target: &Identity, request: &R) -> Result<R::Response, SendError> {
        let payload = serde_json::to_value(request).map_err(|e| SendError::InvalidRequest(e.to_string()))?;
        let response = self.call(target, R::ACTION, payload).await?;
        serde_json::from_value(response).map_err(|e| SendError::InvalidResponse(e.to_string()))
    }

    // ------------------------------------------------------------------
    // Connection runtime
    // ------------------------------------------------------------------

    /// Serve an established WebSocket until either side closes it
    pub async fn serve_websocket<S>(
        self: Arc<Self>,
        ws: WebSocketStream<S>,
        identity: Identity,
        remote_addr: Option<SocketAddr>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, mut stream) = ws.split();
        let (connection, outbound) = Connection::new(identity.clone(), remote_addr);
        tokio::spawn(connection::write_frames(sink, outbound, connection.clone()));

        let (inbound_tx, inbound_rx) = mpsc::channel::<String>(self.config.inbound_queue);
        let reader_connection = connection.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        warn!("Ignoring binary frame from {}", identity);
                    }
                    Ok(Message::Close(frame)) => {
                        info!("{} closed the connection: {:?}", identity, frame);
                        break;
                    }
                    // Ping/pong is answered by tungstenite
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket error from {}: {}", identity, e);
                        break;
                    }
                }
            }
            reader_connection.close("peer went away");
        });

        self.run_connection(connection, inbound_rx).await;
        reader.abort();
    }

    /// Run the receive loop of one connection.
    ///
    /// Binds the connection under its identity, processes inbound text
    /// frames until the channel ends or the connection is closed, then
    /// unbinds it and fails whatever was still pending over it.
    pub async fn run_connection(self: Arc<Self>, connection: Arc<Connection>, mut inbound: mpsc::Receiver<String>) {
        self.registry.bind(connection.clone());

        let (calls_tx, calls_rx) = mpsc::channel(self.config.inbound_queue);
        let worker = tokio::spawn(self.clone().call_worker(connection.clone(), calls_rx));

        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(text) => {
                        let outcome = self.handle_frame(&connection, &text, &calls_tx).await;
                        debug!("Frame from {}: {:?}", connection.identity(), outcome);
                    }
                    None => {
                        debug!("Inbound stream of {} ended", connection.identity());
                        break;
                    }
                },
                _ = connection.closed() => {
                    debug!("Connection {} to {} closed", connection.id(), connection.identity());
                    break;
                }
            }
        }

        drop(calls_tx);
        worker.abort();
        connection.close("connection ended");
        self.registry.unbind(&connection);

        let failed = self.correlation.fail_connection(connection.id(), "connection closed");
        if failed > 0 {
            info!(
                "{} pending request(s) via {} failed on disconnect",
                failed,
                connection.identity()
            );
        }
    }

    async fn call_worker(
        self: Arc<Self>,
        connection: Arc<Connection>,
        mut calls: mpsc::Receiver<(Call, EventTrackingId)>,
    ) {
        while let Some((call, tracking)) = calls.recv().await {
            let outcome = self.process_call(&connection, call, tracking).await;
            debug!("[{}] {:?}", tracking, outcome);
        }
    }

    /// Dispatch a CALL addressed to this node and send the reply
    pub async fn process_call(
        &self,
        connection: &Connection,
        call: Call,
        tracking: EventTrackingId,
    ) -> ProcessingOutcome {
        let mut ctx = CallContext::new(connection.id(), connection.identity().clone(), &call);
        ctx.event_tracking_id = tracking;

        let (reply, outcome) = self.dispatcher.dispatch(&ctx, &call, self.signatures.as_ref()).await;
        self.reply_on(connection, reply, tracking).await;
        outcome
    }

    /// Decode and act on one inbound text frame
    pub async fn handle_frame(
        &self,
        connection: &Connection,
        text: &str,
        calls: &mpsc::Sender<(Call, EventTrackingId)>,
    ) -> ProcessingOutcome {
        let tracking = EventTrackingId::generate();
        debug!("[{}] Received from {}: {}", tracking, connection.identity(), text);

        let envelope = match self.codec.decode(text) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                if let Err(e) = connection.send_text(String::new()).await {
                    debug!("[{}] Keep-alive echo to {} failed: {}", tracking, connection.identity(), e);
                }
                return ProcessingOutcome::Acknowledged;
            }
            Err(mut e) => {
                warn!("[{}] Could not parse frame from {}: {}", tracking, connection.identity(), e);
                if let DecodeError::Formation {
                    routing: Some(routing), ..
                } = &mut e
                {
                    // The reply goes back over this connection
                    if routing.network_path.first() != Some(connection.identity()) {
                        routing.network_path.prepend(connection.identity().clone());
                    }
                }
                if let Some(reply) = e.error_reply() {
                    self.reply_on(connection, reply, tracking).await;
                }
                return ProcessingOutcome::CouldNotParse;
            }
        };

        match envelope {
            Envelope::Call(call) => self.accept_call(connection, call, calls, tracking).await,
            Envelope::CallResult(result) => self.accept_result(result, tracking).await,
            Envelope::CallError(error) => self.accept_call_error(error, tracking),
            Envelope::RequestError(error) => self.accept_request_error(error, tracking).await,
            Envelope::ResponseError(error) => self.accept_response_error(connection, error, tracking).await,
        }
    }

    async fn accept_call(
        &self,
        connection: &Connection,
        mut call: Call,
        calls: &mpsc::Sender<(Call, EventTrackingId)>,
        tracking: EventTrackingId,
    ) -> ProcessingOutcome {
        if let Some(routing) = call.routing.as_mut() {
            match self.router.accept_request(connection.identity(), routing) {
                Ok(RequestStep::Deliver) => {}
                Ok(RequestStep::Forward(next)) => {
                    let mut forwarded = call.clone();
                    if let Some(routing) = forwarded.routing.as_mut() {
                        self.router.stamp(routing);
                    }
                    return match self.relay(Envelope::Call(forwarded), &next).await {
                        Ok(()) => ProcessingOutcome::Forwarded(next),
                        Err(e) => {
                            warn!("[{}] Could not forward {} to {}: {}", tracking, call.request_id, next, e);
                            let reply = call.error_reply(
                                ErrorCode::ProtocolError,
                                format!("could not forward to {next}"),
                                json!({ "reason": e.to_string() }),
                            );
                            self.reply_on(connection, reply, tracking).await;
                            ProcessingOutcome::ErrorResponse(ErrorCode::ProtocolError)
                        }
                    };
                }
                Err(e) => {
                    warn!("[{}] Routing fault for {} {}: {}", tracking, call.action, call.request_id, e);
                    let code = e.error_code();
                    let reply = call.error_reply(code, e.to_string(), json!({}));
                    self.reply_on(connection, reply, tracking).await;
                    return ProcessingOutcome::ErrorResponse(code);
                }
            }
        }

        if calls.send((call, tracking)).await.is_err() {
            debug!("[{}] Call worker of {} is gone", tracking, connection.identity());
            return ProcessingOutcome::Dropped;
        }
        ProcessingOutcome::Queued
    }

    async fn accept_result(&self, mut result: CallResult, tracking: EventTrackingId) -> ProcessingOutcome {
        if let Some(routing) = result.routing.as_mut() {
            match self.router.accept_reply(routing) {
                Ok(ReplyStep::Deliver) => {}
                Ok(ReplyStep::Forward(next)) => {
                    return self.relay_reply(Envelope::CallResult(result), next, tracking).await;
                }
                Err(e) => {
                    warn!("[{}] Dropping result {}: {}", tracking, result.request_id, e);
                    return ProcessingOutcome::Dropped;
                }
            }
        }

        let Some(responder) = self.correlation.target_of(&result.request_id) else {
            debug!("[{}] Dropping result for unknown request {}", tracking, result.request_id);
            return ProcessingOutcome::Dropped;
        };

        let verification = self.signatures.verify_response(&result);
        if !verification.verified {
            let reason = verification
                .reason
                .unwrap_or_else(|| "signature verification failed".to_string());
            warn!(
                "[{}] Rejecting result {} from {}: {}",
                tracking, result.request_id, responder, reason
            );
            self.correlation
                .resolve(&result.request_id, Err(SendError::SignatureRejected(reason.clone())));

            if self.codec.format() == WireFormat::Routed {
                self.reject_response(&responder, result.request_id, reason, tracking).await;
            }
            return ProcessingOutcome::Resolved;
        }

        if self.correlation.resolve(&result.request_id, Ok(result.payload)) {
            ProcessingOutcome::Resolved
        } else {
            ProcessingOutcome::Dropped
        }
    }

    fn accept_call_error(&self, error: CallError, tracking: EventTrackingId) -> ProcessingOutcome {
        debug!(
            "[{}] CallError for {}: {} {}",
            tracking, error.request_id, error.error_code, error.error_description
        );
        let outcome = Err(SendError::Remote {
            code: error.error_code,
            description: error.error_description,
            details: error.error_details,
        });
        if self.correlation.resolve(&error.request_id, outcome) {
            ProcessingOutcome::Resolved
        } else {
            ProcessingOutcome::Dropped
        }
    }

    async fn accept_request_error(&self, mut error: RoutedError, tracking: EventTrackingId) -> ProcessingOutcome {
        let mut routing = error.routing();
        match self.router.accept_reply(&mut routing) {
            Ok(ReplyStep::Deliver) => {
                let outcome = Err(SendError::Remote {
                    code: error.error_code,
                    description: error.error_description,
                    details: error.error_details,
                });
                if self.correlation.resolve(&error.request_id, outcome) {
                    ProcessingOutcome::Resolved
                } else {
                    ProcessingOutcome::Dropped
                }
            }
            Ok(ReplyStep::Forward(next)) => {
                error.set_routing(routing);
                self.relay_reply(Envelope::RequestError(error), next, tracking).await
            }
            Err(e) => {
                warn!("[{}] Dropping request error {}: {}", tracking, error.request_id, e);
                ProcessingOutcome::Dropped
            }
        }
    }

    async fn accept_response_error(
        &self,
        connection: &Connection,
        mut error: RoutedError,
        tracking: EventTrackingId,
    ) -> ProcessingOutcome {
        let mut routing = error.routing();
        match self.router.accept_request(connection.identity(), &mut routing) {
            Ok(RequestStep::Deliver) => {
                warn!(
                    "[{}] Response {} rejected by {}: {} {}",
                    tracking,
                    error.request_id,
                    routing.origin().unwrap_or(connection.identity()),
                    error.error_code,
                    error.error_description
                );
                ProcessingOutcome::Acknowledged
            }
            Ok(RequestStep::Forward(next)) => {
                self.router.stamp(&mut routing);
                error.set_routing(routing);
                match self.relay(Envelope::ResponseError(error), &next).await {
                    Ok(()) => ProcessingOutcome::Forwarded(next),
                    Err(e) => {
                        warn!("[{}] Could not forward response error to {}: {}", tracking, next, e);
                        ProcessingOutcome::Dropped
                    }
                }
            }
            Err(e) => {
                warn!("[{}] Dropping response error {}: {}", tracking, error.request_id, e);
                ProcessingOutcome::Dropped
            }
        }
    }

    /// Tell a responder that its CALLRESULT failed verification
    async fn reject_response(&self, responder: &Identity, request_id: RequestId, reason: String, tracking: EventTrackingId) {
        let (routing, next) = match self.router.originate(responder) {
            Ok(route) => route,
            Err(e) => {
                warn!("[{}] Cannot report rejected response to {}: {}", tracking, responder, e);
                return;
            }
        };

        let error = RoutedError {
            request_id,
            error_code: ErrorCode::SecurityError,
            error_description: "Response signature verification failed".to_string(),
            error_details: json!({ "signature": reason }),
            destination: routing.destination,
            network_path: routing.network_path,
        };
        if let Err(e) = self.relay(Envelope::ResponseError(error), &next).await {
            warn!("[{}] Could not send response error to {}: {}", tracking, responder, e);
        }
    }

    async fn relay_reply(&self, envelope: Envelope, next: Identity, tracking: EventTrackingId) -> ProcessingOutcome {
        match self.relay(envelope, &next).await {
            Ok(()) => ProcessingOutcome::Forwarded(next),
            Err(e) => {
                warn!("[{}] Could not relay reply to {}: {}", tracking, next, e);
                ProcessingOutcome::Dropped
            }
        }
    }

    /// Hand an envelope to a bound neighbour
    async fn relay(&self, envelope: Envelope, next: &Identity) -> Result<(), SendError> {
        let connection = self
            .registry
            .lookup(next)
            .ok_or_else(|| SendError::UnknownClient(next.clone()))?;
        connection.send_text(envelope.encode()).await?;
        Ok(())
    }

    async fn reply_on(&self, connection: &Connection, reply: Envelope, tracking: EventTrackingId) {
        if let Err(e) = connection.send_text(reply.encode()).await {
            warn!(
                "[{}] Could not send reply {} to {}: {}",
                tracking,
                reply.request_id(),
                connection.identity(),
                e
            );
        }
    }
}
