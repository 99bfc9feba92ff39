//! Action dispatch
//!
//! Maps an inbound CALL to the handler registered for its action, fans the
//! parsed request out to every subscriber concurrently and reduces their
//! answers to exactly one reply envelope:
//!
//! 1. unknown action → NotImplemented
//! 2. payload does not parse → FormationViolation echoing the payload
//! 3. signature verification fails → SecurityError
//! 4. a subscriber fails or panics → FormationViolation with its message
//! 5. otherwise the first answer to complete wins; with no answer at all
//!    the action's standard "failed" response is sent
//!
//! Hooks observe requests and replies; a failing hook is logged and never
//! changes the reply.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::actions::{
    AuthorizeRequest, BootNotificationRequest, DataTransferRequest, FailedResponse,
    HeartbeatRequest, Request, ResetRequest, StatusNotificationRequest,
};
use crate::connection::ConnectionId;
use crate::endpoint::ProcessingOutcome;
use crate::envelope::{Call, CallResult, Envelope, Routing};
use crate::error::ErrorCode;
use crate::identity::{EventTrackingId, Identity, NetworkPath, RequestId};
use crate::signature::SignaturePolicy;

/// Failure raised by a subscriber or hook
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// What a subscriber sees about the request it handles
#[derive(Debug, Clone)]
pub struct CallContext {
    pub connection: ConnectionId,
    /// Immediate neighbour the CALL arrived from
    pub peer: Identity,
    /// Originator of the CALL (differs from `peer` when routed)
    pub origin: Identity,
    pub request_id: RequestId,
    pub action: String,
    pub event_tracking_id: EventTrackingId,
    pub network_path: Option<NetworkPath>,
}

impl CallContext {
    pub fn new(connection: ConnectionId, peer: Identity, call: &Call) -> Self {
        let origin = call
            .routing
            .as_ref()
            .and_then(Routing::origin)
            .cloned()
            .unwrap_or_else(|| peer.clone());

        Self {
            connection,
            peer,
            origin,
            request_id: call.request_id.clone(),
            action: call.action.clone(),
            event_tracking_id: EventTrackingId::generate(),
            network_path: call.routing.as_ref().map(|r| r.network_path.clone()),
        }
    }
}

/// Reduced result of handling one CALL
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Response(Value),
    NotImplemented,
    FormationViolation { description: String, payload: Value },
    SignatureRejected(String),
    ExceptionOccurred(String),
}

impl DispatchOutcome {
    /// Error reply for every outcome except `Response`
    fn error_reply(self, call: &Call) -> Option<Envelope> {
        let reply = match self {
            DispatchOutcome::Response(_) => return None,
            DispatchOutcome::NotImplemented => call.error_reply(
                ErrorCode::NotImplemented,
                format!("Unknown action {}", call.action),
                json!({}),
            ),
            DispatchOutcome::FormationViolation { description, payload } => call.error_reply(
                ErrorCode::FormationViolation,
                description,
                json!({ "request": payload.to_string() }),
            ),
            DispatchOutcome::SignatureRejected(reason) => call.error_reply(
                ErrorCode::SecurityError,
                "Signature verification failed",
                json!({ "signature": reason }),
            ),
            DispatchOutcome::ExceptionOccurred(message) => call.error_reply(
                ErrorCode::FormationViolation,
                message.clone(),
                json!({ "exception": message }),
            ),
        };
        Some(reply)
    }
}

type ParsedRequest = Arc<dyn Any + Send + Sync>;
type SubscriberResult = Result<Option<Value>, HandlerError>;
type Subscriber =
    Arc<dyn Fn(CallContext, ParsedRequest, Value) -> BoxFuture<'static, SubscriberResult> + Send + Sync>;
type FailedFn = Arc<dyn Fn() -> Result<Value, serde_json::Error> + Send + Sync>;

type RawRequestHook = Arc<dyn Fn(&CallContext, &Call) -> Result<(), HandlerError> + Send + Sync>;
type ParsedRequestHook = Arc<dyn Fn(&CallContext, &Value) -> Result<(), HandlerError> + Send + Sync>;
type ResponseHook = Arc<dyn Fn(&CallContext, &Envelope) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Clone)]
struct ActionEntry {
    /// Payload is checked against a request type, not just passed through
    typed: bool,
    parse: fn(Value) -> Result<ParsedRequest, serde_json::Error>,
    failed: FailedFn,
    subscribers: Vec<Subscriber>,
}

fn parse_typed<R: Request>(payload: Value) -> Result<ParsedRequest, serde_json::Error> {
    let request: R = serde_json::from_value(payload)?;
    let parsed: ParsedRequest = Arc::new(request);
    Ok(parsed)
}

fn parse_raw(payload: Value) -> Result<ParsedRequest, serde_json::Error> {
    let parsed: ParsedRequest = Arc::new(payload);
    Ok(parsed)
}

fn failed_typed<R>() -> Result<Value, serde_json::Error>
where
    R: Request,
    R::Response: FailedResponse,
{
    serde_json::to_value(R::Response::failed())
}

#[derive(Default)]
struct Hooks {
    raw_request: Vec<RawRequestHook>,
    parsed_request: Vec<ParsedRequestHook>,
    response: Vec<ResponseHook>,
}

/// Action → handler table
#[derive(Default)]
pub struct ActionDispatcher {
    table: RwLock<HashMap<String, ActionEntry>>,
    hooks: RwLock<Hooks>,
}

impl ActionDispatcher {
    /// Empty table: every action is NotImplemented until registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the core actions every endpoint answers
    pub fn with_core_actions() -> Self {
        let dispatcher = Self::new();
        dispatcher.register::<HeartbeatRequest>();
        dispatcher.register::<BootNotificationRequest>();
        dispatcher.register::<StatusNotificationRequest>();
        dispatcher.register::<AuthorizeRequest>();
        dispatcher.register::<DataTransferRequest>();
        dispatcher.register::<ResetRequest>();
        dispatcher
    }

    /// Make an action known (with no subscribers yet).
    ///
    /// An action previously registered untyped switches to `R`'s parser and
    /// failed response; its raw subscribers keep receiving the payload.
    pub fn register<R>(&self)
    where
        R: Request,
        R::Response: FailedResponse,
    {
        let mut table = self.table.write();
        let entry = table.entry(R::ACTION.to_string()).or_insert_with(|| ActionEntry {
            typed: true,
            parse: parse_typed::<R>,
            failed: Arc::new(failed_typed::<R>),
            subscribers: Vec::new(),
        });
        if !entry.typed {
            debug!("Action {} is now parsed as a typed request", R::ACTION);
            entry.typed = true;
            entry.parse = parse_typed::<R>;
            entry.failed = Arc::new(failed_typed::<R>);
        }
    }

    /// Make an untyped action known; `failed` is sent when nobody answers
    pub fn register_raw(&self, action: impl Into<String>, failed: Value) {
        self.table
            .write()
            .entry(action.into())
            .or_insert_with(|| ActionEntry {
                typed: false,
                parse: parse_raw,
                failed: Arc::new(move || Ok(failed.clone())),
                subscribers: Vec::new(),
            });
    }

    /// Add a typed subscriber; registers the action if needed.
    ///
    /// Returning `Ok(None)` means "no opinion" and lets another subscriber
    /// (or the failed response) answer.
    pub fn subscribe<R, F, Fut>(&self, handler: F)
    where
        R: Request,
        R::Response: FailedResponse,
        F: Fn(CallContext, R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<R::Response>, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let subscriber: Subscriber = Arc::new(move |ctx: CallContext, parsed: ParsedRequest, payload: Value| {
            let handler = handler.clone();
            async move {
                let request = match (*parsed).downcast_ref::<R>() {
                    Some(request) => request.clone(),
                    // Another request type owns the action: read the payload as R
                    None => serde_json::from_value::<R>(payload)?,
                };
                match handler(ctx, request).await? {
                    Some(response) => Ok(Some(serde_json::to_value(response)?)),
                    None => Ok(None),
                }
            }
            .boxed()
        });

        self.register::<R>();
        if let Some(entry) = self.table.write().get_mut(R::ACTION) {
            entry.subscribers.push(subscriber);
        }
    }

    /// Add an untyped subscriber receiving the raw payload, also on typed
    /// actions. Unregistered actions are registered with `{}` as failed
    /// response.
    pub fn subscribe_raw<F, Fut>(&self, action: &str, handler: F)
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SubscriberResult> + Send + 'static,
    {
        let subscriber: Subscriber = Arc::new(move |ctx: CallContext, _parsed: ParsedRequest, payload: Value| {
            handler(ctx, payload).boxed()
        });

        self.register_raw(action, json!({}));
        if let Some(entry) = self.table.write().get_mut(action) {
            entry.subscribers.push(subscriber);
        }
    }

    pub fn is_registered(&self, action: &str) -> bool {
        self.table.read().contains_key(action)
    }

    pub fn subscriber_count(&self, action: &str) -> usize {
        self.table
            .read()
            .get(action)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }

    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.table.read().keys().cloned().collect();
        actions.sort();
        actions
    }

    /// Observe every CALL before it is parsed
    pub fn on_raw_request<F>(&self, hook: F)
    where
        F: Fn(&CallContext, &Call) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.hooks.write().raw_request.push(Arc::new(hook));
    }

    /// Observe every request payload that parsed and verified
    pub fn on_parsed_request<F>(&self, hook: F)
    where
        F: Fn(&CallContext, &Value) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.hooks.write().parsed_request.push(Arc::new(hook));
    }

    /// Observe every reply before it is sent
    pub fn on_response<F>(&self, hook: F)
    where
        F: Fn(&CallContext, &Envelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.hooks.write().response.push(Arc::new(hook));
    }

    /// Handle one CALL and build the reply envelope for it
    pub async fn dispatch(
        &self,
        ctx: &CallContext,
        call: &Call,
        signatures: &dyn SignaturePolicy,
    ) -> (Envelope, ProcessingOutcome) {
        let raw_hooks = self.hooks.read().raw_request.clone();
        for hook in raw_hooks {
            run_hook(ctx, "raw request", || hook(ctx, call));
        }

        let outcome = self.outcome(ctx, call, signatures).await;
        let processed = match &outcome {
            DispatchOutcome::Response(_) => ProcessingOutcome::JsonResponse,
            DispatchOutcome::ExceptionOccurred(_) => ProcessingOutcome::ExceptionOccurred,
            DispatchOutcome::NotImplemented => ProcessingOutcome::ErrorResponse(ErrorCode::NotImplemented),
            DispatchOutcome::FormationViolation { .. } => {
                ProcessingOutcome::ErrorResponse(ErrorCode::FormationViolation)
            }
            DispatchOutcome::SignatureRejected(_) => ProcessingOutcome::ErrorResponse(ErrorCode::SecurityError),
        };

        let reply = match outcome {
            DispatchOutcome::Response(payload) => {
                let result = CallResult {
                    request_id: call.request_id.clone(),
                    payload,
                    routing: call.routing.as_ref().map(Routing::reply),
                };
                match signatures.sign_response(result.clone()) {
                    Ok(signed) => Envelope::CallResult(signed),
                    Err(e) => {
                        warn!(
                            "[{}] Signing {} response {} failed, sending unsigned: {}",
                            ctx.event_tracking_id, call.action, call.request_id, e
                        );
                        Envelope::CallResult(result)
                    }
                }
            }
            other => other
                .error_reply(call)
                .unwrap_or_else(|| call.error_reply(ErrorCode::InternalError, "no reply", json!({}))),
        };

        let response_hooks = self.hooks.read().response.clone();
        for hook in response_hooks {
            run_hook(ctx, "response", || hook(ctx, &reply));
        }

        (reply, processed)
    }

    /// Reduce one CALL to its outcome (no reply hooks, no signing)
    pub async fn outcome(&self, ctx: &CallContext, call: &Call, signatures: &dyn SignaturePolicy) -> DispatchOutcome {
        let entry = self.table.read().get(&call.action).cloned();
        let Some(entry) = entry else {
            debug!("[{}] No handler for action {}", ctx.event_tracking_id, call.action);
            return DispatchOutcome::NotImplemented;
        };

        let parsed = match (entry.parse)(call.payload.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    "[{}] Could not parse {} request {}: {}",
                    ctx.event_tracking_id, call.action, call.request_id, e
                );
                return DispatchOutcome::FormationViolation {
                    description: format!("Could not parse {} request: {}", call.action, e),
                    payload: call.payload.clone(),
                };
            }
        };

        let verification = signatures.verify_request(call);
        if !verification.verified {
            let reason = verification
                .reason
                .unwrap_or_else(|| "signature verification failed".to_string());
            warn!(
                "[{}] Rejecting {} {} from {}: {}",
                ctx.event_tracking_id, call.action, call.request_id, ctx.origin, reason
            );
            return DispatchOutcome::SignatureRejected(reason);
        }

        let parsed_hooks = self.hooks.read().parsed_request.clone();
        for hook in parsed_hooks {
            run_hook(ctx, "parsed request", || hook(ctx, &call.payload));
        }

        let mut running: FuturesUnordered<_> = entry
            .subscribers
            .iter()
            .map(|subscriber| {
                AssertUnwindSafe((**subscriber)(ctx.clone(), parsed.clone(), call.payload.clone())).catch_unwind()
            })
            .collect();

        // Await every subscriber; the first answer to complete is kept
        let mut response = None;
        let mut exception = None;
        while let Some(result) = running.next().await {
            match result {
                Ok(Ok(Some(value))) => {
                    if response.is_none() {
                        response = Some(value);
                    }
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    warn!(
                        "[{}] {} subscriber failed: {}",
                        ctx.event_tracking_id, call.action, e
                    );
                    exception.get_or_insert_with(|| e.message().to_string());
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(
                        "[{}] {} subscriber panicked: {}",
                        ctx.event_tracking_id, call.action, message
                    );
                    exception.get_or_insert(message);
                }
            }
        }

        if let Some(message) = exception {
            return DispatchOutcome::ExceptionOccurred(message);
        }

        match response {
            Some(value) => DispatchOutcome::Response(value),
            None => {
                debug!(
                    "[{}] No subscriber answered {} {}, sending failed response",
                    ctx.event_tracking_id, call.action, call.request_id
                );
                match (entry.failed)() {
                    Ok(value) => DispatchOutcome::Response(value),
                    Err(e) => DispatchOutcome::ExceptionOccurred(e.to_string()),
                }
            }
        }
    }
}

fn run_hook(ctx: &CallContext, kind: &str, hook: impl FnOnce() -> Result<(), HandlerError>) {
    match panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("[{}] {} hook failed: {}", ctx.event_tracking_id, kind, e),
        Err(payload) => warn!(
            "[{}] {} hook panicked: {}",
            ctx.event_tracking_id,
            kind,
            panic_message(payload.as_ref())
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
