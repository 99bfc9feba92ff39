//! OCPP-J envelope framing
//!
//! OCPP carries every message as a positional JSON array whose first element
//! is the message type:
//! - CALL: [2, requestId, action, payload]
//! - CALLRESULT: [3, requestId, payload]
//! - CALLERROR: [4, requestId, errorCode, errorDescription, errorDetails]
//!
//! Between networking nodes the routed framing inserts the destination and
//! the network path right after the type tag, and adds the response-side
//! error (type 5):
//! - CALL: [2, destination, [path], requestId, action, payload]
//! - CALLRESULT: [3, destination, [path], requestId, payload]
//! - REQUESTERROR: [4, destination, [path], requestId, errorCode, errorDescription, errorDetails]
//! - RESPONSEERROR: [5, destination, [path], requestId, errorCode, errorDescription, errorDetails]

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::error::ErrorCode;
use crate::identity::{Identity, NetworkPath, RequestId};

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
    ResponseError = 5,
}

impl MessageType {
    fn from_tag(tag: u64, format: WireFormat) -> Option<Self> {
        match (tag, format) {
            (2, _) => Some(MessageType::Call),
            (3, _) => Some(MessageType::CallResult),
            (4, _) => Some(MessageType::CallError),
            (5, WireFormat::Routed) => Some(MessageType::ResponseError),
            _ => None,
        }
    }
}

/// Framing spoken on a connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Plain OCPP-J, tags 2/3/4
    #[default]
    Standard,
    /// Networking-node overlay with destination and network path
    Routed,
}

/// Destination and hop path carried by routed envelopes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    pub destination: Identity,
    pub network_path: NetworkPath,
}

impl Routing {
    pub fn new(destination: Identity, network_path: NetworkPath) -> Self {
        Self {
            destination,
            network_path,
        }
    }

    /// The node that originated a request: the oldest hop on its path
    pub fn origin(&self) -> Option<&Identity> {
        self.network_path.last()
    }

    /// Routing for the reply to a request: back to its origin along the
    /// exact reverse of the recorded path.
    pub fn reply(&self) -> Routing {
        Routing {
            destination: self
                .origin()
                .cloned()
                .unwrap_or_else(|| self.destination.clone()),
            network_path: self.network_path.reversed(),
        }
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub request_id: RequestId,
    pub action: String,
    pub payload: Value,
    pub routing: Option<Routing>,
}

impl Call {
    /// Create a new CALL message with a generated request id
    pub fn new(action: impl Into<String>, payload: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            request_id: RequestId::generate(),
            action: action.into(),
            payload: serde_json::to_value(payload)?,
            routing: None,
        })
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = Some(routing);
        self
    }

    /// Success reply to this request, routed back along the reversed path
    pub fn reply(&self, payload: Value) -> Envelope {
        Envelope::CallResult(CallResult {
            request_id: self.request_id.clone(),
            payload,
            routing: self.routing.as_ref().map(Routing::reply),
        })
    }

    /// Error reply: a CALLERROR in the standard framing, a REQUESTERROR when routed
    pub fn error_reply(&self, code: ErrorCode, description: impl Into<String>, details: Value) -> Envelope {
        error_reply(
            self.request_id.clone(),
            self.routing.as_ref(),
            code,
            description.into(),
            details,
        )
    }
}

fn error_reply(
    request_id: RequestId,
    routing: Option<&Routing>,
    code: ErrorCode,
    description: String,
    details: Value,
) -> Envelope {
    match routing {
        Some(routing) => {
            let reply = routing.reply();
            Envelope::RequestError(RoutedError {
                request_id,
                error_code: code,
                error_description: description,
                error_details: details,
                destination: reply.destination,
                network_path: reply.network_path,
            })
        }
        None => Envelope::CallError(CallError {
            request_id,
            error_code: code,
            error_description: description,
            error_details: details,
        }),
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub request_id: RequestId,
    pub payload: Value,
    pub routing: Option<Routing>,
}

impl CallResult {
    pub fn new(request_id: RequestId, payload: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            request_id,
            payload: serde_json::to_value(payload)?,
            routing: None,
        })
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// OCPP CALLERROR message (error response, standard framing)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub request_id: RequestId,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(request_id: RequestId, error_code: ErrorCode, error_description: impl Into<String>) -> Self {
        Self {
            request_id,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(Map::new()),
        }
    }
}

/// Error envelope of the routed framing. Used for both REQUESTERROR (the
/// negative answer to a CALL) and RESPONSEERROR (a rejected CALLRESULT).
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedError {
    pub request_id: RequestId,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
    pub destination: Identity,
    pub network_path: NetworkPath,
}

impl RoutedError {
    pub fn routing(&self) -> Routing {
        Routing::new(self.destination.clone(), self.network_path.clone())
    }

    pub fn set_routing(&mut self, routing: Routing) {
        self.destination = routing.destination;
        self.network_path = routing.network_path;
    }
}

/// Parsed OCPP envelope (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
    RequestError(RoutedError),
    ResponseError(RoutedError),
}

impl Envelope {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Envelope::Call(c) => &c.request_id,
            Envelope::CallResult(r) => &r.request_id,
            Envelope::CallError(e) => &e.request_id,
            Envelope::RequestError(e) | Envelope::ResponseError(e) => &e.request_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Envelope::Call(_) => MessageType::Call,
            Envelope::CallResult(_) => MessageType::CallResult,
            Envelope::CallError(_) | Envelope::RequestError(_) => MessageType::CallError,
            Envelope::ResponseError(_) => MessageType::ResponseError,
        }
    }

    /// Routing header, if this envelope uses the routed framing
    pub fn routing(&self) -> Option<Routing> {
        match self {
            Envelope::Call(c) => c.routing.clone(),
            Envelope::CallResult(r) => r.routing.clone(),
            Envelope::CallError(_) => None,
            Envelope::RequestError(e) | Envelope::ResponseError(e) => Some(e.routing()),
        }
    }

    /// Replace the routing header of a routed envelope. No-op for CALLERROR.
    pub fn set_routing(&mut self, routing: Routing) {
        match self {
            Envelope::Call(c) => c.routing = Some(routing),
            Envelope::CallResult(r) => r.routing = Some(routing),
            Envelope::CallError(_) => {}
            Envelope::RequestError(e) | Envelope::ResponseError(e) => e.set_routing(routing),
        }
    }

    /// Error code carried by an error envelope
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Envelope::CallError(e) => Some(e.error_code),
            Envelope::RequestError(e) | Envelope::ResponseError(e) => Some(e.error_code),
            _ => None,
        }
    }

    /// Serialize to the OCPP wire format
    pub fn encode(&self) -> String {
        let tag = self.message_type() as u8;
        let mut array = vec![json!(tag)];

        if let Some(routing) = self.routing() {
            array.push(json!(routing.destination));
            array.push(json!(routing.network_path));
        }

        match self {
            Envelope::Call(c) => {
                array.push(json!(c.request_id));
                array.push(json!(c.action));
                array.push(c.payload.clone());
            }
            Envelope::CallResult(r) => {
                array.push(json!(r.request_id));
                array.push(r.payload.clone());
            }
            Envelope::CallError(e) => {
                array.push(json!(e.request_id));
                array.push(json!(e.error_code));
                array.push(json!(e.error_description));
                array.push(e.error_details.clone());
            }
            Envelope::RequestError(e) | Envelope::ResponseError(e) => {
                array.push(json!(e.request_id));
                array.push(json!(e.error_code));
                array.push(json!(e.error_description));
                array.push(e.error_details.clone());
            }
        }

        Value::Array(array).to_string()
    }
}

/// Errors decoding a raw frame
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    /// Not an OCPP message at all; no response is possible
    #[error("protocol error: {reason}")]
    Protocol { reason: String, raw: String },

    /// Recognized message type but wrong arity or element types
    #[error("formation violation in {message_type:?}: {reason}")]
    Formation {
        message_type: MessageType,
        request_id: Option<RequestId>,
        routing: Option<Routing>,
        reason: String,
        raw: String,
    },
}

impl DecodeError {
    pub fn raw(&self) -> &str {
        match self {
            DecodeError::Protocol { raw, .. } | DecodeError::Formation { raw, .. } => raw,
        }
    }

    /// The FormationViolation reply owed to the sender, if any.
    ///
    /// Only a malformed CALL with a readable request id gets an answer; a
    /// malformed reply has nobody to be answered.
    pub fn error_reply(&self) -> Option<Envelope> {
        match self {
            DecodeError::Formation {
                message_type: MessageType::Call,
                request_id: Some(request_id),
                routing,
                reason,
                raw,
            } => Some(error_reply(
                request_id.clone(),
                routing.as_ref(),
                ErrorCode::FormationViolation,
                reason.clone(),
                json!({ "request": raw }),
            )),
            _ => None,
        }
    }
}

/// Envelope decoder for one wire format
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    format: WireFormat,
}

impl Codec {
    pub fn new(format: WireFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Decode one text frame.
    ///
    /// Blank frames decode to `Ok(None)`: some stations send them as a
    /// keep-alive and expect an empty frame back.
    pub fn decode(&self, raw: &str) -> Result<Option<Envelope>, DecodeError> {
        if raw.trim().is_empty() {
            return Ok(None);
        }

        let protocol = |reason: &str| DecodeError::Protocol {
            reason: reason.to_string(),
            raw: raw.to_string(),
        };

        let value: Value = serde_json::from_str(raw).map_err(|e| protocol(&format!("invalid JSON: {e}")))?;
        let Value::Array(array) = value else {
            return Err(protocol("message is not a JSON array"));
        };

        let tag = array
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| protocol("missing message type"))?;
        let message_type = MessageType::from_tag(tag, self.format)
            .ok_or_else(|| protocol(&format!("unknown message type {tag}")))?;

        let mut reader = ArrayReader {
            array: &array,
            message_type,
            raw,
            request_id: None,
            routing: None,
        };

        let offset = match self.format {
            WireFormat::Standard => 1,
            WireFormat::Routed => {
                let destination = Identity::new(reader.string(1, "destination")?);
                let network_path = reader.path(2)?;
                reader.routing = Some(Routing::new(destination, network_path));
                3
            }
        };

        // Capture the id before the arity check so a short CALL can still be answered
        if let Some(Value::String(id)) = array.get(offset) {
            if !id.is_empty() {
                reader.request_id = Some(RequestId::new(id.clone()));
            }
        }

        let envelope = match message_type {
            MessageType::Call => {
                reader.arity(offset + 3)?;
                let request_id = reader.request_id(offset)?;
                let action = reader.string(offset + 1, "action")?;
                if action.is_empty() {
                    return Err(reader.formation("action is empty"));
                }
                let payload = reader.object(offset + 2, "payload")?;
                Envelope::Call(Call {
                    request_id,
                    action,
                    payload,
                    routing: reader.routing.clone(),
                })
            }
            MessageType::CallResult => {
                reader.arity(offset + 2)?;
                let request_id = reader.request_id(offset)?;
                let payload = reader.object(offset + 1, "payload")?;
                Envelope::CallResult(CallResult {
                    request_id,
                    payload,
                    routing: reader.routing.clone(),
                })
            }
            MessageType::CallError | MessageType::ResponseError => {
                reader.arity(offset + 4)?;
                let request_id = reader.request_id(offset)?;
                let error_code = ErrorCode::from_wire(&reader.string(offset + 1, "error code")?);
                let error_description = reader.string(offset + 2, "error description")?;
                let error_details = reader.object(offset + 3, "error details")?;

                match reader.routing.clone() {
                    None => Envelope::CallError(CallError {
                        request_id,
                        error_code,
                        error_description,
                        error_details,
                    }),
                    Some(routing) => {
                        let error = RoutedError {
                            request_id,
                            error_code,
                            error_description,
                            error_details,
                            destination: routing.destination,
                            network_path: routing.network_path,
                        };
                        if message_type == MessageType::ResponseError {
                            Envelope::ResponseError(error)
                        } else {
                            Envelope::RequestError(error)
                        }
                    }
                }
            }
        };

        Ok(Some(envelope))
    }
}

/// Positional accessors producing FormationViolation errors
struct ArrayReader<'a> {
    array: &'a [Value],
    message_type: MessageType,
    raw: &'a str,
    request_id: Option<RequestId>,
    routing: Option<Routing>,
}

impl ArrayReader<'_> {
    fn formation(&self, reason: impl Into<String>) -> DecodeError {
        DecodeError::Formation {
            message_type: self.message_type,
            request_id: self.request_id.clone(),
            routing: self.routing.clone(),
            reason: reason.into(),
            raw: self.raw.to_string(),
        }
    }

    fn arity(&self, expected: usize) -> Result<(), DecodeError> {
        if self.array.len() != expected {
            return Err(self.formation(format!(
                "expected {} elements, got {}",
                expected,
                self.array.len()
            )));
        }
        Ok(())
    }

    fn string(&self, index: usize, what: &str) -> Result<String, DecodeError> {
        match self.array.get(index) {
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Err(self.formation(format!("{what} must be a string"))),
        }
    }

    fn object(&self, index: usize, what: &str) -> Result<Value, DecodeError> {
        match self.array.get(index) {
            Some(value @ Value::Object(_)) => Ok(value.clone()),
            _ => Err(self.formation(format!("{what} must be a JSON object"))),
        }
    }

    fn request_id(&self, index: usize) -> Result<RequestId, DecodeError> {
        let id = self.string(index, "request id")?;
        if id.is_empty() {
            return Err(self.formation("request id is empty"));
        }
        Ok(RequestId::new(id))
    }

    fn path(&self, index: usize) -> Result<NetworkPath, DecodeError> {
        let Some(Value::Array(hops)) = self.array.get(index) else {
            return Err(self.formation("network path must be an array"));
        };
        hops.iter()
            .map(|hop| match hop {
                Value::String(s) if !s.is_empty() => Ok(Identity::new(s.clone())),
                _ => Err(self.formation("network path hops must be non-empty strings")),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(NetworkPath::from_hops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard() -> Codec {
        Codec::new(WireFormat::Standard)
    }

    fn routed() -> Codec {
        Codec::new(WireFormat::Routed)
    }

    #[test]
    fn test_call_parsing() {
        let json = r#"[2, "msg-123", "Heartbeat", {}]"#;
        let msg = standard().decode(json).unwrap().unwrap();

        match msg {
            Envelope::Call(call) => {
                assert_eq!(call.request_id, RequestId::new("msg-123"));
                assert_eq!(call.action, "Heartbeat");
                assert!(call.routing.is_none());
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_call_result_parsing() {
        let json = r#"[3, "msg-123", {"currentTime": "2026-01-20T12:00:00Z"}]"#;
        let msg = standard().decode(json).unwrap().unwrap();

        match msg {
            Envelope::CallResult(result) => {
                assert_eq!(result.request_id, RequestId::new("msg-123"));
                assert_eq!(result.payload["currentTime"], "2026-01-20T12:00:00Z");
            }
            _ => panic!("Expected CallResult"),
        }
    }

    #[test]
    fn test_call_error_parsing() {
        let json = r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#;
        let msg = standard().decode(json).unwrap().unwrap();

        match msg {
            Envelope::CallError(error) => {
                assert_eq!(error.request_id, RequestId::new("msg-123"));
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_blank_frame_is_noop() {
        assert_eq!(standard().decode("").unwrap(), None);
        assert_eq!(standard().decode("  \n").unwrap(), None);
    }

    #[test]
    fn test_not_an_array_is_protocol_error() {
        for raw in [r#"{"a":1}"#, "not json", "[]", r#"["2","1","Heartbeat",{}]"#, "[7,\"1\",{}]"] {
            let err = standard().decode(raw).unwrap_err();
            assert!(matches!(err, DecodeError::Protocol { .. }), "{raw} -> {err:?}");
            assert!(err.error_reply().is_none());
        }
    }

    #[test]
    fn test_response_error_tag_only_when_routed() {
        let raw = r#"[5, "msg-1", "GenericError", "", {}]"#;
        assert!(matches!(standard().decode(raw), Err(DecodeError::Protocol { .. })));
    }

    #[test]
    fn test_call_missing_payload_gets_formation_reply() {
        let raw = r#"[2,"1","Reset"]"#;
        let err = standard().decode(raw).unwrap_err();
        assert!(matches!(err, DecodeError::Formation { .. }));

        let reply = err.error_reply().expect("malformed CALL is answered");
        let text = reply.encode();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value[0], 4);
        assert_eq!(value[1], "1");
        assert_eq!(value[2], "FormationViolation");
        assert_eq!(value[4]["request"], raw);
    }

    #[test]
    fn test_malformed_result_is_not_answered() {
        let err = standard().decode(r#"[3,"1","not an object"]"#).unwrap_err();
        assert!(matches!(err, DecodeError::Formation { .. }));
        assert!(err.error_reply().is_none());
    }

    #[test]
    fn test_wrong_element_types() {
        for raw in [
            r#"[2, 1, "Heartbeat", {}]"#,
            r#"[2, "1", 5, {}]"#,
            r#"[2, "1", "Heartbeat", []]"#,
            r#"[2, "", "Heartbeat", {}]"#,
            r#"[3, "1", {}, {}]"#,
            r#"[4, "1", 7, "desc", {}]"#,
            r#"[4, "1", "GenericError", "desc"]"#,
        ] {
            assert!(
                matches!(standard().decode(raw), Err(DecodeError::Formation { .. })),
                "{raw}"
            );
        }
    }

    #[test]
    fn test_routed_call_roundtrip() {
        let call = Call::new("Reset", json!({"type": "Immediate"}))
            .unwrap()
            .with_routing(Routing::new(
                Identity::new("CS1"),
                NetworkPath::from_hops(vec!["NN1".into(), "CSMS".into()]),
            ));
        let envelope = Envelope::Call(call);
        let text = envelope.encode();
        assert!(text.starts_with(r#"[2,"CS1",["NN1","CSMS"],"#));

        let decoded = routed().decode(&text).unwrap().unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_routed_error_reply_reverses_path() {
        let call = Call::new("Reset", json!({}))
            .unwrap()
            .with_routing(Routing::new(
                Identity::new("CS1"),
                NetworkPath::from_hops(vec!["B".into(), "A".into()]),
            ));

        match call.error_reply(ErrorCode::NotSupported, "nope", json!({})) {
            Envelope::RequestError(e) => {
                assert_eq!(e.destination, Identity::new("A"));
                assert_eq!(e.network_path.hops(), &[Identity::new("A"), Identity::new("B")]);
            }
            other => panic!("Expected RequestError, got {other:?}"),
        }
    }

    #[test]
    fn test_routed_response_error_parsing() {
        let raw = r#"[5, "CS1", ["CSMS"], "msg-9", "SecurityError", "bad signature", {}]"#;
        match routed().decode(raw).unwrap().unwrap() {
            Envelope::ResponseError(e) => {
                assert_eq!(e.destination, Identity::new("CS1"));
                assert_eq!(e.error_code, ErrorCode::SecurityError);
            }
            other => panic!("Expected ResponseError, got {other:?}"),
        }
    }

    #[test]
    fn test_routed_bad_path_is_formation() {
        let raw = r#"[2, "CS1", "CSMS", "1", "Heartbeat", {}]"#;
        assert!(matches!(routed().decode(raw), Err(DecodeError::Formation { .. })));
    }
}
