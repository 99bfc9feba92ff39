//! Property tests for the envelope codec
//!
//! Tests invariants for:
//! - Round-trip: decode(encode(e)) == e in both framings
//! - Arity strictness: a missing or extra element never decodes
//! - Type strictness: a wrongly typed element never decodes

use ocpp_rpc::envelope::{Call, CallError, CallResult, Codec, Envelope, RoutedError, Routing, WireFormat};
use ocpp_rpc::{ErrorCode, Identity, NetworkPath, RequestId};
use proptest::prelude::*;
use serde_json::{Map, Value};

// ============================================================================
// Strategies
// ============================================================================

fn identity() -> impl Strategy<Value = Identity> {
    "[A-Za-z0-9_-]{1,12}".prop_map(Identity::new)
}

fn request_id() -> impl Strategy<Value = RequestId> {
    "[a-z0-9-]{1,36}".prop_map(RequestId::new)
}

fn action() -> impl Strategy<Value = String> {
    "[A-Z][A-Za-z]{0,20}"
}

fn json_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[ -~]{0,16}".prop_map(Value::from),
    ]
}

fn flat_object() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-zA-Z]{1,8}", json_leaf(), 0..5)
        .prop_map(|m| Value::Object(m.into_iter().collect::<Map<_, _>>()))
}

/// JSON objects one level deep, optionally with a nested object
fn payload() -> impl Strategy<Value = Value> {
    (flat_object(), prop::option::of(flat_object())).prop_map(|(mut outer, inner)| {
        if let (Value::Object(map), Some(inner)) = (&mut outer, inner) {
            map.insert("nested".to_string(), inner);
        }
        outer
    })
}

fn error_code() -> impl Strategy<Value = ErrorCode> {
    prop::sample::select(ErrorCode::ALL.to_vec())
}

fn routing() -> impl Strategy<Value = Routing> {
    (identity(), prop::collection::vec(identity(), 0..5))
        .prop_map(|(destination, hops)| Routing::new(destination, NetworkPath::from_hops(hops)))
}

fn standard_envelope() -> impl Strategy<Value = Envelope> {
    prop_oneof![
        (request_id(), action(), payload()).prop_map(|(request_id, action, payload)| {
            Envelope::Call(Call {
                request_id,
                action,
                payload,
                routing: None,
            })
        }),
        (request_id(), payload()).prop_map(|(request_id, payload)| {
            Envelope::CallResult(CallResult {
                request_id,
                payload,
                routing: None,
            })
        }),
        (request_id(), error_code(), "[ -~]{0,32}", payload()).prop_map(|(request_id, code, description, details)| {
            Envelope::CallError(CallError {
                request_id,
                error_code: code,
                error_description: description,
                error_details: details,
            })
        }),
    ]
}

fn routed_error() -> impl Strategy<Value = RoutedError> {
    (request_id(), error_code(), "[ -~]{0,32}", payload(), routing()).prop_map(
        |(request_id, code, description, details, routing)| RoutedError {
            request_id,
            error_code: code,
            error_description: description,
            error_details: details,
            destination: routing.destination,
            network_path: routing.network_path,
        },
    )
}

fn routed_envelope() -> impl Strategy<Value = Envelope> {
    prop_oneof![
        (request_id(), action(), payload(), routing()).prop_map(|(request_id, action, payload, routing)| {
            Envelope::Call(Call {
                request_id,
                action,
                payload,
                routing: Some(routing),
            })
        }),
        (request_id(), payload(), routing()).prop_map(|(request_id, payload, routing)| {
            Envelope::CallResult(CallResult {
                request_id,
                payload,
                routing: Some(routing),
            })
        }),
        routed_error().prop_map(Envelope::RequestError),
        routed_error().prop_map(Envelope::ResponseError),
    ]
}

fn elements(envelope: &Envelope) -> Vec<Value> {
    match serde_json::from_str(&envelope.encode()) {
        Ok(Value::Array(elements)) => elements,
        other => panic!("encoder produced a non-array: {other:?}"),
    }
}

// ============================================================================
// Round-trip
// ============================================================================

proptest! {
    /// Standard framing is lossless
    #[test]
    fn standard_roundtrip(envelope in standard_envelope()) {
        let codec = Codec::new(WireFormat::Standard);
        let decoded = codec.decode(&envelope.encode());
        prop_assert_eq!(decoded, Ok(Some(envelope)));
    }

    /// Routed framing is lossless, including destination and path
    #[test]
    fn routed_roundtrip(envelope in routed_envelope()) {
        let codec = Codec::new(WireFormat::Routed);
        let decoded = codec.decode(&envelope.encode());
        prop_assert_eq!(decoded, Ok(Some(envelope)));
    }
}

// ============================================================================
// Strictness
// ============================================================================

proptest! {
    /// Dropping any element after the tag never yields an envelope
    #[test]
    fn missing_element_rejected(envelope in standard_envelope(), index in any::<prop::sample::Index>()) {
        let mut elements = elements(&envelope);
        let i = 1 + index.index(elements.len() - 1);
        elements.remove(i);

        let raw = Value::Array(elements).to_string();
        prop_assert!(Codec::new(WireFormat::Standard).decode(&raw).is_err(), "{} decoded", raw);
    }

    /// An extra trailing element never yields an envelope
    #[test]
    fn extra_element_rejected(envelope in routed_envelope(), extra in json_leaf()) {
        let mut elements = elements(&envelope);
        elements.push(extra);

        let raw = Value::Array(elements).to_string();
        prop_assert!(Codec::new(WireFormat::Routed).decode(&raw).is_err(), "{} decoded", raw);
    }

    /// A number where a string, object or path belongs never yields an envelope
    #[test]
    fn wrong_type_rejected(envelope in routed_envelope(), index in any::<prop::sample::Index>()) {
        let mut elements = elements(&envelope);
        let i = index.index(elements.len());
        elements[i] = Value::from(if i == 0 { 9 } else { 42 });

        let raw = Value::Array(elements).to_string();
        prop_assert!(Codec::new(WireFormat::Routed).decode(&raw).is_err(), "{} decoded", raw);
    }

    /// Routed frames are not valid standard frames and vice versa
    #[test]
    fn framings_do_not_mix(envelope in standard_envelope()) {
        let raw = envelope.encode();
        prop_assert!(Codec::new(WireFormat::Routed).decode(&raw).is_err());
    }
}
