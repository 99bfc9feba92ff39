//! Multi-hop routing over in-memory links
//!
//! Topology used throughout:
//!
//! ```text
//! CSMS ── NN1 ── NN2 ── CS1
//! ```
//!
//! The central system reaches CS1 through static routes; the station
//! reaches the central system through default uplinks.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{attach, link};
use ocpp_rpc::actions::{HeartbeatRequest, ResetRequest, ResetResponse, ResetStatus, ResetType};
use ocpp_rpc::{
    CallContext, Endpoint, EndpointConfig, ErrorCode, HmacSignatures, Identity, NetworkPath, SendError,
};
use serde_json::json;
use tokio_test::assert_ok;

struct Chain {
    csms: Arc<Endpoint>,
    nn1: Arc<Endpoint>,
    nn2: Arc<Endpoint>,
    cs1: Arc<Endpoint>,
}

async fn chain() -> Chain {
    let csms = Endpoint::new(EndpointConfig::new("CSMS").routed().with_route("CS1", "NN1"));
    let nn1 = Endpoint::new(
        EndpointConfig::new("NN1")
            .routed()
            .with_route("CS1", "NN2")
            .with_default_uplink("CSMS"),
    );
    let nn2 = Endpoint::new(EndpointConfig::new("NN2").routed().with_default_uplink("NN1"));
    let cs1 = Endpoint::new(EndpointConfig::new("CS1").routed().with_default_uplink("NN2"));

    link(&csms, "CSMS", &nn1, "NN1").await;
    link(&nn1, "NN1", &nn2, "NN2").await;
    link(&nn2, "NN2", &cs1, "CS1").await;

    Chain { csms, nn1, nn2, cs1 }
}

fn path(hops: &[&str]) -> NetworkPath {
    NetworkPath::from_hops(hops.iter().map(|h| Identity::new(*h)))
}

#[tokio::test]
async fn test_request_crosses_three_hops_and_reply_returns() {
    let chain = chain().await;

    let seen: Arc<Mutex<Option<CallContext>>> = Arc::new(Mutex::new(None));
    let record = seen.clone();
    chain
        .cs1
        .dispatcher()
        .subscribe::<ResetRequest, _, _>(move |ctx, request| {
            let record = record.clone();
            async move {
                assert_eq!(request.reset_type, ResetType::Immediate);
                *record.lock().unwrap() = Some(ctx);
                Ok(Some(ResetResponse {
                    status: ResetStatus::Accepted,
                    status_info: None,
                }))
            }
        });

    let response = assert_ok!(
        chain
            .csms
            .send_request(
                &Identity::new("CS1"),
                &ResetRequest {
                    reset_type: ResetType::Immediate,
                    evse_id: None,
                },
            )
            .await
    );
    assert_eq!(response.status, ResetStatus::Accepted);

    let ctx = seen.lock().unwrap().take().expect("CS1 handled the request");
    assert_eq!(ctx.peer, Identity::new("NN2"));
    assert_eq!(ctx.origin, Identity::new("CSMS"));
    assert_eq!(ctx.network_path, Some(path(&["NN2", "NN1", "CSMS"])));

    for endpoint in [&chain.csms, &chain.nn1, &chain.nn2, &chain.cs1] {
        assert!(endpoint.correlation().is_empty());
    }
}

#[tokio::test]
async fn test_station_reaches_csms_through_default_uplinks() {
    let chain = chain().await;

    let response = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        chain.cs1.send_request(&Identity::new("CSMS"), &HeartbeatRequest {}),
    )
    .await
    .expect("reply routed back to the station");

    assert_ok!(response);
}

#[tokio::test]
async fn test_unknown_destination_answered_by_stuck_hop() {
    let csms = Endpoint::new(EndpointConfig::new("CSMS").routed().with_route("CS9", "NN1"));
    let nn1 = Endpoint::new(EndpointConfig::new("NN1").routed());
    link(&csms, "CSMS", &nn1, "NN1").await;

    let result = csms.call(&Identity::new("CS9"), "Heartbeat", json!({})).await;

    match result {
        Err(SendError::Remote { code, .. }) => assert_eq!(code, ErrorCode::ProtocolError),
        other => panic!("expected ProtocolError from NN1, got {other:?}"),
    }
    assert!(csms.correlation().is_empty());
}

#[tokio::test]
async fn test_request_fails_where_routes_end() {
    let chain = chain().await;

    let result = chain.nn2.call(&Identity::new("CS9"), "Heartbeat", json!({})).await;

    // NN2 has a default uplink, so the request leaves; NN1 cannot place CS9
    // and NN1's own default uplink is the CSMS, which has no route either.
    match result {
        Err(SendError::Remote { code, .. }) => assert_eq!(code, ErrorCode::ProtocolError),
        other => panic!("expected ProtocolError, got {other:?}"),
    }

    let isolated = Endpoint::new(EndpointConfig::new("NN3").routed());
    let result = isolated.call(&Identity::new("CS1"), "Heartbeat", json!({})).await;
    assert_eq!(result, Err(SendError::UnknownClient(Identity::new("CS1"))));
}

#[tokio::test]
async fn test_handler_error_travels_back_along_path() {
    let chain = chain().await;

    let response = chain
        .csms
        .call(&Identity::new("CS1"), "Reset", json!({"type": "Sideways"}))
        .await;

    match response {
        Err(SendError::Remote { code, details, .. }) => {
            assert_eq!(code, ErrorCode::FormationViolation);
            assert_eq!(details["request"], r#"{"type":"Sideways"}"#);
        }
        other => panic!("expected FormationViolation from CS1, got {other:?}"),
    }
}

// ============================================================================
// Routed error paths
// ============================================================================

#[tokio::test]
async fn test_forged_response_reported_back_to_responder() {
    let csms = Endpoint::builder(EndpointConfig::new("CSMS").routed().with_route("CS1", "NN1"))
        .with_signatures(HmacSignatures::new("k1", b"shared".to_vec()))
        .build();
    let nn1 = Endpoint::new(EndpointConfig::new("NN1").routed());
    link(&csms, "CSMS", &nn1, "NN1").await;
    let mut cs1 = attach(&nn1, "CS1").await;

    let pending = assert_ok!(csms.send(&Identity::new("CS1"), "Heartbeat", json!({}), None).await);
    let call = cs1.recv_json().await;
    assert_eq!(call[0], 2);
    assert_eq!(call[1], "CS1");
    assert_eq!(call[2], json!(["NN1", "CSMS"]));
    let request_id = call[3].clone();

    let forged = json!({
        "currentTime": "2024-01-01T00:00:00Z",
        "signatures": [{"keyId": "k1", "algorithm": "HMAC-SHA256", "value": "00ff"}]
    });
    cs1.send(&json!([3, "CSMS", ["CSMS", "NN1"], request_id, forged]).to_string())
        .await;

    assert!(matches!(
        pending.resolution().await,
        Err(SendError::SignatureRejected(_))
    ));

    // RESPONSEERROR from the CSMS, relayed and stamped by NN1
    let rejection = cs1.recv_json().await;
    assert_eq!(rejection[0], 5);
    assert_eq!(rejection[1], "CS1");
    assert_eq!(rejection[2], json!(["NN1", "CSMS"]));
    assert_eq!(rejection[3], request_id);
    assert_eq!(rejection[4], "SecurityError");
    assert_eq!(rejection[6]["signature"], "signature mismatch");
}

#[tokio::test]
async fn test_malformed_routed_call_answered_along_recorded_path() {
    let cs1 = Endpoint::new(EndpointConfig::new("CS1").routed());
    let mut nn2 = attach(&cs1, "NN2").await;

    // NN2 relayed without stamping itself; the payload is missing
    let raw = r#"[2,"CS1",["CSMS"],"m-1","Reset"]"#;
    nn2.send(raw).await;
    let reply = nn2.recv_json().await;

    assert_eq!(reply[0], 4);
    assert_eq!(reply[1], "CSMS");
    assert_eq!(reply[2], json!(["CSMS", "NN2"]));
    assert_eq!(reply[3], "m-1");
    assert_eq!(reply[4], "FormationViolation");
    assert_eq!(reply[6]["request"], raw);
}

#[tokio::test]
async fn test_misrouted_reply_is_dropped() {
    let csms = Endpoint::new(EndpointConfig::new("CSMS").routed().with_route("CS1", "NN1"));
    let mut nn1 = attach(&csms, "NN1").await;

    let pending = assert_ok!(csms.send(&Identity::new("CS1"), "Heartbeat", json!({}), None).await);
    let call = nn1.recv_json().await;
    assert_eq!(call[2], json!(["CSMS"]));
    let request_id = call[3].clone();

    // Path still ends at NN1, so the CSMS is not the hop to consume it
    nn1.send(&json!([3, "CSMS", ["CSMS", "NN1"], request_id, {"currentTime": "misrouted"}]).to_string())
        .await;
    nn1.assert_silent(Duration::from_millis(50)).await;

    nn1.send(&json!([3, "CSMS", ["CSMS"], request_id, {"currentTime": "2024-01-01T00:00:00Z"}]).to_string())
        .await;
    let response = assert_ok!(pending.resolution().await);
    assert_eq!(response["currentTime"], "2024-01-01T00:00:00Z");
    assert!(csms.correlation().is_empty());
}
