//! Typed actions
//!
//! A `Request` names its OCPP action and response type; the dispatcher and
//! `Endpoint::send_request` use it to (de)serialize payloads. Only the core
//! actions every endpoint answers live here; business modules define their
//! own request types the same way.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request payload of one OCPP action
pub trait Request: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const ACTION: &'static str;

    type Response: Serialize + DeserializeOwned + Send + Sync + 'static;
}

/// Response synthesized when no subscriber answered a request
pub trait FailedResponse {
    fn failed() -> Self;
}

// ============================================================================
// Enumerations
// ============================================================================

/// Generic OCPP status for responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenericStatus {
    Accepted,
    Rejected,
}

/// Registration status for BootNotification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

/// Authorization status of an id token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationStatus {
    Accepted,
    Blocked,
    Expired,
    Invalid,
    Unknown,
}

/// Charging station status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorStatus {
    Available,
    Occupied,
    Reserved,
    Unavailable,
    Faulted,
}

/// Boot reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootReason {
    ApplicationReset,
    FirmwareUpdate,
    LocalReset,
    PowerUp,
    RemoteReset,
    ScheduledReset,
    Triggered,
    Unknown,
    Watchdog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetType {
    Immediate,
    OnIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetStatus {
    Accepted,
    Rejected,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataTransferStatus {
    Accepted,
    Rejected,
    UnknownMessageId,
    UnknownVendorId,
}

// ============================================================================
// Complex Types
// ============================================================================

/// Charging station information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingStationInfo {
    pub model: String,
    pub vendor_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

/// Token for identification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdToken {
    pub id_token: String,
    #[serde(rename = "type")]
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdTokenInfo {
    pub status: AuthorizationStatus,
}

/// Status info for responses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    pub reason_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<String>,
}

impl StatusInfo {
    fn no_handler() -> Self {
        Self {
            reason_code: "NoHandler".to_string(),
            additional_info: Some("no subscriber answered this request".to_string()),
        }
    }
}

// ============================================================================
// Heartbeat
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

impl Request for HeartbeatRequest {
    const ACTION: &'static str = "Heartbeat";
    type Response = HeartbeatResponse;
}

impl FailedResponse for HeartbeatResponse {
    fn failed() -> Self {
        Self {
            current_time: Utc::now(),
        }
    }
}

// ============================================================================
// BootNotification
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charging_station: ChargingStationInfo,
    pub reason: BootReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub current_time: DateTime<Utc>,
    pub interval: i32,
    pub status: RegistrationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

impl Request for BootNotificationRequest {
    const ACTION: &'static str = "BootNotification";
    type Response = BootNotificationResponse;
}

impl FailedResponse for BootNotificationResponse {
    fn failed() -> Self {
        Self {
            current_time: Utc::now(),
            interval: 0,
            status: RegistrationStatus::Rejected,
            status_info: Some(StatusInfo::no_handler()),
        }
    }
}

// ============================================================================
// StatusNotification
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub timestamp: DateTime<Utc>,
    pub connector_status: ConnectorStatus,
    pub evse_id: i32,
    pub connector_id: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusNotificationResponse {}

impl Request for StatusNotificationRequest {
    const ACTION: &'static str = "StatusNotification";
    type Response = StatusNotificationResponse;
}

impl FailedResponse for StatusNotificationResponse {
    fn failed() -> Self {
        Self {}
    }
}

// ============================================================================
// Authorize
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    pub id_token: IdToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResponse {
    pub id_token_info: IdTokenInfo,
}

impl Request for AuthorizeRequest {
    const ACTION: &'static str = "Authorize";
    type Response = AuthorizeResponse;
}

impl FailedResponse for AuthorizeResponse {
    fn failed() -> Self {
        Self {
            id_token_info: IdTokenInfo {
                status: AuthorizationStatus::Invalid,
            },
        }
    }
}

// ============================================================================
// DataTransfer
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    pub vendor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferResponse {
    pub status: DataTransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

impl Request for DataTransferRequest {
    const ACTION: &'static str = "DataTransfer";
    type Response = DataTransferResponse;
}

impl FailedResponse for DataTransferResponse {
    fn failed() -> Self {
        Self {
            status: DataTransferStatus::Rejected,
            data: None,
            status_info: Some(StatusInfo::no_handler()),
        }
    }
}

// ============================================================================
// Reset
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    #[serde(rename = "type")]
    pub reset_type: ResetType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evse_id: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    pub status: ResetStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

impl Request for ResetRequest {
    const ACTION: &'static str = "Reset";
    type Response = ResetResponse;
}

impl FailedResponse for ResetResponse {
    fn failed() -> Self {
        Self {
            status: ResetStatus::Rejected,
            status_info: Some(StatusInfo::no_handler()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_notification_request() {
        let req = BootNotificationRequest {
            charging_station: ChargingStationInfo {
                model: "EK3".to_string(),
                vendor_name: "Elektrokombinacija".to_string(),
                serial_number: Some("EK3-001".to_string()),
                firmware_version: Some("0.1.0".to_string()),
            },
            reason: BootReason::PowerUp,
        };

        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["chargingStation"]["vendorName"], "Elektrokombinacija");
        let parsed: BootNotificationRequest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.charging_station.model, "EK3");
    }

    #[test]
    fn test_failed_responses_are_negative() {
        let boot = serde_json::to_value(BootNotificationResponse::failed()).unwrap();
        assert_eq!(boot["status"], "Rejected");
        assert_eq!(boot["statusInfo"]["reasonCode"], "NoHandler");

        let reset = serde_json::to_value(ResetResponse::failed()).unwrap();
        assert_eq!(reset["status"], "Rejected");

        let heartbeat = serde_json::to_value(HeartbeatResponse::failed()).unwrap();
        assert!(heartbeat["currentTime"].is_string());
    }

    #[test]
    fn test_reset_type_field_name() {
        let req: ResetRequest = serde_json::from_str(r#"{"type": "OnIdle"}"#).unwrap();
        assert_eq!(req.reset_type, ResetType::OnIdle);
        assert_eq!(ResetRequest::ACTION, "Reset");
    }
}
