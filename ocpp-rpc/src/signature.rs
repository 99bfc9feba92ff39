//! Message signature policies
//!
//! Verification runs before any business handler sees a request; signing
//! runs after the handler produced its response. Policies are pluggable so
//! deployments without the security extensions use `NoSignatures`.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

use crate::envelope::{Call, CallResult};

type HmacSha256 = Hmac<Sha256>;

/// Payload member holding the signatures of a message
pub const SIGNATURES_FIELD: &str = "signatures";

/// Algorithm name written into HMAC signature objects
pub const HMAC_SHA256: &str = "HMAC-SHA256";

/// Result of verifying one envelope. Transient, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureOutcome {
    pub verified: bool,
    pub reason: Option<String>,
}

impl SignatureOutcome {
    pub fn verified() -> Self {
        Self {
            verified: true,
            reason: None,
        }
    }

    pub fn verified_because(reason: impl Into<String>) -> Self {
        Self {
            verified: true,
            reason: Some(reason.into()),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            verified: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("invalid signing key: {0}")]
    InvalidKey(String),
}

/// Verify/sign strategy applied to envelopes
pub trait SignaturePolicy: Send + Sync {
    fn verify_request(&self, call: &Call) -> SignatureOutcome;

    fn verify_response(&self, result: &CallResult) -> SignatureOutcome;

    fn sign_request(&self, call: Call) -> Result<Call, SignatureError>;

    fn sign_response(&self, result: CallResult) -> Result<CallResult, SignatureError>;
}

/// Always verifies, never signs
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSignatures;

impl SignaturePolicy for NoSignatures {
    fn verify_request(&self, _call: &Call) -> SignatureOutcome {
        SignatureOutcome::verified()
    }

    fn verify_response(&self, _result: &CallResult) -> SignatureOutcome {
        SignatureOutcome::verified()
    }

    fn sign_request(&self, call: Call) -> Result<Call, SignatureError> {
        Ok(call)
    }

    fn sign_response(&self, result: CallResult) -> Result<CallResult, SignatureError> {
        Ok(result)
    }
}

/// One entry of a payload's `signatures` array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSignature {
    pub key_id: String,
    pub algorithm: String,
    /// Hex-encoded MAC
    pub value: String,
}

/// HMAC-SHA256 over the canonical JSON of the payload (without its
/// `signatures` member), keyed by a shared secret.
pub struct HmacSignatures {
    key_id: String,
    secret: Vec<u8>,
    require_signed: bool,
}

impl HmacSignatures {
    pub fn new(key_id: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            key_id: key_id.into(),
            secret: secret.into(),
            require_signed: false,
        }
    }

    /// Reject messages that carry no signature at all
    pub fn require_signed(mut self, required: bool) -> Self {
        self.require_signed = required;
        self
    }

    fn mac(&self, payload: &Value) -> Result<HmacSha256, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        mac.update(canonical_payload(payload).as_bytes());
        Ok(mac)
    }

    fn sign_payload(&self, payload: &mut Value) -> Result<(), SignatureError> {
        if !payload.is_object() {
            return Err(SignatureError::NotAnObject);
        }

        let value = hex::encode(self.mac(payload)?.finalize().into_bytes());
        let signature = MessageSignature {
            key_id: self.key_id.clone(),
            algorithm: HMAC_SHA256.to_string(),
            value,
        };

        let Some(object) = payload.as_object_mut() else {
            return Err(SignatureError::NotAnObject);
        };
        let mut signatures: Vec<MessageSignature> = object
            .get(SIGNATURES_FIELD)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        signatures.retain(|s| s.key_id != self.key_id);
        signatures.push(signature);

        let signatures = serde_json::to_value(signatures).map_err(|_| SignatureError::NotAnObject)?;
        object.insert(SIGNATURES_FIELD.to_string(), signatures);
        Ok(())
    }

    fn verify_payload(&self, payload: &Value) -> SignatureOutcome {
        let Some(raw) = payload.get(SIGNATURES_FIELD) else {
            return if self.require_signed {
                SignatureOutcome::rejected("message is not signed")
            } else {
                SignatureOutcome::verified_because("unsigned")
            };
        };

        let signatures: Vec<MessageSignature> = match serde_json::from_value(raw.clone()) {
            Ok(s) => s,
            Err(e) => return SignatureOutcome::rejected(format!("malformed signatures: {e}")),
        };

        let Some(signature) = signatures
            .iter()
            .find(|s| s.key_id == self.key_id && s.algorithm == HMAC_SHA256)
        else {
            return if self.require_signed {
                SignatureOutcome::rejected(format!("no {} signature for key {}", HMAC_SHA256, self.key_id))
            } else {
                SignatureOutcome::verified_because("no signature for this key")
            };
        };

        let Ok(expected) = hex::decode(&signature.value) else {
            return SignatureOutcome::rejected("signature is not hex encoded");
        };

        match self.mac(payload) {
            Ok(mac) => match mac.verify_slice(&expected) {
                Ok(()) => SignatureOutcome::verified(),
                Err(_) => SignatureOutcome::rejected("signature mismatch"),
            },
            Err(e) => SignatureOutcome::rejected(e.to_string()),
        }
    }
}

impl SignaturePolicy for HmacSignatures {
    fn verify_request(&self, call: &Call) -> SignatureOutcome {
        self.verify_payload(&call.payload)
    }

    fn verify_response(&self, result: &CallResult) -> SignatureOutcome {
        self.verify_payload(&result.payload)
    }

    fn sign_request(&self, mut call: Call) -> Result<Call, SignatureError> {
        self.sign_payload(&mut call.payload)?;
        Ok(call)
    }

    fn sign_response(&self, mut result: CallResult) -> Result<CallResult, SignatureError> {
        self.sign_payload(&mut result.payload)?;
        Ok(result)
    }
}

/// Payload text that is signed: the object without its signatures.
/// serde_json orders object keys, so the text is stable across peers.
fn canonical_payload(payload: &Value) -> String {
    match payload {
        Value::Object(map) => {
            let mut map = map.clone();
            map.remove(SIGNATURES_FIELD);
            Value::Object(map).to_string()
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> HmacSignatures {
        HmacSignatures::new("csms-key", b"shared-secret".to_vec())
    }

    #[test]
    fn test_sign_then_verify() {
        let call = Call::new("Reset", json!({"type": "Immediate"})).unwrap();
        let signed = policy().sign_request(call).unwrap();

        assert_eq!(signed.payload[SIGNATURES_FIELD][0]["keyId"], "csms-key");
        assert_eq!(policy().verify_request(&signed), SignatureOutcome::verified());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let call = Call::new("Reset", json!({"type": "Immediate"})).unwrap();
        let mut signed = policy().sign_request(call).unwrap();
        signed.payload["type"] = json!("OnIdle");

        let outcome = policy().verify_request(&signed);
        assert!(!outcome.verified);
        assert_eq!(outcome.reason.as_deref(), Some("signature mismatch"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let call = Call::new("Reset", json!({"type": "Immediate"})).unwrap();
        let signed = HmacSignatures::new("csms-key", b"other".to_vec())
            .sign_request(call)
            .unwrap();
        assert!(!policy().verify_request(&signed).verified);
    }

    #[test]
    fn test_unsigned_depends_on_requirement() {
        let call = Call::new("Heartbeat", json!({})).unwrap();
        assert!(policy().verify_request(&call).verified);
        assert!(!policy().require_signed(true).verify_request(&call).verified);
    }

    #[test]
    fn test_resigning_replaces_own_signature() {
        let result = CallResult::new("1".into(), json!({"status": "Accepted"})).unwrap();
        let once = policy().sign_response(result).unwrap();
        let twice = policy().sign_response(once).unwrap();
        assert_eq!(twice.payload[SIGNATURES_FIELD].as_array().unwrap().len(), 1);
        assert!(policy().verify_response(&twice).verified);
    }

    #[test]
    fn test_non_object_payload_cannot_be_signed() {
        let result = CallResult {
            request_id: "1".into(),
            payload: json!([1, 2]),
            routing: None,
        };
        assert_eq!(policy().sign_response(result).unwrap_err(), SignatureError::NotAnObject);
    }

    #[test]
    fn test_no_signatures_policy() {
        let call = Call::new("Heartbeat", json!({})).unwrap();
        assert!(NoSignatures.verify_request(&call).verified);
        let signed = NoSignatures.sign_request(call.clone()).unwrap();
        assert_eq!(signed, call);
    }
}
