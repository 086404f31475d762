//! OCPP-J message framing
//!
//! OCPP-J carries three message shapes as JSON arrays:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! The codec only enforces the envelope. Payloads are passed through as
//! `serde_json::Value` and checked elsewhere.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ErrorCode, OcppError};

/// OCPP-J message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// How correlation ids are generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdStrategy {
    /// "1", "2", "3", ... per connection
    #[default]
    Sequential,
    /// Random UUID v4 strings
    Random,
}

/// Source of correlation ids for outbound calls on one connection
#[derive(Debug)]
pub struct MessageIdGenerator {
    strategy: IdStrategy,
    counter: AtomicU64,
}

impl MessageIdGenerator {
    pub fn new(strategy: IdStrategy) -> Self {
        Self {
            strategy,
            counter: AtomicU64::new(0),
        }
    }

    /// Next id; `is_live` rejects ids still awaited on this connection
    pub fn next_id(&self, is_live: impl Fn(&str) -> bool) -> String {
        loop {
            let id = match self.strategy {
                IdStrategy::Sequential => (self.counter.fetch_add(1, Ordering::Relaxed) + 1).to_string(),
                IdStrategy::Random => Uuid::new_v4().to_string(),
            };
            if !is_live(&id) {
                return id;
            }
        }
    }

    /// Generate a fresh id and serialize the CALL carrying it
    pub fn encode_call(
        &self,
        action: &str,
        payload: Value,
        is_live: impl Fn(&str) -> bool,
    ) -> Result<(String, String), OcppError> {
        let call = Call::new(self.next_id(is_live), action, payload);
        let text = call.to_text()?;
        Ok((call.message_id, text))
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new(IdStrategy::default())
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    pub fn new(message_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            action: action.into(),
            payload,
        }
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload]
    pub fn to_text(&self) -> Result<String, OcppError> {
        let array = serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            &self.action,
            &self.payload
        ]);
        Ok(serde_json::to_string(&array)?)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: message_id.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Serialize to OCPP wire format: [3, messageId, payload]
    pub fn to_text(&self) -> Result<String, OcppError> {
        let array = serde_json::json!([
            MessageType::CallResult as i32,
            &self.message_id,
            &self.payload
        ]);
        Ok(serde_json::to_string(&array)?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }

    /// Serialize to OCPP wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_text(&self) -> Result<String, OcppError> {
        let array = serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            self.error_code.as_str(),
            &self.error_description,
            &self.error_details
        ]);
        Ok(serde_json::to_string(&array)?)
    }

    /// The failure a caller awaiting this reply receives
    pub fn into_error(self) -> OcppError {
        OcppError::Fault {
            code: self.error_code,
            description: self.error_description,
            details: self.error_details,
        }
    }
}

/// Parsed OCPP-J message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

fn malformed(message_id: Option<&str>, reason: impl Into<String>) -> OcppError {
    OcppError::MalformedEnvelope {
        message_id: message_id.map(str::to_string),
        reason: reason.into(),
    }
}

fn expect_arity(array: &[Value], arity: usize, message_id: &str, kind: &str) -> Result<(), OcppError> {
    if array.len() != arity {
        return Err(malformed(
            Some(message_id),
            format!("{} must have {} elements, got {}", kind, arity, array.len()),
        ));
    }
    Ok(())
}

/// Id of a frame that looks like a CALL but failed envelope decoding
///
/// Such a frame is still owed a reply; anything else is left unanswered.
pub fn salvage_call_id(bytes: &[u8]) -> Option<String> {
    let array: Vec<Value> = serde_json::from_slice(bytes).ok()?;
    match (array.first().and_then(Value::as_i64), array.get(1).and_then(Value::as_str)) {
        (Some(2), Some(id)) => Some(id.to_string()),
        _ => None,
    }
}

impl OcppMessage {
    /// Parse an OCPP-J message from a JSON frame
    ///
    /// Structural failures yield `MalformedEnvelope`, carrying the message id
    /// whenever position 1 held a string so that the caller can still answer.
    pub fn parse(bytes: &[u8]) -> Result<Self, OcppError> {
        let array: Vec<Value> = serde_json::from_slice(bytes)
            .map_err(|e| malformed(None, format!("not a JSON array: {}", e)))?;

        let (msg_type, id) = match (array.first(), array.get(1)) {
            (Some(msg_type), Some(id)) => (msg_type, id),
            _ => return Err(malformed(None, "missing message type or id")),
        };

        let message_id = id
            .as_str()
            .ok_or_else(|| malformed(None, "message id must be a string"))?;

        let msg_type = msg_type
            .as_i64()
            .ok_or_else(|| malformed(Some(message_id), "message type must be an integer"))?;

        match msg_type {
            2 => {
                expect_arity(&array, 4, message_id, "CALL")?;
                let action = array[2]
                    .as_str()
                    .ok_or_else(|| malformed(Some(message_id), "action must be a string"))?;

                Ok(OcppMessage::Call(Call::new(message_id, action, array[3].clone())))
            }
            3 => {
                expect_arity(&array, 3, message_id, "CALLRESULT")?;
                Ok(OcppMessage::CallResult(CallResult {
                    message_id: message_id.to_string(),
                    payload: array[2].clone(),
                }))
            }
            4 => {
                expect_arity(&array, 5, message_id, "CALLERROR")?;
                let error_code = array[2]
                    .as_str()
                    .map(ErrorCode::from_wire)
                    .ok_or_else(|| malformed(Some(message_id), "error code must be a string"))?;

                let error_description = array[3]
                    .as_str()
                    .ok_or_else(|| malformed(Some(message_id), "error description must be a string"))?
                    .to_string();

                Ok(OcppMessage::CallError(CallError {
                    message_id: message_id.to_string(),
                    error_code,
                    error_description,
                    error_details: array[4].clone(),
                }))
            }
            other => Err(malformed(
                Some(message_id),
                format!("unknown message type {}", other),
            )),
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            OcppMessage::Call(_) => MessageType::Call,
            OcppMessage::CallResult(_) => MessageType::CallResult,
            OcppMessage::CallError(_) => MessageType::CallError,
        }
    }

    /// Serialize to a text frame
    pub fn to_text(&self) -> Result<String, OcppError> {
        match self {
            OcppMessage::Call(c) => c.to_text(),
            OcppMessage::CallResult(r) => r.to_text(),
            OcppMessage::CallError(e) => e.to_text(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn malformed_id(json: &str) -> Option<String> {
        match OcppMessage::parse(json.as_bytes()) {
            Err(OcppError::MalformedEnvelope { message_id, .. }) => message_id,
            other => panic!("Expected MalformedEnvelope, got {:?}", other),
        }
    }

    #[test]
    fn test_call_serialization() {
        let call = Call::new("19223201", "Heartbeat", serde_json::json!({}));
        let text = call.to_text().unwrap();
        assert_eq!(text, r#"[2,"19223201","Heartbeat",{}]"#);
    }

    #[test]
    fn test_call_parsing() {
        let json = r#"[2, "msg-123", "Heartbeat", {}]"#;
        match OcppMessage::parse(json.as_bytes()).unwrap() {
            OcppMessage::Call(call) => {
                assert_eq!(call.message_id, "msg-123");
                assert_eq!(call.action, "Heartbeat");
            }
            other => panic!("Expected Call, got {:?}", other),
        }
    }

    #[test]
    fn test_call_result_parsing() {
        let json = r#"[3, "msg-123", {"currentTime": "2026-01-20T12:00:00Z"}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();
        assert_eq!(msg.message_type(), MessageType::CallResult);
        assert_eq!(msg.message_id(), "msg-123");
    }

    #[test]
    fn test_call_error_parsing() {
        let json = r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#;
        match OcppMessage::parse(json.as_bytes()).unwrap() {
            OcppMessage::CallError(error) => {
                assert_eq!(error.message_id, "msg-123");
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
                assert_eq!(error.error_description, "Action not supported");
            }
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_error_code_falls_back() {
        let json = r#"[4, "7", "WeirdCode", "", null]"#;
        match OcppMessage::parse(json.as_bytes()).unwrap() {
            OcppMessage::CallError(error) => assert_eq!(error.error_code, ErrorCode::GenericError),
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_envelopes() {
        assert_eq!(malformed_id(r#"{"not": "an array"}"#), None);
        assert_eq!(malformed_id(r#"[2]"#), None);
        assert_eq!(malformed_id(r#"[2, 42, "Heartbeat", {}]"#), None);
        assert_eq!(malformed_id(r#"[2, "a", "Heartbeat"]"#), Some("a".to_string()));
        assert_eq!(malformed_id(r#"[3, "b", {}, {}]"#), Some("b".to_string()));
        assert_eq!(malformed_id(r#"[9, "c", {}]"#), Some("c".to_string()));
        assert_eq!(malformed_id(r#"[2, "d", 5, {}]"#), Some("d".to_string()));
        assert_eq!(malformed_id(r#"["2", "e", "Heartbeat", {}]"#), Some("e".to_string()));
    }

    #[test]
    fn test_salvage_call_id() {
        assert_eq!(salvage_call_id(br#"[2, "a", "Heartbeat"]"#).as_deref(), Some("a"));
        assert_eq!(salvage_call_id(br#"[2, "b", 7, {}]"#).as_deref(), Some("b"));
        assert_eq!(salvage_call_id(br#"[3, "c", {}, {}]"#), None);
        assert_eq!(salvage_call_id(br#"[2, 42]"#), None);
        assert_eq!(salvage_call_id(b"not json"), None);
    }

    #[test]
    fn test_sequential_ids_skip_live_ones() {
        let ids = MessageIdGenerator::new(IdStrategy::Sequential);
        assert_eq!(ids.next_id(|_| false), "1");
        assert_eq!(ids.next_id(|id| id == "2"), "3");

        let (id, text) = ids.encode_call("Ping", serde_json::json!({}), |_| false).unwrap();
        assert_eq!(id, "4");
        assert_eq!(text, r#"[2,"4","Ping",{}]"#);
    }

    #[test]
    fn test_random_ids_are_uuids() {
        let ids = MessageIdGenerator::new(IdStrategy::Random);
        let a = ids.next_id(|_| false);
        let b = ids.next_id(|_| false);
        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_call_error_into_error() {
        let err = CallError::new("1", ErrorCode::SecurityError, "denied").into_error();
        assert_eq!(err.code(), ErrorCode::SecurityError);
    }
}
