//! Error taxonomy and the error-observation channel
//!
//! `ErrorCode` is the vocabulary carried in CALLERROR frames. `OcppError` is
//! the single error type returned by the engine; every variant maps onto an
//! `ErrorCode` so that local failures and peer failures look alike to callers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::validation::Violation;

/// Description used when a request deadline passes without a reply
pub const TIMEOUT_DESCRIPTION: &str = "request timed out, no response received from peer";

/// OCPP-J error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Action is unknown to the receiver
    NotImplemented,
    /// Action is known but not serviced by the receiver
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    #[serde(alias = "FormatViolation")]
    FormationViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
    MessageTypeNotSupported,
    RpcFrameworkError,
}

impl ErrorCode {
    /// Wire name of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
        }
    }

    /// Parse a wire name, falling back to `GenericError` for unknown codes
    pub fn from_wire(name: &str) -> Self {
        serde_json::from_value(Value::String(name.to_string())).unwrap_or(ErrorCode::GenericError)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors in OCPP-J message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed envelope: {reason}")]
    MalformedEnvelope {
        /// Id recovered from the frame, when one could be read
        message_id: Option<String>,
        reason: String,
    },

    #[error("Action {action} already registered by profile {existing}, cannot add it to {profile}")]
    DuplicateAction {
        action: String,
        existing: String,
        profile: String,
    },

    #[error("Action {action} is unsupported: {reason}")]
    UnsupportedAction { action: String, reason: String },

    #[error("Payload violation: {0}")]
    Violation(#[from] Violation),

    #[error("{code} - {description}")]
    Fault {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("Reply {message_id} does not match the call in flight ({expected:?})")]
    UnmatchedReply {
        message_id: String,
        expected: Option<String>,
    },

    #[error("Handler for {action} failed on call {message_id}: {reason}")]
    HandlerFault {
        action: String,
        message_id: String,
        reason: String,
    },

    #[error("Request cancelled, connection shut down")]
    Cancelled,

    #[error("Queue closed")]
    QueueClosed,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection not started")]
    NotStarted,

    #[error("Connection already started")]
    AlreadyStarted,
}

impl OcppError {
    /// Build the outcome a caller sees when its deadline expires
    pub fn timeout() -> Self {
        OcppError::Fault {
            code: ErrorCode::GenericError,
            description: TIMEOUT_DESCRIPTION.to_string(),
            details: Value::Object(serde_json::Map::new()),
        }
    }

    /// True for the locally synthesized timeout outcome
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            OcppError::Fault { code: ErrorCode::GenericError, description, .. }
                if description == TIMEOUT_DESCRIPTION
        )
    }

    /// Closest taxonomy code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            OcppError::Json(_) => ErrorCode::FormationViolation,
            OcppError::MalformedEnvelope { .. } => ErrorCode::ProtocolError,
            OcppError::DuplicateAction { .. } => ErrorCode::InternalError,
            OcppError::UnsupportedAction { .. } => ErrorCode::NotSupported,
            OcppError::Violation(v) => v.kind.code(),
            OcppError::Fault { code, .. } => *code,
            OcppError::UnmatchedReply { .. } => ErrorCode::ProtocolError,
            OcppError::HandlerFault { .. } | OcppError::Config(_) => ErrorCode::InternalError,
            OcppError::Cancelled
            | OcppError::QueueClosed
            | OcppError::ConnectionClosed
            | OcppError::Transport(_)
            | OcppError::NotStarted
            | OcppError::AlreadyStarted => ErrorCode::GenericError,
        }
    }
}

/// Outward sink for anomalies no caller is waiting on
///
/// Cloned into every component of a connection. Reporting never blocks: a
/// full channel, or one nobody subscribed to, drops the anomaly after it has
/// been logged.
#[derive(Debug, Clone, Default)]
pub struct ErrorReporter {
    tx: Option<mpsc::Sender<OcppError>>,
}

impl ErrorReporter {
    /// Create a reporter and the receiving end of its channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OcppError>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A reporter that only logs
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn report(&self, err: OcppError) {
        warn!("{}", err);
        if let Some(ref tx) = self.tx {
            if let Err(e) = tx.try_send(err) {
                debug!("Error channel unavailable, dropping anomaly: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_names() {
        assert_eq!(ErrorCode::from_wire("NotSupported"), ErrorCode::NotSupported);
        assert_eq!(ErrorCode::from_wire("FormatViolation"), ErrorCode::FormationViolation);
        assert_eq!(ErrorCode::from_wire("SomethingElse"), ErrorCode::GenericError);
        assert_eq!(ErrorCode::PropertyConstraintViolation.to_string(), "PropertyConstraintViolation");
    }

    #[test]
    fn test_timeout_has_generic_error_shape() {
        let err = OcppError::timeout();
        assert!(err.is_timeout());
        assert_eq!(err.code(), ErrorCode::GenericError);

        let remote = OcppError::Fault {
            code: ErrorCode::GenericError,
            description: "busy".into(),
            details: Value::Null,
        };
        assert!(!remote.is_timeout());
        assert_eq!(remote.code(), err.code());
    }

    #[tokio::test]
    async fn test_reporter_delivers_and_drops_when_full() {
        let (reporter, mut rx) = ErrorReporter::channel(1);
        reporter.report(OcppError::QueueClosed);
        reporter.report(OcppError::Cancelled);

        assert!(matches!(rx.recv().await, Some(OcppError::QueueClosed)));
        assert!(rx.try_recv().is_err());

        ErrorReporter::disabled().report(OcppError::ConnectionClosed);
    }
}
