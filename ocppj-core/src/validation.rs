//! Payload shape validation
//!
//! The engine never looks inside payloads. It asks a `PayloadValidator`
//! whether a payload fits the shape declared for an action and turns the
//! answer into the matching error code.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::error::ErrorCode;

/// Kind of payload constraint that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// Payload is not well formed for the action (wrong JSON structure)
    Formation,
    /// A value is outside its allowed range, length or set
    PropertyConstraint,
    /// A required field is missing or a field occurs too often
    OccurrenceConstraint,
    /// A field has the wrong JSON type
    TypeConstraint,
}

impl ViolationKind {
    pub fn code(&self) -> ErrorCode {
        match self {
            ViolationKind::Formation => ErrorCode::FormationViolation,
            ViolationKind::PropertyConstraint => ErrorCode::PropertyConstraintViolation,
            ViolationKind::OccurrenceConstraint => ErrorCode::OccurrenceConstraintViolation,
            ViolationKind::TypeConstraint => ErrorCode::TypeConstraintViolation,
        }
    }
}

/// A failed payload constraint
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct Violation {
    pub kind: ViolationKind,
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(kind: ViolationKind, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn property(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ViolationKind::PropertyConstraint, field, message)
    }

    pub fn occurrence(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ViolationKind::OccurrenceConstraint, field, message)
    }

    /// Classify a deserialization failure
    ///
    /// serde_json only exposes a coarse category, so data errors are told
    /// apart by the message prefixes serde itself emits.
    pub fn from_serde(err: &serde_json::Error) -> Self {
        let message = err.to_string();
        let kind = if !err.is_data() {
            ViolationKind::Formation
        } else if message.starts_with("missing field") || message.starts_with("duplicate field") {
            ViolationKind::OccurrenceConstraint
        } else if message.starts_with("invalid type") {
            ViolationKind::TypeConstraint
        } else if message.starts_with("unknown variant") || message.starts_with("invalid value") {
            ViolationKind::PropertyConstraint
        } else {
            ViolationKind::Formation
        };
        Self::new(kind, "payload", message)
    }

    /// Prefix the field path with its parent
    pub fn within(mut self, parent: &str) -> Self {
        self.field = format!("{}.{}", parent, self.field);
        self
    }
}

/// Declarative constraints of a payload shape
pub trait Validate {
    fn validate(&self) -> Result<(), Violation>;
}

impl<T: Validate> Validate for Option<T> {
    fn validate(&self) -> Result<(), Violation> {
        match self {
            Some(inner) => inner.validate(),
            None => Ok(()),
        }
    }
}

/// Pluggable schema check consulted for every inbound and outbound payload
pub trait PayloadValidator: Send + Sync {
    /// Check a request payload for `action`
    fn validate_request(&self, action: &str, payload: &Value) -> Result<(), Violation>;

    /// Check a response payload for `action`
    fn validate_response(&self, action: &str, payload: &Value) -> Result<(), Violation>;
}

/// Validator that accepts everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl PayloadValidator for AcceptAll {
    fn validate_request(&self, _action: &str, _payload: &Value) -> Result<(), Violation> {
        Ok(())
    }

    fn validate_response(&self, _action: &str, _payload: &Value) -> Result<(), Violation> {
        Ok(())
    }
}

/// Deserialize `payload` as `T` and check its constraints
pub fn validate_as<T: DeserializeOwned + Validate>(payload: &Value) -> Result<(), Violation> {
    let typed = T::deserialize(payload).map_err(|e| Violation::from_serde(&e))?;
    typed.validate()
}

// ============================================================================
// Constraint helpers
// ============================================================================

pub fn check_gte(field: &str, value: i64, min: i64) -> Result<(), Violation> {
    if value < min {
        return Err(Violation::property(field, format!("must be >= {}, got {}", min, value)));
    }
    Ok(())
}

pub fn check_gt(field: &str, value: i64, min: i64) -> Result<(), Violation> {
    if value <= min {
        return Err(Violation::property(field, format!("must be > {}, got {}", min, value)));
    }
    Ok(())
}

pub fn check_range(field: &str, value: i64, min: i64, max: i64) -> Result<(), Violation> {
    if value < min || value > max {
        return Err(Violation::property(
            field,
            format!("must be within {}..={}, got {}", min, max, value),
        ));
    }
    Ok(())
}

pub fn check_max_len(field: &str, value: &str, max: usize) -> Result<(), Violation> {
    if value.chars().count() > max {
        return Err(Violation::property(field, format!("must be at most {} characters", max)));
    }
    Ok(())
}

/// Required string: present and non-empty
pub fn check_required(field: &str, value: &str) -> Result<(), Violation> {
    if value.is_empty() {
        return Err(Violation::occurrence(field, "required"));
    }
    Ok(())
}
