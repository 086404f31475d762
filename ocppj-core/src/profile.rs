//! Profiles and the profile registry
//!
//! A profile is a named, fixed set of actions a peer declares support for.
//! The registry is filled once while a connection is configured and is read
//! only afterwards: it is moved behind an `Arc` when the connection is built,
//! so lookups need no locking.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::OcppError;
use crate::validation::{validate_as, PayloadValidator, Validate, Violation};

/// Side of the connection a peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    ChargingStation,
    Csms,
}

impl Role {
    /// Role of the other end of a connection
    pub fn peer(&self) -> Role {
        match self {
            Role::ChargingStation => Role::Csms,
            Role::Csms => Role::ChargingStation,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::ChargingStation => write!(f, "charging station"),
            Role::Csms => write!(f, "CSMS"),
        }
    }
}

/// Which side may initiate an action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    StationToCsms,
    CsmsToStation,
    Both,
}

impl Direction {
    /// Whether a peer playing `role` may send a Call for this action
    pub fn may_initiate(&self, role: Role) -> bool {
        match self {
            Direction::Both => true,
            Direction::StationToCsms => role == Role::ChargingStation,
            Direction::CsmsToStation => role == Role::Csms,
        }
    }
}

/// A typed action: name, direction and payload shapes
pub trait Feature: Send + Sync + 'static {
    const ACTION: &'static str;
    const DIRECTION: Direction;

    type Request: Serialize + DeserializeOwned + Validate + Send + 'static;
    type Response: Serialize + DeserializeOwned + Validate + Send + 'static;
}

type ShapeCheck = fn(&Value) -> Result<(), Violation>;

fn accept_any(_payload: &Value) -> Result<(), Violation> {
    Ok(())
}

/// Registry entry for one action
#[derive(Clone)]
pub struct ActionDescriptor {
    name: String,
    profile: String,
    direction: Direction,
    request_shape: ShapeCheck,
    response_shape: ShapeCheck,
}

impl std::fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("name", &self.name)
            .field("profile", &self.profile)
            .field("direction", &self.direction)
            .finish()
    }
}

impl ActionDescriptor {
    /// Descriptor whose shapes are checked through a `Feature`'s payload types
    pub fn of<F: Feature>() -> Self {
        Self {
            name: F::ACTION.to_string(),
            profile: String::new(),
            direction: F::DIRECTION,
            request_shape: validate_as::<F::Request>,
            response_shape: validate_as::<F::Response>,
        }
    }

    /// Descriptor that accepts any payload
    pub fn untyped(name: impl Into<String>, direction: Direction) -> Self {
        Self {
            name: name.into(),
            profile: String::new(),
            direction,
            request_shape: accept_any,
            response_shape: accept_any,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the profile owning this action
    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn validate_request(&self, payload: &Value) -> Result<(), Violation> {
        (self.request_shape)(payload)
    }

    pub fn validate_response(&self, payload: &Value) -> Result<(), Violation> {
        (self.response_shape)(payload)
    }
}

/// A named, immutable set of actions
#[derive(Debug, Clone)]
pub struct Profile {
    name: String,
    actions: Vec<ActionDescriptor>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
        }
    }

    /// Add a typed action
    pub fn with_feature<F: Feature>(self) -> Self {
        self.with_action(ActionDescriptor::of::<F>())
    }

    /// Add an action descriptor
    pub fn with_action(mut self, mut action: ActionDescriptor) -> Self {
        action.profile = self.name.clone();
        self.actions.retain(|a| a.name != action.name);
        self.actions.push(action);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actions(&self) -> impl Iterator<Item = &ActionDescriptor> {
        self.actions.iter()
    }

    pub fn supports(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a.name == action)
    }
}

/// Catalog of supported actions, grouped by profile
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, Profile>,
    actions: HashMap<String, ActionDescriptor>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a profile's actions
    ///
    /// Registering the same profile again is a no-op. Fails with
    /// `DuplicateAction` when another profile already claims one of the
    /// actions; the registry is left unchanged in that case.
    pub fn register(&mut self, profile: Profile) -> Result<(), OcppError> {
        for action in profile.actions() {
            if let Some(existing) = self.actions.get(action.name()) {
                if existing.profile() != profile.name() {
                    return Err(OcppError::DuplicateAction {
                        action: action.name().to_string(),
                        existing: existing.profile().to_string(),
                        profile: profile.name().to_string(),
                    });
                }
            }
        }

        if let Some(previous) = self.profiles.remove(profile.name()) {
            for action in previous.actions() {
                self.actions.remove(action.name());
            }
        }

        for action in profile.actions() {
            self.actions.insert(action.name().to_string(), action.clone());
        }
        debug!("Registered profile {} ({} actions)", profile.name(), profile.actions.len());
        self.profiles.insert(profile.name().to_string(), profile);
        Ok(())
    }

    /// Builder-style `register`
    pub fn with_profile(mut self, profile: Profile) -> Result<Self, OcppError> {
        self.register(profile)?;
        Ok(self)
    }

    /// Look up the descriptor (and so the owning profile) of an action
    pub fn resolve(&self, action: &str) -> Option<&ActionDescriptor> {
        self.actions.get(action)
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    pub fn profile_names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Shape checks through registered descriptors; unknown actions pass,
/// since they are rejected earlier as unsupported
impl PayloadValidator for ProfileRegistry {
    fn validate_request(&self, action: &str, payload: &Value) -> Result<(), Violation> {
        match self.resolve(action) {
            Some(descriptor) => descriptor.validate_request(payload),
            None => Ok(()),
        }
    }

    fn validate_response(&self, action: &str, payload: &Value) -> Result<(), Violation> {
        match self.resolve(action) {
            Some(descriptor) => descriptor.validate_response(payload),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping_profile(name: &str) -> Profile {
        Profile::new(name).with_action(ActionDescriptor::untyped("Ping", Direction::Both))
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = ProfileRegistry::new();
        registry.register(ping_profile("P")).unwrap();

        let descriptor = registry.resolve("Ping").unwrap();
        assert_eq!(descriptor.profile(), "P");
        assert!(registry.resolve("Pong").is_none());
        assert!(registry.profile("P").unwrap().supports("Ping"));
    }

    #[test]
    fn test_duplicate_action_rejected() {
        let mut registry = ProfileRegistry::new();
        registry.register(ping_profile("P")).unwrap();

        let err = registry.register(ping_profile("Q")).unwrap_err();
        match err {
            OcppError::DuplicateAction { action, existing, profile } => {
                assert_eq!(action, "Ping");
                assert_eq!(existing, "P");
                assert_eq!(profile, "Q");
            }
            other => panic!("Expected DuplicateAction, got {:?}", other),
        }
        assert!(registry.profile("Q").is_none());
        assert_eq!(registry.resolve("Ping").unwrap().profile(), "P");
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = ProfileRegistry::new();
        registry.register(ping_profile("P")).unwrap();
        registry.register(ping_profile("P")).unwrap();
        assert_eq!(registry.profile_names().count(), 1);
    }

    #[test]
    fn test_direction_gating() {
        assert!(Direction::StationToCsms.may_initiate(Role::ChargingStation));
        assert!(!Direction::StationToCsms.may_initiate(Role::Csms));
        assert!(Direction::CsmsToStation.may_initiate(Role::Csms));
        assert!(Direction::Both.may_initiate(Role::Csms));
    }
}
