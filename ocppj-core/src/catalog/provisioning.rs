//! Provisioning profile: registration and liveness

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StatusInfo;
use crate::profile::{Direction, Feature, Profile};
use crate::validation::{check_gte, check_max_len, check_required, Validate, Violation};

pub const PROFILE: &str = "Provisioning";

pub fn profile() -> Profile {
    Profile::new(PROFILE)
        .with_feature::<BootNotification>()
        .with_feature::<Heartbeat>()
}

/// Registration status for BootNotification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
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

/// Charging station information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingStationInfo {
    pub model: String,
    pub vendor_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

impl Validate for ChargingStationInfo {
    fn validate(&self) -> Result<(), Violation> {
        check_required("model", &self.model)?;
        check_max_len("model", &self.model, 20)?;
        check_required("vendorName", &self.vendor_name)?;
        check_max_len("vendorName", &self.vendor_name, 50)?;
        if let Some(ref serial) = self.serial_number {
            check_max_len("serialNumber", serial, 25)?;
        }
        if let Some(ref firmware) = self.firmware_version {
            check_max_len("firmwareVersion", firmware, 50)?;
        }
        Ok(())
    }
}

/// BootNotification request (CS -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charging_station: ChargingStationInfo,
    pub reason: BootReason,
}

impl Validate for BootNotificationRequest {
    fn validate(&self) -> Result<(), Violation> {
        self.charging_station
            .validate()
            .map_err(|v| v.within("chargingStation"))
    }
}

/// BootNotification response (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub current_time: DateTime<Utc>,
    /// Heartbeat interval in seconds (retry interval while not accepted)
    pub interval: i32,
    pub status: RegistrationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

impl Validate for BootNotificationResponse {
    fn validate(&self) -> Result<(), Violation> {
        check_gte("interval", self.interval.into(), 0)?;
        self.status_info.validate().map_err(|v| v.within("statusInfo"))
    }
}

pub struct BootNotification;

impl Feature for BootNotification {
    const ACTION: &'static str = "BootNotification";
    const DIRECTION: Direction = Direction::StationToCsms;
    type Request = BootNotificationRequest;
    type Response = BootNotificationResponse;
}

/// Heartbeat request (CS -> CSMS)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

impl Validate for HeartbeatRequest {
    fn validate(&self) -> Result<(), Violation> {
        Ok(())
    }
}

/// Heartbeat response (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

impl Validate for HeartbeatResponse {
    fn validate(&self) -> Result<(), Violation> {
        Ok(())
    }
}

pub struct Heartbeat;

impl Feature for Heartbeat {
    const ACTION: &'static str = "Heartbeat";
    const DIRECTION: Direction = Direction::StationToCsms;
    type Request = HeartbeatRequest;
    type Response = HeartbeatResponse;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::{validate_as, ViolationKind};
    use serde_json::json;

    #[test]
    fn test_boot_notification_serialization() {
        let req = BootNotificationRequest {
            charging_station: ChargingStationInfo {
                model: "EK3".to_string(),
                vendor_name: "Elektrokombinacija".to_string(),
                serial_number: None,
                firmware_version: Some("0.1.0".to_string()),
            },
            reason: BootReason::PowerUp,
        };

        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["chargingStation"]["vendorName"], "Elektrokombinacija");
        assert!(value["chargingStation"].get("serialNumber").is_none());
        assert_eq!(value["reason"], "PowerUp");
    }

    #[test]
    fn test_boot_notification_constraints() {
        let too_long = json!({
            "chargingStation": {"model": "M".repeat(21), "vendorName": "V"},
            "reason": "PowerUp"
        });
        let v = validate_as::<BootNotificationRequest>(&too_long).unwrap_err();
        assert_eq!(v.kind, ViolationKind::PropertyConstraint);
        assert_eq!(v.field, "chargingStation.model");

        let bad_reason = json!({
            "chargingStation": {"model": "M", "vendorName": "V"},
            "reason": "Bored"
        });
        assert_eq!(
            validate_as::<BootNotificationRequest>(&bad_reason).unwrap_err().kind,
            ViolationKind::PropertyConstraint
        );
    }

    #[test]
    fn test_boot_response_parsing() {
        let response = json!({
            "currentTime": "2026-01-20T12:00:00Z",
            "interval": 300,
            "status": "Accepted"
        });
        assert!(validate_as::<BootNotificationResponse>(&response).is_ok());

        let negative = json!({
            "currentTime": "2026-01-20T12:00:00Z",
            "interval": -5,
            "status": "Pending"
        });
        assert!(validate_as::<BootNotificationResponse>(&negative).is_err());
    }
}
