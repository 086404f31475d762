//! Sample OCPP 2.0.1 action catalog
//!
//! Payload shapes and constraints for a handful of actions, grouped into
//! profiles:
//! - Provisioning: BootNotification, Heartbeat
//! - SmartCharging: NotifyEVChargingNeeds
//! - DataTransfer: DataTransfer (either side may initiate)

use serde::{Deserialize, Serialize};

use crate::error::OcppError;
use crate::profile::ProfileRegistry;
use crate::validation::{check_max_len, check_required, Validate, Violation};

pub mod data;
pub mod provisioning;
pub mod smartcharging;

/// Additional status details carried by several responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    pub reason_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<String>,
}

impl StatusInfo {
    pub fn new(reason_code: impl Into<String>) -> Self {
        Self {
            reason_code: reason_code.into(),
            additional_info: None,
        }
    }
}

impl Validate for StatusInfo {
    fn validate(&self) -> Result<(), Violation> {
        check_required("reasonCode", &self.reason_code)?;
        check_max_len("reasonCode", &self.reason_code, 20)?;
        if let Some(ref info) = self.additional_info {
            check_max_len("additionalInfo", info, 512)?;
        }
        Ok(())
    }
}

/// Registry holding every profile of the catalog
pub fn registry() -> Result<ProfileRegistry, OcppError> {
    ProfileRegistry::new()
        .with_profile(provisioning::profile())?
        .with_profile(smartcharging::profile())?
        .with_profile(data::profile())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_registry() {
        let registry = registry().unwrap();
        assert_eq!(
            registry.resolve("BootNotification").unwrap().profile(),
            provisioning::PROFILE
        );
        assert_eq!(
            registry.resolve("NotifyEVChargingNeeds").unwrap().profile(),
            smartcharging::PROFILE
        );
        assert_eq!(registry.resolve("DataTransfer").unwrap().profile(), data::PROFILE);
        assert_eq!(registry.profile_names().count(), 3);
    }

    #[test]
    fn test_status_info_requires_reason_code() {
        assert!(StatusInfo::new("").validate().is_err());
        assert!(StatusInfo::new("Busy").validate().is_ok());
        assert!(StatusInfo::new("x".repeat(21)).validate().is_err());
    }
}
