//! SmartCharging profile: EV charging needs
//!
//! The station forwards what the EV reported during charge parameter
//! discovery. The CSMS only acknowledges here; an updated schedule follows
//! later as its own call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StatusInfo;
use crate::profile::{Direction, Feature, Profile};
use crate::validation::{check_gt, check_gte, check_range, Validate, Violation};

pub const PROFILE: &str = "SmartCharging";

pub fn profile() -> Profile {
    Profile::new(PROFILE).with_feature::<NotifyEVChargingNeeds>()
}

/// Mode of energy transfer requested by the EV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnergyTransferMode {
    DC,
    #[serde(rename = "AC_single_phase")]
    AcSinglePhase,
    #[serde(rename = "AC_two_phase")]
    AcTwoPhase,
    #[serde(rename = "AC_three_phase")]
    AcThreePhase,
}

/// EV AC charging parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcChargingParameters {
    /// Requested energy in Wh, preconditioning included
    pub energy_amount: i32,
    /// Amps per phase
    pub ev_min_current: i32,
    /// Amps per phase, cable capacity included
    pub ev_max_current: i32,
    pub ev_max_voltage: i32,
}

impl Validate for AcChargingParameters {
    fn validate(&self) -> Result<(), Violation> {
        check_gte("energyAmount", self.energy_amount.into(), 0)?;
        check_gte("evMinCurrent", self.ev_min_current.into(), 0)?;
        check_gte("evMaxCurrent", self.ev_max_current.into(), 0)?;
        check_gte("evMaxVoltage", self.ev_max_voltage.into(), 0)
    }
}

/// EV DC charging parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DcChargingParameters {
    pub ev_max_current: i32,
    pub ev_max_voltage: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_amount: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ev_max_power: Option<i32>,
    /// Percent of battery capacity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_of_charge: Option<i32>,
    /// Battery capacity in Wh
    #[serde(rename = "energyCapacity", skip_serializing_if = "Option::is_none")]
    pub ev_energy_capacity: Option<i32>,
    #[serde(rename = "fullSoC", skip_serializing_if = "Option::is_none")]
    pub full_soc: Option<i32>,
    #[serde(rename = "bulkSoC", skip_serializing_if = "Option::is_none")]
    pub bulk_soc: Option<i32>,
}

impl Validate for DcChargingParameters {
    fn validate(&self) -> Result<(), Violation> {
        check_gte("evMaxCurrent", self.ev_max_current.into(), 0)?;
        check_gte("evMaxVoltage", self.ev_max_voltage.into(), 0)?;

        let non_negative = [
            ("energyAmount", self.energy_amount),
            ("evMaxPower", self.ev_max_power),
            ("energyCapacity", self.ev_energy_capacity),
        ];
        for (field, value) in non_negative {
            if let Some(value) = value {
                check_gte(field, value.into(), 0)?;
            }
        }

        let percentages = [
            ("stateOfCharge", self.state_of_charge),
            ("fullSoC", self.full_soc),
            ("bulkSoC", self.bulk_soc),
        ];
        for (field, value) in percentages {
            if let Some(value) = value {
                check_range(field, value.into(), 0, 100)?;
            }
        }
        Ok(())
    }
}

/// Characteristics of the energy delivery the EV requires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingNeeds {
    pub requested_energy_transfer: EnergyTransferMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub departure_time: Option<DateTime<Utc>>,
    #[serde(rename = "acChargingParameters", skip_serializing_if = "Option::is_none")]
    pub ac_charging_parameters: Option<AcChargingParameters>,
    #[serde(rename = "dcChargingParameters", skip_serializing_if = "Option::is_none")]
    pub dc_charging_parameters: Option<DcChargingParameters>,
}

impl ChargingNeeds {
    pub fn new(mode: EnergyTransferMode) -> Self {
        Self {
            requested_energy_transfer: mode,
            departure_time: None,
            ac_charging_parameters: None,
            dc_charging_parameters: None,
        }
    }
}

impl Validate for ChargingNeeds {
    fn validate(&self) -> Result<(), Violation> {
        self.ac_charging_parameters
            .validate()
            .map_err(|v| v.within("acChargingParameters"))?;
        self.dc_charging_parameters
            .validate()
            .map_err(|v| v.within("dcChargingParameters"))
    }
}

/// NotifyEVChargingNeeds request (CS -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyEVChargingNeedsRequest {
    /// Maximum schedule tuples per schedule the EV supports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_schedule_tuples: Option<i32>,
    /// EVSE the EV is connected to; never 0
    #[serde(rename = "evseId")]
    pub evse_id: i32,
    pub charging_needs: ChargingNeeds,
}

impl NotifyEVChargingNeedsRequest {
    pub fn new(evse_id: i32, charging_needs: ChargingNeeds) -> Self {
        Self {
            max_schedule_tuples: None,
            evse_id,
            charging_needs,
        }
    }
}

impl Validate for NotifyEVChargingNeedsRequest {
    fn validate(&self) -> Result<(), Violation> {
        if let Some(tuples) = self.max_schedule_tuples {
            check_gte("maxScheduleTuples", tuples.into(), 0)?;
        }
        check_gt("evseId", self.evse_id.into(), 0)?;
        self.charging_needs
            .validate()
            .map_err(|v| v.within("chargingNeeds"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum NotifyEVChargingNeedsStatus {
    /// A schedule will be provided momentarily
    Accepted,
    /// Service not available
    Rejected,
    /// The CSMS is gathering information to provide a schedule
    Processing,
}

/// NotifyEVChargingNeeds response (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyEVChargingNeedsResponse {
    pub status: NotifyEVChargingNeedsStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

impl NotifyEVChargingNeedsResponse {
    pub fn new(status: NotifyEVChargingNeedsStatus) -> Self {
        Self {
            status,
            status_info: None,
        }
    }
}

impl Validate for NotifyEVChargingNeedsResponse {
    fn validate(&self) -> Result<(), Violation> {
        self.status_info.validate().map_err(|v| v.within("statusInfo"))
    }
}

pub struct NotifyEVChargingNeeds;

impl Feature for NotifyEVChargingNeeds {
    const ACTION: &'static str = "NotifyEVChargingNeeds";
    const DIRECTION: Direction = Direction::StationToCsms;
    type Request = NotifyEVChargingNeedsRequest;
    type Response = NotifyEVChargingNeedsResponse;
}
