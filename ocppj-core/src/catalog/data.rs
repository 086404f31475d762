//! DataTransfer profile: vendor-specific exchanges in either direction

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StatusInfo;
use crate::profile::{Direction, Feature, Profile};
use crate::validation::{check_max_len, check_required, Validate, Violation};

pub const PROFILE: &str = "DataTransfer";

pub fn profile() -> Profile {
    Profile::new(PROFILE).with_feature::<DataTransfer>()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum DataTransferStatus {
    Accepted,
    Rejected,
    UnknownMessageId,
    UnknownVendorId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    pub vendor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl DataTransferRequest {
    pub fn new(vendor_id: impl Into<String>) -> Self {
        Self {
            vendor_id: vendor_id.into(),
            message_id: None,
            data: None,
        }
    }
}

impl Validate for DataTransferRequest {
    fn validate(&self) -> Result<(), Violation> {
        check_required("vendorId", &self.vendor_id)?;
        check_max_len("vendorId", &self.vendor_id, 255)?;
        if let Some(ref id) = self.message_id {
            check_max_len("messageId", id, 50)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferResponse {
    pub status: DataTransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl DataTransferResponse {
    pub fn new(status: DataTransferStatus) -> Self {
        Self {
            status,
            status_info: None,
            data: None,
        }
    }
}

impl Validate for DataTransferResponse {
    fn validate(&self) -> Result<(), Violation> {
        self.status_info.validate().map_err(|v| v.within("statusInfo"))
    }
}

pub struct DataTransfer;

impl Feature for DataTransfer {
    const ACTION: &'static str = "DataTransfer";
    const DIRECTION: Direction = Direction::Both;
    type Request = DataTransferRequest;
    type Response = DataTransferResponse;
}
