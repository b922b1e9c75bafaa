//! Time-clock device communication.
//!
//! [`DeviceClient`] is the seam the sync orchestrator talks through.
//! [`ZkClient`] speaks the ZKTeco binary protocol over TCP;
//! [`MockDeviceClient`] replays a scripted snapshot.

mod client;
pub mod mock;
pub mod protocol;
mod tcp;

pub use client::ZkClient;
pub use mock::MockDeviceClient;

use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// Connection parameters for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub ip: String,
    pub port: u16,
    /// Numeric comm key, when the device has one set.
    pub comm_key: Option<String>,
    pub timeout_ms: u64,
}

impl DeviceConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// The comm key as the device expects it; `0` means none.
    ///
    /// # Errors
    /// Returns an error when the key is not a number.
    pub fn comm_key_value(&self) -> Result<u32, DeviceError> {
        match self.comm_key.as_deref().map(str::trim) {
            None | Some("") => Ok(0),
            Some(key) => key.parse::<u32>().map_err(|_| {
                DeviceError::InvalidConfig(format!("comm key must be numeric, got '{key}'"))
            }),
        }
    }
}

/// Check a device config before opening a connection.
///
/// # Errors
/// Returns [`DeviceError::InvalidConfig`] for a non-IPv4 address, port 0
/// or a non-numeric comm key.
pub fn validate_config(config: &DeviceConfig) -> Result<(), DeviceError> {
    if config.ip.parse::<Ipv4Addr>().is_err() {
        return Err(DeviceError::InvalidConfig(format!(
            "invalid IP address: {}",
            config.ip
        )));
    }
    if config.port == 0 {
        return Err(DeviceError::InvalidConfig("port cannot be 0".into()));
    }
    config.comm_key_value()?;
    Ok(())
}

/// A user enrolled on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceUser {
    pub device_user_id: String,
    /// May be blank.
    pub device_name: String,
}

/// One punch as reported by the device, in device-local time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLog {
    pub device_user_id: String,
    pub timestamp: NaiveDateTime,
    pub verify_type: u8,
    pub punch_type: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial_number: String,
    pub firmware_version: String,
    pub user_count: u32,
    pub log_count: u32,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub device_info: Option<DeviceInfo>,
    /// Operator-facing message when the test failed.
    pub error: Option<String>,
    pub latency_ms: u64,
}

/// Optional date bounds a client may apply to the logs it returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl FetchRequest {
    /// The device's full history.
    pub fn full() -> Self {
        Self::default()
    }

    pub fn contains(&self, ts: &NaiveDateTime) -> bool {
        let date = ts.date();
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}

/// Users and logs fetched in one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub users: Vec<DeviceUser>,
    pub logs: Vec<DeviceLog>,
}

/// Operations the sync core needs from a device.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Connect, read device info and disconnect. Never fails; the outcome
    /// is in the result.
    async fn test_connection(&self, config: &DeviceConfig) -> ConnectionTestResult;

    async fn get_device_info(&self, config: &DeviceConfig) -> Result<DeviceInfo, DeviceError>;

    async fn get_users(&self, config: &DeviceConfig) -> Result<Vec<DeviceUser>, DeviceError>;

    async fn get_attendance_logs(
        &self,
        config: &DeviceConfig,
        request: &FetchRequest,
    ) -> Result<Vec<DeviceLog>, DeviceError>;

    /// Users and logs together, retrying transient failures.
    async fn sync_all(
        &self,
        config: &DeviceConfig,
        request: &FetchRequest,
    ) -> Result<DeviceSnapshot, DeviceError>;
}
