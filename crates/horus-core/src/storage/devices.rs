//! Device records.
//!
//! Devices are configured by the operator; the sync core only reads them and
//! stamps `last_sync_at` after a completed run.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use super::{now_text, Store};
use crate::device::DeviceConfig;
use crate::error::DatabaseError;

/// Whether a device is synced on a timer or only on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSyncMode {
    Auto,
    Manual,
}

impl DeviceSyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceSyncMode::Auto => "auto",
            DeviceSyncMode::Manual => "manual",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "auto" => DeviceSyncMode::Auto,
            _ => DeviceSyncMode::Manual,
        }
    }
}

/// A configured time-clock device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    /// Shared secret ("comm key"); empty when the device has none.
    pub comm_key: String,
    pub timezone: String,
    pub sync_mode: DeviceSyncMode,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl Device {
    /// A manual-sync device with default port and timezone.
    pub fn new(id: impl Into<String>, name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ip: ip.into(),
            port: 4370,
            comm_key: String::new(),
            timezone: "UTC".into(),
            sync_mode: DeviceSyncMode::Manual,
            last_sync_at: None,
        }
    }

    /// Connection parameters for the device client.
    pub fn connection_config(&self, timeout_ms: u64) -> DeviceConfig {
        DeviceConfig {
            ip: self.ip.clone(),
            port: self.port,
            comm_key: if self.comm_key.trim().is_empty() {
                None
            } else {
                Some(self.comm_key.clone())
            },
            timeout_ms,
        }
    }
}

const DEVICE_COLUMNS: &str =
    "id, name, ip, port, comm_key, timezone, sync_mode, last_sync_at";

fn row_to_device(row: &Row<'_>) -> rusqlite::Result<Device> {
    let last_sync_at: Option<String> = row.get(7)?;
    Ok(Device {
        id: row.get(0)?,
        name: row.get(1)?,
        ip: row.get(2)?,
        port: row.get(3)?,
        comm_key: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        timezone: row
            .get::<_, Option<String>>(5)?
            .unwrap_or_else(|| "UTC".to_string()),
        sync_mode: DeviceSyncMode::parse(&row.get::<_, Option<String>>(6)?.unwrap_or_default()),
        last_sync_at: last_sync_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}

/// Look up one device.
///
/// # Errors
/// Returns an error if the query fails.
pub async fn get_device(store: &Store, id: &str) -> Result<Option<Device>, DatabaseError> {
    store
        .select_optional(
            &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"),
            &[Value::from(id.to_string())],
            row_to_device,
        )
        .await
}

/// All devices ordered by name.
///
/// # Errors
/// Returns an error if the query fails.
pub async fn list_devices(store: &Store) -> Result<Vec<Device>, DatabaseError> {
    store
        .select(
            &format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY name, id"),
            &[],
            row_to_device,
        )
        .await
}

/// Insert or update a device's configuration. `last_sync_at` is left alone
/// on update.
///
/// # Errors
/// Returns an error if the statement fails.
pub async fn upsert_device(store: &Store, device: &Device) -> Result<(), DatabaseError> {
    store
        .execute(
            "INSERT INTO devices (id, name, ip, port, comm_key, timezone, sync_mode, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                ip = excluded.ip,
                port = excluded.port,
                comm_key = excluded.comm_key,
                timezone = excluded.timezone,
                sync_mode = excluded.sync_mode,
                updated_at = excluded.updated_at",
            &[
                Value::from(device.id.clone()),
                Value::from(device.name.clone()),
                Value::from(device.ip.clone()),
                Value::from(device.port),
                Value::from(device.comm_key.clone()),
                Value::from(device.timezone.clone()),
                Value::from(device.sync_mode.as_str().to_string()),
                Value::from(now_text()),
            ],
        )
        .await?;
    Ok(())
}

/// Record the completion time of a sync run.
///
/// # Errors
/// Returns an error if the statement fails.
pub async fn set_last_synced_at(
    store: &Store,
    id: &str,
    at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    store
        .execute(
            "UPDATE devices SET last_sync_at = ?1, updated_at = ?2 WHERE id = ?3",
            &[
                Value::from(at.to_rfc3339()),
                Value::from(now_text()),
                Value::from(id.to_string()),
            ],
        )
        .await?;
    Ok(())
}
