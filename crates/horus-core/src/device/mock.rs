//! Scripted device client for tests and dry runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{
    validate_config, ConnectionTestResult, DeviceClient, DeviceConfig, DeviceInfo, DeviceLog,
    DeviceSnapshot, DeviceUser, FetchRequest,
};
use crate::error::DeviceError;

/// Serves a fixed snapshot, optionally failing specific calls.
#[derive(Debug, Default)]
pub struct MockDeviceClient {
    snapshot: DeviceSnapshot,
    sync_all_error: Option<DeviceError>,
    users_error: Option<DeviceError>,
    logs_error: Option<DeviceError>,
    latency: Duration,
    sync_all_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl MockDeviceClient {
    pub fn new(users: Vec<DeviceUser>, logs: Vec<DeviceLog>) -> Self {
        Self {
            snapshot: DeviceSnapshot { users, logs },
            ..Self::default()
        }
    }

    /// Fail the combined fetch; the separate calls still succeed.
    pub fn failing_sync_all(mut self, error: DeviceError) -> Self {
        self.sync_all_error = Some(error);
        self
    }

    pub fn failing_users(mut self, error: DeviceError) -> Self {
        self.users_error = Some(error);
        self
    }

    pub fn failing_logs(mut self, error: DeviceError) -> Self {
        self.logs_error = Some(error);
        self
    }

    /// Delay every fetch, to keep a sync in flight.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn sync_all_calls(&self) -> usize {
        self.sync_all_calls.load(Ordering::SeqCst)
    }

    /// Calls to `get_users` plus `get_attendance_logs`.
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            serial_number: "MOCK-0001".into(),
            firmware_version: "Ver 6.60".into(),
            user_count: self.snapshot.users.len() as u32,
            log_count: self.snapshot.logs.len() as u32,
            last_activity: Utc::now(),
        }
    }

    fn logs_for(&self, request: &FetchRequest) -> Vec<DeviceLog> {
        self.snapshot
            .logs
            .iter()
            .filter(|log| request.contains(&log.timestamp))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DeviceClient for MockDeviceClient {
    async fn test_connection(&self, config: &DeviceConfig) -> ConnectionTestResult {
        match validate_config(config) {
            Ok(()) => ConnectionTestResult {
                success: true,
                device_info: Some(self.info()),
                error: None,
                latency_ms: self.latency.as_millis() as u64,
            },
            Err(e) => ConnectionTestResult {
                success: false,
                device_info: None,
                error: Some(e.user_message()),
                latency_ms: 0,
            },
        }
    }

    async fn get_device_info(&self, config: &DeviceConfig) -> Result<DeviceInfo, DeviceError> {
        validate_config(config)?;
        Ok(self.info())
    }

    async fn get_users(&self, config: &DeviceConfig) -> Result<Vec<DeviceUser>, DeviceError> {
        validate_config(config)?;
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        match &self.users_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.snapshot.users.clone()),
        }
    }

    async fn get_attendance_logs(
        &self,
        config: &DeviceConfig,
        request: &FetchRequest,
    ) -> Result<Vec<DeviceLog>, DeviceError> {
        validate_config(config)?;
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        match &self.logs_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.logs_for(request)),
        }
    }

    async fn sync_all(
        &self,
        config: &DeviceConfig,
        request: &FetchRequest,
    ) -> Result<DeviceSnapshot, DeviceError> {
        validate_config(config)?;
        self.sync_all_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if let Some(e) = self.sync_all_error.as_ref().or(self.users_error.as_ref()).or(self.logs_error.as_ref()) {
            return Err(e.clone());
        }
        Ok(DeviceSnapshot {
            users: self.snapshot.users.clone(),
            logs: self.logs_for(request),
        })
    }
}
