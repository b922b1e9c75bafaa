use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use super::tcp::ZkTcp;
use super::{
    validate_config, ConnectionTestResult, DeviceClient, DeviceConfig, DeviceInfo, DeviceLog,
    DeviceSnapshot, DeviceUser, FetchRequest,
};
use crate::error::DeviceError;
use crate::storage::DeviceSettings;

/// The device wants a fresh session between the user and log tables.
const RECONNECT_PAUSE: Duration = Duration::from_millis(500);

/// ZKTeco client over TCP. Every call opens its own session.
#[derive(Debug, Clone)]
pub struct ZkClient {
    sync_retries: u32,
    retry_delay: Duration,
}

impl Default for ZkClient {
    fn default() -> Self {
        Self::new(&DeviceSettings::default())
    }
}

impl ZkClient {
    pub fn new(settings: &DeviceSettings) -> Self {
        Self {
            sync_retries: settings.sync_retries,
            retry_delay: Duration::from_secs(settings.retry_delay_secs),
        }
    }

    async fn open(config: &DeviceConfig) -> Result<ZkTcp, DeviceError> {
        validate_config(config)?;
        let comm_key = config.comm_key_value()?;

        tracing::info!(addr = %config.address(), "connecting to device");
        let mut session = ZkTcp::connect(config.address(), config.timeout_ms).await?;
        if comm_key > 0 {
            if let Err(e) = session.auth(comm_key).await {
                tracing::warn!(addr = %config.address(), error = %e, "device authentication failed");
                session.disconnect().await;
                return Err(e);
            }
        }
        Ok(session)
    }

    async fn fetch_once(
        config: &DeviceConfig,
        request: &FetchRequest,
    ) -> Result<DeviceSnapshot, DeviceError> {
        let mut session = Self::open(config).await?;
        let users = session.users().await;
        session.disconnect().await;
        let users = users?;
        tracing::info!(users = users.len(), "fetched device users");

        tokio::time::sleep(RECONNECT_PAUSE).await;

        let mut session = Self::open(config).await?;
        let logs = session.attendance().await;
        session.disconnect().await;
        let mut logs = logs?;
        logs.retain(|log| request.contains(&log.timestamp));
        tracing::info!(logs = logs.len(), "fetched device logs");

        Ok(DeviceSnapshot { users, logs })
    }
}

#[async_trait]
impl DeviceClient for ZkClient {
    async fn test_connection(&self, config: &DeviceConfig) -> ConnectionTestResult {
        let started = Instant::now();
        match Self::open(config).await {
            Ok(mut session) => {
                let info = match session.free_sizes().await {
                    Ok((user_count, log_count)) => DeviceInfo {
                        serial_number: "Unknown".into(),
                        firmware_version: "Unknown".into(),
                        user_count,
                        log_count,
                        last_activity: Utc::now(),
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "connected but could not read device info");
                        DeviceInfo {
                            serial_number: "Unknown".into(),
                            firmware_version: "Unknown".into(),
                            user_count: 0,
                            log_count: 0,
                            last_activity: Utc::now(),
                        }
                    }
                };
                session.disconnect().await;
                ConnectionTestResult {
                    success: true,
                    device_info: Some(info),
                    error: None,
                    latency_ms: started.elapsed().as_millis() as u64,
                }
            }
            Err(e) => ConnectionTestResult {
                success: false,
                device_info: None,
                error: Some(e.user_message()),
                latency_ms: started.elapsed().as_millis() as u64,
            },
        }
    }

    async fn get_device_info(&self, config: &DeviceConfig) -> Result<DeviceInfo, DeviceError> {
        let mut session = Self::open(config).await?;
        let sizes = session.free_sizes().await;
        session.disconnect().await;
        let (user_count, log_count) = sizes?;
        Ok(DeviceInfo {
            serial_number: "Unknown".into(),
            firmware_version: "Unknown".into(),
            user_count,
            log_count,
            last_activity: Utc::now(),
        })
    }

    async fn get_users(&self, config: &DeviceConfig) -> Result<Vec<DeviceUser>, DeviceError> {
        let mut session = Self::open(config).await?;
        let users = session.users().await;
        session.disconnect().await;
        users
    }

    async fn get_attendance_logs(
        &self,
        config: &DeviceConfig,
        request: &FetchRequest,
    ) -> Result<Vec<DeviceLog>, DeviceError> {
        let mut session = Self::open(config).await?;
        let logs = session.attendance().await;
        session.disconnect().await;
        let mut logs = logs?;
        logs.retain(|log| request.contains(&log.timestamp));
        Ok(logs)
    }

    async fn sync_all(
        &self,
        config: &DeviceConfig,
        request: &FetchRequest,
    ) -> Result<DeviceSnapshot, DeviceError> {
        let mut attempt = 0;
        loop {
            match Self::fetch_once(config, request).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if e.is_retryable() && attempt < self.sync_retries => {
                    attempt += 1;
                    let delay = self.retry_delay * attempt;
                    tracing::warn!(
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "device fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
