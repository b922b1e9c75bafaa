//! Device sync runs: fetch, reconcile users, ingest punches, rebuild
//! summaries.
//!
//! Steady-state failures (a device that cannot be reached, a batch that
//! fails to insert, a date whose summaries cannot be written) are collected
//! in [`SyncResult::errors`]. Only a missing device record or a failure to
//! load the run's setup snapshot is returned as `Err`.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::filter::{apply_window, prefilter_stored, validate_mode};
use super::registry::{SyncGuard, SyncRegistry};
use super::types::{SyncOptions, SyncOutcome, SyncPhase, SyncProgress, SyncResult};
use crate::attendance::{AttendanceRuleSet, RebuildOutcome, SummaryBuilder};
use crate::device::{
    validate_config, ConnectionTestResult, DeviceClient, DeviceConfig, DeviceInfo, DeviceLog,
    DeviceSnapshot, DeviceUser, FetchRequest,
};
use crate::error::{CoreError, DeviceError, ValidationError};
use crate::identity::IdentityIndex;
use crate::ingest::{BatchInserter, RawPunchRecord};
use crate::storage::devices::{self, Device, DeviceSyncMode};
use crate::storage::directory::{self, NewProfile, ProfileStatus};
use crate::storage::{holidays, punches, settings, Config, Store};

pub const ALREADY_SYNCING: &str = "sync already in progress";

/// Sends progress events, waiting for channel capacity. A dropped
/// receiver is ignored.
#[derive(Debug, Clone)]
struct Reporter {
    device_id: String,
    tx: Option<mpsc::Sender<SyncProgress>>,
}

impl Reporter {
    async fn send(
        &self,
        phase: SyncPhase,
        current: usize,
        total: usize,
        message: impl Into<String>,
        details: Option<String>,
    ) {
        if let Some(tx) = &self.tx {
            let event = SyncProgress {
                device_id: self.device_id.clone(),
                phase,
                current,
                total,
                message: message.into(),
                details,
            };
            if tx.send(event).await.is_err() {
                tracing::trace!(device_id = %self.device_id, "progress receiver dropped");
            }
        }
    }
}

/// Rules, holidays and profiles read once at the start of a run.
struct RunSnapshot {
    rules: AttendanceRuleSet,
    holidays: BTreeSet<NaiveDate>,
    identity: IdentityIndex,
}

/// What the device gave us, with the calls that failed.
struct FetchReport {
    snapshot: Option<DeviceSnapshot>,
    errors: Vec<String>,
}

impl FetchReport {
    fn complete(snapshot: DeviceSnapshot) -> Self {
        Self {
            snapshot: Some(snapshot),
            errors: Vec::new(),
        }
    }

    fn failed(error: String) -> Self {
        Self {
            snapshot: None,
            errors: vec![error],
        }
    }
}

/// One in-flight run: its slot in the registry, its report, its progress.
struct Run<'a> {
    guard: SyncGuard,
    reporter: Reporter,
    result: SyncResult,
    cancel: &'a CancellationToken,
}

impl Run<'_> {
    async fn enter(&mut self, phase: SyncPhase, message: &str) {
        self.guard.set_phase(phase);
        tracing::info!(device_id = %self.result.device_id, phase = %phase, "{message}");
        self.reporter.send(phase, 0, 0, message, None).await;
    }

    async fn end(mut self, outcome: SyncOutcome) -> SyncResult {
        let phase = match outcome {
            SyncOutcome::Completed => SyncPhase::Complete,
            SyncOutcome::Cancelled => SyncPhase::Cancelled,
            SyncOutcome::Failed => SyncPhase::Failed,
        };
        self.guard.set_phase(phase);
        let result = self.result.finish(outcome);
        let message = match outcome {
            SyncOutcome::Completed => "sync complete",
            SyncOutcome::Cancelled => "sync cancelled",
            SyncOutcome::Failed => "sync failed",
        };
        tracing::info!(
            device_id = %result.device_id,
            outcome = ?outcome,
            logs_added = result.logs_added,
            logs_duplicate = result.logs_duplicate,
            errors = result.errors.len(),
            "{message}"
        );
        self.reporter
            .send(phase, 0, 0, message, result.errors.last().cloned())
            .await;
        result
    }

    fn fail(&mut self, error: String) {
        tracing::warn!(device_id = %self.result.device_id, error = %error, "sync error");
        self.result.errors.push(error);
    }
}

/// Runs device syncs against one store.
pub struct SyncOrchestrator {
    store: Store,
    client: Arc<dyn DeviceClient>,
    registry: Arc<SyncRegistry>,
    config: Config,
}

impl SyncOrchestrator {
    pub fn new(
        store: Store,
        client: Arc<dyn DeviceClient>,
        registry: Arc<SyncRegistry>,
        config: Config,
    ) -> Self {
        Self {
            store,
            client,
            registry,
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn is_syncing(&self, device_id: &str) -> bool {
        self.registry.is_active(device_id)
    }

    pub fn active_phase(&self, device_id: &str) -> Option<SyncPhase> {
        self.registry.phase(device_id)
    }

    /// A progress channel sized from configuration.
    pub fn progress_channel(&self) -> (mpsc::Sender<SyncProgress>, mpsc::Receiver<SyncProgress>) {
        mpsc::channel(self.config.sync.progress_channel_capacity.max(1))
    }

    async fn device(&self, device_id: &str) -> Result<Device, CoreError> {
        devices::get_device(&self.store, device_id)
            .await?
            .ok_or_else(|| CoreError::DeviceNotFound(device_id.to_string()))
    }

    fn connection(&self, device: &Device) -> DeviceConfig {
        device.connection_config(self.config.device.timeout_ms)
    }

    /// # Errors
    /// Returns an error if the device record does not exist.
    pub async fn test_connection(&self, device_id: &str) -> Result<ConnectionTestResult, CoreError> {
        let device = self.device(device_id).await?;
        Ok(self.client.test_connection(&self.connection(&device)).await)
    }

    /// # Errors
    /// Returns an error if the device record does not exist or the device
    /// cannot be read.
    pub async fn device_info(&self, device_id: &str) -> Result<DeviceInfo, CoreError> {
        let device = self.device(device_id).await?;
        Ok(self.client.get_device_info(&self.connection(&device)).await?)
    }

    async fn load_snapshot(&self) -> Result<RunSnapshot, CoreError> {
        let rules = settings::load_rule_set(&self.store, &self.config.rules).await?;
        let holidays = holidays::holiday_set(&self.store).await?;
        let identity = IdentityIndex::build(directory::list_profiles(&self.store).await?);
        Ok(RunSnapshot {
            rules,
            holidays,
            identity,
        })
    }

    /// Sync one device.
    ///
    /// # Errors
    /// Returns [`CoreError::DeviceNotFound`] for an unknown device, or an
    /// error if the rule set, holidays or profiles cannot be loaded. Every
    /// other failure is reported in the result.
    pub async fn start_sync(
        &self,
        device_id: &str,
        options: SyncOptions,
        progress: Option<mpsc::Sender<SyncProgress>>,
        cancel: CancellationToken,
    ) -> Result<SyncResult, CoreError> {
        let Some(guard) = self.registry.try_acquire(device_id) else {
            tracing::info!(device_id, "sync already in progress, request ignored");
            let mut result = SyncResult::new(device_id);
            result.errors.push(ALREADY_SYNCING.to_string());
            return Ok(result.finish(SyncOutcome::Failed));
        };

        let device = self.device(device_id).await?;
        let snapshot = self.load_snapshot().await?;
        let latest_stored = punches::latest_timestamp(&self.store, device_id).await?;

        let mut run = Run {
            guard,
            reporter: Reporter {
                device_id: device_id.to_string(),
                tx: progress,
            },
            result: SyncResult::new(device_id),
            cancel: &cancel,
        };

        if let Err(e) = validate_mode(&options.mode) {
            run.fail(e.to_string());
            return Ok(run.end(SyncOutcome::Failed).await);
        }

        self.run(&device, &options, snapshot, latest_stored, run).await
    }

    async fn run(
        &self,
        device: &Device,
        options: &SyncOptions,
        mut snapshot: RunSnapshot,
        latest_stored: Option<chrono::NaiveDateTime>,
        mut run: Run<'_>,
    ) -> Result<SyncResult, CoreError> {
        let sync = &self.config.sync;

        run.enter(SyncPhase::Connecting, "connecting to device").await;
        if run.cancel.is_cancelled() {
            return Ok(run.end(SyncOutcome::Cancelled).await);
        }
        let connection = self.connection(device);
        if let Err(e) = validate_config(&connection) {
            run.fail(format!("device connection invalid: {}", e.user_message()));
            return Ok(run.end(SyncOutcome::Failed).await);
        }

        run.enter(SyncPhase::Fetching, "fetching users and logs").await;
        let cancel = run.cancel;
        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Ok(run.end(SyncOutcome::Cancelled).await),
            fetched = self.fetch(&connection) => fetched,
        };
        for e in fetched.errors {
            run.fail(e);
        }
        let Some(snapshot_from_device) = fetched.snapshot else {
            return Ok(run.end(SyncOutcome::Failed).await);
        };

        run.result.logs_fetched = snapshot_from_device.logs.len();
        let logs = apply_window(
            snapshot_from_device.logs,
            &options.mode,
            latest_stored,
            sync.latest_overlap_days,
        );
        let logs = if sync.prefilter_stored {
            let (kept, dropped) = prefilter_stored(logs, latest_stored, sync.prefilter_slack_minutes);
            run.result.logs_prefiltered = dropped;
            kept
        } else {
            logs
        };
        tracing::info!(
            device_id = %device.id,
            fetched = run.result.logs_fetched,
            kept = logs.len(),
            prefiltered = run.result.logs_prefiltered,
            "device data fetched"
        );

        run.enter(SyncPhase::ReconcilingUsers, "reconciling users").await;
        if !self
            .reconcile_users(&snapshot_from_device.users, &mut snapshot.identity, &mut run)
            .await
        {
            return Ok(run.end(SyncOutcome::Cancelled).await);
        }

        run.enter(SyncPhase::IngestingLogs, "storing attendance logs").await;
        if run.cancel.is_cancelled() {
            return Ok(run.end(SyncOutcome::Cancelled).await);
        }
        let records: Vec<RawPunchRecord> = logs
            .iter()
            .map(|log| to_record(&device.id, log))
            .collect();
        let inserter = BatchInserter::new(self.store.clone(), &self.config.ingest);
        let reporter = run.reporter.clone();
        let outcome = inserter
            .insert_punches(
                &records,
                |p| {
                    let reporter = reporter.clone();
                    async move {
                        reporter
                            .send(
                                SyncPhase::IngestingLogs,
                                p.processed,
                                p.total,
                                format!("stored {} of {} logs", p.processed, p.total),
                                Some(format!("{} new, {} duplicate", p.inserted, p.duplicates)),
                            )
                            .await;
                    }
                },
                run.cancel,
            )
            .await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                run.fail(format!("log ingest failed: {e}"));
                return Ok(run.end(SyncOutcome::Failed).await);
            }
        };
        run.result.logs_added = outcome.inserted;
        run.result.logs_duplicate = outcome.duplicates;
        for e in outcome.errors {
            run.fail(e);
        }
        if outcome.cancelled {
            return Ok(run.end(SyncOutcome::Cancelled).await);
        }

        let dates = outcome.inserted_dates;
        run.result.dates_touched = dates.iter().copied().collect();
        if dates.is_empty() {
            tracing::info!(device_id = %device.id, "no new logs, summary rebuild skipped");
        } else {
            run.enter(SyncPhase::RebuildingSummaries, "rebuilding daily summaries")
                .await;
            let rebuilt = self
                .rebuild_dates(&snapshot, &dates, &run.reporter, run.cancel)
                .await;
            run.result.summaries_updated = rebuilt.summaries_updated;
            run.result.logs_unmatched = rebuilt.unmatched;
            for e in rebuilt.errors {
                run.fail(e);
            }
            if rebuilt.cancelled {
                return Ok(run.end(SyncOutcome::Cancelled).await);
            }
        }

        if let Err(e) = devices::set_last_synced_at(&self.store, &device.id, Utc::now()).await {
            run.fail(format!("could not record sync time: {e}"));
        }
        Ok(run.end(SyncOutcome::Completed).await)
    }

    /// Combined fetch, falling back to separate user and log calls.
    ///
    /// In the fallback a failing half is reported and replaced by an empty
    /// list; the snapshot is missing only when nothing could be read.
    async fn fetch(&self, connection: &DeviceConfig) -> FetchReport {
        let request = FetchRequest::full();
        let e = match self.client.sync_all(connection, &request).await {
            Ok(snapshot) => return FetchReport::complete(snapshot),
            Err(e @ (DeviceError::Auth(_) | DeviceError::InvalidConfig(_))) => {
                return FetchReport::failed(format!("device fetch failed: {}", e.user_message()));
            }
            Err(e) => e,
        };
        tracing::warn!(addr = %connection.address(), error = %e, "combined fetch failed, trying separate calls");

        let mut errors = Vec::new();
        let users = match self.client.get_users(connection).await {
            Ok(users) => Some(users),
            Err(e) => {
                errors.push(format!("user fetch failed: {}", e.user_message()));
                None
            }
        };
        let logs = match self.client.get_attendance_logs(connection, &request).await {
            Ok(logs) => Some(logs),
            Err(e) => {
                errors.push(format!("log fetch failed: {}", e.user_message()));
                None
            }
        };

        let snapshot = match (users, logs) {
            (None, None) => None,
            (users, logs) => Some(DeviceSnapshot {
                users: users.unwrap_or_default(),
                logs: logs.unwrap_or_default(),
            }),
        };
        FetchReport { snapshot, errors }
    }

    /// Create profiles for device users nobody knows yet. Returns `false`
    /// if the run was cancelled part way.
    async fn reconcile_users(
        &self,
        users: &[DeviceUser],
        identity: &mut IdentityIndex,
        run: &mut Run<'_>,
    ) -> bool {
        let sync = &self.config.sync;
        let total = users.len();
        for (i, user) in users.iter().enumerate() {
            if i % sync.cancel_check_every.max(1) == 0 && run.cancel.is_cancelled() {
                return false;
            }

            let token = user.device_user_id.trim();
            if token.is_empty() {
                tracing::debug!("skipping device user with blank id");
            } else if identity.resolve(token).is_some() {
                run.result.users_synced += 1;
            } else {
                let name = user.device_name.trim();
                let new = NewProfile {
                    device_user_id: Some(token.to_string()),
                    device_name: (!name.is_empty()).then(|| name.to_string()),
                    display_name: if name.is_empty() {
                        format!("User {token}")
                    } else {
                        name.to_string()
                    },
                    department_id: None,
                    status: ProfileStatus::Active,
                };
                match directory::ensure_profile(&self.store, new).await {
                    Ok((profile, true)) => {
                        tracing::debug!(token, profile_id = %profile.id, "created profile for device user");
                        identity.insert(profile);
                        run.result.users_added += 1;
                    }
                    Ok((profile, false)) => {
                        identity.insert(profile);
                        run.result.users_synced += 1;
                    }
                    Err(e) => run.fail(format!("could not create user {token}: {e}")),
                }
            }

            let done = i + 1;
            if done % sync.progress_every.max(1) == 0 || done == total {
                run.reporter
                    .send(
                        SyncPhase::ReconcilingUsers,
                        done,
                        total,
                        format!("reconciled {done} of {total} users"),
                        None,
                    )
                    .await;
            }
        }
        true
    }

    async fn rebuild_dates(
        &self,
        snapshot: &RunSnapshot,
        dates: &BTreeSet<NaiveDate>,
        reporter: &Reporter,
        cancel: &CancellationToken,
    ) -> RebuildOutcome {
        SummaryBuilder::new(&self.store, &snapshot.rules, &snapshot.holidays, &snapshot.identity)
            .rebuild(
                dates,
                |date, done, total| {
                    let reporter = reporter.clone();
                    async move {
                        reporter
                            .send(
                                SyncPhase::RebuildingSummaries,
                                done,
                                total,
                                format!("rebuilt summaries for {date}"),
                                None,
                            )
                            .await;
                    }
                },
                cancel,
            )
            .await
    }

    /// Sync every device set to automatic sync, one after another.
    ///
    /// # Errors
    /// Returns an error if the device list cannot be read. Per-device
    /// setup failures become failed results.
    pub async fn sync_all_auto(
        &self,
        options: SyncOptions,
        progress: Option<mpsc::Sender<SyncProgress>>,
        cancel: CancellationToken,
    ) -> Result<Vec<SyncResult>, CoreError> {
        let auto: Vec<Device> = devices::list_devices(&self.store)
            .await?
            .into_iter()
            .filter(|d| d.sync_mode == DeviceSyncMode::Auto)
            .collect();

        let mut results = Vec::with_capacity(auto.len());
        for device in auto {
            if cancel.is_cancelled() {
                break;
            }
            let result = match self
                .start_sync(&device.id, options.clone(), progress.clone(), cancel.clone())
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    let mut failed = SyncResult::new(&device.id);
                    failed.errors.push(e.to_string());
                    failed.finish(SyncOutcome::Failed)
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    /// Recompute summaries for `from..=to` with the current rules, outside
    /// any device sync. Progress events carry an empty device id.
    ///
    /// # Errors
    /// Returns an error for an inverted range or if the rule set, holidays
    /// or profiles cannot be loaded.
    pub async fn rebuild_summaries(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        progress: Option<mpsc::Sender<SyncProgress>>,
        cancel: CancellationToken,
    ) -> Result<RebuildOutcome, CoreError> {
        if from > to {
            return Err(ValidationError::InvalidDateRange { start: from, end: to }.into());
        }
        let snapshot = self.load_snapshot().await?;
        let dates: BTreeSet<NaiveDate> = from.iter_days().take_while(|d| *d <= to).collect();
        let reporter = Reporter {
            device_id: String::new(),
            tx: progress,
        };
        tracing::info!(%from, %to, days = dates.len(), "rebuilding summaries");
        Ok(self.rebuild_dates(&snapshot, &dates, &reporter, &cancel).await)
    }
}

fn to_record(device_id: &str, log: &DeviceLog) -> RawPunchRecord {
    RawPunchRecord {
        device_id: device_id.to_string(),
        device_user_id: log.device_user_id.trim().to_string(),
        timestamp: log.timestamp,
        verify_type: log.verify_type,
        punch_type: log.punch_type,
        raw_payload: serde_json::to_string(log).ok(),
    }
}
