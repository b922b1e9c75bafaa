//! End-to-end sync runs against an in-memory store and a scripted device.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use horus_core::device::{DeviceLog, DeviceUser, MockDeviceClient};
use horus_core::storage::devices::{get_device, upsert_device, Device, DeviceSyncMode};
use horus_core::storage::directory::list_profiles;
use horus_core::storage::punches::count_punches;
use horus_core::storage::settings::{set_setting, LATE_GRACE_PERIOD};
use horus_core::storage::summaries::{get_summary, list_summaries};
use horus_core::sync::ALREADY_SYNCING;
use horus_core::{
    AttendanceStatus, Config, CoreError, DeviceError, IdentityIndex, Store, SyncMode, SyncOptions,
    SyncOrchestrator, SyncOutcome, SyncPhase, SyncProgress, SyncRegistry,
};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Helpers
// ============================================================================

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
    day(d).and_hms_opt(h, m, 0).unwrap()
}

fn user(id: &str, name: &str) -> DeviceUser {
    DeviceUser {
        device_user_id: id.into(),
        device_name: name.into(),
    }
}

fn log(id: &str, ts: NaiveDateTime) -> DeviceLog {
    DeviceLog {
        device_user_id: id.into(),
        timestamp: ts,
        verify_type: 1,
        punch_type: 0,
    }
}

fn users() -> Vec<DeviceUser> {
    vec![user("1", "Amal"), user("2", "  ")]
}

/// Monday 4th and Tuesday 5th March 2024, plus one punch from an
/// unregistered token.
fn logs() -> Vec<DeviceLog> {
    vec![
        log("1", at(4, 9, 20)),
        log("1", at(4, 17, 5)),
        log("2", at(4, 8, 50)),
        log("2", at(4, 17, 30)),
        log("1", at(5, 8, 55)),
        log("99", at(5, 10, 0)),
    ]
}

async fn store_with(devices: &[(&str, DeviceSyncMode)]) -> Store {
    let store = Store::open_memory().unwrap();
    for (id, mode) in devices {
        let mut device = Device::new(*id, *id, "192.168.1.201");
        device.sync_mode = *mode;
        upsert_device(&store, &device).await.unwrap();
    }
    store
}

fn orchestrator(store: &Store, client: MockDeviceClient, config: Config) -> SyncOrchestrator {
    SyncOrchestrator::new(store.clone(), Arc::new(client), SyncRegistry::new(), config)
}

fn one_row_groups() -> Config {
    let mut config = Config::default();
    config.ingest.rows_per_statement = 1;
    config.ingest.statements_per_savepoint = 1;
    config
}

async fn run(orch: &SyncOrchestrator, device_id: &str, mode: SyncMode) -> horus_core::SyncResult {
    orch.start_sync(device_id, SyncOptions::new(mode), None, CancellationToken::new())
        .await
        .unwrap()
}

// ============================================================================
// Full runs
// ============================================================================

#[tokio::test]
async fn first_sync_creates_users_stores_logs_and_summaries() {
    let store = store_with(&[("gate", DeviceSyncMode::Manual)]).await;
    let orch = orchestrator(&store, MockDeviceClient::new(users(), logs()), Config::default());

    let result = run(&orch, "gate", SyncMode::All).await;
    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.outcome, SyncOutcome::Completed);
    assert_eq!(result.users_added, 2);
    assert_eq!(result.users_synced, 0);
    assert_eq!(result.logs_fetched, 6);
    assert_eq!(result.logs_added, 6);
    assert_eq!(result.logs_duplicate, 0);
    assert_eq!(result.dates_touched, vec![day(4), day(5)]);
    assert_eq!(result.summaries_updated, 4);
    assert_eq!(result.logs_unmatched, 1);

    let profiles = list_profiles(&store).await.unwrap();
    let names: Vec<&str> = profiles.iter().map(|p| p.display_name.as_str()).collect();
    assert_eq!(names, vec!["Amal", "User 2"]);

    let identity = IdentityIndex::build(profiles);
    let amal = identity.resolve("1").unwrap().id.clone();
    let other = identity.resolve("2").unwrap().id.clone();

    let monday = get_summary(&store, &amal, day(4)).await.unwrap().unwrap();
    assert_eq!(monday.status, AttendanceStatus::Late);
    assert_eq!(monday.late_minutes, 5);
    let tuesday = get_summary(&store, &amal, day(5)).await.unwrap().unwrap();
    assert_eq!(tuesday.status, AttendanceStatus::Incomplete);
    assert_eq!(
        get_summary(&store, &other, day(4)).await.unwrap().unwrap().status,
        AttendanceStatus::Present
    );
    assert_eq!(
        get_summary(&store, &other, day(5)).await.unwrap().unwrap().status,
        AttendanceStatus::Absent
    );

    let device = get_device(&store, "gate").await.unwrap().unwrap();
    assert!(device.last_sync_at.is_some());
}

#[tokio::test]
async fn second_sync_adds_nothing() {
    let store = store_with(&[("gate", DeviceSyncMode::Manual)]).await;
    let orch = orchestrator(&store, MockDeviceClient::new(users(), logs()), Config::default());

    run(&orch, "gate", SyncMode::All).await;
    let again = run(&orch, "gate", SyncMode::All).await;

    assert!(again.success);
    assert_eq!(again.users_added, 0);
    assert_eq!(again.users_synced, 2);
    assert_eq!(again.logs_added, 0);
    assert_eq!(again.logs_prefiltered + again.logs_duplicate, 6);
    assert!(again.dates_touched.is_empty());
    assert_eq!(again.summaries_updated, 0);
    assert_eq!(count_punches(&store, Some("gate")).await.unwrap(), 6);
    assert_eq!(list_summaries(&store, day(1), day(31)).await.unwrap().len(), 4);
}

#[tokio::test]
async fn without_prefilter_repeats_count_as_duplicates() {
    let store = store_with(&[("gate", DeviceSyncMode::Manual)]).await;
    let mut config = Config::default();
    config.sync.prefilter_stored = false;
    let orch = orchestrator(&store, MockDeviceClient::new(users(), logs()), config);

    run(&orch, "gate", SyncMode::All).await;
    let again = run(&orch, "gate", SyncMode::All).await;
    assert_eq!(again.logs_prefiltered, 0);
    assert_eq!(again.logs_duplicate, 6);
    assert_eq!(again.logs_added, 0);
}

#[tokio::test]
async fn latest_mode_only_keeps_the_overlap_window() {
    let store = store_with(&[("gate", DeviceSyncMode::Manual)]).await;
    let mut config = Config::default();
    config.sync.prefilter_stored = false;
    config.sync.latest_overlap_days = 1;

    let first = orchestrator(
        &store,
        MockDeviceClient::new(users(), vec![log("1", at(4, 9, 0)), log("1", at(6, 9, 0))]),
        config.clone(),
    );
    assert_eq!(run(&first, "gate", SyncMode::All).await.logs_added, 2);

    let second = orchestrator(
        &store,
        MockDeviceClient::new(
            users(),
            vec![
                log("1", at(1, 9, 0)),
                log("1", at(4, 9, 0)),
                log("1", at(6, 9, 0)),
                log("1", at(7, 9, 0)),
            ],
        ),
        config,
    );
    let result = run(&second, "gate", SyncMode::Latest).await;
    assert_eq!(result.logs_fetched, 4);
    assert_eq!(result.logs_added, 1);
    assert_eq!(result.logs_duplicate, 1);
    assert_eq!(result.dates_touched, vec![day(7)]);
}

#[tokio::test]
async fn range_mode_keeps_dates_inside_range() {
    let store = store_with(&[("gate", DeviceSyncMode::Manual)]).await;
    let orch = orchestrator(&store, MockDeviceClient::new(users(), logs()), Config::default());

    let result = run(&orch, "gate", SyncMode::Range { start: day(5), end: day(5) }).await;
    assert!(result.success);
    assert_eq!(result.logs_added, 2);
    assert_eq!(result.dates_touched, vec![day(5)]);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn unknown_device_is_an_error() {
    let store = store_with(&[]).await;
    let orch = orchestrator(&store, MockDeviceClient::new(users(), logs()), Config::default());

    let err = orch
        .start_sync("nope", SyncOptions::default(), None, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DeviceNotFound(id) if id == "nope"));
    assert!(!orch.is_syncing("nope"));
}

#[tokio::test]
async fn inverted_range_fails_before_contacting_the_device() {
    let store = store_with(&[("gate", DeviceSyncMode::Manual)]).await;
    let client = Arc::new(MockDeviceClient::new(users(), logs()));
    let orch = SyncOrchestrator::new(store.clone(), client.clone(), SyncRegistry::new(), Config::default());

    let result = run(&orch, "gate", SyncMode::Range { start: day(6), end: day(4) }).await;
    assert_eq!(result.outcome, SyncOutcome::Failed);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(client.sync_all_calls(), 0);
    assert_eq!(client.fetch_calls(), 0);
}

#[tokio::test]
async fn failed_user_fetch_still_stores_logs() {
    let store = store_with(&[("gate", DeviceSyncMode::Manual)]).await;
    let client = Arc::new(
        MockDeviceClient::new(users(), logs())
            .failing_sync_all(DeviceError::Timeout("no answer".into()))
            .failing_users(DeviceError::Timeout("no answer".into())),
    );
    let orch = SyncOrchestrator::new(store.clone(), client.clone(), SyncRegistry::new(), Config::default());

    let result = run(&orch, "gate", SyncMode::All).await;
    assert_eq!(result.outcome, SyncOutcome::Completed);
    assert!(!result.success);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].starts_with("user fetch failed"), "{}", result.errors[0]);
    assert!(result.errors[0].contains("timeout"), "{}", result.errors[0]);
    assert_eq!(result.users_added, 0);
    assert_eq!(result.logs_added, 6);
    assert_eq!(count_punches(&store, None).await.unwrap(), 6);
    assert_eq!(client.fetch_calls(), 2);
}

#[tokio::test]
async fn fetch_failure_writes_nothing() {
    let store = store_with(&[("gate", DeviceSyncMode::Manual)]).await;
    let client = MockDeviceClient::new(users(), logs())
        .failing_sync_all(DeviceError::Timeout("no answer".into()))
        .failing_users(DeviceError::Timeout("no answer".into()))
        .failing_logs(DeviceError::Timeout("no answer".into()));
    let orch = orchestrator(&store, client, Config::default());

    let result = run(&orch, "gate", SyncMode::All).await;
    assert_eq!(result.outcome, SyncOutcome::Failed);
    assert!(!result.success);
    assert_eq!(result.errors.len(), 2);
    assert!(result.errors[0].starts_with("user fetch failed"), "{}", result.errors[0]);
    assert!(result.errors[1].starts_with("log fetch failed"), "{}", result.errors[1]);
    assert_eq!(count_punches(&store, None).await.unwrap(), 0);
    assert!(list_summaries(&store, day(1), day(31)).await.unwrap().is_empty());
    assert!(get_device(&store, "gate").await.unwrap().unwrap().last_sync_at.is_none());
}

#[tokio::test]
async fn combined_fetch_failure_falls_back_to_separate_calls() {
    let store = store_with(&[("gate", DeviceSyncMode::Manual)]).await;
    let client = Arc::new(
        MockDeviceClient::new(users(), logs())
            .failing_sync_all(DeviceError::Protocol("short read".into())),
    );
    let orch = SyncOrchestrator::new(store.clone(), client.clone(), SyncRegistry::new(), Config::default());

    let result = run(&orch, "gate", SyncMode::All).await;
    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.logs_added, 6);
    assert_eq!(client.sync_all_calls(), 1);
    assert_eq!(client.fetch_calls(), 2);
}

#[tokio::test]
async fn invalid_connection_fails_before_contacting_the_device() {
    let store = Store::open_memory().unwrap();
    upsert_device(&store, &Device::new("gate", "gate", "not-an-ip")).await.unwrap();
    let client = Arc::new(MockDeviceClient::new(users(), logs()));
    let orch = SyncOrchestrator::new(store.clone(), client.clone(), SyncRegistry::new(), Config::default());

    let result = run(&orch, "gate", SyncMode::All).await;
    assert_eq!(result.outcome, SyncOutcome::Failed);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("invalid IP address"), "{}", result.errors[0]);
    assert_eq!(client.sync_all_calls(), 0);
    assert_eq!(client.fetch_calls(), 0);
}

#[tokio::test]
async fn failing_batch_does_not_stop_the_run() {
    let store = store_with(&[("gate", DeviceSyncMode::Manual)]).await;
    store
        .execute(
            "CREATE TRIGGER poison BEFORE INSERT ON attendance_logs_raw
             WHEN NEW.device_user_id = 'poison'
             BEGIN SELECT RAISE(ABORT, 'poison record'); END",
            &[],
        )
        .await
        .unwrap();
    let mut device_logs = logs();
    device_logs.insert(2, log("poison", at(4, 12, 0)));
    let orch = orchestrator(&store, MockDeviceClient::new(users(), device_logs), one_row_groups());

    let result = run(&orch, "gate", SyncMode::All).await;
    assert_eq!(result.outcome, SyncOutcome::Completed);
    assert!(!result.success);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("poison"), "{}", result.errors[0]);
    assert_eq!(result.logs_fetched, 7);
    assert_eq!(result.logs_added, 6);
    assert_eq!(result.summaries_updated, 4);
    assert_eq!(count_punches(&store, None).await.unwrap(), 6);
}

// ============================================================================
// Concurrency and cancellation
// ============================================================================

#[tokio::test]
async fn second_run_for_same_device_is_rejected() {
    let store = store_with(&[("gate", DeviceSyncMode::Manual)]).await;
    let client = MockDeviceClient::new(users(), logs()).with_latency(Duration::from_millis(200));
    let orch = orchestrator(&store, client, Config::default());

    let first = run(&orch, "gate", SyncMode::All);
    let second = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(orch.is_syncing("gate"));
        run(&orch, "gate", SyncMode::All).await
    };
    let (first, second) = tokio::join!(first, second);

    assert!(first.success);
    assert!(!second.success);
    assert_eq!(second.errors, vec![ALREADY_SYNCING.to_string()]);
    assert_eq!(count_punches(&store, None).await.unwrap(), 6);
    assert!(!orch.is_syncing("gate"));
}

#[tokio::test]
async fn different_devices_sync_concurrently() {
    let store = store_with(&[("gate", DeviceSyncMode::Manual), ("dock", DeviceSyncMode::Manual)]).await;
    let client = MockDeviceClient::new(users(), logs()).with_latency(Duration::from_millis(50));
    let orch = orchestrator(&store, client, Config::default());

    let (a, b) = tokio::join!(run(&orch, "gate", SyncMode::All), run(&orch, "dock", SyncMode::All));
    assert!(a.success, "errors: {:?}", a.errors);
    assert!(b.success, "errors: {:?}", b.errors);
    assert_eq!(count_punches(&store, Some("gate")).await.unwrap(), 6);
    assert_eq!(count_punches(&store, Some("dock")).await.unwrap(), 6);
    // Both runs see the same device users; the second creates none.
    assert_eq!(a.users_added + b.users_added, 2);
}

#[tokio::test]
async fn cancelled_before_start() {
    let store = store_with(&[("gate", DeviceSyncMode::Manual)]).await;
    let orch = orchestrator(&store, MockDeviceClient::new(users(), logs()), Config::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = orch
        .start_sync("gate", SyncOptions::default(), None, cancel)
        .await
        .unwrap();
    assert_eq!(result.outcome, SyncOutcome::Cancelled);
    assert!(!result.success);
    assert_eq!(count_punches(&store, None).await.unwrap(), 0);
    assert!(get_device(&store, "gate").await.unwrap().unwrap().last_sync_at.is_none());
}

#[tokio::test]
async fn cancelled_while_fetching() {
    let store = store_with(&[("gate", DeviceSyncMode::Manual)]).await;
    let client = MockDeviceClient::new(users(), logs()).with_latency(Duration::from_secs(5));
    let orch = orchestrator(&store, client, Config::default());
    let cancel = CancellationToken::new();

    let trigger = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(
        orch.start_sync("gate", SyncOptions::default(), None, cancel.clone()),
        trigger
    );
    let result = result.unwrap();
    assert_eq!(result.outcome, SyncOutcome::Cancelled);
    assert_eq!(count_punches(&store, None).await.unwrap(), 0);
    assert!(!orch.is_syncing("gate"));
}

#[tokio::test]
async fn cancelled_while_ingesting_keeps_committed_rows() {
    let store = store_with(&[("gate", DeviceSyncMode::Manual)]).await;
    let orch = orchestrator(&store, MockDeviceClient::new(users(), logs()), one_row_groups());
    let (tx, mut rx) = orch.progress_channel();
    let cancel = CancellationToken::new();

    let watch = async {
        while let Some(event) = rx.recv().await {
            if event.phase == SyncPhase::IngestingLogs && event.current > 0 {
                cancel.cancel();
            }
        }
    };
    let (result, ()) = tokio::join!(
        orch.start_sync("gate", SyncOptions::default(), Some(tx), cancel.clone()),
        watch
    );
    let result = result.unwrap();

    assert_eq!(result.outcome, SyncOutcome::Cancelled);
    assert!(!result.success);
    let stored = count_punches(&store, None).await.unwrap();
    assert!(stored > 0 && stored < 6, "stored {stored}");
    assert_eq!(stored as usize, result.logs_added);
    assert!(get_device(&store, "gate").await.unwrap().unwrap().last_sync_at.is_none());
    assert!(!orch.is_syncing("gate"));
}

// ============================================================================
// Progress, auto sync, rebuilds
// ============================================================================

#[tokio::test]
async fn progress_walks_through_phases_in_order() {
    let store = store_with(&[("gate", DeviceSyncMode::Manual)]).await;
    let orch = orchestrator(&store, MockDeviceClient::new(users(), logs()), Config::default());
    let (tx, mut rx) = orch.progress_channel();

    let collect = async {
        let mut events: Vec<SyncProgress> = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    };
    let (result, events) = tokio::join!(
        orch.start_sync("gate", SyncOptions::default(), Some(tx), CancellationToken::new()),
        collect
    );
    assert!(result.unwrap().success);

    let mut phases: Vec<SyncPhase> = events.iter().map(|e| e.phase).collect();
    phases.dedup();
    assert_eq!(
        phases,
        vec![
            SyncPhase::Connecting,
            SyncPhase::Fetching,
            SyncPhase::ReconcilingUsers,
            SyncPhase::IngestingLogs,
            SyncPhase::RebuildingSummaries,
            SyncPhase::Complete,
        ]
    );
    assert!(events.iter().all(|e| e.device_id == "gate"));
}

#[tokio::test]
async fn auto_sync_only_visits_auto_devices() {
    let store = store_with(&[("gate", DeviceSyncMode::Auto), ("dock", DeviceSyncMode::Manual)]).await;
    let orch = orchestrator(&store, MockDeviceClient::new(users(), logs()), Config::default());

    let results = orch
        .sync_all_auto(SyncOptions::default(), None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].device_id, "gate");
    assert_eq!(count_punches(&store, Some("dock")).await.unwrap(), 0);
}

#[tokio::test]
async fn rebuild_applies_changed_rules() {
    let store = store_with(&[("gate", DeviceSyncMode::Manual)]).await;
    let orch = orchestrator(&store, MockDeviceClient::new(users(), logs()), Config::default());
    run(&orch, "gate", SyncMode::All).await;

    set_setting(&store, LATE_GRACE_PERIOD, "30").await.unwrap();
    let outcome = orch
        .rebuild_summaries(day(4), day(4), None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.dates_processed, 1);
    assert_eq!(outcome.summaries_updated, 2);

    let identity = IdentityIndex::build(list_profiles(&store).await.unwrap());
    let amal = &identity.resolve("Amal").unwrap().id;
    let monday = get_summary(&store, amal, day(4)).await.unwrap().unwrap();
    assert_eq!(monday.status, AttendanceStatus::Present);
    assert_eq!(monday.late_minutes, 0);

    let err = orch
        .rebuild_summaries(day(5), day(4), None, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}
