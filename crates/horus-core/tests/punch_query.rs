//! Filtering, ordering and paging of stored punches against a simple model.

use std::collections::BTreeSet;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use horus_core::ingest::{BatchInserter, RawPunchRecord};
use horus_core::storage::devices::{upsert_device, Device};
use horus_core::storage::punches::{query_punches, PunchQuery, PunchRecord, PunchSort};
use horus_core::storage::IngestConfig;
use horus_core::Store;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

const DEVICES: [&str; 2] = ["d0", "d1"];

fn base() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

fn record(device: usize, user: u8, minutes: i64) -> RawPunchRecord {
    RawPunchRecord {
        device_id: DEVICES[device].to_string(),
        device_user_id: user.to_string(),
        timestamp: base() + Duration::minutes(minutes),
        verify_type: 1,
        punch_type: 0,
        raw_payload: None,
    }
}

async fn seeded(records: &[RawPunchRecord]) -> Store {
    let store = Store::open_memory().unwrap();
    for id in DEVICES {
        upsert_device(&store, &Device::new(id, id, "10.0.0.1")).await.unwrap();
    }
    let inserter = BatchInserter::new(store.clone(), &IngestConfig::default());
    inserter
        .insert_punches(records, |_| async {}, &CancellationToken::new())
        .await
        .unwrap();
    store
}

fn matches(query: &PunchQuery, r: &RawPunchRecord) -> bool {
    let date = r.timestamp.date();
    query.date_from.map_or(true, |d| date >= d)
        && query.date_to.map_or(true, |d| date <= d)
        && query.device_id.as_deref().map_or(true, |d| r.device_id == d)
        && query.device_user_id.as_deref().map_or(true, |u| r.device_user_id == u)
}

fn sort_key(sort: PunchSort, p: &PunchRecord) -> String {
    match sort {
        PunchSort::Timestamp => p.timestamp.to_string(),
        PunchSort::DeviceUserId => p.device_user_id.clone(),
        PunchSort::DeviceId => p.device_id.clone(),
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn sort_strategy() -> impl Strategy<Value = PunchSort> {
    prop_oneof![
        Just(PunchSort::Timestamp),
        Just(PunchSort::DeviceUserId),
        Just(PunchSort::DeviceId),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn query_returns_exactly_the_matching_rows_in_order(
        raw in prop::collection::vec((0usize..2, 0u8..4, 0i64..(6 * 24 * 60)), 0..60),
        from_day in prop::option::of(1u32..7),
        span in 0u32..4,
        device in prop::option::of(0usize..2),
        user in prop::option::of(0u8..4),
        sort in sort_strategy(),
        descending in any::<bool>(),
    ) {
        let records: Vec<RawPunchRecord> = raw.iter().map(|(d, u, m)| record(*d, *u, *m)).collect();
        let date_from = from_day.and_then(|d| NaiveDate::from_ymd_opt(2024, 3, d));
        let query = PunchQuery {
            date_from,
            date_to: date_from.map(|d| d + Duration::days(i64::from(span))),
            device_id: device.map(|d| DEVICES[d].to_string()),
            device_user_id: user.map(|u| u.to_string()),
            sort,
            descending,
            limit: None,
            offset: 0,
        };

        let expected: BTreeSet<(String, String, NaiveDateTime)> = records
            .iter()
            .filter(|r| matches(&query, r))
            .map(|r| (r.device_id.clone(), r.device_user_id.clone(), r.timestamp))
            .collect();

        let rows = runtime().block_on(async {
            let store = seeded(&records).await;
            query_punches(&store, &query).await.unwrap()
        });

        let got: BTreeSet<(String, String, NaiveDateTime)> = rows
            .iter()
            .map(|p| (p.device_id.clone(), p.device_user_id.clone(), p.timestamp))
            .collect();
        prop_assert_eq!(rows.len(), got.len());
        prop_assert_eq!(got, expected);

        for pair in rows.windows(2) {
            let (a, b) = (sort_key(sort, &pair[0]), sort_key(sort, &pair[1]));
            if descending {
                prop_assert!(a >= b);
            } else {
                prop_assert!(a <= b);
            }
        }
    }
}

#[tokio::test]
async fn paging_walks_the_full_ordering() {
    let records: Vec<RawPunchRecord> = (0..10).map(|i| record(i % 2, 1, i as i64 * 90)).collect();
    let store = seeded(&records).await;

    let all = query_punches(&store, &PunchQuery::default()).await.unwrap();
    assert_eq!(all.len(), 10);

    let page = query_punches(
        &store,
        &PunchQuery {
            limit: Some(3),
            offset: 4,
            ..PunchQuery::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(page, all[4..7].to_vec());
}

#[tokio::test]
async fn inverted_range_is_rejected() {
    let store = seeded(&[]).await;
    let query = PunchQuery {
        date_from: NaiveDate::from_ymd_opt(2024, 3, 5),
        date_to: NaiveDate::from_ymd_opt(2024, 3, 4),
        ..PunchQuery::default()
    };
    assert!(query_punches(&store, &query).await.is_err());
}
