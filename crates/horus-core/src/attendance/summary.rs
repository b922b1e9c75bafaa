//! Recompute daily summaries for a set of dates.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::rules::{process_day, AttendanceRuleSet, DailySummaryDraft};
use crate::error::CoreError;
use crate::identity::IdentityIndex;
use crate::storage::punches::punches_on;
use crate::storage::summaries::upsert_summary_in;
use crate::storage::Store;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildOutcome {
    pub dates_processed: usize,
    pub summaries_updated: usize,
    /// Punches whose device token matched no profile.
    pub unmatched: usize,
    pub failed_dates: usize,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

/// Rebuilds summaries against one run's snapshot of rules, holidays and
/// profiles.
pub struct SummaryBuilder<'a> {
    store: &'a Store,
    rules: &'a AttendanceRuleSet,
    holidays: &'a BTreeSet<NaiveDate>,
    identity: &'a IdentityIndex,
}

impl<'a> SummaryBuilder<'a> {
    pub fn new(
        store: &'a Store,
        rules: &'a AttendanceRuleSet,
        holidays: &'a BTreeSet<NaiveDate>,
        identity: &'a IdentityIndex,
    ) -> Self {
        Self {
            store,
            rules,
            holidays,
            identity,
        }
    }

    /// Drafts for one date: every active profile, plus any inactive profile
    /// that punched that day. Returns the drafts and the unmatched count.
    async fn drafts_for(&self, date: NaiveDate) -> Result<(Vec<DailySummaryDraft>, usize), CoreError> {
        let punches = punches_on(self.store, date).await?;

        let mut by_person: HashMap<&str, Vec<NaiveDateTime>> = HashMap::new();
        let mut unmatched = 0;
        for punch in &punches {
            match self.identity.resolve(&punch.device_user_id) {
                Some(profile) => by_person
                    .entry(profile.id.as_str())
                    .or_default()
                    .push(punch.timestamp),
                None => {
                    unmatched += 1;
                    tracing::debug!(token = %punch.device_user_id, %date, "punch matches no profile");
                }
            }
        }

        let is_holiday = self.holidays.contains(&date);
        let drafts = self
            .identity
            .profiles()
            .iter()
            .filter(|p| p.is_active() || by_person.contains_key(p.id.as_str()))
            .map(|p| {
                let times = by_person.get(p.id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
                process_day(&p.id, date, times, self.rules, is_holiday)
            })
            .collect();
        Ok((drafts, unmatched))
    }

    async fn write_date(&self, n: usize, drafts: &[DailySummaryDraft]) -> Result<(), CoreError> {
        let savepoint = format!("summary_{n}");
        let mut session = self.store.session().await;
        session.savepoint(&savepoint).await?;
        for draft in drafts {
            if let Err(e) = upsert_summary_in(&mut session, draft).await {
                session.abandon(&savepoint).await;
                return Err(e);
            }
        }
        session.release(&savepoint).await?;
        Ok(())
    }

    /// Recompute and upsert summaries for `dates`, one savepoint per date.
    /// A failed date is rolled back and recorded; the next date proceeds.
    ///
    /// `progress` is awaited after each date with `(done, total)`.
    pub async fn rebuild<F, Fut>(
        &self,
        dates: &BTreeSet<NaiveDate>,
        mut progress: F,
        cancel: &CancellationToken,
    ) -> RebuildOutcome
    where
        F: FnMut(NaiveDate, usize, usize) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let mut outcome = RebuildOutcome::default();
        let total = dates.len();

        for (n, &date) in dates.iter().enumerate() {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let result = match self.drafts_for(date).await {
                Ok((drafts, unmatched)) => {
                    outcome.unmatched += unmatched;
                    self.write_date(n, &drafts).await.map(|()| drafts.len())
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(written) => {
                    outcome.summaries_updated += written;
                    tracing::debug!(%date, summaries = written, "summaries rebuilt");
                }
                Err(e) => {
                    tracing::warn!(%date, error = %e, "summary rebuild failed for date");
                    outcome.failed_dates += 1;
                    outcome.errors.push(format!("summaries for {date}: {e}"));
                }
            }
            outcome.dates_processed += 1;

            progress(date, n + 1, total).await;
            tokio::task::yield_now().await;
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::rules::AttendanceStatus;
    use crate::storage::devices::{upsert_device, Device};
    use crate::storage::directory::{create_profile, list_profiles, NewProfile, ProfileStatus};
    use crate::storage::summaries::{get_summary, list_summaries};
    use rusqlite::types::Value;

    async fn setup() -> (Store, IdentityIndex) {
        let store = Store::open_memory().unwrap();
        upsert_device(&store, &Device::new("dev", "Gate", "10.0.0.3"))
            .await
            .unwrap();
        for (token, name) in [("1", "Amal"), ("2", "Badr")] {
            create_profile(
                &store,
                NewProfile {
                    device_user_id: Some(token.into()),
                    device_name: Some(name.into()),
                    display_name: name.into(),
                    department_id: None,
                    status: ProfileStatus::Active,
                },
            )
            .await
            .unwrap();
        }
        for (id, token, ts) in [
            ("p1", "1", "2024-03-04T08:55:00"),
            ("p2", "1", "2024-03-04T17:10:00"),
            ("p3", "99", "2024-03-04T09:00:00"),
        ] {
            store
                .execute(
                    "INSERT INTO attendance_logs_raw (id, device_id, device_user_id, timestamp) VALUES (?1, 'dev', ?2, ?3)",
                    &[
                        Value::from(id.to_string()),
                        Value::from(token.to_string()),
                        Value::from(ts.to_string()),
                    ],
                )
                .await
                .unwrap();
        }
        let identity = IdentityIndex::build(list_profiles(&store).await.unwrap());
        (store, identity)
    }

    #[tokio::test]
    async fn absent_profiles_get_rows_and_unmatched_are_counted() {
        let (store, identity) = setup().await;
        let rules = AttendanceRuleSet::default();
        let holidays = BTreeSet::new();
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();

        let outcome = SummaryBuilder::new(&store, &rules, &holidays, &identity)
            .rebuild(&BTreeSet::from([date]), |_, _, _| async {}, &CancellationToken::new())
            .await;
        assert_eq!(outcome.summaries_updated, 2);
        assert_eq!(outcome.unmatched, 1);
        assert!(outcome.errors.is_empty());

        let amal = &identity.resolve("1").unwrap().id;
        let badr = &identity.resolve("2").unwrap().id;
        assert_eq!(
            get_summary(&store, amal, date).await.unwrap().unwrap().status,
            AttendanceStatus::Present
        );
        assert_eq!(
            get_summary(&store, badr, date).await.unwrap().unwrap().status,
            AttendanceStatus::Absent
        );
    }

    #[tokio::test]
    async fn rebuild_twice_leaves_one_row_per_person_and_date() {
        let (store, identity) = setup().await;
        let rules = AttendanceRuleSet::default();
        let holidays = BTreeSet::from([NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()]);
        let dates = BTreeSet::from([NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()]);
        let builder = SummaryBuilder::new(&store, &rules, &holidays, &identity);
        let cancel = CancellationToken::new();

        builder.rebuild(&dates, |_, _, _| async {}, &cancel).await;
        builder.rebuild(&dates, |_, _, _| async {}, &cancel).await;

        let rows = list_summaries(&store, *dates.first().unwrap(), *dates.last().unwrap())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == AttendanceStatus::Holiday));
    }
}
