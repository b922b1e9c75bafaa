//! Daily attendance classification.
//!
//! [`process_day`] turns one person's punches for one calendar day into a
//! [`DailySummaryDraft`]. It is a pure function of its inputs: no I/O, no
//! clock, and the order of the punches does not matter.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::storage::RulesConfig;

/// Verdict for one person on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Late,
    EarlyLeave,
    Absent,
    Incomplete,
    Holiday,
    Weekend,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Late => "late",
            AttendanceStatus::EarlyLeave => "early_leave",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Incomplete => "incomplete",
            AttendanceStatus::Holiday => "holiday",
            AttendanceStatus::Weekend => "weekend",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "present" => AttendanceStatus::Present,
            "late" => AttendanceStatus::Late,
            "early_leave" => AttendanceStatus::EarlyLeave,
            "absent" => AttendanceStatus::Absent,
            "incomplete" => AttendanceStatus::Incomplete,
            "holiday" => AttendanceStatus::Holiday,
            "weekend" => AttendanceStatus::Weekend,
            _ => return None,
        })
    }
}

/// Secondary observations that never change the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryFlag {
    /// More than two punches; only the first and last are used.
    MultiplePunches,
    CheckInOutsideWindow,
    CheckOutOutsideWindow,
    /// Punches recorded on a holiday or non-workday.
    PunchOnNonWorkday,
}

/// Inclusive time-of-day window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn contains(&self, t: NaiveTime) -> bool {
        self.start <= t && t <= self.end
    }
}

/// Set of working weekdays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workdays(u8);

impl Workdays {
    pub fn new(days: impl IntoIterator<Item = Weekday>) -> Self {
        Self(
            days.into_iter()
                .fold(0u8, |mask, d| mask | (1 << d.num_days_from_monday())),
        )
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    /// Parse weekday names ("Mon", "monday", ...).
    ///
    /// # Errors
    /// Returns an error naming the first unrecognized entry.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, ValidationError> {
        let mut days = Vec::with_capacity(names.len());
        for name in names {
            let day = name
                .as_ref()
                .trim()
                .parse::<Weekday>()
                .map_err(|_| ValidationError::InvalidValue {
                    field: "workdays".into(),
                    message: format!("unknown weekday '{}'", name.as_ref()),
                })?;
            days.push(day);
        }
        Ok(Self::new(days))
    }
}

/// Rules in force for a sync run. Snapshotted once at the start of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRuleSet {
    pub work_start: NaiveTime,
    pub work_end: NaiveTime,
    pub late_grace_minutes: u32,
    pub early_leave_grace_minutes: u32,
    pub check_in_window: TimeWindow,
    pub check_out_window: TimeWindow,
    pub workdays: Workdays,
}

/// Parse `HH:MM` (or `HH:MM:SS`).
pub(crate) fn parse_clock(field: &str, value: &str) -> Result<NaiveTime, ValidationError> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| ValidationError::InvalidValue {
            field: field.to_string(),
            message: format!("expected HH:MM, got '{value}'"),
        })
}

impl AttendanceRuleSet {
    /// Build from configured defaults.
    ///
    /// # Errors
    /// Returns an error if a time or weekday cannot be parsed.
    pub fn from_config(cfg: &RulesConfig) -> Result<Self, ValidationError> {
        Ok(Self {
            work_start: parse_clock("work_start_time", &cfg.work_start_time)?,
            work_end: parse_clock("work_end_time", &cfg.work_end_time)?,
            late_grace_minutes: cfg.late_grace_period,
            early_leave_grace_minutes: cfg.early_leave_grace_period,
            check_in_window: TimeWindow {
                start: parse_clock("check_in_window_start", &cfg.check_in_window_start)?,
                end: parse_clock("check_in_window_end", &cfg.check_in_window_end)?,
            },
            check_out_window: TimeWindow {
                start: parse_clock("check_out_window_start", &cfg.check_out_window_start)?,
                end: parse_clock("check_out_window_end", &cfg.check_out_window_end)?,
            },
            workdays: Workdays::from_names(&cfg.workdays)?,
        })
    }
}

impl Default for AttendanceRuleSet {
    fn default() -> Self {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN);
        Self {
            work_start: t(9, 0),
            work_end: t(17, 0),
            late_grace_minutes: 15,
            early_leave_grace_minutes: 15,
            check_in_window: TimeWindow {
                start: t(6, 0),
                end: t(12, 0),
            },
            check_out_window: TimeWindow {
                start: t(12, 0),
                end: t(23, 59),
            },
            workdays: Workdays::new([
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ]),
        }
    }
}

/// Computed summary for one person and day, ready to be upserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySummaryDraft {
    pub person_id: String,
    pub date: NaiveDate,
    pub check_in: Option<NaiveDateTime>,
    pub check_out: Option<NaiveDateTime>,
    pub late_minutes: u32,
    pub early_minutes: u32,
    pub incomplete: bool,
    pub status: AttendanceStatus,
    pub flags: Vec<SummaryFlag>,
}

fn minutes_between(later: NaiveTime, earlier: NaiveTime) -> i64 {
    later.signed_duration_since(earlier).num_minutes()
}

fn beyond_grace(minutes: i64, grace: u32) -> u32 {
    u32::try_from((minutes - i64::from(grace)).max(0)).unwrap_or(u32::MAX)
}

/// Classify one person's day.
pub fn process_day(
    person_id: &str,
    date: NaiveDate,
    punches: &[NaiveDateTime],
    rules: &AttendanceRuleSet,
    is_holiday: bool,
) -> DailySummaryDraft {
    let mut sorted = punches.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let check_in = sorted.first().copied();
    let check_out = if sorted.len() > 1 {
        sorted.last().copied()
    } else {
        None
    };
    let incomplete = sorted.len() == 1;
    let is_workday = rules.workdays.contains(date.weekday());

    let mut flags = Vec::new();
    if sorted.len() > 2 {
        flags.push(SummaryFlag::MultiplePunches);
    }

    if is_holiday || !is_workday {
        if !sorted.is_empty() {
            flags.push(SummaryFlag::PunchOnNonWorkday);
        }
        return DailySummaryDraft {
            person_id: person_id.to_string(),
            date,
            check_in,
            check_out,
            late_minutes: 0,
            early_minutes: 0,
            incomplete,
            status: if is_holiday {
                AttendanceStatus::Holiday
            } else {
                AttendanceStatus::Weekend
            },
            flags,
        };
    }

    let late_minutes = check_in
        .map(|t| beyond_grace(minutes_between(t.time(), rules.work_start), rules.late_grace_minutes))
        .unwrap_or(0);
    let early_minutes = check_out
        .map(|t| {
            beyond_grace(
                minutes_between(rules.work_end, t.time()),
                rules.early_leave_grace_minutes,
            )
        })
        .unwrap_or(0);

    if let Some(t) = check_in {
        if !rules.check_in_window.contains(t.time()) {
            flags.push(SummaryFlag::CheckInOutsideWindow);
        }
    }
    if let Some(t) = check_out {
        if !rules.check_out_window.contains(t.time()) {
            flags.push(SummaryFlag::CheckOutOutsideWindow);
        }
    }

    let status = if sorted.is_empty() {
        AttendanceStatus::Absent
    } else if incomplete {
        AttendanceStatus::Incomplete
    } else if late_minutes > 0 {
        AttendanceStatus::Late
    } else if early_minutes > 0 {
        AttendanceStatus::EarlyLeave
    } else {
        AttendanceStatus::Present
    };

    DailySummaryDraft {
        person_id: person_id.to_string(),
        date,
        check_in,
        check_out,
        late_minutes,
        early_minutes,
        incomplete,
        status,
        flags,
    }
}
