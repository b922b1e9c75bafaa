//! Attendance classification and summary rebuilds.

pub mod rules;
pub mod summary;

pub use rules::{
    process_day, AttendanceRuleSet, AttendanceStatus, DailySummaryDraft, SummaryFlag, TimeWindow,
    Workdays,
};
pub use summary::{RebuildOutcome, SummaryBuilder};
