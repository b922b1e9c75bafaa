//! # Horus Core Library
//!
//! This library provides the core logic for Horus Attendance: pulling punch
//! logs from ZKTeco-style biometric terminals, storing them without
//! duplicates, and turning them into per-person daily attendance summaries.
//! The `horus-cli` binary is a thin layer over the same library.
//!
//! ## Architecture
//!
//! - **Device**: Binary TCP protocol client behind the [`DeviceClient`] trait,
//!   with an in-memory mock for tests
//! - **Storage**: SQLite persistence for devices, profiles, raw punches,
//!   summaries, holidays and settings, plus TOML configuration
//! - **Ingest**: Savepoint-per-chunk batch insert that ignores duplicates
//! - **Attendance**: Pure per-day rule evaluation and the summary rebuilder
//! - **Sync**: Per-device run orchestration with progress and cancellation
//!
//! ## Key Components
//!
//! - [`SyncOrchestrator`]: Runs a device sync end to end
//! - [`BatchInserter`]: Idempotent punch ingestion
//! - [`IdentityIndex`]: Maps device tokens to person profiles
//! - [`process_day`]: Classifies one person's day
//! - [`Store`]: Shared SQLite connection
//! - [`Config`]: Application configuration management

pub mod attendance;
pub mod device;
pub mod error;
pub mod identity;
pub mod ingest;
pub mod logging;
pub mod storage;
pub mod sync;

pub use attendance::{
    process_day, AttendanceRuleSet, AttendanceStatus, DailySummaryDraft, RebuildOutcome,
    SummaryBuilder, SummaryFlag,
};
pub use device::{DeviceClient, DeviceConfig, MockDeviceClient, ZkClient};
pub use error::{ConfigError, CoreError, DatabaseError, DeviceError, ValidationError};
pub use identity::{IdentityIndex, MatchTier};
pub use ingest::{BatchInserter, InsertOutcome, RawPunchRecord};
pub use storage::{Config, Store};
pub use sync::{
    SyncMode, SyncOptions, SyncOrchestrator, SyncOutcome, SyncPhase, SyncProgress, SyncRegistry,
    SyncResult,
};
