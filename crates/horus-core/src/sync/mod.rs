//! Device synchronization.
//!
//! A run fetches users and logs from one device, creates profiles for
//! unknown device users, ingests punches idempotently and rebuilds the
//! daily summaries of every date that gained a punch. The registry keeps
//! runs for the same device from overlapping.

pub mod filter;
pub mod orchestrator;
pub mod registry;
pub mod types;

pub use orchestrator::{SyncOrchestrator, ALREADY_SYNCING};
pub use registry::{SyncGuard, SyncRegistry};
pub use types::{SyncMode, SyncOptions, SyncOutcome, SyncPhase, SyncProgress, SyncResult};
