//! Server-side lockdown.
//!
//! Unlike the scanner, these stages change the server: instance settings,
//! DENY grants and blocking DDL triggers. Every stage is fail-closed and
//! re-running it against an already hardened target is a no-op.

pub mod database;
pub mod deny;
pub mod probe;
pub mod server;
pub mod trigger;

pub use database::harden_database;
pub use deny::{DATABASE_DENIES, DenyOutcome, DenyStatement, apply_database_denies, verify_skipped_denies};
pub use probe::{CANDIDATE_EVENTS, MAX_PROBE_ATTEMPTS, ProbeBudget, probe_supported_events};
pub use server::harden_instance;
pub use trigger::{TriggerInstall, TriggerTemplate, install_database_trigger};
