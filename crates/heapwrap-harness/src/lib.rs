//! Verification tooling for heapwrap.
//!
//! - Self-check: runs the allocation policy scenarios over the reference
//!   primitive and records verdicts plus lifecycle records as JSONL.
//! - Symbol report: the primitive names for a prefix and the redirection
//!   table for a target OS.
//! - Log validation for JSONL evidence files.

pub mod error;
pub mod report;
pub mod scenarios;
pub mod structured_log;

pub use error::HarnessError;
pub use scenarios::{ScenarioReport, SelfCheck, run_self_check};
