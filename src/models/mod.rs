//! Core data models for feedback indexing.

pub mod record;
pub mod response;

pub use record::{BatchStatus, BatchSummary, Record, RecordStatus};
pub use response::{Platform, Response};
