//! Quill - feedback indexing pipeline
//!
//! Stores submitted feedback and indexes it into Elasticsearch in chunked,
//! retryable background tasks, tracking each chunk in a status record.

pub mod config;
pub mod elasticsearch;
pub mod error;
pub mod indexing;
pub mod models;
pub mod search;
pub mod store;

pub use config::Config;
pub use error::{IndexError, Result};
pub use models::{BatchStatus, Record, RecordStatus, Response};
