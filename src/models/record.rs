//! Ingestion tracking records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one chunk's indexing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Success,
    Failure,
}

impl RecordStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecordStatus::Pending)
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordStatus::Pending => write!(f, "pending"),
            RecordStatus::Success => write!(f, "success"),
            RecordStatus::Failure => write!(f, "failure"),
        }
    }
}

/// One row per reindexing batch-chunk attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: u64,

    /// Groups the chunks of one logical reindex
    pub batch_id: String,

    /// Human label, e.g. "response 0-999"
    pub name: String,

    pub status: RecordStatus,

    pub created: DateTime<Utc>,

    /// Set when a worker picks the chunk up
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,

    /// Set when the record becomes terminal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,

    /// Failure reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Record {
    pub fn new(id: u64, batch_id: &str, name: &str) -> Self {
        Self {
            id,
            batch_id: batch_id.to_string(),
            name: name.to_string(),
            status: RecordStatus::Pending,
            created: Utc::now(),
            started: None,
            finished: None,
            message: None,
        }
    }
}

/// Aggregate state of every record sharing a batch id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// No records carry this batch id
    Empty,
    /// At least one chunk has not settled yet
    Pending,
    Success,
    Failure,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStatus::Empty => write!(f, "empty"),
            BatchStatus::Pending => write!(f, "pending"),
            BatchStatus::Success => write!(f, "success"),
            BatchStatus::Failure => write!(f, "failure"),
        }
    }
}

/// Per-status record counts for one batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub pending: usize,
    pub success: usize,
    pub failure: usize,
}

impl BatchSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        let mut summary = Self::default();
        for record in records {
            match record.status {
                RecordStatus::Pending => summary.pending += 1,
                RecordStatus::Success => summary.success += 1,
                RecordStatus::Failure => summary.failure += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.pending + self.success + self.failure
    }

    /// A batch completes only once every chunk is terminal; it succeeds only
    /// if every chunk succeeded.
    pub fn status(&self) -> BatchStatus {
        if self.total() == 0 {
            BatchStatus::Empty
        } else if self.pending > 0 {
            BatchStatus::Pending
        } else if self.failure > 0 {
            BatchStatus::Failure
        } else {
            BatchStatus::Success
        }
    }
}
