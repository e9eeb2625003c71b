//! Error types for the indexing pipeline.

use thiserror::Error;

/// Errors that can occur while indexing feedback into the search engine
#[derive(Error, Debug)]
pub enum IndexError {
    /// Transport-level failure talking to the search engine
    #[error("Search backend unavailable: {0}")]
    Transport(String),

    /// The search engine answered with a non-success status
    #[error("Search backend returned {status}: {body}")]
    Backend { status: u16, body: String },

    /// Bulk write accepted some documents and rejected others
    #[error("Bulk write rejected {} of {total} documents (first: {reason})", rejected.len())]
    PartialBulkFailure {
        rejected: Vec<String>,
        total: usize,
        reason: String,
    },

    /// Record store (sled) failure
    #[error("Record store error: {0}")]
    Store(#[from] sled::Error),

    /// No record with the given id
    #[error("Record {0} not found")]
    RecordNotFound(u64),

    /// JSON encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Chunk refers to a mapping type nobody registered
    #[error("Unknown mapping type: {0}")]
    UnknownMapping(String),

    /// Invalid configuration value
    #[error("Config error: {0}")]
    Config(String),

    /// Index creation, alias swap or similar lifecycle step failed
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// A task or batch did not settle in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The task queue no longer accepts work
    #[error("Task queue is shut down")]
    QueueClosed,
}

impl IndexError {
    /// Whether retrying the same work could succeed.
    ///
    /// Rejected documents will be rejected again, so partial bulk failures
    /// are permanent even though some documents made it in.
    pub fn is_transient(&self) -> bool {
        match self {
            IndexError::Transport(_) | IndexError::Timeout(_) => true,
            IndexError::Backend { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<elasticsearch::Error> for IndexError {
    fn from(err: elasticsearch::Error) -> Self {
        match err.status_code() {
            Some(status) => IndexError::Backend {
                status: status.as_u16(),
                body: err.to_string(),
            },
            None => IndexError::Transport(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IndexError::PartialBulkFailure {
            rejected: vec!["3".into(), "7".into()],
            total: 10,
            reason: "mapper_parsing_exception".into(),
        };
        assert_eq!(
            err.to_string(),
            "Bulk write rejected 2 of 10 documents (first: mapper_parsing_exception)"
        );

        let err = IndexError::RecordNotFound(42);
        assert_eq!(err.to_string(), "Record 42 not found");
    }

    #[test]
    fn test_transient_classification() {
        assert!(IndexError::Transport("connection reset".into()).is_transient());
        assert!(IndexError::Timeout("chunk".into()).is_transient());
        assert!(IndexError::Backend {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(IndexError::Backend {
            status: 429,
            body: String::new()
        }
        .is_transient());
        assert!(!IndexError::Backend {
            status: 400,
            body: String::new()
        }
        .is_transient());
        assert!(!IndexError::PartialBulkFailure {
            rejected: vec!["1".into()],
            total: 2,
            reason: "bad".into(),
        }
        .is_transient());
        assert!(!IndexError::UnknownMapping("nope".into()).is_transient());
    }

    #[test]
    fn test_from_serde_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: IndexError = json_err.into();
        assert!(matches!(err, IndexError::Serialization(_)));
    }
}
