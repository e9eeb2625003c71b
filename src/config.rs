//! TOML configuration for the indexer.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{IndexError, Result};

/// Default number of item ids per chunk task
pub const CHUNK_SIZE: usize = 1000;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub elasticsearch: ElasticsearchConfig,
    pub indexing: IndexingConfig,
    pub queue: QueueConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ElasticsearchConfig {
    pub url: String,
    /// Logical alias readers query; generations live behind it
    pub alias: String,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            alias: "feedback".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexingConfig {
    pub chunk_size: usize,
    /// Index responses as soon as they are saved
    pub live_index: bool,
    /// How long a rebuild waits for its batch before giving up
    pub rebuild_timeout_secs: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            live_index: true,
            rebuild_timeout_secs: 3600,
        }
    }
}

impl IndexingConfig {
    pub fn rebuild_timeout(&self) -> Duration {
        Duration::from_secs(self.rebuild_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
    pub capacity: usize,
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt
    pub retry_backoff_ms: u64,
    /// Ceiling for the retry delay
    pub retry_max_backoff_ms: u64,
    pub task_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            capacity: 64,
            max_attempts: 3,
            retry_backoff_ms: 500,
            retry_max_backoff_ms: 30_000,
            task_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill-data"),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            IndexError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| IndexError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.indexing.chunk_size == 0 {
            return Err(IndexError::Config("indexing.chunk_size must be > 0".into()));
        }
        if self.queue.workers == 0 {
            return Err(IndexError::Config("queue.workers must be > 0".into()));
        }
        if self.queue.capacity == 0 {
            return Err(IndexError::Config("queue.capacity must be > 0".into()));
        }
        if self.queue.max_attempts == 0 {
            return Err(IndexError::Config("queue.max_attempts must be > 0".into()));
        }
        if self.queue.retry_max_backoff_ms < self.queue.retry_backoff_ms {
            return Err(IndexError::Config(
                "queue.retry_max_backoff_ms must be >= queue.retry_backoff_ms".into(),
            ));
        }
        if self.elasticsearch.alias.is_empty() {
            return Err(IndexError::Config("elasticsearch.alias is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.indexing.chunk_size, CHUNK_SIZE);
        assert_eq!(config.elasticsearch.alias, "feedback");
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[elasticsearch]
url = "http://es:9200"

[indexing]
chunk_size = 250

[queue]
workers = 8
"#
        )
        .unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.elasticsearch.url, "http://es:9200");
        assert_eq!(config.elasticsearch.alias, "feedback");
        assert_eq!(config.indexing.chunk_size, 250);
        assert!(config.indexing.live_index);
        assert_eq!(config.queue.workers, 8);
        assert_eq!(config.queue.max_attempts, 3);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[indexing]\nchunk_size = 0").unwrap();

        let err = Config::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, IndexError::Config(_)));
    }

    #[test]
    fn test_backoff_ceiling_below_initial_rejected() {
        let mut config = Config::default();
        config.queue.retry_backoff_ms = 1_000;
        config.queue.retry_max_backoff_ms = 100;
        assert!(matches!(config.validate(), Err(IndexError::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load_from_file("/nonexistent/quill.toml").unwrap_err();
        assert!(matches!(err, IndexError::Config(_)));
    }
}
