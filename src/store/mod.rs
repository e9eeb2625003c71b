//! Embedded sled storage for feedback responses and ingestion records.

mod records;
mod responses;

pub use records::{RecordStore, Transition};
pub use responses::ResponseStore;

use std::path::Path;

use tracing::info;

use crate::error::Result;

const RECORDS_TREE: &str = "records";
const BATCHES_TREE: &str = "record_batches";
const RESPONSES_TREE: &str = "responses";

/// Handle on the sled database holding every tree
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening store at {}", path.as_ref().display());
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// In-memory database removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn records(&self) -> Result<RecordStore> {
        RecordStore::new(
            self.db.clone(),
            self.db.open_tree(RECORDS_TREE)?,
            self.db.open_tree(BATCHES_TREE)?,
        )
    }

    pub fn responses(&self) -> Result<ResponseStore> {
        Ok(ResponseStore::new(
            self.db.clone(),
            self.db.open_tree(RESPONSES_TREE)?,
        ))
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}
