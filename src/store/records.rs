//! Record store: one row per chunk, grouped by batch id.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{IndexError, Result};
use crate::models::{BatchStatus, BatchSummary, Record, RecordStatus};

/// Outcome of a status transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The record was already terminal and kept its status
    AlreadySettled(RecordStatus),
}

/// Persistent record tracking.
///
/// Every mutation is a compare-and-swap on the single row it touches, so
/// workers finishing different chunks of one batch never race each other.
#[derive(Clone)]
pub struct RecordStore {
    db: sled::Db,
    records: sled::Tree,
    batches: sled::Tree,
}

fn batch_prefix(batch_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(batch_id.len() + 1);
    key.extend_from_slice(batch_id.as_bytes());
    key.push(0);
    key
}

fn batch_key(batch_id: &str, id: u64) -> Vec<u8> {
    let mut key = batch_prefix(batch_id);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

impl RecordStore {
    pub(super) fn new(db: sled::Db, records: sled::Tree, batches: sled::Tree) -> Result<Self> {
        Ok(Self {
            db,
            records,
            batches,
        })
    }

    /// Create a PENDING record for one chunk of `batch_id`
    pub fn create(&self, batch_id: &str, name: &str) -> Result<u64> {
        let id = self.db.generate_id()?;
        let record = Record::new(id, batch_id, name);

        self.records
            .insert(id.to_be_bytes(), serde_json::to_vec(&record)?)?;
        self.batches.insert(batch_key(batch_id, id), Vec::<u8>::new())?;

        debug!(record_id = id, batch_id, name, "Created record");
        Ok(id)
    }

    pub fn get(&self, id: u64) -> Result<Record> {
        match self.records.get(id.to_be_bytes())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(IndexError::RecordNotFound(id)),
        }
    }

    pub fn status(&self, id: u64) -> Result<RecordStatus> {
        Ok(self.get(id)?.status)
    }

    /// Stamp the start time; a no-op once the record is terminal
    pub fn mark_started(&self, id: u64) -> Result<Transition> {
        self.update(id, |record| {
            if record.status.is_terminal() {
                return None;
            }
            record.started = Some(Utc::now());
            Some(())
        })
    }

    pub fn mark_success(&self, id: u64) -> Result<Transition> {
        self.settle(id, RecordStatus::Success, None)
    }

    pub fn mark_failure(&self, id: u64, message: &str) -> Result<Transition> {
        self.settle(id, RecordStatus::Failure, Some(message.to_string()))
    }

    fn settle(&self, id: u64, status: RecordStatus, message: Option<String>) -> Result<Transition> {
        let transition = self.update(id, |record| {
            if record.status.is_terminal() {
                return None;
            }
            record.status = status;
            record.finished = Some(Utc::now());
            record.message = message.clone();
            Some(())
        })?;

        if let Transition::AlreadySettled(current) = transition {
            warn!(
                record_id = id,
                %current,
                requested = %status,
                "Record already settled, keeping existing status"
            );
        }
        Ok(transition)
    }

    /// Read-modify-CAS loop on a single row. `apply` returns `None` to leave
    /// the record untouched.
    fn update<F>(&self, id: u64, mut apply: F) -> Result<Transition>
    where
        F: FnMut(&mut Record) -> Option<()>,
    {
        let key = id.to_be_bytes();
        loop {
            let current = self
                .records
                .get(key)?
                .ok_or(IndexError::RecordNotFound(id))?;
            let mut record: Record = serde_json::from_slice(&current)?;

            if apply(&mut record).is_none() {
                return Ok(Transition::AlreadySettled(record.status));
            }

            let updated = serde_json::to_vec(&record)?;
            match self
                .records
                .compare_and_swap(key, Some(&current), Some(updated))?
            {
                Ok(()) => return Ok(Transition::Applied),
                Err(_) => continue,
            }
        }
    }

    /// Every record of a batch, in creation order
    pub fn batch_records(&self, batch_id: &str) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        for entry in self.batches.scan_prefix(batch_prefix(batch_id)) {
            let (key, _) = entry?;
            let mut id_bytes = [0u8; 8];
            id_bytes.copy_from_slice(&key[key.len() - 8..]);
            let id = u64::from_be_bytes(id_bytes);
            match self.get(id) {
                Ok(record) => records.push(record),
                // Pruned between the index scan and the row read
                Err(IndexError::RecordNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    pub fn batch_summary(&self, batch_id: &str) -> Result<BatchSummary> {
        Ok(BatchSummary::from_records(&self.batch_records(batch_id)?))
    }

    pub fn batch_status(&self, batch_id: &str) -> Result<BatchStatus> {
        Ok(self.batch_summary(batch_id)?.status())
    }

    /// Mark every still-pending record of a batch failed. Returns how many
    /// records were settled by this call.
    pub fn fail_pending(&self, batch_id: &str, message: &str) -> Result<usize> {
        let mut settled = 0;
        for record in self.batch_records(batch_id)? {
            if record.status.is_terminal() {
                continue;
            }
            if self.mark_failure(record.id, message)? == Transition::Applied {
                settled += 1;
            }
        }
        Ok(settled)
    }

    /// Distinct batch ids with their summaries
    pub fn batches(&self) -> Result<Vec<(String, BatchSummary)>> {
        let mut ids: Vec<String> = Vec::new();
        for entry in self.batches.iter() {
            let (key, _) = entry?;
            let batch_id = String::from_utf8_lossy(&key[..key.len() - 9]).into_owned();
            if ids.last() != Some(&batch_id) {
                ids.push(batch_id);
            }
        }

        ids.into_iter()
            .map(|id| {
                let summary = self.batch_summary(&id)?;
                Ok((id, summary))
            })
            .collect()
    }

    /// Delete terminal records created before `cutoff`. Pending records are
    /// kept so in-flight batches stay observable.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for entry in self.records.iter() {
            let (key, value) = entry?;
            let record: Record = serde_json::from_slice(&value)?;
            if record.status.is_terminal() && record.created < cutoff {
                self.records.remove(&key)?;
                self.batches.remove(batch_key(&record.batch_id, record.id))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
