//! Bulk writing of one chunk into a concrete index.

use std::sync::Arc;

use tracing::{debug, warn};

use super::mapping::DynMapping;
use crate::error::{IndexError, Result};
use crate::search::SearchBackend;

/// What happened to one chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkReport {
    pub requested: usize,
    pub indexed: usize,
    /// Ids that no longer resolved to a live object
    pub skipped: usize,
}

/// Writes chunks of domain objects into the search index.
///
/// Has no access to the record store; turning outcomes into record status
/// is the dispatcher's job.
#[derive(Clone)]
pub struct IndexWriter {
    backend: Arc<dyn SearchBackend>,
}

impl IndexWriter {
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self { backend }
    }

    /// Fetch, convert and bulk write `ids` into `index` in one round trip.
    ///
    /// Any rejected document fails the whole chunk.
    pub async fn index_chunk(
        &self,
        mapping: &dyn DynMapping,
        index: &str,
        ids: &[u64],
    ) -> Result<ChunkReport> {
        let docs = mapping.fetch_documents(ids).await?;
        let skipped = ids.len().saturating_sub(docs.len());
        if skipped > 0 {
            debug!(
                "{} of {} {} ids no longer exist, skipping",
                skipped,
                ids.len(),
                mapping.name()
            );
        }

        if docs.is_empty() {
            return Ok(ChunkReport {
                requested: ids.len(),
                indexed: 0,
                skipped,
            });
        }

        let outcome = self.backend.bulk_index(index, &docs).await?;
        if !outcome.is_complete() {
            let reason = outcome.rejected[0].reason.clone();
            warn!(
                "Bulk write to {} rejected {} of {} documents",
                index,
                outcome.rejected.len(),
                docs.len()
            );
            return Err(IndexError::PartialBulkFailure {
                rejected: outcome.rejected.into_iter().map(|r| r.id).collect(),
                total: docs.len(),
                reason,
            });
        }

        Ok(ChunkReport {
            requested: ids.len(),
            indexed: outcome.indexed,
            skipped,
        })
    }
}
