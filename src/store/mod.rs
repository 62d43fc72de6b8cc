//! Storage contract consumed by the pipeline.
//!
//! A store offers keyed upserts for unified entities and checkpoints, a
//! versioned read for read-modify-write, and atomic commit of a whole run
//! (every staged entity plus the checkpoint) or nothing.
//!
//! Concurrent sources touching the same (ticker, timestamp) row are
//! serialised at commit time: each staged entity remembers the row version it
//! was merged onto, and a mismatch is resolved by re-reading the row and
//! re-merging the run's contribution. Conflicts never fail a run.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use crate::checkpoint::{Checkpoint, CheckpointUpdate};
use crate::error::{Error, Result};
use crate::observability::metrics::CONCURRENCY_CONFLICTS;
use crate::types::{EntityKey, Ticker};
use crate::unify::{StagedEntity, UnifiedEntity};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub const DEFAULT_PAGE_SIZE: usize = 10;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionedEntity {
    pub entity: UnifiedEntity,
    pub version: u64,
}

/// Paginated read of unified entities, ordered by ticker then timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityQuery {
    pub ticker: Option<Ticker>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for EntityQuery {
    fn default() -> Self {
        EntityQuery {
            ticker: None,
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl EntityQuery {
    pub fn ticker(ticker: Ticker) -> Self {
        EntityQuery {
            ticker: Some(ticker),
            ..Default::default()
        }
    }

    pub fn matches(&self, entity: &UnifiedEntity) -> bool {
        self.ticker.as_ref().is_none_or(|t| *t == entity.ticker)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommitReport {
    pub entities_written: usize,
    pub conflicts_resolved: usize,
    pub checkpoint: Checkpoint,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Cheap connectivity probe.
    async fn ping(&self) -> Result<()>;

    async fn checkpoint(&self, source_name: &str) -> Result<Option<Checkpoint>>;

    async fn checkpoints(&self) -> Result<Vec<Checkpoint>>;

    /// Inserts or overwrites the checkpoint of `update.source_name` on its own.
    async fn upsert_checkpoint(&self, update: CheckpointUpdate) -> Result<Checkpoint>;

    async fn entity(&self, key: &EntityKey) -> Result<Option<VersionedEntity>>;

    async fn entities(&self, query: &EntityQuery) -> Result<Vec<UnifiedEntity>>;

    /// Writes every staged entity and the checkpoint update as one transaction.
    ///
    /// `timeout` bounds the wait. On `Error::Timeout` nothing was written;
    /// once the store has started its final commit it waits for it instead
    /// and reports the real outcome.
    async fn commit(
        &self,
        batch: crate::unify::MergeBatch,
        update: CheckpointUpdate,
        timeout: Duration,
    ) -> Result<CommitReport>;
}

/// Decides what to write for one staged entity given the row as it is now.
/// Returns the entity and whether a conflict had to be resolved.
pub(crate) fn resolve_staged(
    staged: &StagedEntity,
    current: Option<&VersionedEntity>,
) -> Result<(UnifiedEntity, bool)> {
    match staged.check_version(current) {
        Ok(()) => Ok((staged.entity.clone(), false)),
        Err(Error::ConcurrencyConflict(key)) => {
            tracing::debug!(key = %key, source = %staged.contribution.source, "Concurrent write, re-merging");
            CONCURRENCY_CONFLICTS.inc();
            Ok((staged.rebase(current), true))
        }
        Err(e) => Err(e),
    }
}

pub(crate) fn next_version(current: Option<&VersionedEntity>) -> u64 {
    current.map(|row| row.version + 1).unwrap_or(1)
}
