use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::RwLock;
use crate::checkpoint::{Checkpoint, CheckpointUpdate};
use crate::error::{Error, Result};
use crate::store::{next_version, resolve_staged, CommitReport, EntityQuery, Store, VersionedEntity};
use crate::types::EntityKey;
use crate::unify::{MergeBatch, UnifiedEntity};

#[derive(Default)]
struct Tables {
    entities: BTreeMap<EntityKey, VersionedEntity>,
    checkpoints: BTreeMap<String, Checkpoint>,
}

/// Process-local store. Commits hold the write lock for the whole batch, so
/// readers see either none or all of a run.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn checkpoint(&self, source_name: &str) -> Result<Option<Checkpoint>> {
        Ok(self.tables.read().await.checkpoints.get(source_name).cloned())
    }

    async fn checkpoints(&self) -> Result<Vec<Checkpoint>> {
        Ok(self.tables.read().await.checkpoints.values().cloned().collect())
    }

    async fn upsert_checkpoint(&self, update: CheckpointUpdate) -> Result<Checkpoint> {
        let mut tables = self.tables.write().await;
        let existing = tables.checkpoints.remove(&update.source_name);
        let checkpoint = Checkpoint::apply(existing, &update);
        tables.checkpoints.insert(update.source_name.clone(), checkpoint.clone());
        Ok(checkpoint)
    }

    async fn entity(&self, key: &EntityKey) -> Result<Option<VersionedEntity>> {
        Ok(self.tables.read().await.entities.get(key).cloned())
    }

    async fn entities(&self, query: &EntityQuery) -> Result<Vec<UnifiedEntity>> {
        let tables = self.tables.read().await;
        Ok(tables.entities.values()
            .map(|row| &row.entity)
            .filter(|entity| query.matches(entity))
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn commit(&self, batch: MergeBatch, update: CheckpointUpdate, timeout: Duration) -> Result<CommitReport> {
        // Nothing below awaits, so the wait for the lock is the only part that can time out.
        let mut tables = tokio::time::timeout(timeout, self.tables.write())
            .await
            .map_err(|_| Error::Timeout(timeout))?;

        // Resolve everything before touching the tables.
        let mut writes = Vec::with_capacity(batch.len());
        let mut conflicts_resolved = 0;
        for (key, staged) in batch.into_staged() {
            let current = tables.entities.get(&key);
            let (entity, conflicted) = resolve_staged(&staged, current)?;
            if conflicted {
                conflicts_resolved += 1;
            }
            writes.push((key, VersionedEntity { entity, version: next_version(current) }));
        }

        let entities_written = writes.len();
        tables.entities.extend(writes);

        let existing = tables.checkpoints.remove(&update.source_name);
        let checkpoint = Checkpoint::apply(existing, &update);
        tables.checkpoints.insert(update.source_name.clone(), checkpoint.clone());

        Ok(CommitReport {
            entities_written,
            conflicts_resolved,
            checkpoint,
        })
    }
}
