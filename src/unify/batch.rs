use std::collections::BTreeMap;
use crate::error::{Error, Result};
use crate::store::{Store, VersionedEntity};
use crate::types::{EntityKey, NormalizedRecord};
use crate::unify::{engine, UnifiedEntity};

/// A merged entity waiting for commit, with the row version it was computed from.
#[derive(Clone, Debug)]
pub struct StagedEntity {
    pub base_version: Option<u64>,
    pub entity: UnifiedEntity,
    /// The latest record this run contributed to the key.
    pub contribution: NormalizedRecord,
}

impl StagedEntity {
    /// Fails with `ConcurrencyConflict` when `current` is not the row this entity was merged onto.
    pub fn check_version(&self, current: Option<&VersionedEntity>) -> Result<()> {
        if current.map(|row| row.version) == self.base_version {
            Ok(())
        } else {
            Err(Error::ConcurrencyConflict(self.entity.key()))
        }
    }

    /// Re-merges this run's contribution onto the row as it is now.
    pub fn rebase(&self, current: Option<&VersionedEntity>) -> UnifiedEntity {
        engine::merge(current.map(|row| row.entity.clone()), &self.contribution)
    }
}

/// Unit of work for one source run. Nothing staged here is visible to
/// readers until the batch is committed; dropping it discards everything.
#[derive(Debug)]
pub struct MergeBatch {
    source: String,
    staged: BTreeMap<EntityKey, StagedEntity>,
    merged: u64,
}

impl MergeBatch {
    pub fn new(source: impl Into<String>) -> Self {
        MergeBatch {
            source: source.into(),
            staged: BTreeMap::new(),
            merged: 0,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Merges `record` onto the staged entity for its key, reading the
    /// committed row from `store` the first time the key is seen.
    pub async fn merge<S>(&mut self, store: &S, record: NormalizedRecord) -> Result<&UnifiedEntity>
    where
        S: Store + ?Sized,
    {
        let key = record.key();
        let current = if self.staged.contains_key(&key) {
            None
        } else {
            store.entity(&key).await?
        };
        Ok(self.stage(record, current))
    }

    /// Staging step of `merge` once the committed row (if needed) is known.
    pub fn stage(&mut self, record: NormalizedRecord, current: Option<VersionedEntity>) -> &UnifiedEntity {
        self.merged += 1;
        let key = record.key();

        let staged = match self.staged.remove(&key) {
            Some(mut staged) => {
                staged.entity = engine::merge(Some(staged.entity), &record);
                staged.contribution = record;
                staged
            }
            None => {
                let base_version = current.as_ref().map(|row| row.version);
                StagedEntity {
                    base_version,
                    entity: engine::merge(current.map(|row| row.entity), &record),
                    contribution: record,
                }
            }
        };

        &self.staged.entry(key).or_insert(staged).entity
    }

    /// Number of records merged, counting repeats of the same key.
    pub fn records_merged(&self) -> u64 {
        self.merged
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub fn staged(&self) -> impl Iterator<Item = (&EntityKey, &StagedEntity)> {
        self.staged.iter()
    }

    pub fn into_staged(self) -> BTreeMap<EntityKey, StagedEntity> {
        self.staged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Ticker;
    use chrono::{TimeZone, Utc};

    fn record(source: &str, ticker: &str, price: f64) -> NormalizedRecord {
        NormalizedRecord::new(
            Ticker::parse(ticker).unwrap(),
            price,
            None,
            None,
            source,
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn staging_onto_committed_row_keeps_its_version() {
        let committed = VersionedEntity {
            entity: engine::merge(None, &record("a", "BTC", 100.0)),
            version: 4,
        };
        let mut batch = MergeBatch::new("b");
        let entity = batch.stage(record("b", "BTC", 200.0), Some(committed));
        assert_eq!(entity.value, 150.0);

        let (_, staged) = batch.staged().next().unwrap();
        assert_eq!(staged.base_version, Some(4));
    }

    #[test]
    fn repeated_key_in_one_run_overwrites_own_slot() {
        let mut batch = MergeBatch::new("a");
        batch.stage(record("a", "BTC", 100.0), None);
        let entity = batch.stage(record("a", "BTC", 120.0), None);
        assert_eq!(entity.value, 120.0);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.records_merged(), 2);
    }

    #[test]
    fn version_check_detects_concurrent_commit() {
        let mut batch = MergeBatch::new("b");
        batch.stage(record("b", "BTC", 200.0), None);
        let (_, staged) = batch.staged().next().unwrap();

        assert!(staged.check_version(None).is_ok());

        let concurrent = VersionedEntity {
            entity: engine::merge(None, &record("a", "BTC", 100.0)),
            version: 1,
        };
        assert!(matches!(
            staged.check_version(Some(&concurrent)),
            Err(Error::ConcurrencyConflict(_))
        ));

        let rebased = staged.rebase(Some(&concurrent));
        assert_eq!(rebased.value, 150.0);
        assert_eq!(rebased.sources.len(), 2);
    }
}
