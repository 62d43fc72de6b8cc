use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use crate::checkpoint::{Checkpoint, CheckpointUpdate, RunStatus};
use crate::error::{Error, Result};
use crate::store::{next_version, resolve_staged, CommitReport, EntityQuery, Store, VersionedEntity};
use crate::types::{EntityKey, Ticker, Timestamp};
use crate::unify::{MergeBatch, UnifiedEntity};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS unified_entities (
    entity_key TEXT NOT NULL,
    ts_micros INTEGER NOT NULL,
    value REAL NOT NULL,
    market_cap REAL,
    volume REAL,
    last_source TEXT NOT NULL,
    sources_json TEXT NOT NULL,
    version INTEGER NOT NULL,
    PRIMARY KEY (entity_key, ts_micros)
);
CREATE TABLE IF NOT EXISTS etl_checkpoints (
    source_name TEXT PRIMARY KEY,
    high_water_mark_micros INTEGER,
    last_status TEXT NOT NULL,
    records_processed INTEGER NOT NULL DEFAULT 0,
    run_duration_ms INTEGER NOT NULL DEFAULT 0,
    error_log TEXT
);
";

/// SQLite-backed store. Commits run as `BEGIN IMMEDIATE` transactions, which
/// take the database write lock up front; any error rolls the whole run back.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::Storage(format!("blocking task failed: {}", e)))?
    }
}

fn to_micros(ts: Timestamp) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(micros: i64) -> rusqlite::Result<Timestamp> {
    DateTime::from_timestamp_micros(micros).ok_or(rusqlite::Error::IntegralValueOutOfRange(1, micros))
}

fn conversion_error(column: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<VersionedEntity> {
    let ticker: String = row.get(0)?;
    let sources_json: String = row.get(6)?;
    let version: i64 = row.get(7)?;
    Ok(VersionedEntity {
        entity: UnifiedEntity {
            ticker: Ticker::parse(&ticker).map_err(|e| conversion_error(0, e))?,
            timestamp: from_micros(row.get(1)?)?,
            value: row.get(2)?,
            market_cap: row.get(3)?,
            volume: row.get(4)?,
            last_source: row.get(5)?,
            sources: serde_json::from_str(&sources_json).map_err(|e| conversion_error(6, e))?,
        },
        version: version as u64,
    })
}

fn checkpoint_from_row(row: &Row<'_>) -> rusqlite::Result<Checkpoint> {
    let status: String = row.get(2)?;
    let records: i64 = row.get(3)?;
    let duration: i64 = row.get(4)?;
    Ok(Checkpoint {
        source_name: row.get(0)?,
        high_water_mark: row.get::<_, Option<i64>>(1)?.map(from_micros).transpose()?,
        last_status: RunStatus::parse(&status).unwrap_or(RunStatus::Failure),
        records_processed: records as u64,
        run_duration_ms: duration as u64,
        last_error: row.get(5)?,
    })
}

const SELECT_ENTITY: &str = "SELECT entity_key, ts_micros, value, market_cap, volume, last_source, sources_json, version
     FROM unified_entities";

const SELECT_CHECKPOINT: &str = "SELECT source_name, high_water_mark_micros, last_status, records_processed, run_duration_ms, error_log
     FROM etl_checkpoints";

fn read_entity(conn: &Connection, key: &EntityKey) -> Result<Option<VersionedEntity>> {
    let mut stmt = conn.prepare_cached(&format!("{} WHERE entity_key = ?1 AND ts_micros = ?2", SELECT_ENTITY))?;
    Ok(stmt
        .query_row(params![key.ticker.as_str(), to_micros(key.timestamp)], entity_from_row)
        .optional()?)
}

fn write_entity(conn: &Connection, row: &VersionedEntity) -> Result<()> {
    let sources_json = serde_json::to_string(&row.entity.sources)
        .map_err(|e| Error::Storage(format!("encode sources: {}", e)))?;
    conn.execute(
        "INSERT INTO unified_entities
            (entity_key, ts_micros, value, market_cap, volume, last_source, sources_json, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(entity_key, ts_micros) DO UPDATE SET
            value = excluded.value,
            market_cap = excluded.market_cap,
            volume = excluded.volume,
            last_source = excluded.last_source,
            sources_json = excluded.sources_json,
            version = excluded.version",
        params![
            row.entity.ticker.as_str(),
            to_micros(row.entity.timestamp),
            row.entity.value,
            row.entity.market_cap,
            row.entity.volume,
            row.entity.last_source,
            sources_json,
            row.version as i64,
        ],
    )?;
    Ok(())
}

fn read_checkpoint(conn: &Connection, source_name: &str) -> Result<Option<Checkpoint>> {
    let mut stmt = conn.prepare_cached(&format!("{} WHERE source_name = ?1", SELECT_CHECKPOINT))?;
    Ok(stmt.query_row(params![source_name], checkpoint_from_row).optional()?)
}

fn write_checkpoint(conn: &Connection, update: &CheckpointUpdate) -> Result<Checkpoint> {
    let checkpoint = Checkpoint::apply(read_checkpoint(conn, &update.source_name)?, update);
    conn.execute(
        "INSERT INTO etl_checkpoints
            (source_name, high_water_mark_micros, last_status, records_processed, run_duration_ms, error_log)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(source_name) DO UPDATE SET
            high_water_mark_micros = excluded.high_water_mark_micros,
            last_status = excluded.last_status,
            records_processed = excluded.records_processed,
            run_duration_ms = excluded.run_duration_ms,
            error_log = excluded.error_log",
        params![
            checkpoint.source_name,
            checkpoint.high_water_mark.map(to_micros),
            checkpoint.last_status.as_str(),
            checkpoint.records_processed as i64,
            checkpoint.run_duration_ms as i64,
            checkpoint.last_error,
        ],
    )?;
    Ok(checkpoint)
}

#[async_trait]
impl Store for SqliteStore {
    async fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }

    async fn checkpoint(&self, source_name: &str) -> Result<Option<Checkpoint>> {
        let source_name = source_name.to_string();
        self.with_conn(move |conn| read_checkpoint(conn, &source_name)).await
    }

    async fn checkpoints(&self) -> Result<Vec<Checkpoint>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!("{} ORDER BY source_name", SELECT_CHECKPOINT))?;
            let rows = stmt.query_map([], checkpoint_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn upsert_checkpoint(&self, update: CheckpointUpdate) -> Result<Checkpoint> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let checkpoint = write_checkpoint(&tx, &update)?;
            tx.commit()?;
            Ok(checkpoint)
        })
        .await
    }

    async fn entity(&self, key: &EntityKey) -> Result<Option<VersionedEntity>> {
        let key = key.clone();
        self.with_conn(move |conn| read_entity(conn, &key)).await
    }

    async fn entities(&self, query: &EntityQuery) -> Result<Vec<UnifiedEntity>> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "{} WHERE (?1 IS NULL OR entity_key = ?1) ORDER BY entity_key, ts_micros LIMIT ?2 OFFSET ?3",
                SELECT_ENTITY
            ))?;
            let rows = stmt.query_map(
                params![
                    query.ticker.as_ref().map(|t| t.as_str().to_string()),
                    query.limit as i64,
                    query.offset as i64,
                ],
                entity_from_row,
            )?;
            Ok(rows.map(|row| row.map(|r| r.entity)).collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn commit(&self, batch: MergeBatch, update: CheckpointUpdate, timeout: Duration) -> Result<CommitReport> {
        // The blocking task outlives a caller that stops waiting, so it may
        // only COMMIT after claiming the state the waiting side abandons.
        let state = CommitState::default();
        let claim = Arc::clone(&state.0);
        let conn = Arc::clone(&self.conn);
        let source = update.source_name.clone();

        let mut task = tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut entities_written = 0;
            let mut conflicts_resolved = 0;
            for (key, staged) in batch.into_staged() {
                let current = read_entity(&tx, &key)?;
                let (entity, conflicted) = resolve_staged(&staged, current.as_ref())?;
                if conflicted {
                    conflicts_resolved += 1;
                }
                let version = next_version(current.as_ref());
                write_entity(&tx, &VersionedEntity { entity, version })?;
                entities_written += 1;
            }

            let checkpoint = write_checkpoint(&tx, &update)?;
            if claim
                .compare_exchange(PENDING, COMMITTING, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(Error::Storage("commit abandoned by caller".to_string()));
            }
            tx.commit()?;

            Ok(CommitReport {
                entities_written,
                conflicts_resolved,
                checkpoint,
            })
        });

        let waited = tokio::time::timeout(timeout, &mut task).await;
        let joined = match waited {
            Ok(joined) => joined,
            Err(_) if state.abandon() => return Err(Error::Timeout(timeout)),
            Err(_) => {
                tracing::warn!(source = %source, "Commit timeout hit during COMMIT, waiting for it to land");
                task.await
            }
        };
        joined.map_err(|e| Error::Storage(format!("blocking task failed: {}", e)))?
    }
}

const PENDING: u8 = 0;
const COMMITTING: u8 = 1;
const ABANDONED: u8 = 2;

/// Who gets past `PENDING` first: the blocking task claiming COMMIT, or the
/// waiting side abandoning on timeout or drop. Exactly one of them wins.
#[derive(Default)]
struct CommitState(Arc<AtomicU8>);

impl CommitState {
    fn abandon(&self) -> bool {
        self.0
            .compare_exchange(PENDING, ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Drop for CommitState {
    fn drop(&mut self) {
        self.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NormalizedRecord;
    use chrono::{TimeZone, Utc};

    const WAIT: Duration = Duration::from_secs(5);

    fn record(source: &str, price: f64) -> NormalizedRecord {
        NormalizedRecord::new(
            Ticker::parse("BTC").unwrap(),
            price,
            Some(1e12),
            None,
            source,
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn entities_round_trip_through_sqlite() {
        let store = SqliteStore::in_memory().unwrap();
        let mut batch = MergeBatch::new("a");
        batch.merge(&store, record("a", 100.0)).await.unwrap();
        store
            .commit(batch, CheckpointUpdate::success("a", 1, Duration::from_millis(3), None), WAIT)
            .await
            .unwrap();

        let mut batch = MergeBatch::new("b");
        batch.merge(&store, record("b", 200.0)).await.unwrap();
        store
            .commit(batch, CheckpointUpdate::success("b", 1, Duration::from_millis(3), None), WAIT)
            .await
            .unwrap();

        let row = store.entity(&record("a", 0.0).key()).await.unwrap().unwrap();
        assert_eq!(row.version, 2);
        assert_eq!(row.entity.value, 150.0);
        assert_eq!(row.entity.market_cap, Some(1e12));
        assert_eq!(row.entity.sources["a"].value, 100.0);
        assert_eq!(row.entity.sources["b"].value, 200.0);
    }

    #[tokio::test]
    async fn checkpoint_failure_keeps_mark_in_sqlite() {
        let store = SqliteStore::in_memory().unwrap();
        let mark = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        store
            .upsert_checkpoint(CheckpointUpdate::success("a", 4, Duration::ZERO, Some(mark)))
            .await
            .unwrap();
        store
            .upsert_checkpoint(CheckpointUpdate::failure("a", Duration::ZERO, "network down"))
            .await
            .unwrap();

        let cp = store.checkpoint("a").await.unwrap().unwrap();
        assert_eq!(cp.last_status, RunStatus::Failure);
        assert_eq!(cp.high_water_mark, Some(mark));
        assert_eq!(cp.last_error.as_deref(), Some("network down"));
        assert_eq!(store.checkpoints().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merge.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            let mut batch = MergeBatch::new("a");
            batch.merge(&store, record("a", 100.0)).await.unwrap();
            store.commit(batch, CheckpointUpdate::success("a", 1, Duration::ZERO, None), WAIT).await.unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        let all = reopened.entities(&EntityQuery::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value, 100.0);
    }

    #[tokio::test]
    async fn timed_out_commit_never_lands() {
        let store = SqliteStore::in_memory().unwrap();
        let mut batch = MergeBatch::new("a");
        batch.merge(&store, record("a", 100.0)).await.unwrap();

        // Another writer holds the connection past the deadline.
        let busy = store.conn.lock();
        let err = store
            .commit(batch, CheckpointUpdate::success("a", 1, Duration::ZERO, None), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        drop(busy);

        // Let the blocking half reach its claim and roll back.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.entities(&EntityQuery::default()).await.unwrap().is_empty());
        assert!(store.checkpoint("a").await.unwrap().is_none());
    }

    #[test]
    fn commit_and_abandon_are_mutually_exclusive() {
        let state = CommitState::default();
        assert!(state.0.compare_exchange(PENDING, COMMITTING, Ordering::SeqCst, Ordering::SeqCst).is_ok());
        assert!(!state.abandon());

        let state = CommitState::default();
        assert!(state.abandon());
        assert!(state.0.compare_exchange(PENDING, COMMITTING, Ordering::SeqCst, Ordering::SeqCst).is_err());
    }
}
