use std::collections::BTreeMap;
use crate::types::{NormalizedRecord, SourceQuote};
use crate::unify::UnifiedEntity;

/// Folds one normalized record into the unified entity for its key.
///
/// The record's source slot is overwritten (last write wins per source) and
/// the aggregate value is recomputed as the mean over every slot, so the
/// result depends only on the set of contributing sources and not on the
/// order they arrived in. Secondary metrics follow the record being merged.
pub fn merge(existing: Option<UnifiedEntity>, record: &NormalizedRecord) -> UnifiedEntity {
    let mut sources = existing.map(|entity| entity.sources).unwrap_or_default();
    sources.insert(record.source.clone(), record.quote());

    UnifiedEntity {
        ticker: record.ticker.clone(),
        timestamp: record.timestamp,
        value: average(&sources),
        market_cap: record.market_cap,
        volume: record.volume,
        last_source: record.source.clone(),
        sources,
    }
}

fn average(sources: &BTreeMap<String, SourceQuote>) -> f64 {
    if sources.is_empty() {
        return 0.0;
    }
    sources.values().map(|q| q.value).sum::<f64>() / sources.len() as f64
}
