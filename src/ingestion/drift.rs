//! Advisory schema-drift checks. Nothing here returns an error or changes
//! control flow; findings go to the log and the drift counter.

use std::collections::BTreeSet;
use crate::observability::metrics::record_drift_warning;

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.9;

/// Keys that any market-data record should carry at least one of.
pub const COMMON_MARKET_KEYS: [&str; 8] = [
    "ticker",
    "symbol",
    "price",
    "price_usd",
    "quotes",
    "current_price",
    "s",
    "p",
];

#[derive(Clone, Debug, PartialEq)]
pub struct DriftReport {
    /// Present on the wire, absent from the expected schema.
    pub unexpected_keys: Vec<String>,
    /// Expected but not present on the wire. Informational only.
    pub missing_keys: Vec<String>,
    /// Jaccard similarity of the two key sets.
    pub similarity: f64,
    pub low_confidence: bool,
    pub no_common_keys: bool,
}

impl DriftReport {
    pub fn warnings(&self) -> usize {
        usize::from(!self.unexpected_keys.is_empty())
            + usize::from(self.low_confidence)
            + usize::from(self.no_common_keys)
    }

    pub fn is_clean(&self) -> bool {
        self.warnings() == 0
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DriftDetector {
    threshold: f64,
}

impl Default for DriftDetector {
    fn default() -> Self {
        DriftDetector::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl DriftDetector {
    pub fn new(threshold: f64) -> Self {
        DriftDetector { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn detect<'a, I>(&self, raw_keys: I, expected: &[&str], source: &str) -> DriftReport
    where
        I: IntoIterator<Item = &'a str>,
    {
        let raw: BTreeSet<&str> = raw_keys.into_iter().collect();
        let expected: BTreeSet<&str> = expected.iter().copied().collect();

        let unexpected_keys: Vec<String> = raw.difference(&expected).map(|k| k.to_string()).collect();
        let missing_keys: Vec<String> = expected.difference(&raw).map(|k| k.to_string()).collect();
        let similarity = jaccard(&raw, &expected);
        let no_common_keys = !COMMON_MARKET_KEYS.iter().any(|k| raw.contains(k));

        let report = DriftReport {
            low_confidence: similarity < self.threshold,
            unexpected_keys,
            missing_keys,
            similarity,
            no_common_keys,
        };

        if !report.unexpected_keys.is_empty() {
            tracing::warn!(
                source = %source,
                new_keys = ?report.unexpected_keys,
                "Schema drift: unexpected keys"
            );
        }
        if report.low_confidence {
            tracing::warn!(
                source = %source,
                similarity = report.similarity,
                threshold = self.threshold,
                missing_keys = ?report.missing_keys,
                "Schema drift: low similarity to expected schema"
            );
        }
        if report.no_common_keys {
            tracing::warn!(source = %source, incoming_keys = ?raw, "Schema drift: no common market keys");
        }

        for _ in 0..report.warnings() {
            record_drift_warning(source);
        }
        report
    }
}

fn jaccard(a: &BTreeSet<&str>, b: &BTreeSet<&str>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f64 / union as f64
}
