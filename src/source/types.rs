use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, OnceLock};
use tracing::warn;

/// One point of a time-series result.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// One row of a time-series query result: an identifier label set plus an
/// ordered sample series. Typed projections below pull the fields each
/// consumer needs; a row missing a required field is skipped with a
/// deduplicated warning.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricRow {
    pub labels: BTreeMap<String, String>,
    pub samples: Vec<Sample>,
}

impl MetricRow {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(|s| s.as_str())
    }

    /// Identifier field that must be present and non-empty.
    pub fn required(&self, name: &str, query: &str) -> Option<&str> {
        match self.label(name) {
            Some(v) if !v.is_empty() => Some(v),
            _ => {
                warn_once(
                    query,
                    name,
                    format!("{}: row missing required field '{}', skipped", query, name),
                );
                None
            }
        }
    }

    /// Cluster field with fallback to the configured default cluster id.
    pub fn cluster_or<'a>(&'a self, default_cluster: &'a str) -> &'a str {
        match self.label("cluster_id") {
            Some(v) if !v.is_empty() => v,
            _ => default_cluster,
        }
    }

    /// Mean of the sample values. Zero for an empty series.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.value).sum::<f64>() / self.samples.len() as f64
    }

    /// Largest sample value. Zero for an empty series.
    pub fn max(&self) -> f64 {
        self.samples
            .iter()
            .map(|s| s.value)
            .fold(0.0_f64, f64::max)
    }

    /// Sum of the sample values; used for cumulative-quantity queries.
    pub fn sum(&self) -> f64 {
        self.samples.iter().map(|s| s.value).sum()
    }

    /// Extract sub-labels carried with a prefix convention, e.g. pod labels
    /// arriving as `label_app`, `label_tier` on a labels query row.
    pub fn prefixed_labels(&self, prefix: &str) -> BTreeMap<String, String> {
        self.labels
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(prefix)
                    .map(|name| (name.to_string(), v.clone()))
            })
            .collect()
    }
}

/// Log a row-skip warning once per (query, field) template. A malformed
/// scrape can produce millions of identical rows; one line is enough.
pub fn warn_once(query: &str, field: &str, message: String) {
    static SEEN: OnceLock<Mutex<HashSet<(String, String)>>> = OnceLock::new();
    let seen = SEEN.get_or_init(|| Mutex::new(HashSet::new()));
    let key = (query.to_string(), field.to_string());
    let mut guard = match seen.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    if guard.insert(key) {
        warn!("{}", message);
    }
}
