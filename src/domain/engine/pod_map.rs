use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::interval::active_interval;
use crate::core::keys::PodKey;
use crate::core::window::Window;
use crate::errors::CostError;
use crate::domain::allocation::allocation::{Allocation, AllocationProperties};
use crate::source::data_source::{AllocationQuery, DataSource};
use crate::source::rows::PodRow;
use crate::source::types::MetricRow;

/// One pod under construction: its active interval plus a container-name →
/// allocation slot map. Created on the first metric row naming the pod,
/// extended by later rows, discarded when the computation ends.
#[derive(Clone, Debug)]
pub struct PodEntry {
    pub key: PodKey,
    pub node: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub allocations: BTreeMap<String, Allocation>,
}

impl PodEntry {
    pub fn minutes(&self) -> f64 {
        if self.end <= self.start {
            return 0.0;
        }
        (self.end - self.start).num_seconds() as f64 / 60.0
    }

    pub fn hours(&self) -> f64 {
        self.minutes() / 60.0
    }

    /// Container slot, created on first touch with the pod's identity and
    /// active interval.
    pub fn allocation_mut(&mut self, container: &str, window: &Window) -> &mut Allocation {
        self.allocations
            .entry(container.to_string())
            .or_insert_with(|| {
                let properties = AllocationProperties {
                    cluster: self.key.cluster.clone(),
                    node: self.node.clone(),
                    namespace: self.key.namespace.clone(),
                    pod: self.key.pod.clone(),
                    container: container.to_string(),
                    ..Default::default()
                };
                let mut alloc = Allocation::new(properties, *window);
                alloc.start = Some(self.start);
                alloc.end = Some(self.end);
                alloc
            })
    }
}

/// The pod skeleton every later join keys off, plus the UID-less → UID-ful
/// sidecar that lets rows without a UID fan out to the right entries.
pub struct PodMap {
    pub window: Window,
    pods: HashMap<PodKey, PodEntry>,
    uid_index: HashMap<PodKey, Vec<PodKey>>,
    pub ingest_uid: bool,
}

impl PodMap {
    pub fn build(
        rows: &[PodRow],
        resolution: Duration,
        window: &Window,
        now: DateTime<Utc>,
        ingest_uid: bool,
    ) -> PodMap {
        let mut map = PodMap {
            window: *window,
            pods: HashMap::new(),
            uid_index: HashMap::new(),
            ingest_uid,
        };

        // When UID ingestion is on and any row carries a UID, the UID-less
        // rows are duplicates of the same series and are dropped.
        let any_uid = ingest_uid && rows.iter().any(|r| r.uid.is_some());

        for row in rows {
            let (s, e) = match active_interval(&row.samples, resolution, window, now) {
                Some(interval) => interval,
                None => continue,
            };

            let key = match (&row.uid, any_uid) {
                (Some(uid), true) => {
                    let uid_key = row.key.with_uid(uid);
                    let fanout = map.uid_index.entry(row.key.clone()).or_default();
                    if !fanout.contains(&uid_key) {
                        fanout.push(uid_key.clone());
                    }
                    uid_key
                }
                (None, true) => continue,
                _ => row.key.clone(),
            };

            match map.pods.get_mut(&key) {
                Some(entry) => {
                    entry.start = entry.start.min(s);
                    entry.end = entry.end.max(e);
                    if entry.node.is_empty() {
                        if let Some(node) = &row.node {
                            entry.node = node.clone();
                        }
                    }
                }
                None => {
                    map.pods.insert(
                        key.clone(),
                        PodEntry {
                            key,
                            node: row.node.clone().unwrap_or_default(),
                            start: s,
                            end: e,
                            allocations: BTreeMap::new(),
                        },
                    );
                }
            }
        }

        debug!(
            "pod map: {} pod(s), {} uid fan-out key(s)",
            map.pods.len(),
            map.uid_index.len()
        );
        map
    }

    /// Keys a metric row's pod key resolves to: the key itself when present,
    /// otherwise its UID-ful variants. Empty means the row references a pod
    /// the skeleton never saw; the row is silently ignored.
    pub fn resolve(&self, key: &PodKey) -> Vec<PodKey> {
        if self.pods.contains_key(key) {
            return vec![key.clone()];
        }
        self.uid_index.get(key).cloned().unwrap_or_default()
    }

    pub fn get(&self, key: &PodKey) -> Option<&PodEntry> {
        self.pods.get(key)
    }

    pub fn get_mut(&mut self, key: &PodKey) -> Option<&mut PodEntry> {
        self.pods.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &PodEntry> {
        self.pods.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut PodEntry> {
        self.pods.values_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &PodKey> {
        self.pods.keys()
    }
}

const POD_QUERY_ATTEMPTS: usize = 3;

/// Run the pods query with up to three attempts. Only this query retries:
/// it is the skeleton every later join keys off, so a transient failure
/// here would void the whole computation.
pub async fn query_pods(
    source: &dyn DataSource,
    window: &Window,
    ingest_uid: bool,
    cancel: &CancellationToken,
) -> Result<Vec<MetricRow>, CostError> {
    let query = if ingest_uid {
        AllocationQuery::PodsUid
    } else {
        AllocationQuery::Pods
    };

    let mut last_error = String::new();
    for attempt in 1..=POD_QUERY_ATTEMPTS {
        if cancel.is_cancelled() {
            return Err(CostError::Cancelled);
        }
        match source.query_range(query, window).await {
            Ok(rows) if !rows.is_empty() => return Ok(rows),
            Ok(_) => {
                last_error = format!("{}: empty result", query.name());
                warn!("pods query attempt {}/{} returned no rows", attempt, POD_QUERY_ATTEMPTS);
            }
            Err(err) => {
                last_error = format!("{}: {}", query.name(), err);
                warn!(
                    "pods query attempt {}/{} failed: {}",
                    attempt, POD_QUERY_ATTEMPTS, err
                );
            }
        }
    }
    Err(CostError::FatalInput(format!(
        "pods query failed after {} attempts: {}",
        POD_QUERY_ATTEMPTS, last_error
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::rows::pod_rows;
    use crate::source::types::Sample;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ts(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap() + Duration::minutes(min as i64)
    }

    fn window() -> Window {
        Window::new(ts(0), ts(60)).unwrap()
    }

    fn raw_row(pod: &str, uid: Option<&str>, minutes: &[u32]) -> MetricRow {
        let mut labels: BTreeMap<String, String> = BTreeMap::new();
        labels.insert("namespace".into(), "default".into());
        labels.insert("pod".into(), pod.into());
        labels.insert("node".into(), "n1".into());
        if let Some(uid) = uid {
            labels.insert("uid".into(), uid.into());
        }
        MetricRow {
            labels,
            samples: minutes
                .iter()
                .map(|m| Sample {
                    timestamp: ts(*m),
                    value: 1.0,
                })
                .collect(),
        }
    }

    #[test]
    fn builds_entries_with_clamped_intervals() {
        let rows = pod_rows(
            &[raw_row("web-0", None, &[0, 30, 59])],
            "c1",
            AllocationQuery::Pods,
        );
        let map = PodMap::build(&rows, Duration::minutes(1), &window(), ts(60), false);
        assert_eq!(map.len(), 1);
        let entry = map.get(&PodKey::new("c1", "default", "web-0")).unwrap();
        assert_eq!(entry.start, ts(0));
        assert_eq!(entry.end, ts(59));
        assert_eq!(entry.node, "n1");
    }

    #[test]
    fn uid_rows_win_and_fan_out_is_recorded() {
        let rows = pod_rows(
            &[
                raw_row("web-0", Some("u1"), &[0, 30]),
                raw_row("web-0", Some("u2"), &[30, 59]),
                raw_row("web-0", None, &[0, 59]),
            ],
            "c1",
            AllocationQuery::PodsUid,
        );
        let map = PodMap::build(&rows, Duration::minutes(1), &window(), ts(60), true);
        assert_eq!(map.len(), 2);
        let base = PodKey::new("c1", "default", "web-0");
        let resolved = map.resolve(&base);
        assert_eq!(resolved.len(), 2);
        assert!(resolved.contains(&base.with_uid("u1")));
        assert!(resolved.contains(&base.with_uid("u2")));
    }

    #[test]
    fn unknown_pods_resolve_to_nothing() {
        let map = PodMap::build(&[], Duration::minutes(1), &window(), ts(60), false);
        assert!(map.resolve(&PodKey::new("c1", "default", "ghost")).is_empty());
    }

    struct CountingSource {
        calls: AtomicUsize,
        fail_times: usize,
    }

    #[async_trait]
    impl DataSource for CountingSource {
        async fn query_range(
            &self,
            _query: AllocationQuery,
            _window: &Window,
        ) -> Result<Vec<MetricRow>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(anyhow!("transient"))
            } else {
                Ok(vec![raw_row("web-0", None, &[0])])
            }
        }

        fn resolution(&self) -> Duration {
            Duration::minutes(1)
        }

        fn batch_duration(&self) -> Duration {
            Duration::hours(24)
        }
    }

    #[tokio::test]
    async fn pods_query_retries_twice_then_succeeds() {
        let source = CountingSource {
            calls: AtomicUsize::new(0),
            fail_times: 2,
        };
        let rows = query_pods(&source, &window(), false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn pods_query_is_fatal_after_three_failures() {
        let source = CountingSource {
            calls: AtomicUsize::new(0),
            fail_times: 5,
        };
        let err = query_pods(&source, &window(), false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CostError::FatalInput(_)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }
}
