use std::collections::{BTreeMap, BTreeSet, HashMap};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::window::Window;
use crate::domain::allocation::allocation::RawAllocationOnly;
use crate::domain::allocation::props::{AccumulateOption, AllocationFilter, AllocationProperty};
use crate::domain::allocation::range::AllocationSetRange;
use crate::domain::allocation::set::{aggregation_name, AllocationSet};
use crate::domain::engine::{AllocationEngine, ComputeOptions};
use crate::errors::CostError;

/// One façade query: window, shaping, and toggles. Ordering downstream is
/// strict: filter, then aggregate, then accumulate.
#[derive(Clone, Debug)]
pub struct AllocationRequest {
    pub window: Window,
    pub aggregate: Vec<AllocationProperty>,
    pub accumulate: AccumulateOption,
    pub filter: AllocationFilter,
    pub include_idle: bool,
    pub idle_by_node: bool,
    /// Spread the idle buckets' cost across the surviving allocations in
    /// proportion to their own cost instead of reporting them separately.
    pub share_idle: bool,
    /// Treat load-balancer cost as shared infrastructure rather than a
    /// directly attributed component.
    pub share_load_balancer: bool,
    pub ingest_uid: bool,
}

impl AllocationRequest {
    pub fn over(window: Window) -> Self {
        AllocationRequest {
            window,
            aggregate: Vec::new(),
            accumulate: AccumulateOption::None,
            filter: AllocationFilter::none(),
            include_idle: true,
            idle_by_node: false,
            share_idle: false,
            share_load_balancer: false,
            ingest_uid: true,
        }
    }
}

/// Non-scalar properties and raw maxima dropped by accumulation, collected
/// per post-aggregation name before the fold and reattached after it.
#[derive(Default)]
struct SideMaps {
    labels: HashMap<String, BTreeMap<String, String>>,
    annotations: HashMap<String, BTreeMap<String, String>>,
    services: HashMap<String, BTreeSet<String>>,
    cpu_max: HashMap<String, f64>,
    ram_max: HashMap<String, f64>,
    gpu_max: HashMap<String, f64>,
}

impl SideMaps {
    fn collect(&mut self, set: &AllocationSet, aggregate: &[AllocationProperty]) {
        for alloc in set.allocations.values() {
            let name = aggregation_name(alloc, aggregate);
            self.labels
                .entry(name.clone())
                .or_default()
                .extend(alloc.properties.labels.clone());
            self.annotations
                .entry(name.clone())
                .or_default()
                .extend(alloc.properties.annotations.clone());
            self.services
                .entry(name.clone())
                .or_default()
                .extend(alloc.properties.services.iter().cloned());
            if let Some(raw) = &alloc.raw_allocation_only {
                let max_into = |slot: &mut HashMap<String, f64>, value: f64| {
                    let entry = slot.entry(name.clone()).or_insert(0.0);
                    *entry = entry.max(value);
                };
                max_into(&mut self.cpu_max, raw.cpu_core_usage_max);
                max_into(&mut self.ram_max, raw.ram_byte_usage_max);
                max_into(&mut self.gpu_max, raw.gpu_usage_max);
            }
        }
    }

    fn reattach(&self, set: &mut AllocationSet) {
        for (name, alloc) in set.allocations.iter_mut() {
            if let Some(labels) = self.labels.get(name) {
                if !labels.is_empty() {
                    alloc.properties.labels = labels.clone();
                }
            }
            if let Some(annotations) = self.annotations.get(name) {
                if !annotations.is_empty() {
                    alloc.properties.annotations = annotations.clone();
                }
            }
            if let Some(services) = self.services.get(name) {
                if !services.is_empty() {
                    alloc.properties.services = services.iter().cloned().collect();
                }
            }
            let cpu = self.cpu_max.get(name).copied().unwrap_or(0.0);
            let ram = self.ram_max.get(name).copied().unwrap_or(0.0);
            let gpu = self.gpu_max.get(name).copied().unwrap_or(0.0);
            if cpu > 0.0 || ram > 0.0 || gpu > 0.0 {
                let raw = alloc
                    .raw_allocation_only
                    .get_or_insert_with(RawAllocationOnly::default);
                raw.cpu_core_usage_max = cpu;
                raw.ram_byte_usage_max = ram;
                raw.gpu_usage_max = gpu;
            }
        }
    }
}

/// Move load-balancer cost into the shared component. Total cost per
/// allocation is unchanged; the per-balancer detail stays in the raw block.
fn share_load_balancer_costs(set: &mut AllocationSet) {
    for alloc in set.allocations.values_mut() {
        if alloc.load_balancer_cost != 0.0 {
            alloc.shared_cost += alloc.load_balancer_cost;
            alloc.load_balancer_cost = 0.0;
        }
    }
}

/// Remove the idle buckets and spread their cost across the remaining
/// allocations in proportion to each one's total cost.
fn share_idle_costs(set: &mut AllocationSet) {
    let idle_cost: f64 = set
        .allocations
        .values()
        .filter(|a| a.is_idle())
        .map(|a| a.total_cost())
        .sum();
    if idle_cost <= 0.0 {
        set.allocations.retain(|_, a| !a.is_idle());
        return;
    }
    set.allocations.retain(|_, a| !a.is_idle());
    let basis: f64 = set.allocations.values().map(|a| a.total_cost()).sum();
    if basis <= 0.0 {
        return;
    }
    for alloc in set.allocations.values_mut() {
        alloc.shared_cost += idle_cost * alloc.total_cost() / basis;
    }
}

impl AllocationEngine {
    /// The external entry point: batch the window, compute each sub-window,
    /// then filter, aggregate, and accumulate in that order. Metadata and
    /// maxima lost to the fold are collected into side maps up front and
    /// reattached to the result.
    pub async fn compute_allocation(
        &self,
        request: &AllocationRequest,
        cancel: &CancellationToken,
    ) -> Result<AllocationSetRange, CostError> {
        let options = ComputeOptions {
            ingest_uid: request.ingest_uid,
            include_idle: request.include_idle,
            idle_by_node: request.idle_by_node,
        };
        let batches = request.window.batches(self.source().batch_duration());
        debug!(
            "allocation over {} in {} batch(es)",
            request.window,
            batches.len()
        );

        let mut range = AllocationSetRange::new();
        let mut side_maps = SideMaps::default();
        for batch in &batches {
            let mut set = self.compute_window(batch, &options, cancel).await?;
            if request.share_load_balancer {
                share_load_balancer_costs(&mut set);
            }
            set.filter(&request.filter);
            side_maps.collect(&set, &request.aggregate);
            set.aggregate_by(&request.aggregate);
            range.append(set)?;
        }

        let mut result = match request.accumulate {
            AccumulateOption::None => range,
            option => range.accumulate_by(option)?,
        };

        for set in result.sets.iter_mut() {
            side_maps.reattach(set);
            if request.share_idle {
                share_idle_costs(set);
            }
            set.sanitize();
        }
        if request.accumulate == AccumulateOption::All {
            if let Some(set) = result.sets.first_mut() {
                set.expand_window_to(&request.window);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticClusterInfo;
    use crate::core::math::{approx_eq, BYTES_PER_GIB};
    use crate::pricing::{ConfigPricing, CustomPricing};
    use crate::source::data_source::{AllocationQuery, DataSource};
    use crate::source::types::{MetricRow, Sample};
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn ts(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn row(pairs: &[(&str, &str)], samples: Vec<Sample>) -> MetricRow {
        MetricRow {
            labels: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            samples,
        }
    }

    fn span(window: &Window, value: f64) -> Vec<Sample> {
        vec![
            Sample {
                timestamp: window.start(),
                value,
            },
            Sample {
                timestamp: window.end(),
                value,
            },
        ]
    }

    /// One pod (`default/web-0`, container `main`) on node `n1`: 0.5 CPU
    /// cores and 1 GiB of RAM, priced at $0.04/core-hr and $0.005/GiB-hr.
    struct FixtureSource {
        batch: Duration,
    }

    #[async_trait]
    impl DataSource for FixtureSource {
        async fn query_range(
            &self,
            query: AllocationQuery,
            window: &Window,
        ) -> Result<Vec<MetricRow>> {
            let pod = &[
                ("namespace", "default"),
                ("pod", "web-0"),
                ("container", "main"),
                ("node", "n1"),
            ];
            Ok(match query {
                AllocationQuery::Pods | AllocationQuery::PodsUid => vec![row(
                    &[("namespace", "default"), ("pod", "web-0"), ("node", "n1")],
                    span(window, 1.0),
                )],
                AllocationQuery::CpuCoresAllocated | AllocationQuery::CpuCoresRequested => {
                    vec![row(pod, span(window, 0.5))]
                }
                AllocationQuery::CpuUsageAvg => vec![row(pod, span(window, 0.25))],
                AllocationQuery::CpuUsageMax => vec![row(pod, span(window, 0.4))],
                AllocationQuery::RamBytesAllocated | AllocationQuery::RamBytesRequested => {
                    vec![row(pod, span(window, BYTES_PER_GIB))]
                }
                AllocationQuery::NodeCostPerCpuHr => vec![row(
                    &[("node", "n1"), ("instance_type", "m5.large")],
                    span(window, 0.04),
                )],
                AllocationQuery::NodeCostPerRamGibHr => vec![row(
                    &[("node", "n1"), ("instance_type", "m5.large")],
                    span(window, 0.005),
                )],
                AllocationQuery::NodeCpuCoresCapacity => {
                    vec![row(&[("node", "n1")], span(window, 4.0))]
                }
                AllocationQuery::PodLabels => vec![row(
                    &[
                        ("namespace", "default"),
                        ("pod", "web-0"),
                        ("label_app", "web"),
                    ],
                    span(window, 1.0),
                )],
                _ => Vec::new(),
            })
        }

        fn resolution(&self) -> Duration {
            Duration::minutes(1)
        }

        fn batch_duration(&self) -> Duration {
            self.batch
        }
    }

    fn engine(batch: Duration) -> AllocationEngine {
        AllocationEngine::new(
            Arc::new(FixtureSource { batch }),
            Arc::new(ConfigPricing::new(CustomPricing::default())),
            Arc::new(StaticClusterInfo::new("c1")),
        )
    }

    #[tokio::test]
    async fn one_pod_hour_prices_out() {
        let window = Window::new(ts(0), ts(60)).unwrap();
        let mut request = AllocationRequest::over(window);
        request.accumulate = AccumulateOption::All;
        request.include_idle = false;

        let range = engine(Duration::hours(24))
            .compute_allocation(&request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(range.len(), 1);
        let set = &range.sets[0];
        let alloc = set.get("c1/n1/default/web-0/main").unwrap();
        assert!(approx_eq(alloc.cpu_cost, 0.02));
        assert!(approx_eq(alloc.ram_cost, 0.005));
        assert!(approx_eq(alloc.total_cost(), 0.025));
        assert_eq!(alloc.properties.labels.get("app").map(String::as_str), Some("web"));
        // Members stay inside the requested window.
        assert!(alloc.start.unwrap() >= window.start());
        assert!(alloc.end.unwrap() <= window.end());
    }

    #[tokio::test]
    async fn batched_computation_accumulates_to_the_single_pass_total() {
        let window = Window::new(ts(0), ts(120)).unwrap();
        let mut request = AllocationRequest::over(window);
        request.accumulate = AccumulateOption::All;
        request.include_idle = false;

        let batched = engine(Duration::hours(1))
            .compute_allocation(&request, &CancellationToken::new())
            .await
            .unwrap();
        let single = engine(Duration::hours(24))
            .compute_allocation(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(batched.len(), 1);
        assert_eq!(single.len(), 1);
        assert!(approx_eq(
            batched.sets[0].total_cost(),
            single.sets[0].total_cost()
        ));
        // Accumulated window expands back to the requested range.
        assert_eq!(batched.sets[0].window, window);
        // Metadata survives the fold via the side maps.
        let alloc = batched.sets[0].get("c1/n1/default/web-0/main").unwrap();
        assert_eq!(alloc.properties.labels.get("app").map(String::as_str), Some("web"));
        // Maxima are recomputed rather than summed across batches.
        let raw = alloc.raw_allocation_only.as_ref().unwrap();
        assert!(approx_eq(raw.cpu_core_usage_max, 0.4));
    }

    #[tokio::test]
    async fn idle_present_iff_requested_and_keyed_by_node_on_demand() {
        let window = Window::new(ts(0), ts(60)).unwrap();
        let mut request = AllocationRequest::over(window);
        request.accumulate = AccumulateOption::All;
        request.include_idle = false;

        let eng = engine(Duration::hours(24));
        let without = eng
            .compute_allocation(&request, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!without.sets[0].allocations.values().any(|a| a.is_idle()));

        request.include_idle = true;
        let with = eng
            .compute_allocation(&request, &CancellationToken::new())
            .await
            .unwrap();
        let idle: Vec<_> = with.sets[0]
            .allocations
            .values()
            .filter(|a| a.is_idle())
            .collect();
        assert_eq!(idle.len(), 1);
        // 4 cores × 1h × $0.04 = $0.16 capacity, $0.02 allocated.
        assert!(approx_eq(idle[0].cpu_cost, 0.14));
        assert!(idle[0].properties.node.is_empty());

        request.idle_by_node = true;
        let by_node = eng
            .compute_allocation(&request, &CancellationToken::new())
            .await
            .unwrap();
        let idle: Vec<_> = by_node.sets[0]
            .allocations
            .values()
            .filter(|a| a.is_idle())
            .collect();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].properties.node, "n1");
    }

    #[tokio::test]
    async fn filter_applies_before_aggregation() {
        let window = Window::new(ts(0), ts(60)).unwrap();
        let mut request = AllocationRequest::over(window);
        request.include_idle = false;
        request.aggregate = vec![AllocationProperty::Namespace];
        request.filter = AllocationFilter::none().with(AllocationProperty::Node, "other");

        let range = engine(Duration::hours(24))
            .compute_allocation(&request, &CancellationToken::new())
            .await
            .unwrap();
        // Node filter ran before the namespace aggregation erased the node.
        assert!(range.sets[0].is_empty());

        request.filter = AllocationFilter::none().with(AllocationProperty::Node, "n1");
        let range = engine(Duration::hours(24))
            .compute_allocation(&request, &CancellationToken::new())
            .await
            .unwrap();
        assert!(range.sets[0].get("default").is_some());
    }

    #[tokio::test]
    async fn share_idle_folds_idle_into_shared_cost() {
        let window = Window::new(ts(0), ts(60)).unwrap();
        let mut request = AllocationRequest::over(window);
        request.accumulate = AccumulateOption::All;
        request.include_idle = true;
        request.share_idle = true;

        let range = engine(Duration::hours(24))
            .compute_allocation(&request, &CancellationToken::new())
            .await
            .unwrap();
        let set = &range.sets[0];
        assert!(!set.allocations.values().any(|a| a.is_idle()));
        let alloc = set.get("c1/n1/default/web-0/main").unwrap();
        // The pod is the only cost bearer, so it absorbs all idle ($0.14).
        assert!(approx_eq(alloc.shared_cost, 0.14));
    }
}
