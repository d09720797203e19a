use std::collections::BTreeMap;

use crate::domain::allocation::set::AllocationSet;
use crate::pricing::CustomPricing;

/// Per-cluster cost rollup over one allocation set. Node cost is the sum of
/// the compute components (CPU, RAM, GPU) including idle; disk covers
/// persistent volumes including the unmounted buckets.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct ClusterSummary {
    pub cluster: String,
    pub node_cost: f64,
    pub disk_cost: f64,
    pub load_balancer_cost: f64,
    pub network_cost: f64,
    pub management_cost: f64,
    pub cpu_efficiency: f64,
    pub ram_efficiency: f64,
}

impl ClusterSummary {
    pub fn total_cost(&self) -> f64 {
        self.node_cost
            + self.disk_cost
            + self.load_balancer_cost
            + self.network_cost
            + self.management_cost
    }
}

/// Roll an allocation set up into one summary per cluster. The management
/// fee is a flat hourly price over the set's window, charged once per
/// cluster seen.
pub fn summarize_clusters(
    set: &AllocationSet,
    config: &CustomPricing,
) -> BTreeMap<String, ClusterSummary> {
    let mut summaries: BTreeMap<String, ClusterSummary> = BTreeMap::new();
    let window_hours = set.window.hours();

    struct EffAccum {
        cpu_usage: f64,
        cpu_request: f64,
        ram_usage: f64,
        ram_request: f64,
    }
    let mut eff: BTreeMap<String, EffAccum> = BTreeMap::new();

    for alloc in set.allocations.values() {
        let cluster = alloc.properties.cluster.clone();
        let summary = summaries.entry(cluster.clone()).or_insert_with(|| ClusterSummary {
            cluster: cluster.clone(),
            management_cost: config.cluster_management * window_hours,
            ..ClusterSummary::default()
        });

        summary.node_cost += alloc.cpu_cost + alloc.ram_cost + alloc.gpu_cost;
        summary.disk_cost += alloc.pv_cost();
        summary.load_balancer_cost += alloc.load_balancer_cost;
        summary.network_cost += alloc.network_cost;

        if !alloc.is_idle() {
            let hours = alloc.hours();
            let a = eff.entry(cluster).or_insert(EffAccum {
                cpu_usage: 0.0,
                cpu_request: 0.0,
                ram_usage: 0.0,
                ram_request: 0.0,
            });
            a.cpu_usage += alloc.cpu_core_usage_average * hours;
            a.cpu_request += alloc.cpu_core_request_average * hours;
            a.ram_usage += alloc.ram_byte_usage_average * hours;
            a.ram_request += alloc.ram_bytes_request_average * hours;
        }
    }

    for (cluster, a) in eff {
        if let Some(summary) = summaries.get_mut(&cluster) {
            if a.cpu_request > 0.0 {
                summary.cpu_efficiency = a.cpu_usage / a.cpu_request;
            }
            if a.ram_request > 0.0 {
                summary.ram_efficiency = a.ram_usage / a.ram_request;
            }
        }
    }

    summaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::math::approx_eq;
    use crate::core::window::Window;
    use crate::domain::allocation::allocation::{Allocation, PvAllocation};
    use chrono::{TimeZone, Utc};

    fn window() -> Window {
        let start = Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap();
        Window::new(start, start + chrono::Duration::hours(1)).unwrap()
    }

    fn alloc(cluster: &str, pod: &str) -> Allocation {
        let w = window();
        let mut a = Allocation::default();
        a.properties.cluster = cluster.to_string();
        a.properties.namespace = "default".to_string();
        a.properties.pod = pod.to_string();
        a.name = a.properties.name();
        a.window = Some(w);
        a.start = Some(w.start());
        a.end = Some(w.end());
        a
    }

    #[test]
    fn rolls_costs_up_per_cluster() {
        let mut set = AllocationSet::new(window());
        let mut a = alloc("c1", "web-0");
        a.cpu_cost = 0.02;
        a.ram_cost = 0.005;
        a.load_balancer_cost = 0.025;
        a.pvs.insert(
            "c1/pv-1".to_string(),
            PvAllocation {
                byte_hours: 0.0,
                cost: 0.01,
            },
        );
        set.insert(a);
        let mut b = alloc("c2", "db-0");
        b.cpu_cost = 0.04;
        set.insert(b);

        let config = CustomPricing {
            cluster_management: 0.1,
            ..CustomPricing::default()
        };
        let summaries = summarize_clusters(&set, &config);
        assert_eq!(summaries.len(), 2);
        let c1 = &summaries["c1"];
        assert!(approx_eq(c1.node_cost, 0.025));
        assert!(approx_eq(c1.disk_cost, 0.01));
        assert!(approx_eq(c1.load_balancer_cost, 0.025));
        assert!(approx_eq(c1.management_cost, 0.1));
        assert!(approx_eq(c1.total_cost(), 0.16));
        assert!(approx_eq(summaries["c2"].node_cost, 0.04));
    }

    #[test]
    fn efficiency_is_usage_over_request_weighted_by_hours() {
        let mut set = AllocationSet::new(window());
        let mut a = alloc("c1", "web-0");
        a.cpu_core_usage_average = 0.25;
        a.cpu_core_request_average = 0.5;
        set.insert(a);

        let summaries = summarize_clusters(&set, &CustomPricing::default());
        assert!(approx_eq(summaries["c1"].cpu_efficiency, 0.5));
        assert!(approx_eq(summaries["c1"].ram_efficiency, 0.0));
    }
}
