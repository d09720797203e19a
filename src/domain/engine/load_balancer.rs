use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::core::interval::{active_interval, hours_between};
use crate::core::keys::ServiceKey;
use crate::core::provider_id::is_private_ip;
use crate::core::window::Window;
use crate::domain::allocation::allocation::{Allocation, RawAllocationOnly};
use crate::domain::engine::pod_map::PodMap;
use crate::domain::engine::pv::cluster_unmounted_allocation;
use crate::source::rows::ServiceRow;

/// One service-fronting load balancer with its hourly price and active
/// interval. Classification as private follows the RFC1918 ranges over the
/// ingress address.
#[derive(Clone, Debug)]
pub struct LoadBalancer {
    pub key: ServiceKey,
    pub price_per_hour: f64,
    pub ingress_ip: String,
    pub private: bool,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl LoadBalancer {
    pub fn hours(&self) -> f64 {
        hours_between(self.start, self.end)
    }

    /// Total cost over the active interval. Sparse sampling is compensated
    /// by crediting one extra resolution of runtime: the scrape at the edge
    /// of the interval stands for the slice after it, so
    /// `priceHr × overlap × (resolution + overlap) / overlap`.
    pub fn cost(&self, resolution: Duration) -> f64 {
        let overlap = self.hours();
        if overlap <= 0.0 {
            return 0.0;
        }
        let resolution_hours = resolution.num_seconds() as f64 / 3600.0;
        self.price_per_hour * (overlap + resolution_hours)
    }
}

/// Build the LB map from price rows and active-minute rows. A service with
/// no ingress IP never provisioned a balancer and is skipped.
pub fn build_lb_map(
    price_rows: &[ServiceRow],
    active_rows: &[ServiceRow],
    resolution: Duration,
    window: &Window,
    now: DateTime<Utc>,
) -> HashMap<ServiceKey, LoadBalancer> {
    let mut lbs: HashMap<ServiceKey, LoadBalancer> = HashMap::new();

    for row in price_rows {
        let ingress_ip = match &row.ingress_ip {
            Some(ip) => ip.clone(),
            None => continue,
        };
        let (start, end) = match active_interval(&row.row.samples, resolution, window, now) {
            Some(interval) => interval,
            None => continue,
        };
        lbs.insert(
            row.key.clone(),
            LoadBalancer {
                key: row.key.clone(),
                price_per_hour: row.row.average(),
                private: is_private_ip(&ingress_ip),
                ingress_ip,
                start,
                end,
            },
        );
    }
    // Active-minute rows refine the interval when they cover more ground.
    for row in active_rows {
        if let Some(lb) = lbs.get_mut(&row.key) {
            if let Some((start, end)) = active_interval(&row.row.samples, resolution, window, now)
            {
                lb.start = lb.start.min(start);
                lb.end = lb.end.max(end);
            }
        }
    }

    debug!("lb map: {} balancer(s)", lbs.len());
    lbs
}

/// Distribute each balancer's cost across the allocations tagged with its
/// service, weighted by hours of interval overlap. A balancer no allocation
/// is tagged with routes its full cost to the cluster unmounted bucket.
/// Returns the synthetic unmounted allocations.
pub fn apply_lb_costs(
    map: &mut PodMap,
    lbs: &HashMap<ServiceKey, LoadBalancer>,
    resolution: Duration,
    window: &Window,
) -> Vec<Allocation> {
    let mut unmounted: Vec<Allocation> = Vec::new();

    for lb in lbs.values() {
        let total_cost = lb.cost(resolution);
        if total_cost <= 0.0 {
            continue;
        }

        // Gather (pod, container, overlap hours) for tagged allocations.
        let mut weights: Vec<(crate::core::keys::PodKey, String, f64)> = Vec::new();
        let mut total_weight = 0.0;
        for entry in map.values() {
            for (container, alloc) in &entry.allocations {
                if !alloc.properties.services.contains(&lb.key.service) {
                    continue;
                }
                let (Some(s), Some(e)) = (alloc.start, alloc.end) else {
                    continue;
                };
                let overlap = hours_between(s.max(lb.start), e.min(lb.end));
                if overlap > 0.0 {
                    weights.push((entry.key.clone(), container.clone(), overlap));
                    total_weight += overlap;
                }
            }
        }

        if total_weight <= 0.0 {
            let mut alloc = cluster_unmounted_allocation(&lb.key.cluster, window);
            alloc.load_balancer_cost = total_cost;
            alloc
                .raw_allocation_only
                .get_or_insert_with(RawAllocationOnly::default)
                .load_balancers
                .insert(lb.key.to_string(), total_cost);
            unmounted.push(alloc);
            continue;
        }

        for (pod_key, container, weight) in weights {
            if let Some(entry) = map.get_mut(&pod_key) {
                if let Some(alloc) = entry.allocations.get_mut(&container) {
                    let share = total_cost * weight / total_weight;
                    alloc.load_balancer_cost += share;
                    *alloc
                        .raw_allocation_only
                        .get_or_insert_with(RawAllocationOnly::default)
                        .load_balancers
                        .entry(lb.key.to_string())
                        .or_default() += share;
                }
            }
        }
    }

    unmounted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::keys::PodKey;
    use crate::core::math::approx_eq;
    use crate::source::data_source::AllocationQuery;
    use crate::source::rows::pod_rows;
    use crate::source::types::{MetricRow, Sample};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn ts(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap() + Duration::minutes(min as i64)
    }

    fn window() -> Window {
        Window::new(ts(0), ts(60)).unwrap()
    }

    fn lb(service: &str, price: f64, start: u32, end: u32, ip: &str) -> LoadBalancer {
        LoadBalancer {
            key: ServiceKey::new("c1", "default", service),
            price_per_hour: price,
            ingress_ip: ip.to_string(),
            private: is_private_ip(ip),
            start: ts(start),
            end: ts(end),
        }
    }

    fn tagged_pod_map(pods: &[(&str, u32, u32, &str)]) -> PodMap {
        let rows: Vec<MetricRow> = pods
            .iter()
            .map(|(p, s, e, _)| {
                let mut labels = BTreeMap::new();
                labels.insert("namespace".to_string(), "default".to_string());
                labels.insert("pod".to_string(), p.to_string());
                MetricRow {
                    labels,
                    samples: vec![
                        Sample {
                            timestamp: ts(*s),
                            value: 1.0,
                        },
                        Sample {
                            timestamp: ts(*e),
                            value: 1.0,
                        },
                    ],
                }
            })
            .collect();
        let typed = pod_rows(&rows, "c1", AllocationQuery::Pods);
        let mut map = PodMap::build(&typed, Duration::minutes(1), &window(), ts(60), false);
        for (p, _, _, service) in pods {
            let key = PodKey::new("c1", "default", p);
            let w = map.window;
            let entry = map.get_mut(&key).unwrap();
            let alloc = entry.allocation_mut("main", &w);
            alloc.properties.services.push(service.to_string());
        }
        map
    }

    #[test]
    fn cost_adds_one_resolution_of_runtime() {
        let balancer = lb("web", 0.025, 0, 60, "8.8.8.8");
        // 1h of overlap plus 1m of resolution.
        let expected = 0.025 * (1.0 + 1.0 / 60.0);
        assert!(approx_eq(balancer.cost(Duration::minutes(1)), expected));
        assert!(!balancer.private);
    }

    #[test]
    fn cost_distributes_by_overlap_hours() {
        let mut map = tagged_pod_map(&[("a", 0, 60, "web"), ("b", 0, 30, "web")]);
        let balancer = lb("web", 1.0, 0, 60, "10.0.0.5");
        assert!(balancer.private);
        let lbs = HashMap::from([(balancer.key.clone(), balancer)]);
        let unmounted = apply_lb_costs(&mut map, &lbs, Duration::zero(), &window());
        assert!(unmounted.is_empty());

        let cost_a = map
            .get(&PodKey::new("c1", "default", "a"))
            .unwrap()
            .allocations["main"]
            .load_balancer_cost;
        let cost_b = map
            .get(&PodKey::new("c1", "default", "b"))
            .unwrap()
            .allocations["main"]
            .load_balancer_cost;
        // a overlaps 1h, b overlaps 0.5h of a $1.00 balancer-hour.
        assert!(approx_eq(cost_a, 1.0 * (1.0 / 1.5)));
        assert!(approx_eq(cost_b, 1.0 * (0.5 / 1.5)));
        assert!(approx_eq(cost_a + cost_b, 1.0));
    }

    #[test]
    fn untagged_balancer_routes_to_unmounted() {
        let mut map = tagged_pod_map(&[("a", 0, 60, "other")]);
        let balancer = lb("web", 1.0, 0, 60, "8.8.8.8");
        let lbs = HashMap::from([(balancer.key.clone(), balancer)]);
        let unmounted = apply_lb_costs(&mut map, &lbs, Duration::zero(), &window());
        assert_eq!(unmounted.len(), 1);
        assert!(approx_eq(unmounted[0].load_balancer_cost, 1.0));
        assert_eq!(
            unmounted[0]
                .raw_allocation_only
                .as_ref()
                .unwrap()
                .load_balancers["c1/default/web"],
            1.0
        );
    }

    #[test]
    fn services_without_ingress_ip_are_skipped() {
        let mut labels = BTreeMap::new();
        labels.insert("namespace".to_string(), "default".to_string());
        labels.insert("service_name".to_string(), "web".to_string());
        let row = MetricRow {
            labels,
            samples: vec![Sample {
                timestamp: ts(30),
                value: 0.025,
            }],
        };
        let typed = crate::source::rows::service_rows(
            &[row],
            "c1",
            "service_name",
            AllocationQuery::LbCostPerHr,
        );
        let lbs = build_lb_map(&typed, &[], Duration::minutes(1), &window(), ts(60));
        assert!(lbs.is_empty());
    }
}
