use std::collections::HashMap;

use crate::domain::allocation::set::AllocationSet;
use crate::domain::engine::apply::NetworkPrices;
use crate::pricing::CustomPricing;
use crate::source::types::MetricRow;

/// Resolve per-cluster egress unit prices from the three cost-per-GiB row
/// streams. Clusters with no usable price for a bucket inherit the
/// configured default for that bucket.
pub fn network_prices(
    zone_rows: &[MetricRow],
    region_rows: &[MetricRow],
    internet_rows: &[MetricRow],
    default_cluster: &str,
    config: &CustomPricing,
) -> HashMap<String, NetworkPrices> {
    let defaults = default_network_prices(config);
    let mut prices: HashMap<String, NetworkPrices> = HashMap::new();

    let mut fill = |rows: &[MetricRow], pick: fn(&mut NetworkPrices) -> &mut f64| {
        for row in rows {
            let cluster = row.cluster_or(default_cluster).to_string();
            let value = row.average();
            if !value.is_finite() || value < 0.0 {
                continue;
            }
            let entry = prices.entry(cluster).or_insert(defaults);
            *pick(entry) = value;
        }
    };

    fill(zone_rows, |p| &mut p.cross_zone_per_gib);
    fill(region_rows, |p| &mut p.cross_region_per_gib);
    fill(internet_rows, |p| &mut p.internet_per_gib);

    prices
}

pub fn default_network_prices(config: &CustomPricing) -> NetworkPrices {
    NetworkPrices {
        cross_zone_per_gib: config.zone_network_egress,
        cross_region_per_gib: config.region_network_egress,
        internet_per_gib: config.internet_network_egress,
    }
}

/// Fleet-wide egress cost decomposition, totalled over one allocation set.
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize)]
pub struct EgressBreakdown {
    pub cross_zone_cost: f64,
    pub cross_region_cost: f64,
    pub internet_cost: f64,
    pub total_cost: f64,
    pub transfer_bytes: f64,
    pub receive_bytes: f64,
}

impl EgressBreakdown {
    pub fn from_set(set: &AllocationSet) -> Self {
        let mut out = Self::default();
        for alloc in set.allocations.values() {
            out.cross_zone_cost += alloc.network_cross_zone_cost;
            out.cross_region_cost += alloc.network_cross_region_cost;
            out.internet_cost += alloc.network_internet_cost;
            out.total_cost += alloc.network_cost;
            out.transfer_bytes += alloc.network_transfer_bytes;
            out.receive_bytes += alloc.network_receive_bytes;
        }
        out
    }
}
