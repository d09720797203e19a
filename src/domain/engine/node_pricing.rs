use std::collections::HashMap;
use tracing::debug;

use crate::core::keys::NodeKey;
use crate::core::math::bytes_to_gib;
use crate::domain::engine::pod_map::PodMap;
use crate::pricing::{CustomPricing, PricingProvider};
use crate::source::rows::NodeRow;

/// Effective unit prices for one node after custom-pricing substitution,
/// fallback, and discounting.
#[derive(Clone, Debug)]
pub struct NodePricing {
    pub key: NodeKey,
    pub cost_per_cpu_core_hr: f64,
    pub cost_per_ram_gib_hr: f64,
    pub cost_per_gpu_hr: f64,
    pub spot: bool,
    pub discount: f64,
    pub provider_id: String,
    pub node_type: String,
    /// Where the prices came from; fallback substitutions append
    /// `customCPU` / `customRAM` / `customGPU` markers.
    pub source: String,
}

fn usable(price: f64) -> bool {
    price.is_finite() && price > 0.0
}

/// Build the per-node pricing table from the three price row streams and
/// the spot rows, then apply the combined discount. The GPU unit price is
/// deliberately left undiscounted.
pub fn build_node_pricing(
    cpu_rows: &[NodeRow],
    ram_rows: &[NodeRow],
    gpu_rows: &[NodeRow],
    spot_rows: &[NodeRow],
    node_labels: &HashMap<NodeKey, std::collections::BTreeMap<String, String>>,
    pricing: &dyn PricingProvider,
) -> HashMap<NodeKey, NodePricing> {
    let config = pricing.config();
    let mut nodes: HashMap<NodeKey, NodePricing> = HashMap::new();

    fn node_mut<'a>(
        nodes: &'a mut HashMap<NodeKey, NodePricing>,
        row: &NodeRow,
        node_labels: &HashMap<NodeKey, std::collections::BTreeMap<String, String>>,
    ) -> &'a mut NodePricing {
        nodes.entry(row.key.clone()).or_insert_with(|| {
            let node_type = row
                .instance_type
                .clone()
                .or_else(|| {
                    node_labels
                        .get(&row.key)
                        .and_then(|l| l.get("node_kubernetes_io_instance_type").cloned())
                })
                .unwrap_or_default();
            NodePricing {
                key: row.key.clone(),
                cost_per_cpu_core_hr: 0.0,
                cost_per_ram_gib_hr: 0.0,
                cost_per_gpu_hr: 0.0,
                spot: false,
                discount: 0.0,
                provider_id: row.provider_id.clone().unwrap_or_default(),
                node_type,
                source: "metrics".to_string(),
            }
        })
    }

    for row in cpu_rows {
        node_mut(&mut nodes, row, node_labels).cost_per_cpu_core_hr = row.row.average();
    }
    for row in ram_rows {
        node_mut(&mut nodes, row, node_labels).cost_per_ram_gib_hr = row.row.average();
    }
    for row in gpu_rows {
        node_mut(&mut nodes, row, node_labels).cost_per_gpu_hr = row.row.average();
    }
    for row in spot_rows {
        if let Some(node) = nodes.get_mut(&row.key) {
            node.spot = row.row.average() > 0.0;
        }
    }

    for node in nodes.values_mut() {
        if config.custom_prices_enabled {
            node.cost_per_cpu_core_hr = config.cpu_price(node.spot);
            node.cost_per_ram_gib_hr = config.ram_price(node.spot);
            node.cost_per_gpu_hr = config.gpu_price(node.spot);
            node.source = "custom".to_string();
        } else {
            if !usable(node.cost_per_cpu_core_hr) {
                node.cost_per_cpu_core_hr = config.cpu_price(node.spot);
                node.source.push_str("/customCPU");
            }
            if !usable(node.cost_per_ram_gib_hr) {
                node.cost_per_ram_gib_hr = config.ram_price(node.spot);
                node.source.push_str("/customRAM");
            }
            if !usable(node.cost_per_gpu_hr) {
                node.cost_per_gpu_hr = config.gpu_price(node.spot);
                node.source.push_str("/customGPU");
            }
        }

        let discount = pricing.combined_discount_for_node(&node.node_type, node.spot);
        node.discount = discount;
        node.cost_per_cpu_core_hr *= 1.0 - discount;
        node.cost_per_ram_gib_hr *= 1.0 - discount;
        // GPU price carries no discount.
    }

    debug!("node pricing: {} node(s)", nodes.len());
    nodes
}

/// Multiply every allocation's resource-hours by its node's unit prices.
/// Allocations on unknown nodes fall back to the on-demand custom prices.
pub fn apply_node_prices(
    map: &mut PodMap,
    nodes: &HashMap<NodeKey, NodePricing>,
    config: &CustomPricing,
) {
    for entry in map.values_mut() {
        for alloc in entry.allocations.values_mut() {
            let key = NodeKey::new(&alloc.properties.cluster, &alloc.properties.node);
            let (cpu_price, ram_price, gpu_price) = match nodes.get(&key) {
                Some(node) => {
                    if alloc.properties.provider_id.is_empty() {
                        alloc.properties.provider_id = node.provider_id.clone();
                    }
                    (
                        node.cost_per_cpu_core_hr,
                        node.cost_per_ram_gib_hr,
                        node.cost_per_gpu_hr,
                    )
                }
                None => (
                    config.cpu_price(false),
                    config.ram_price(false),
                    config.gpu_price(false),
                ),
            };
            alloc.cpu_cost = alloc.cpu_core_hours * cpu_price;
            alloc.ram_cost = bytes_to_gib(alloc.ram_byte_hours) * ram_price;
            alloc.gpu_cost = alloc.gpu_hours * gpu_price;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::math::approx_eq;
    use crate::pricing::ConfigPricing;
    use crate::source::data_source::AllocationQuery;
    use crate::source::rows::node_rows;
    use crate::source::types::{MetricRow, Sample};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn node_row(node: &str, value: f64) -> MetricRow {
        let mut labels = BTreeMap::new();
        labels.insert("node".to_string(), node.to_string());
        labels.insert("instance_type".to_string(), "m5.large".to_string());
        MetricRow {
            labels,
            samples: vec![Sample {
                timestamp: Utc.with_ymd_and_hms(2024, 9, 1, 0, 30, 0).unwrap(),
                value,
            }],
        }
    }

    fn typed(rows: &[MetricRow]) -> Vec<NodeRow> {
        node_rows(rows, "c1", AllocationQuery::NodeCostPerCpuHr)
    }

    #[test]
    fn metric_prices_survive_when_usable() {
        let pricing = ConfigPricing::new(CustomPricing::default());
        let nodes = build_node_pricing(
            &typed(&[node_row("n1", 0.04)]),
            &typed(&[node_row("n1", 0.005)]),
            &[],
            &[],
            &HashMap::new(),
            &pricing,
        );
        let node = &nodes[&NodeKey::new("c1", "n1")];
        assert!(approx_eq(node.cost_per_cpu_core_hr, 0.04));
        assert!(approx_eq(node.cost_per_ram_gib_hr, 0.005));
        assert!(node.source.starts_with("metrics"));
        // No GPU price row: fallback marker recorded.
        assert!(node.source.contains("customGPU"));
    }

    #[test]
    fn non_finite_prices_fall_back_and_tag_the_source() {
        let pricing = ConfigPricing::new(CustomPricing::default());
        let nodes = build_node_pricing(
            &typed(&[node_row("n1", f64::NAN)]),
            &typed(&[node_row("n1", 0.0)]),
            &[],
            &[],
            &HashMap::new(),
            &pricing,
        );
        let node = &nodes[&NodeKey::new("c1", "n1")];
        let config = CustomPricing::default();
        assert!(approx_eq(node.cost_per_cpu_core_hr, config.cpu));
        assert!(approx_eq(node.cost_per_ram_gib_hr, config.ram));
        assert!(node.source.contains("customCPU"));
        assert!(node.source.contains("customRAM"));
    }

    #[test]
    fn discount_applies_to_cpu_and_ram_but_not_gpu() {
        let pricing = ConfigPricing::new(CustomPricing {
            discount: 0.5,
            ..CustomPricing::default()
        });
        let nodes = build_node_pricing(
            &typed(&[node_row("n1", 0.04)]),
            &typed(&[node_row("n1", 0.01)]),
            &typed(&[node_row("n1", 1.0)]),
            &[],
            &HashMap::new(),
            &pricing,
        );
        let node = &nodes[&NodeKey::new("c1", "n1")];
        assert!(approx_eq(node.cost_per_cpu_core_hr, 0.02));
        assert!(approx_eq(node.cost_per_ram_gib_hr, 0.005));
        assert!(approx_eq(node.cost_per_gpu_hr, 1.0));
    }

    #[test]
    fn spot_nodes_take_spot_custom_prices() {
        let pricing = ConfigPricing::new(CustomPricing {
            custom_prices_enabled: true,
            ..CustomPricing::default()
        });
        let nodes = build_node_pricing(
            &typed(&[node_row("n1", 0.04)]),
            &[],
            &[],
            &typed(&[node_row("n1", 1.0)]),
            &HashMap::new(),
            &pricing,
        );
        let node = &nodes[&NodeKey::new("c1", "n1")];
        assert!(node.spot);
        let config = CustomPricing::default();
        assert!(approx_eq(node.cost_per_cpu_core_hr, config.spot_cpu));
        assert_eq!(node.source, "custom");
    }
}
