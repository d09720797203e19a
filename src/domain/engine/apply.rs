use std::collections::HashMap;

use crate::core::keys::PodKey;
use crate::core::math::MAX_SANE_CPU_CORES;
use crate::domain::allocation::allocation::{Allocation, GpuAllocation, RawAllocationOnly};
use crate::domain::engine::pod_map::PodMap;
use crate::source::rows::{ContainerRow, PodValueRow};
use crate::source::types::warn_once;

/// The apply-* functions: each walks one metric's result rows and writes
/// into the pod map. Rows referencing pods the skeleton never saw are
/// silently ignored; the pods query is authoritative.
///
/// Ordering constraints the engine enforces:
/// - allocated before requested (the request-dominates-allocation clamp),
/// - GPU requested before GPU allocated (allocated supersedes),
/// - container slots must exist before the per-pod network splits.

fn with_allocations<F>(map: &mut PodMap, key: &PodKey, container: &str, mut f: F)
where
    F: FnMut(&mut Allocation, f64),
{
    let window = map.window;
    for resolved in map.resolve(key) {
        if let Some(entry) = map.get_mut(&resolved) {
            let hours = entry.hours();
            let alloc = entry.allocation_mut(container, &window);
            f(alloc, hours);
        }
    }
}

fn fill_node(alloc: &mut Allocation, node: &Option<String>) {
    if alloc.properties.node.is_empty() {
        if let Some(node) = node {
            alloc.properties.node = node.clone();
            alloc.name = alloc.properties.name();
        }
    }
}

/// CPU cores allocated. Values past the sanity limit are scrape garbage and
/// zero out; the clamp is logged once per computation run.
pub fn apply_cpu_allocated(map: &mut PodMap, rows: &[ContainerRow]) {
    for row in rows {
        let mut cores = row.row.average();
        if cores > MAX_SANE_CPU_CORES {
            warn_once(
                "cpu_cores_allocated",
                "sanity",
                format!(
                    "cpu allocation {} exceeds {} cores, zeroing",
                    cores, MAX_SANE_CPU_CORES
                ),
            );
            cores = 0.0;
        }
        with_allocations(map, &row.key, &row.container, |alloc, hours| {
            fill_node(alloc, &row.node);
            alloc.cpu_core_hours = cores * hours;
        });
    }
}

/// CPU cores requested. Must run after `apply_cpu_allocated`: when the
/// request exceeds what was recorded as allocated, allocated is clamped
/// *up* to the request, never down.
pub fn apply_cpu_requested(map: &mut PodMap, rows: &[ContainerRow]) {
    for row in rows {
        let mut cores = row.row.average();
        if cores > MAX_SANE_CPU_CORES {
            warn_once(
                "cpu_cores_requested",
                "sanity",
                format!(
                    "cpu request {} exceeds {} cores, zeroing",
                    cores, MAX_SANE_CPU_CORES
                ),
            );
            cores = 0.0;
        }
        with_allocations(map, &row.key, &row.container, |alloc, hours| {
            fill_node(alloc, &row.node);
            alloc.cpu_core_request_average = cores;
            let requested_hours = cores * hours;
            if alloc.cpu_core_hours < requested_hours {
                alloc.cpu_core_hours = requested_hours;
            }
        });
    }
}

pub fn apply_cpu_limits(map: &mut PodMap, rows: &[ContainerRow]) {
    for row in rows {
        let cores = row.row.average();
        with_allocations(map, &row.key, &row.container, |alloc, _| {
            alloc.cpu_core_limit_average = cores;
        });
    }
}

/// CPU usage average; the same 512-core sanity limit applies.
pub fn apply_cpu_usage_avg(map: &mut PodMap, rows: &[ContainerRow]) {
    for row in rows {
        let mut cores = row.row.average();
        if cores > MAX_SANE_CPU_CORES {
            warn_once(
                "cpu_usage_avg",
                "sanity",
                format!(
                    "cpu usage {} exceeds {} cores, zeroing",
                    cores, MAX_SANE_CPU_CORES
                ),
            );
            cores = 0.0;
        }
        with_allocations(map, &row.key, &row.container, |alloc, _| {
            alloc.cpu_core_usage_average = cores;
        });
    }
}

pub fn apply_cpu_usage_max(map: &mut PodMap, rows: &[ContainerRow]) {
    for row in rows {
        let max = row.row.max();
        with_allocations(map, &row.key, &row.container, |alloc, _| {
            raw_mut(alloc).cpu_core_usage_max = max;
        });
    }
}

/// RAM bytes allocated. No sanity limit for RAM.
pub fn apply_ram_allocated(map: &mut PodMap, rows: &[ContainerRow]) {
    for row in rows {
        let bytes = row.row.average();
        with_allocations(map, &row.key, &row.container, |alloc, hours| {
            fill_node(alloc, &row.node);
            alloc.ram_byte_hours = bytes * hours;
        });
    }
}

/// RAM bytes requested; same request-dominates-allocation rule as CPU.
pub fn apply_ram_requested(map: &mut PodMap, rows: &[ContainerRow]) {
    for row in rows {
        let bytes = row.row.average();
        with_allocations(map, &row.key, &row.container, |alloc, hours| {
            fill_node(alloc, &row.node);
            alloc.ram_bytes_request_average = bytes;
            let requested_hours = bytes * hours;
            if alloc.ram_byte_hours < requested_hours {
                alloc.ram_byte_hours = requested_hours;
            }
        });
    }
}

pub fn apply_ram_limits(map: &mut PodMap, rows: &[ContainerRow]) {
    for row in rows {
        let bytes = row.row.average();
        with_allocations(map, &row.key, &row.container, |alloc, _| {
            alloc.ram_byte_limit_average = bytes;
        });
    }
}

pub fn apply_ram_usage_avg(map: &mut PodMap, rows: &[ContainerRow]) {
    for row in rows {
        let bytes = row.row.average();
        with_allocations(map, &row.key, &row.container, |alloc, _| {
            alloc.ram_byte_usage_average = bytes;
        });
    }
}

pub fn apply_ram_usage_max(map: &mut PodMap, rows: &[ContainerRow]) {
    for row in rows {
        let max = row.row.max();
        with_allocations(map, &row.key, &row.container, |alloc, _| {
            raw_mut(alloc).ram_byte_usage_max = max;
        });
    }
}

/// GPUs requested. The resource name selects the shared flag: a fractional
/// shared-GPU resource attributes time slices, not whole devices.
pub fn apply_gpus_requested(map: &mut PodMap, rows: &[ContainerRow]) {
    for row in rows {
        let gpus = row.row.average();
        let is_shared = row
            .resource
            .as_deref()
            .map(|r| r.contains("shared"))
            .unwrap_or(false);
        with_allocations(map, &row.key, &row.container, |alloc, hours| {
            alloc.gpu_request_average = gpus;
            alloc.gpu_hours = gpus * hours;
            alloc
                .gpu
                .get_or_insert_with(GpuAllocation::default)
                .is_shared = is_shared;
        });
    }
}

/// Allocated GPUs supersede the requested quantity when present.
pub fn apply_gpus_allocated(map: &mut PodMap, rows: &[ContainerRow]) {
    for row in rows {
        let gpus = row.row.average();
        with_allocations(map, &row.key, &row.container, |alloc, hours| {
            alloc.gpu_hours = gpus * hours;
        });
    }
}

pub fn apply_gpu_usage_avg(map: &mut PodMap, rows: &[ContainerRow]) {
    for row in rows {
        let usage = row.row.average();
        with_allocations(map, &row.key, &row.container, |alloc, _| {
            alloc.gpu_usage_average = usage;
        });
    }
}

pub fn apply_gpu_usage_max(map: &mut PodMap, rows: &[ContainerRow]) {
    for row in rows {
        let max = row.row.max();
        with_allocations(map, &row.key, &row.container, |alloc, _| {
            raw_mut(alloc).gpu_usage_max = max;
        });
    }
}

/// Device detail (device, model, UUID) for allocations already carrying GPU
/// time.
pub fn apply_gpu_info(map: &mut PodMap, rows: &[ContainerRow]) {
    for row in rows {
        let device = row.row.label("device").unwrap_or_default().to_string();
        let model = row.row.label("modelName").unwrap_or_default().to_string();
        let uuid = row.row.label("UUID").unwrap_or_default().to_string();
        with_allocations(map, &row.key, &row.container, |alloc, _| {
            let gpu = alloc.gpu.get_or_insert_with(GpuAllocation::default);
            gpu.device = device.clone();
            gpu.model = model.clone();
            gpu.uuid = uuid.clone();
        });
    }
}

fn raw_mut(alloc: &mut Allocation) -> &mut RawAllocationOnly {
    alloc
        .raw_allocation_only
        .get_or_insert_with(RawAllocationOnly::default)
}

/// Per-cluster egress unit prices, metric-derived with config fallback.
#[derive(Clone, Copy, Debug, Default)]
pub struct NetworkPrices {
    pub cross_zone_per_gib: f64,
    pub cross_region_per_gib: f64,
    pub internet_per_gib: f64,
}

enum NetworkDirection {
    Transfer,
    Receive,
}

/// Pod-level byte totals split evenly across the pod's containers and then
/// evenly across UID matches when fan-out occurred.
pub fn apply_network_bytes(
    map: &mut PodMap,
    transfer: &[PodValueRow],
    receive: &[PodValueRow],
) {
    apply_network_quantity(map, transfer, NetworkDirection::Transfer);
    apply_network_quantity(map, receive, NetworkDirection::Receive);
}

fn apply_network_quantity(map: &mut PodMap, rows: &[PodValueRow], direction: NetworkDirection) {
    for row in rows {
        let bytes = row.row.sum();
        let matches = map.resolve(&row.key);
        if matches.is_empty() {
            continue;
        }
        let match_count = matches.len() as f64;
        for key in matches {
            if let Some(entry) = map.get_mut(&key) {
                let containers = entry.allocations.len() as f64;
                if containers == 0.0 {
                    continue;
                }
                let share = bytes / containers / match_count;
                for alloc in entry.allocations.values_mut() {
                    match direction {
                        NetworkDirection::Transfer => alloc.network_transfer_bytes += share,
                        NetworkDirection::Receive => alloc.network_receive_bytes += share,
                    }
                }
            }
        }
    }
}

/// Egress GiB decomposed into cross-zone / cross-region / internet buckets,
/// each at its cluster's unit price; `network_cost` accumulates the sum.
pub fn apply_network_costs(
    map: &mut PodMap,
    zone_gib: &[PodValueRow],
    region_gib: &[PodValueRow],
    internet_gib: &[PodValueRow],
    prices: &HashMap<String, NetworkPrices>,
    default_prices: NetworkPrices,
) {
    apply_network_cost_bucket(map, zone_gib, prices, default_prices, Bucket::Zone);
    apply_network_cost_bucket(map, region_gib, prices, default_prices, Bucket::Region);
    apply_network_cost_bucket(map, internet_gib, prices, default_prices, Bucket::Internet);
}

enum Bucket {
    Zone,
    Region,
    Internet,
}

fn apply_network_cost_bucket(
    map: &mut PodMap,
    rows: &[PodValueRow],
    prices: &HashMap<String, NetworkPrices>,
    default_prices: NetworkPrices,
    bucket: Bucket,
) {
    for row in rows {
        let gib = row.row.sum();
        let cluster_prices = prices
            .get(&row.key.cluster)
            .copied()
            .unwrap_or(default_prices);
        let price = match bucket {
            Bucket::Zone => cluster_prices.cross_zone_per_gib,
            Bucket::Region => cluster_prices.cross_region_per_gib,
            Bucket::Internet => cluster_prices.internet_per_gib,
        };
        let cost = gib * price;

        let matches = map.resolve(&row.key);
        if matches.is_empty() {
            continue;
        }
        let match_count = matches.len() as f64;
        for key in matches {
            if let Some(entry) = map.get_mut(&key) {
                let containers = entry.allocations.len() as f64;
                if containers == 0.0 {
                    continue;
                }
                let share = cost / containers / match_count;
                for alloc in entry.allocations.values_mut() {
                    match bucket {
                        Bucket::Zone => alloc.network_cross_zone_cost += share,
                        Bucket::Region => alloc.network_cross_region_cost += share,
                        Bucket::Internet => alloc.network_internet_cost += share,
                    }
                    alloc.network_cost += share;
                }
            }
        }
    }
}
