pub mod apply;
pub mod batch;
pub mod controller;
pub mod load_balancer;
pub mod node_pricing;
pub mod pod_map;
pub mod pv;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cluster::ClusterInfo;
use crate::core::interval::{active_interval, hours_between};
use crate::core::keys::{ControllerKey, NamespaceKey, NodeKey, PodKey};
use crate::core::math::bytes_to_gib;
use crate::core::window::Window;
use crate::domain::allocation::allocation::{Allocation, AllocationProperties, IDLE};
use crate::domain::allocation::set::AllocationSet;
use crate::domain::engine::apply::{
    apply_cpu_allocated, apply_cpu_limits, apply_cpu_requested, apply_cpu_usage_avg,
    apply_cpu_usage_max, apply_gpu_info, apply_gpu_usage_avg, apply_gpu_usage_max,
    apply_gpus_allocated, apply_gpus_requested, apply_network_bytes, apply_network_costs,
    apply_ram_allocated, apply_ram_limits, apply_ram_requested, apply_ram_usage_avg,
    apply_ram_usage_max,
};
use crate::domain::engine::controller::{
    resolve_controllers, resolve_services, selector_map, ControllerInputs, KIND_REPLICASET,
};
use crate::domain::engine::load_balancer::{apply_lb_costs, build_lb_map};
use crate::domain::engine::node_pricing::{apply_node_prices, build_node_pricing, NodePricing};
use crate::domain::engine::pod_map::{query_pods, PodMap};
use crate::domain::engine::pv::{apply_pv_costs, build_pv_map, build_pvc_map};
use crate::domain::network::network_prices;
use crate::errors::CostError;
use crate::pricing::PricingProvider;
use crate::source::data_source::{AllocationQuery, DataSource};
use crate::source::query_group::{GroupKind, QueryGroup};
use crate::source::rows::{
    container_rows, node_rows, owner_rows, pod_rows, pod_value_rows, pv_rows, pvc_mount_rows,
    pvc_rows, service_rows,
};
use crate::source::types::MetricRow;

/// Per-computation toggles. Batching and aggregation live one layer up in
/// `batch`; these are the knobs a single sub-window pass honors.
#[derive(Clone, Copy, Debug)]
pub struct ComputeOptions {
    /// Key pods by UID where the backend reports one; disambiguates pod
    /// name reuse inside one window.
    pub ingest_uid: bool,
    pub include_idle: bool,
    /// Key idle allocations per node instead of per cluster.
    pub idle_by_node: bool,
}

impl Default for ComputeOptions {
    fn default() -> Self {
        ComputeOptions {
            ingest_uid: true,
            include_idle: true,
            idle_by_node: false,
        }
    }
}

/// The allocation computation: scatter the query catalogue over one window,
/// assemble the entity graphs, and synthesize costed allocations.
pub struct AllocationEngine {
    source: Arc<dyn DataSource>,
    pricing: Arc<dyn PricingProvider>,
    cluster: Arc<dyn ClusterInfo>,
}

impl AllocationEngine {
    pub fn new(
        source: Arc<dyn DataSource>,
        pricing: Arc<dyn PricingProvider>,
        cluster: Arc<dyn ClusterInfo>,
    ) -> Self {
        AllocationEngine {
            source,
            pricing,
            cluster,
        }
    }

    pub fn source(&self) -> &dyn DataSource {
        self.source.as_ref()
    }

    /// Compute one sub-window in a single pass. The pods query runs first
    /// (with retries) because every later join keys off its result; the
    /// rest of the catalogue fans out concurrently and is awaited as one
    /// batch. Node unit prices are the only required inputs; everything
    /// else degrades to a warning and attributes no cost.
    pub async fn compute_window(
        &self,
        window: &Window,
        options: &ComputeOptions,
        cancel: &CancellationToken,
    ) -> Result<AllocationSet, CostError> {
        let source = self.source.as_ref();
        let resolution = source.resolution();
        let now = Utc::now();
        let default_cluster = self.cluster.cluster_id();
        let config = self.pricing.config();

        let pods_raw = query_pods(source, window, options.ingest_uid, cancel).await?;
        let pods_query = if options.ingest_uid {
            AllocationQuery::PodsUid
        } else {
            AllocationQuery::Pods
        };
        let pods = pod_rows(&pods_raw, &default_cluster, pods_query);
        let mut map = PodMap::build(&pods, resolution, window, now, options.ingest_uid);
        debug!("computing {} pod(s) over {}", map.len(), window);

        let required = QueryGroup::new(source, *window, cancel.clone(), GroupKind::Required);
        let optional = QueryGroup::new(source, *window, cancel.clone(), GroupKind::Optional);

        let (
            node_cpu_price_raw,
            node_ram_price_raw,
            node_gpu_price_raw,
            cpu_allocated_raw,
            cpu_requested_raw,
            cpu_limit_raw,
            cpu_usage_avg_raw,
            cpu_usage_max_raw,
            ram_allocated_raw,
            ram_requested_raw,
            ram_limit_raw,
            ram_usage_avg_raw,
            ram_usage_max_raw,
            gpus_requested_raw,
            gpus_allocated_raw,
            gpu_usage_avg_raw,
            gpu_usage_max_raw,
            gpu_info_raw,
            node_spot_raw,
            node_labels_raw,
            node_cpu_capacity_raw,
            node_ram_capacity_raw,
            ns_labels_raw,
            ns_annotations_raw,
            pod_labels_raw,
            pod_annotations_raw,
            pv_price_raw,
            pv_bytes_raw,
            pv_active_raw,
            pv_info_raw,
            pvc_info_raw,
            pvc_bytes_raw,
            pvc_mounts_raw,
            net_transfer_raw,
            net_receive_raw,
            net_zone_gib_raw,
            net_zone_price_raw,
            net_region_gib_raw,
            net_region_price_raw,
            net_internet_gib_raw,
            net_internet_price_raw,
            service_selector_raw,
            deployment_selector_raw,
            statefulset_selector_raw,
            daemonset_pods_raw,
            job_pods_raw,
            replicaset_pods_raw,
            rs_unowned_raw,
            rs_rollout_raw,
            lb_price_raw,
            lb_active_raw,
        ) = tokio::join!(
            required.run(AllocationQuery::NodeCostPerCpuHr),
            required.run(AllocationQuery::NodeCostPerRamGibHr),
            required.run(AllocationQuery::NodeCostPerGpuHr),
            optional.run(AllocationQuery::CpuCoresAllocated),
            optional.run(AllocationQuery::CpuCoresRequested),
            optional.run(AllocationQuery::CpuCoresLimit),
            optional.run(AllocationQuery::CpuUsageAvg),
            optional.run(AllocationQuery::CpuUsageMax),
            optional.run(AllocationQuery::RamBytesAllocated),
            optional.run(AllocationQuery::RamBytesRequested),
            optional.run(AllocationQuery::RamBytesLimit),
            optional.run(AllocationQuery::RamUsageAvg),
            optional.run(AllocationQuery::RamUsageMax),
            optional.run(AllocationQuery::GpusRequested),
            optional.run(AllocationQuery::GpusAllocated),
            optional.run(AllocationQuery::GpuUsageAvg),
            optional.run(AllocationQuery::GpuUsageMax),
            optional.run(AllocationQuery::GpuInfo),
            optional.run(AllocationQuery::NodeIsSpot),
            optional.run(AllocationQuery::NodeLabels),
            optional.run(AllocationQuery::NodeCpuCoresCapacity),
            optional.run(AllocationQuery::NodeRamBytesCapacity),
            optional.run(AllocationQuery::NamespaceLabels),
            optional.run(AllocationQuery::NamespaceAnnotations),
            optional.run(AllocationQuery::PodLabels),
            optional.run(AllocationQuery::PodAnnotations),
            optional.run(AllocationQuery::PvCostPerGibHr),
            optional.run(AllocationQuery::PvBytes),
            optional.run(AllocationQuery::PvActiveMinutes),
            optional.run(AllocationQuery::PvInfo),
            optional.run(AllocationQuery::PvcInfo),
            optional.run(AllocationQuery::PvcBytesRequested),
            optional.run(AllocationQuery::PvcPodAllocation),
            optional.run(AllocationQuery::NetworkTransferBytes),
            optional.run(AllocationQuery::NetworkReceiveBytes),
            optional.run(AllocationQuery::NetworkZoneGib),
            optional.run(AllocationQuery::NetworkZoneCostPerGib),
            optional.run(AllocationQuery::NetworkRegionGib),
            optional.run(AllocationQuery::NetworkRegionCostPerGib),
            optional.run(AllocationQuery::NetworkInternetGib),
            optional.run(AllocationQuery::NetworkInternetCostPerGib),
            optional.run(AllocationQuery::ServiceSelectorLabels),
            optional.run(AllocationQuery::DeploymentSelectorLabels),
            optional.run(AllocationQuery::StatefulSetSelectorLabels),
            optional.run(AllocationQuery::DaemonSetPods),
            optional.run(AllocationQuery::JobPods),
            optional.run(AllocationQuery::PodsWithReplicaSetOwner),
            optional.run(AllocationQuery::ReplicaSetsWithoutOwners),
            optional.run(AllocationQuery::ReplicaSetsWithRollout),
            optional.run(AllocationQuery::LbCostPerHr),
            optional.run(AllocationQuery::LbActiveMinutes),
        );

        if cancel.is_cancelled() {
            return Err(CostError::Cancelled);
        }
        if let Some(err) = required.error() {
            return Err(err);
        }

        // Resource hours. Allocated before requested (the clamp), GPU
        // requested before GPU allocated (allocated supersedes).
        apply_cpu_allocated(
            &mut map,
            &container_rows(&cpu_allocated_raw, &default_cluster, AllocationQuery::CpuCoresAllocated),
        );
        apply_cpu_requested(
            &mut map,
            &container_rows(&cpu_requested_raw, &default_cluster, AllocationQuery::CpuCoresRequested),
        );
        apply_cpu_limits(
            &mut map,
            &container_rows(&cpu_limit_raw, &default_cluster, AllocationQuery::CpuCoresLimit),
        );
        apply_cpu_usage_avg(
            &mut map,
            &container_rows(&cpu_usage_avg_raw, &default_cluster, AllocationQuery::CpuUsageAvg),
        );
        apply_cpu_usage_max(
            &mut map,
            &container_rows(&cpu_usage_max_raw, &default_cluster, AllocationQuery::CpuUsageMax),
        );
        apply_ram_allocated(
            &mut map,
            &container_rows(&ram_allocated_raw, &default_cluster, AllocationQuery::RamBytesAllocated),
        );
        apply_ram_requested(
            &mut map,
            &container_rows(&ram_requested_raw, &default_cluster, AllocationQuery::RamBytesRequested),
        );
        apply_ram_limits(
            &mut map,
            &container_rows(&ram_limit_raw, &default_cluster, AllocationQuery::RamBytesLimit),
        );
        apply_ram_usage_avg(
            &mut map,
            &container_rows(&ram_usage_avg_raw, &default_cluster, AllocationQuery::RamUsageAvg),
        );
        apply_ram_usage_max(
            &mut map,
            &container_rows(&ram_usage_max_raw, &default_cluster, AllocationQuery::RamUsageMax),
        );
        apply_gpus_requested(
            &mut map,
            &container_rows(&gpus_requested_raw, &default_cluster, AllocationQuery::GpusRequested),
        );
        apply_gpus_allocated(
            &mut map,
            &container_rows(&gpus_allocated_raw, &default_cluster, AllocationQuery::GpusAllocated),
        );
        apply_gpu_usage_avg(
            &mut map,
            &container_rows(&gpu_usage_avg_raw, &default_cluster, AllocationQuery::GpuUsageAvg),
        );
        apply_gpu_usage_max(
            &mut map,
            &container_rows(&gpu_usage_max_raw, &default_cluster, AllocationQuery::GpuUsageMax),
        );
        apply_gpu_info(
            &mut map,
            &container_rows(&gpu_info_raw, &default_cluster, AllocationQuery::GpuInfo),
        );

        // Metadata and ownership.
        let pod_labels = pod_metadata(&pod_labels_raw, &default_cluster, "label_", AllocationQuery::PodLabels);
        let pod_annotations = pod_metadata(
            &pod_annotations_raw,
            &default_cluster,
            "annotation_",
            AllocationQuery::PodAnnotations,
        );
        let ns_labels = namespace_metadata(&ns_labels_raw, &default_cluster, "label_", AllocationQuery::NamespaceLabels);
        let ns_annotations = namespace_metadata(
            &ns_annotations_raw,
            &default_cluster,
            "annotation_",
            AllocationQuery::NamespaceAnnotations,
        );
        apply_metadata(&mut map, &ns_labels, &pod_labels, MetadataKind::Labels);
        apply_metadata(&mut map, &ns_annotations, &pod_annotations, MetadataKind::Annotations);

        let inputs = ControllerInputs {
            deployment_selectors: selector_map(
                &deployment_selector_raw,
                &default_cluster,
                "deployment",
                AllocationQuery::DeploymentSelectorLabels,
            ),
            statefulset_selectors: selector_map(
                &statefulset_selector_raw,
                &default_cluster,
                "statefulSet",
                AllocationQuery::StatefulSetSelectorLabels,
            ),
            daemonset_pods: owner_rows(&daemonset_pods_raw, &default_cluster, AllocationQuery::DaemonSetPods),
            job_pods: owner_rows(&job_pods_raw, &default_cluster, AllocationQuery::JobPods),
            replicaset_pods: owner_rows(
                &replicaset_pods_raw,
                &default_cluster,
                AllocationQuery::PodsWithReplicaSetOwner,
            ),
            unowned_replicasets: replicaset_set(&rs_unowned_raw, &default_cluster),
            rollout_replicasets: rollout_map(&rs_rollout_raw, &default_cluster),
        };
        resolve_controllers(&mut map, &pod_labels, &inputs);
        resolve_services(
            &mut map,
            &pod_labels,
            &selector_map(
                &service_selector_raw,
                &default_cluster,
                "service",
                AllocationQuery::ServiceSelectorLabels,
            ),
        );

        // Network. Container slots exist by now, so the per-pod splits land.
        apply_network_bytes(
            &mut map,
            &pod_value_rows(&net_transfer_raw, &default_cluster, AllocationQuery::NetworkTransferBytes),
            &pod_value_rows(&net_receive_raw, &default_cluster, AllocationQuery::NetworkReceiveBytes),
        );
        let prices = network_prices(
            &net_zone_price_raw,
            &net_region_price_raw,
            &net_internet_price_raw,
            &default_cluster,
            &config,
        );
        apply_network_costs(
            &mut map,
            &pod_value_rows(&net_zone_gib_raw, &default_cluster, AllocationQuery::NetworkZoneGib),
            &pod_value_rows(&net_region_gib_raw, &default_cluster, AllocationQuery::NetworkRegionGib),
            &pod_value_rows(&net_internet_gib_raw, &default_cluster, AllocationQuery::NetworkInternetGib),
            &prices,
            crate::domain::network::default_network_prices(&config),
        );

        // Storage.
        let pvs = build_pv_map(
            &pv_rows(&pv_price_raw, &default_cluster, AllocationQuery::PvCostPerGibHr),
            &pv_rows(&pv_bytes_raw, &default_cluster, AllocationQuery::PvBytes),
            &pv_rows(&pv_active_raw, &default_cluster, AllocationQuery::PvActiveMinutes),
            &pv_rows(&pv_info_raw, &default_cluster, AllocationQuery::PvInfo),
            resolution,
            window,
            now,
        );
        let mut pvcs = build_pvc_map(
            &pvc_rows(&pvc_info_raw, &default_cluster, AllocationQuery::PvcInfo),
            &pvc_rows(&pvc_bytes_raw, &default_cluster, AllocationQuery::PvcBytesRequested),
            &pvs,
            resolution,
            window,
            now,
        );
        let mounts = pvc_mount_rows(&pvc_mounts_raw, &default_cluster, AllocationQuery::PvcPodAllocation);
        let mut unmounted = apply_pv_costs(&mut map, &pvs, &mut pvcs, &mounts, window);

        // Load balancers, after service tagging.
        let lbs = build_lb_map(
            &service_rows(&lb_price_raw, &default_cluster, "service_name", AllocationQuery::LbCostPerHr),
            &service_rows(&lb_active_raw, &default_cluster, "service_name", AllocationQuery::LbActiveMinutes),
            resolution,
            window,
            now,
        );
        unmounted.extend(apply_lb_costs(&mut map, &lbs, resolution, window));

        // Node pricing last: it turns the accumulated resource hours into
        // cost using the discounted unit prices.
        let node_labels = node_label_map(&node_labels_raw, &default_cluster);
        let nodes = build_node_pricing(
            &node_rows(&node_cpu_price_raw, &default_cluster, AllocationQuery::NodeCostPerCpuHr),
            &node_rows(&node_ram_price_raw, &default_cluster, AllocationQuery::NodeCostPerRamGibHr),
            &node_rows(&node_gpu_price_raw, &default_cluster, AllocationQuery::NodeCostPerGpuHr),
            &node_rows(&node_spot_raw, &default_cluster, AllocationQuery::NodeIsSpot),
            &node_labels,
            self.pricing.as_ref(),
        );
        apply_node_prices(&mut map, &nodes, &config);

        let mut set = AllocationSet::new(*window);
        for entry in map.values() {
            for alloc in entry.allocations.values() {
                let mut alloc = alloc.clone();
                alloc.name = alloc.properties.name();
                set.insert(alloc);
            }
        }
        for alloc in unmounted {
            set.insert(alloc);
        }

        if options.include_idle {
            let idles = idle_allocations(
                &map,
                &nodes,
                &node_rows(&node_cpu_capacity_raw, &default_cluster, AllocationQuery::NodeCpuCoresCapacity),
                &node_rows(&node_ram_capacity_raw, &default_cluster, AllocationQuery::NodeRamBytesCapacity),
                resolution,
                window,
                now,
                options.idle_by_node,
            );
            for alloc in idles {
                set.insert(alloc);
            }
        }

        set.warnings.extend(optional.errors());
        set.sanitize();
        Ok(set)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MetadataKind {
    Labels,
    Annotations,
}

/// Pod-scoped metadata pulled off `label_*` / `annotation_*` row labels.
fn pod_metadata(
    rows: &[MetricRow],
    default_cluster: &str,
    prefix: &str,
    query: AllocationQuery,
) -> HashMap<PodKey, BTreeMap<String, String>> {
    let mut out: HashMap<PodKey, BTreeMap<String, String>> = HashMap::new();
    for row in pod_value_rows(rows, default_cluster, query) {
        let meta = row.row.prefixed_labels(prefix);
        if meta.is_empty() {
            continue;
        }
        out.entry(row.key).or_default().extend(meta);
    }
    out
}

fn namespace_metadata(
    rows: &[MetricRow],
    default_cluster: &str,
    prefix: &str,
    query: AllocationQuery,
) -> HashMap<NamespaceKey, BTreeMap<String, String>> {
    let mut out: HashMap<NamespaceKey, BTreeMap<String, String>> = HashMap::new();
    for row in rows {
        let namespace = match row.required("namespace", query.name()) {
            Some(ns) => ns,
            None => continue,
        };
        let meta = row.prefixed_labels(prefix);
        if meta.is_empty() {
            continue;
        }
        out.entry(NamespaceKey::new(row.cluster_or(default_cluster), namespace))
            .or_default()
            .extend(meta);
    }
    out
}

/// Namespace metadata first, pod metadata overlaid on top (pod wins).
fn apply_metadata(
    map: &mut PodMap,
    namespaces: &HashMap<NamespaceKey, BTreeMap<String, String>>,
    pods: &HashMap<PodKey, BTreeMap<String, String>>,
    kind: MetadataKind,
) {
    for entry in map.values_mut() {
        let key = &entry.key;
        let mut merged = namespaces
            .get(&key.namespace_key())
            .cloned()
            .unwrap_or_default();
        let pod_meta = pods.get(key).or_else(|| {
            // Metadata rows carry no UID; strip ours and retry.
            let base = key.pod.split(' ').next()?;
            pods.get(&PodKey::new(&key.cluster, &key.namespace, base))
        });
        if let Some(pod_meta) = pod_meta {
            merged.extend(pod_meta.clone());
        }
        if merged.is_empty() {
            continue;
        }
        for alloc in entry.allocations.values_mut() {
            match kind {
                MetadataKind::Labels => alloc.properties.labels = merged.clone(),
                MetadataKind::Annotations => alloc.properties.annotations = merged.clone(),
            }
        }
    }
}

fn replicaset_set(rows: &[MetricRow], default_cluster: &str) -> HashSet<ControllerKey> {
    rows.iter()
        .filter_map(|row| {
            let namespace = row.required("namespace", "replicasets_without_owners")?;
            let name = row.required("replicaset", "replicasets_without_owners")?;
            Some(ControllerKey::new(
                row.cluster_or(default_cluster),
                namespace,
                KIND_REPLICASET,
                name,
            ))
        })
        .collect()
}

fn rollout_map(rows: &[MetricRow], default_cluster: &str) -> HashMap<ControllerKey, String> {
    rows.iter()
        .filter_map(|row| {
            let namespace = row.required("namespace", "replicasets_with_rollout")?;
            let name = row.required("replicaset", "replicasets_with_rollout")?;
            let rollout = row.required("owner_name", "replicasets_with_rollout")?;
            Some((
                ControllerKey::new(row.cluster_or(default_cluster), namespace, KIND_REPLICASET, name),
                rollout.to_string(),
            ))
        })
        .collect()
}

fn node_label_map(
    rows: &[MetricRow],
    default_cluster: &str,
) -> HashMap<NodeKey, BTreeMap<String, String>> {
    let mut out: HashMap<NodeKey, BTreeMap<String, String>> = HashMap::new();
    for row in rows {
        let node = match row.required("node", "node_labels") {
            Some(n) => n,
            None => continue,
        };
        let labels = row.prefixed_labels("label_");
        if labels.is_empty() {
            continue;
        }
        out.entry(NodeKey::new(row.cluster_or(default_cluster), node))
            .or_default()
            .extend(labels);
    }
    out
}

/// Idle = node capacity cost − cost attributed to allocations on that node,
/// floored at zero per resource. Capacity rows define each node's active
/// interval; nodes with no capacity rows produce no idle.
#[allow(clippy::too_many_arguments)]
fn idle_allocations(
    map: &PodMap,
    nodes: &HashMap<NodeKey, NodePricing>,
    cpu_capacity: &[crate::source::rows::NodeRow],
    ram_capacity: &[crate::source::rows::NodeRow],
    resolution: Duration,
    window: &Window,
    now: DateTime<Utc>,
    idle_by_node: bool,
) -> Vec<Allocation> {
    #[derive(Default)]
    struct ResourceTotals {
        cpu_core_hours: f64,
        cpu_cost: f64,
        ram_byte_hours: f64,
        ram_cost: f64,
    }

    let mut capacity: HashMap<NodeKey, ResourceTotals> = HashMap::new();
    for row in cpu_capacity {
        let node = match nodes.get(&row.key) {
            Some(n) => n,
            None => continue,
        };
        if let Some((s, e)) = active_interval(&row.row.samples, resolution, window, now) {
            let hours = hours_between(s, e);
            let t = capacity.entry(row.key.clone()).or_default();
            t.cpu_core_hours += row.row.average() * hours;
            t.cpu_cost += row.row.average() * hours * node.cost_per_cpu_core_hr;
        }
    }
    for row in ram_capacity {
        let node = match nodes.get(&row.key) {
            Some(n) => n,
            None => continue,
        };
        if let Some((s, e)) = active_interval(&row.row.samples, resolution, window, now) {
            let hours = hours_between(s, e);
            let t = capacity.entry(row.key.clone()).or_default();
            t.ram_byte_hours += row.row.average() * hours;
            t.ram_cost += bytes_to_gib(row.row.average()) * hours * node.cost_per_ram_gib_hr;
        }
    }

    let mut allocated: HashMap<NodeKey, ResourceTotals> = HashMap::new();
    for entry in map.values() {
        for alloc in entry.allocations.values() {
            if alloc.properties.node.is_empty() {
                continue;
            }
            let key = NodeKey::new(&alloc.properties.cluster, &alloc.properties.node);
            let t = allocated.entry(key).or_default();
            t.cpu_core_hours += alloc.cpu_core_hours;
            t.cpu_cost += alloc.cpu_cost;
            t.ram_byte_hours += alloc.ram_byte_hours;
            t.ram_cost += alloc.ram_cost;
        }
    }

    let mut idles: BTreeMap<String, Allocation> = BTreeMap::new();
    for (node_key, cap) in capacity {
        let used = allocated.remove(&node_key).unwrap_or_default();
        let cpu_cost = (cap.cpu_cost - used.cpu_cost).max(0.0);
        let ram_cost = (cap.ram_cost - used.ram_cost).max(0.0);
        if cpu_cost <= 0.0 && ram_cost <= 0.0 {
            continue;
        }

        let mut alloc = Allocation::new(
            AllocationProperties {
                cluster: node_key.cluster.clone(),
                node: if idle_by_node {
                    node_key.node.clone()
                } else {
                    String::new()
                },
                pod: IDLE.to_string(),
                container: IDLE.to_string(),
                ..Default::default()
            },
            *window,
        );
        alloc.cpu_core_hours = (cap.cpu_core_hours - used.cpu_core_hours).max(0.0);
        alloc.cpu_cost = cpu_cost;
        alloc.ram_byte_hours = (cap.ram_byte_hours - used.ram_byte_hours).max(0.0);
        alloc.ram_cost = ram_cost;

        match idles.get_mut(&alloc.name) {
            Some(existing) => {
                existing.cpu_core_hours += alloc.cpu_core_hours;
                existing.cpu_cost += alloc.cpu_cost;
                existing.ram_byte_hours += alloc.ram_byte_hours;
                existing.ram_cost += alloc.ram_cost;
            }
            None => {
                idles.insert(alloc.name.clone(), alloc);
            }
        }
    }

    idles.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::math::approx_eq;
    use crate::source::rows::{node_rows, pod_rows};
    use crate::source::types::{MetricRow, Sample};
    use chrono::TimeZone;

    fn ts(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap() + Duration::minutes(min as i64)
    }

    fn window() -> Window {
        Window::new(ts(0), ts(60)).unwrap()
    }

    fn node_row(node: &str, value: f64, minutes: &[u32]) -> MetricRow {
        let mut labels = BTreeMap::new();
        labels.insert("node".to_string(), node.to_string());
        MetricRow {
            labels,
            samples: minutes
                .iter()
                .map(|m| Sample {
                    timestamp: ts(*m),
                    value,
                })
                .collect(),
        }
    }

    fn one_pod_map(node: &str, cpu_core_hours: f64, cpu_cost: f64) -> PodMap {
        let mut labels = BTreeMap::new();
        labels.insert("namespace".to_string(), "default".to_string());
        labels.insert("pod".to_string(), "web-0".to_string());
        labels.insert("node".to_string(), node.to_string());
        let row = MetricRow {
            labels,
            samples: vec![
                Sample {
                    timestamp: ts(0),
                    value: 1.0,
                },
                Sample {
                    timestamp: ts(60),
                    value: 1.0,
                },
            ],
        };
        let typed = pod_rows(&[row], "c1", AllocationQuery::Pods);
        let mut map = PodMap::build(&typed, Duration::minutes(1), &window(), ts(60), false);
        let key = PodKey::new("c1", "default", "web-0");
        let w = map.window;
        let entry = map.get_mut(&key).unwrap();
        let alloc = entry.allocation_mut("main", &w);
        alloc.properties.node = node.to_string();
        alloc.cpu_core_hours = cpu_core_hours;
        alloc.cpu_cost = cpu_cost;
        map
    }

    fn pricing_for(node: &str, cpu_price: f64) -> HashMap<NodeKey, NodePricing> {
        HashMap::from([(
            NodeKey::new("c1", node),
            NodePricing {
                key: NodeKey::new("c1", node),
                cost_per_cpu_core_hr: cpu_price,
                cost_per_ram_gib_hr: 0.0,
                cost_per_gpu_hr: 0.0,
                spot: false,
                discount: 0.0,
                provider_id: String::new(),
                node_type: String::new(),
                source: "metrics".to_string(),
            },
        )])
    }

    #[test]
    fn idle_is_capacity_minus_allocated_floored() {
        // 4 cores for 1h at $0.04/core-hr = $0.16; pod used 1 core-hour.
        let map = one_pod_map("n1", 1.0, 0.04);
        let capacity = node_rows(
            &[node_row("n1", 4.0, &[0, 60])],
            "c1",
            AllocationQuery::NodeCpuCoresCapacity,
        );
        let idles = idle_allocations(
            &map,
            &pricing_for("n1", 0.04),
            &capacity,
            &[],
            Duration::minutes(1),
            &window(),
            ts(60),
            false,
        );
        assert_eq!(idles.len(), 1);
        assert!(idles[0].is_idle());
        assert!(approx_eq(idles[0].cpu_cost, 0.12));
        assert!(approx_eq(idles[0].cpu_core_hours, 3.0));
        // Cluster-keyed: no node in the identity.
        assert!(idles[0].properties.node.is_empty());
    }

    #[test]
    fn idle_by_node_keys_per_node() {
        let map = one_pod_map("n1", 1.0, 0.04);
        let capacity = node_rows(
            &[node_row("n1", 4.0, &[0, 60]), node_row("n2", 2.0, &[0, 60])],
            "c1",
            AllocationQuery::NodeCpuCoresCapacity,
        );
        let mut pricing = pricing_for("n1", 0.04);
        pricing.extend(pricing_for("n2", 0.04));
        let idles = idle_allocations(
            &map,
            &pricing,
            &capacity,
            &[],
            Duration::minutes(1),
            &window(),
            ts(60),
            true,
        );
        assert_eq!(idles.len(), 2);
        let nodes: Vec<&str> = idles.iter().map(|a| a.properties.node.as_str()).collect();
        assert!(nodes.contains(&"n1"));
        assert!(nodes.contains(&"n2"));
    }

    #[test]
    fn overallocated_node_produces_no_negative_idle() {
        let map = one_pod_map("n1", 8.0, 0.32);
        let capacity = node_rows(
            &[node_row("n1", 4.0, &[0, 60])],
            "c1",
            AllocationQuery::NodeCpuCoresCapacity,
        );
        let idles = idle_allocations(
            &map,
            &pricing_for("n1", 0.04),
            &capacity,
            &[],
            Duration::minutes(1),
            &window(),
            ts(60),
            false,
        );
        assert!(idles.is_empty());
    }
}
