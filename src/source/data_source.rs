use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;

use crate::core::window::Window;
use crate::source::types::MetricRow;

/// The fixed catalogue of queries one allocation computation fans out.
///
/// The engine never builds query strings itself; backends map each variant
/// to whatever expression their store answers and return rows shaped per
/// `MetricRow`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationQuery {
    Pods,
    PodsUid,

    CpuCoresAllocated,
    CpuCoresRequested,
    CpuCoresLimit,
    CpuUsageAvg,
    CpuUsageMax,

    RamBytesAllocated,
    RamBytesRequested,
    RamBytesLimit,
    RamUsageAvg,
    RamUsageMax,

    GpusRequested,
    GpusAllocated,
    GpuUsageAvg,
    GpuUsageMax,
    GpuInfo,

    NodeCostPerCpuHr,
    NodeCostPerRamGibHr,
    NodeCostPerGpuHr,
    NodeCpuCoresCapacity,
    NodeRamBytesCapacity,
    NodeIsSpot,
    NodeLabels,

    NamespaceLabels,
    NamespaceAnnotations,
    PodLabels,
    PodAnnotations,

    PvCostPerGibHr,
    PvBytes,
    PvActiveMinutes,
    PvInfo,
    PvcInfo,
    PvcBytesRequested,
    PvcPodAllocation,

    NetworkTransferBytes,
    NetworkReceiveBytes,
    NetworkZoneGib,
    NetworkZoneCostPerGib,
    NetworkRegionGib,
    NetworkRegionCostPerGib,
    NetworkInternetGib,
    NetworkInternetCostPerGib,

    ServiceSelectorLabels,
    DeploymentSelectorLabels,
    StatefulSetSelectorLabels,
    DaemonSetPods,
    JobPods,
    PodsWithReplicaSetOwner,
    ReplicaSetsWithoutOwners,
    ReplicaSetsWithRollout,

    LbCostPerHr,
    LbActiveMinutes,
}

impl AllocationQuery {
    /// Stable name used in logs and warning templates.
    pub fn name(&self) -> &'static str {
        match self {
            AllocationQuery::Pods => "pods",
            AllocationQuery::PodsUid => "pods_uid",
            AllocationQuery::CpuCoresAllocated => "cpu_cores_allocated",
            AllocationQuery::CpuCoresRequested => "cpu_cores_requested",
            AllocationQuery::CpuCoresLimit => "cpu_cores_limit",
            AllocationQuery::CpuUsageAvg => "cpu_usage_avg",
            AllocationQuery::CpuUsageMax => "cpu_usage_max",
            AllocationQuery::RamBytesAllocated => "ram_bytes_allocated",
            AllocationQuery::RamBytesRequested => "ram_bytes_requested",
            AllocationQuery::RamBytesLimit => "ram_bytes_limit",
            AllocationQuery::RamUsageAvg => "ram_usage_avg",
            AllocationQuery::RamUsageMax => "ram_usage_max",
            AllocationQuery::GpusRequested => "gpus_requested",
            AllocationQuery::GpusAllocated => "gpus_allocated",
            AllocationQuery::GpuUsageAvg => "gpu_usage_avg",
            AllocationQuery::GpuUsageMax => "gpu_usage_max",
            AllocationQuery::GpuInfo => "gpu_info",
            AllocationQuery::NodeCostPerCpuHr => "node_cost_per_cpu_hr",
            AllocationQuery::NodeCostPerRamGibHr => "node_cost_per_ram_gib_hr",
            AllocationQuery::NodeCostPerGpuHr => "node_cost_per_gpu_hr",
            AllocationQuery::NodeCpuCoresCapacity => "node_cpu_cores_capacity",
            AllocationQuery::NodeRamBytesCapacity => "node_ram_bytes_capacity",
            AllocationQuery::NodeIsSpot => "node_is_spot",
            AllocationQuery::NodeLabels => "node_labels",
            AllocationQuery::NamespaceLabels => "namespace_labels",
            AllocationQuery::NamespaceAnnotations => "namespace_annotations",
            AllocationQuery::PodLabels => "pod_labels",
            AllocationQuery::PodAnnotations => "pod_annotations",
            AllocationQuery::PvCostPerGibHr => "pv_cost_per_gib_hr",
            AllocationQuery::PvBytes => "pv_bytes",
            AllocationQuery::PvActiveMinutes => "pv_active_minutes",
            AllocationQuery::PvInfo => "pv_info",
            AllocationQuery::PvcInfo => "pvc_info",
            AllocationQuery::PvcBytesRequested => "pvc_bytes_requested",
            AllocationQuery::PvcPodAllocation => "pvc_pod_allocation",
            AllocationQuery::NetworkTransferBytes => "network_transfer_bytes",
            AllocationQuery::NetworkReceiveBytes => "network_receive_bytes",
            AllocationQuery::NetworkZoneGib => "network_zone_gib",
            AllocationQuery::NetworkZoneCostPerGib => "network_zone_cost_per_gib",
            AllocationQuery::NetworkRegionGib => "network_region_gib",
            AllocationQuery::NetworkRegionCostPerGib => "network_region_cost_per_gib",
            AllocationQuery::NetworkInternetGib => "network_internet_gib",
            AllocationQuery::NetworkInternetCostPerGib => "network_internet_cost_per_gib",
            AllocationQuery::ServiceSelectorLabels => "service_selector_labels",
            AllocationQuery::DeploymentSelectorLabels => "deployment_selector_labels",
            AllocationQuery::StatefulSetSelectorLabels => "statefulset_selector_labels",
            AllocationQuery::DaemonSetPods => "daemonset_pods",
            AllocationQuery::JobPods => "job_pods",
            AllocationQuery::PodsWithReplicaSetOwner => "pods_with_replicaset_owner",
            AllocationQuery::ReplicaSetsWithoutOwners => "replicasets_without_owners",
            AllocationQuery::ReplicaSetsWithRollout => "replicasets_with_rollout",
            AllocationQuery::LbCostPerHr => "lb_cost_per_hr",
            AllocationQuery::LbActiveMinutes => "lb_active_minutes",
        }
    }
}

/// Time-series backend the engine scatters its queries against.
///
/// Implementations must be safe to share across concurrent computations;
/// the engine holds one behind an `Arc` and never mutates it.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Run one catalogue query over the window, returning typed rows.
    async fn query_range(&self, query: AllocationQuery, window: &Window) -> Result<Vec<MetricRow>>;

    /// Uniform sampling step of the backend's series.
    fn resolution(&self) -> Duration;

    /// Largest window the backend answers comfortably in one pass; wider
    /// requests are batched and accumulated.
    fn batch_duration(&self) -> Duration;
}
