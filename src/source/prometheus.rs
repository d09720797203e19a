use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::core::window::Window;
use crate::source::data_source::{AllocationQuery, DataSource};
use crate::source::types::{MetricRow, Sample};

/// PromQL-speaking `DataSource`.
///
/// Each catalogue query maps to one range expression against the metrics the
/// cost exporter and kube-state publish. The engine averages and clamps the
/// returned series itself, so the expressions stay plain selectors.
pub struct PrometheusSource {
    client: reqwest::Client,
    base_url: String,
    resolution: Duration,
    batch_duration: Duration,
}

impl PrometheusSource {
    pub fn new(base_url: &str, resolution: Duration, batch_duration: Duration) -> Self {
        PrometheusSource {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            resolution,
            batch_duration,
        }
    }

    fn expression(query: AllocationQuery) -> &'static str {
        match query {
            AllocationQuery::Pods | AllocationQuery::PodsUid => "avg(kube_pod_container_status_running) by (cluster_id, namespace, pod, uid, node)",
            AllocationQuery::CpuCoresAllocated => "avg(container_cpu_allocation) by (cluster_id, namespace, pod, container, node)",
            AllocationQuery::CpuCoresRequested => "avg(kube_pod_container_resource_requests{resource=\"cpu\"}) by (cluster_id, namespace, pod, container, node)",
            AllocationQuery::CpuCoresLimit => "avg(kube_pod_container_resource_limits{resource=\"cpu\"}) by (cluster_id, namespace, pod, container, node)",
            AllocationQuery::CpuUsageAvg => "avg(rate(container_cpu_usage_seconds_total[5m])) by (cluster_id, namespace, pod, container)",
            AllocationQuery::CpuUsageMax => "max(rate(container_cpu_usage_seconds_total[5m])) by (cluster_id, namespace, pod, container)",
            AllocationQuery::RamBytesAllocated => "avg(container_memory_allocation_bytes) by (cluster_id, namespace, pod, container, node)",
            AllocationQuery::RamBytesRequested => "avg(kube_pod_container_resource_requests{resource=\"memory\"}) by (cluster_id, namespace, pod, container, node)",
            AllocationQuery::RamBytesLimit => "avg(kube_pod_container_resource_limits{resource=\"memory\"}) by (cluster_id, namespace, pod, container, node)",
            AllocationQuery::RamUsageAvg => "avg(container_memory_working_set_bytes) by (cluster_id, namespace, pod, container)",
            AllocationQuery::RamUsageMax => "max(container_memory_working_set_bytes) by (cluster_id, namespace, pod, container)",
            AllocationQuery::GpusRequested => "avg(kube_pod_container_resource_requests{resource=~\"nvidia.*|amd.*gpu\"}) by (cluster_id, namespace, pod, container, resource, node)",
            AllocationQuery::GpusAllocated => "avg(container_gpu_allocation) by (cluster_id, namespace, pod, container, node)",
            AllocationQuery::GpuUsageAvg => "avg(DCGM_FI_DEV_GPU_UTIL) by (cluster_id, namespace, pod, container)",
            AllocationQuery::GpuUsageMax => "max(DCGM_FI_DEV_GPU_UTIL) by (cluster_id, namespace, pod, container)",
            AllocationQuery::GpuInfo => "avg(DCGM_FI_DEV_COUNT) by (cluster_id, namespace, pod, container, device, modelName, UUID)",
            AllocationQuery::NodeCostPerCpuHr => "avg(node_cpu_hourly_cost) by (cluster_id, node, instance_type, provider_id)",
            AllocationQuery::NodeCostPerRamGibHr => "avg(node_ram_hourly_cost) by (cluster_id, node, instance_type, provider_id)",
            AllocationQuery::NodeCostPerGpuHr => "avg(node_gpu_hourly_cost) by (cluster_id, node, instance_type, provider_id)",
            AllocationQuery::NodeCpuCoresCapacity => "avg(kube_node_status_capacity{resource=\"cpu\"}) by (cluster_id, node)",
            AllocationQuery::NodeRamBytesCapacity => "avg(kube_node_status_capacity{resource=\"memory\"}) by (cluster_id, node)",
            AllocationQuery::NodeIsSpot => "avg(kubecost_node_is_spot) by (cluster_id, node)",
            AllocationQuery::NodeLabels => "avg(kube_node_labels) by (cluster_id, node)",
            AllocationQuery::NamespaceLabels => "avg(kube_namespace_labels) by (cluster_id, namespace)",
            AllocationQuery::NamespaceAnnotations => "avg(kube_namespace_annotations) by (cluster_id, namespace)",
            AllocationQuery::PodLabels => "avg(kube_pod_labels) by (cluster_id, namespace, pod)",
            AllocationQuery::PodAnnotations => "avg(kube_pod_annotations) by (cluster_id, namespace, pod)",
            AllocationQuery::PvCostPerGibHr => "avg(pv_hourly_cost) by (cluster_id, persistentvolume, provider_id)",
            AllocationQuery::PvBytes => "avg(kube_persistentvolume_capacity_bytes) by (cluster_id, persistentvolume)",
            AllocationQuery::PvActiveMinutes => "avg(kube_persistentvolume_status_phase{phase=\"Bound\"}) by (cluster_id, persistentvolume)",
            AllocationQuery::PvInfo => "avg(kubecost_pv_info) by (cluster_id, persistentvolume, storageclass, provider_id)",
            AllocationQuery::PvcInfo => "avg(kube_persistentvolumeclaim_info) by (cluster_id, namespace, persistentvolumeclaim, volumename)",
            AllocationQuery::PvcBytesRequested => "avg(kube_persistentvolumeclaim_resource_requests_storage_bytes) by (cluster_id, namespace, persistentvolumeclaim)",
            AllocationQuery::PvcPodAllocation => "avg(pod_pvc_allocation) by (cluster_id, namespace, pod, persistentvolumeclaim)",
            AllocationQuery::NetworkTransferBytes => "sum(increase(container_network_transmit_bytes_total[1h])) by (cluster_id, namespace, pod)",
            AllocationQuery::NetworkReceiveBytes => "sum(increase(container_network_receive_bytes_total[1h])) by (cluster_id, namespace, pod)",
            AllocationQuery::NetworkZoneGib => "sum(increase(kubecost_pod_network_egress_bytes_total{same_zone=\"false\", same_region=\"true\"}[1h])) by (cluster_id, namespace, pod) / 1024 / 1024 / 1024",
            AllocationQuery::NetworkZoneCostPerGib => "avg(kubecost_network_zone_egress_cost) by (cluster_id)",
            AllocationQuery::NetworkRegionGib => "sum(increase(kubecost_pod_network_egress_bytes_total{same_zone=\"false\", same_region=\"false\", internet=\"false\"}[1h])) by (cluster_id, namespace, pod) / 1024 / 1024 / 1024",
            AllocationQuery::NetworkRegionCostPerGib => "avg(kubecost_network_region_egress_cost) by (cluster_id)",
            AllocationQuery::NetworkInternetGib => "sum(increase(kubecost_pod_network_egress_bytes_total{internet=\"true\"}[1h])) by (cluster_id, namespace, pod) / 1024 / 1024 / 1024",
            AllocationQuery::NetworkInternetCostPerGib => "avg(kubecost_network_internet_egress_cost) by (cluster_id)",
            AllocationQuery::ServiceSelectorLabels => "avg(service_selector_labels) by (cluster_id, namespace, service)",
            AllocationQuery::DeploymentSelectorLabels => "avg(deployment_match_labels) by (cluster_id, namespace, deployment)",
            AllocationQuery::StatefulSetSelectorLabels => "avg(statefulSet_match_labels) by (cluster_id, namespace, statefulSet)",
            AllocationQuery::DaemonSetPods => "sum(kube_pod_owner{owner_kind=\"DaemonSet\"}) by (cluster_id, namespace, pod, owner_name)",
            AllocationQuery::JobPods => "sum(kube_pod_owner{owner_kind=\"Job\"}) by (cluster_id, namespace, pod, owner_name)",
            AllocationQuery::PodsWithReplicaSetOwner => "sum(kube_pod_owner{owner_kind=\"ReplicaSet\"}) by (cluster_id, namespace, pod, owner_name)",
            AllocationQuery::ReplicaSetsWithoutOwners => "avg(kube_replicaset_owner{owner_kind=\"<none>\"}) by (cluster_id, namespace, replicaset)",
            AllocationQuery::ReplicaSetsWithRollout => "avg(kube_replicaset_owner{owner_kind=\"Rollout\"}) by (cluster_id, namespace, replicaset, owner_name)",
            AllocationQuery::LbCostPerHr => "avg(kubecost_load_balancer_cost) by (cluster_id, namespace, service_name, ingress_ip)",
            AllocationQuery::LbActiveMinutes => "count(kubecost_load_balancer_cost) by (cluster_id, namespace, service_name)",
        }
    }
}

#[derive(Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    data: Option<PromData>,
}

#[derive(Deserialize)]
struct PromData {
    result: Vec<PromSeries>,
}

#[derive(Deserialize)]
struct PromSeries {
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

/// Convert one query_range response body into metric rows.
pub fn parse_matrix(body: &str) -> Result<Vec<MetricRow>> {
    let response: PromResponse =
        serde_json::from_str(body).context("malformed query_range response")?;
    if response.status != "success" {
        return Err(anyhow!(
            "query_range failed: {}",
            response.error.unwrap_or_else(|| response.status.clone())
        ));
    }
    let data = response
        .data
        .ok_or_else(|| anyhow!("query_range response missing data"))?;

    let mut rows = Vec::with_capacity(data.result.len());
    for series in data.result {
        let mut samples = Vec::with_capacity(series.values.len());
        for (ts, value) in series.values {
            let value: f64 = match value.parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            let timestamp = timestamp_from_epoch(ts)?;
            samples.push(Sample { timestamp, value });
        }
        rows.push(MetricRow {
            labels: series.metric,
            samples,
        });
    }
    Ok(rows)
}

fn timestamp_from_epoch(epoch: f64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(epoch as i64, 0)
        .single()
        .ok_or_else(|| anyhow!("timestamp {} out of range", epoch))
}

#[async_trait]
impl DataSource for PrometheusSource {
    async fn query_range(&self, query: AllocationQuery, window: &Window) -> Result<Vec<MetricRow>> {
        let expression = Self::expression(query);
        let url = format!(
            "{}/api/v1/query_range?query={}&start={}&end={}&step={}s",
            self.base_url,
            urlencoding::encode(expression),
            window.start().timestamp(),
            window.end().timestamp(),
            self.resolution.num_seconds(),
        );
        debug!("query_range {} over {}", query.name(), window);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("{}: request failed", query.name()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("{}: body read failed", query.name()))?;
        if !status.is_success() {
            return Err(anyhow!("{}: http {}: {}", query.name(), status, body));
        }
        parse_matrix(&body).with_context(|| format!("{}: parse failed", query.name()))
    }

    fn resolution(&self) -> Duration {
        self.resolution
    }

    fn batch_duration(&self) -> Duration {
        self.batch_duration
    }
}
