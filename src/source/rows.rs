use crate::core::keys::{NodeKey, PodKey, PvcKey, PvKey, ServiceKey};
use crate::source::data_source::AllocationQuery;
use crate::source::types::{MetricRow, Sample};

/// Typed projections of raw metric rows.
///
/// Each adapter pulls the identifier tuple one consumer keys off and keeps
/// the sample series for interval and value math. A row missing a required
/// identifier is dropped with a deduplicated warning; the skeleton pod map
/// is authoritative, so dropped rows simply attribute no cost.

#[derive(Clone, Debug)]
pub struct PodRow {
    pub key: PodKey,
    pub uid: Option<String>,
    pub node: Option<String>,
    pub samples: Vec<Sample>,
}

pub fn pod_rows(rows: &[MetricRow], default_cluster: &str, query: AllocationQuery) -> Vec<PodRow> {
    rows.iter()
        .filter_map(|row| {
            let namespace = row.required("namespace", query.name())?;
            let pod = row.required("pod", query.name())?;
            Some(PodRow {
                key: PodKey::new(row.cluster_or(default_cluster), namespace, pod),
                uid: row.label("uid").filter(|u| !u.is_empty()).map(String::from),
                node: row.label("node").filter(|n| !n.is_empty()).map(String::from),
                samples: row.samples.clone(),
            })
        })
        .collect()
}

/// Row keyed by (pod, container); the shape of every CPU/RAM/GPU metric.
#[derive(Clone, Debug)]
pub struct ContainerRow {
    pub key: PodKey,
    pub container: String,
    pub node: Option<String>,
    pub resource: Option<String>,
    pub row: MetricRow,
}

pub fn container_rows(
    rows: &[MetricRow],
    default_cluster: &str,
    query: AllocationQuery,
) -> Vec<ContainerRow> {
    rows.iter()
        .filter_map(|row| {
            let namespace = row.required("namespace", query.name())?;
            let pod = row.required("pod", query.name())?;
            let container = row.required("container", query.name())?;
            Some(ContainerRow {
                key: PodKey::new(row.cluster_or(default_cluster), namespace, pod),
                container: container.to_string(),
                node: row.label("node").filter(|n| !n.is_empty()).map(String::from),
                resource: row.label("resource").map(String::from),
                row: row.clone(),
            })
        })
        .collect()
}

/// Row keyed by pod only; network quantities arrive per pod.
#[derive(Clone, Debug)]
pub struct PodValueRow {
    pub key: PodKey,
    pub row: MetricRow,
}

pub fn pod_value_rows(
    rows: &[MetricRow],
    default_cluster: &str,
    query: AllocationQuery,
) -> Vec<PodValueRow> {
    rows.iter()
        .filter_map(|row| {
            let namespace = row.required("namespace", query.name())?;
            let pod = row.required("pod", query.name())?;
            Some(PodValueRow {
                key: PodKey::new(row.cluster_or(default_cluster), namespace, pod),
                row: row.clone(),
            })
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct NodeRow {
    pub key: NodeKey,
    pub instance_type: Option<String>,
    pub provider_id: Option<String>,
    pub row: MetricRow,
}

pub fn node_rows(
    rows: &[MetricRow],
    default_cluster: &str,
    query: AllocationQuery,
) -> Vec<NodeRow> {
    rows.iter()
        .filter_map(|row| {
            let node = row.required("node", query.name())?;
            Some(NodeRow {
                key: NodeKey::new(row.cluster_or(default_cluster), node),
                instance_type: row.label("instance_type").map(String::from),
                provider_id: row.label("provider_id").map(String::from),
                row: row.clone(),
            })
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct PvRow {
    pub key: PvKey,
    pub storage_class: Option<String>,
    pub provider_id: Option<String>,
    pub row: MetricRow,
}

pub fn pv_rows(rows: &[MetricRow], default_cluster: &str, query: AllocationQuery) -> Vec<PvRow> {
    rows.iter()
        .filter_map(|row| {
            let volume = row.required("persistentvolume", query.name())?;
            Some(PvRow {
                key: PvKey::new(row.cluster_or(default_cluster), volume),
                storage_class: row.label("storageclass").map(String::from),
                provider_id: row.label("provider_id").map(String::from),
                row: row.clone(),
            })
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct PvcRow {
    pub key: PvcKey,
    pub volume: Option<PvKey>,
    pub row: MetricRow,
}

pub fn pvc_rows(rows: &[MetricRow], default_cluster: &str, query: AllocationQuery) -> Vec<PvcRow> {
    rows.iter()
        .filter_map(|row| {
            let namespace = row.required("namespace", query.name())?;
            let claim = row.required("persistentvolumeclaim", query.name())?;
            let cluster = row.cluster_or(default_cluster).to_string();
            let volume = row
                .label("volumename")
                .filter(|v| !v.is_empty())
                .map(|v| PvKey::new(&cluster, v));
            Some(PvcRow {
                key: PvcKey::new(&cluster, namespace, claim),
                volume,
                row: row.clone(),
            })
        })
        .collect()
}

/// Row keyed by (pod, claim): which pods mount which claims.
#[derive(Clone, Debug)]
pub struct PvcMountRow {
    pub pod: PodKey,
    pub claim: PvcKey,
}

pub fn pvc_mount_rows(
    rows: &[MetricRow],
    default_cluster: &str,
    query: AllocationQuery,
) -> Vec<PvcMountRow> {
    rows.iter()
        .filter_map(|row| {
            let namespace = row.required("namespace", query.name())?;
            let pod = row.required("pod", query.name())?;
            let claim = row.required("persistentvolumeclaim", query.name())?;
            let cluster = row.cluster_or(default_cluster);
            Some(PvcMountRow {
                pod: PodKey::new(cluster, namespace, pod),
                claim: PvcKey::new(cluster, namespace, claim),
            })
        })
        .collect()
}

/// Service-scoped row (load balancers, service selectors).
#[derive(Clone, Debug)]
pub struct ServiceRow {
    pub key: ServiceKey,
    pub ingress_ip: Option<String>,
    pub row: MetricRow,
}

pub fn service_rows(
    rows: &[MetricRow],
    default_cluster: &str,
    name_label: &str,
    query: AllocationQuery,
) -> Vec<ServiceRow> {
    rows.iter()
        .filter_map(|row| {
            let namespace = row.required("namespace", query.name())?;
            let service = row.required(name_label, query.name())?;
            Some(ServiceRow {
                key: ServiceKey::new(row.cluster_or(default_cluster), namespace, service),
                ingress_ip: row
                    .label("ingress_ip")
                    .filter(|ip| !ip.is_empty())
                    .map(String::from),
                row: row.clone(),
            })
        })
        .collect()
}

/// Pod-to-owner association row (DaemonSet / Job / ReplicaSet ownership).
#[derive(Clone, Debug)]
pub struct OwnerRow {
    pub pod: PodKey,
    pub owner: String,
}

pub fn owner_rows(
    rows: &[MetricRow],
    default_cluster: &str,
    query: AllocationQuery,
) -> Vec<OwnerRow> {
    rows.iter()
        .filter_map(|row| {
            let namespace = row.required("namespace", query.name())?;
            let pod = row.required("pod", query.name())?;
            let owner = row.required("owner_name", query.name())?;
            Some(OwnerRow {
                pod: PodKey::new(row.cluster_or(default_cluster), namespace, pod),
                owner: owner.to_string(),
            })
        })
        .collect()
}
