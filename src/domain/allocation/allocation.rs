use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::math::{bytes_to_gib, sanitize};
use crate::core::window::Window;

/// Synthetic pod name for cluster-level orphaned cost.
pub const UNMOUNTED: &str = "__unmounted__";
/// Synthetic pod name for unused node capacity.
pub const IDLE: &str = "__idle__";

/// Identity of one costed record. Everything here travels as values; the
/// entity graphs reference each other by key, never by pointer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationProperties {
    pub cluster: String,
    pub node: String,
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub controller_kind: String,
    pub controller: String,
    pub services: Vec<String>,
    pub provider_id: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl AllocationProperties {
    /// Canonical allocation name: `cluster/node/namespace/pod/container`.
    pub fn name(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.cluster, self.node, self.namespace, self.pod, self.container
        )
    }

    /// Merge for aggregation/accumulation: fields that agree survive,
    /// fields that differ blank out. Non-scalar properties are dropped
    /// outright; the batching layer reattaches them afterwards.
    fn merge(&mut self, other: &AllocationProperties) {
        fn reconcile(a: &mut String, b: &str) {
            if a != b {
                a.clear();
            }
        }
        reconcile(&mut self.cluster, &other.cluster);
        reconcile(&mut self.node, &other.node);
        reconcile(&mut self.namespace, &other.namespace);
        reconcile(&mut self.pod, &other.pod);
        reconcile(&mut self.container, &other.container);
        reconcile(&mut self.controller_kind, &other.controller_kind);
        reconcile(&mut self.controller, &other.controller);
        reconcile(&mut self.provider_id, &other.provider_id);
        self.services.clear();
        self.labels.clear();
        self.annotations.clear();
    }
}

/// GPU device detail attached when the GPU-info query reports one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuAllocation {
    pub device: String,
    pub model: String,
    pub uuid: String,
    pub is_shared: bool,
}

/// Per-volume share of a pod's storage cost, keyed by `cluster/pvName` so
/// the downstream rollup can reconcile against the volume's own cost.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PvAllocation {
    pub byte_hours: f64,
    pub cost: f64,
}

/// Fields that survive only on raw (unaggregated) allocations: usage maxima
/// and the per-load-balancer cost detail.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawAllocationOnly {
    pub cpu_core_usage_max: f64,
    pub ram_byte_usage_max: f64,
    pub gpu_usage_max: f64,
    pub load_balancers: BTreeMap<String, f64>,
}

/// One costed record for (cluster, node, namespace, pod, container) over a
/// window.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Allocation {
    pub name: String,
    pub properties: AllocationProperties,
    pub window: Option<Window>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,

    pub cpu_core_hours: f64,
    pub cpu_core_request_average: f64,
    pub cpu_core_usage_average: f64,
    pub cpu_core_limit_average: f64,
    pub cpu_cost: f64,

    pub gpu_hours: f64,
    pub gpu_request_average: f64,
    pub gpu_usage_average: f64,
    pub gpu_cost: f64,
    pub gpu: Option<GpuAllocation>,

    pub ram_byte_hours: f64,
    pub ram_bytes_request_average: f64,
    pub ram_byte_usage_average: f64,
    pub ram_byte_limit_average: f64,
    pub ram_cost: f64,

    pub pvs: BTreeMap<String, PvAllocation>,

    pub network_transfer_bytes: f64,
    pub network_receive_bytes: f64,
    pub network_cross_zone_cost: f64,
    pub network_cross_region_cost: f64,
    pub network_internet_cost: f64,
    pub network_cost: f64,

    pub load_balancer_cost: f64,
    pub shared_cost: f64,
    pub external_cost: f64,

    pub raw_allocation_only: Option<RawAllocationOnly>,
}

impl Allocation {
    pub fn new(properties: AllocationProperties, window: Window) -> Self {
        Allocation {
            name: properties.name(),
            properties,
            window: Some(window),
            start: Some(window.start()),
            end: Some(window.end()),
            ..Default::default()
        }
    }

    pub fn minutes(&self) -> f64 {
        match (self.start, self.end) {
            (Some(s), Some(e)) if e > s => (e - s).num_seconds() as f64 / 60.0,
            _ => 0.0,
        }
    }

    pub fn hours(&self) -> f64 {
        self.minutes() / 60.0
    }

    pub fn pv_cost(&self) -> f64 {
        self.pvs.values().map(|pv| pv.cost).sum()
    }

    pub fn pv_byte_hours(&self) -> f64 {
        self.pvs.values().map(|pv| pv.byte_hours).sum()
    }

    /// Sum of all cost components.
    pub fn total_cost(&self) -> f64 {
        self.cpu_cost
            + self.gpu_cost
            + self.ram_cost
            + self.pv_cost()
            + self.network_cost
            + self.load_balancer_cost
            + self.shared_cost
            + self.external_cost
    }

    pub fn is_idle(&self) -> bool {
        self.properties.pod == IDLE
    }

    pub fn is_unmounted(&self) -> bool {
        self.properties.pod == UNMOUNTED || self.properties.pod.ends_with("-unmounted-pvcs")
    }

    /// CPU usage over request; a used-but-unrequested core counts as fully
    /// efficient rather than dividing by zero.
    pub fn cpu_efficiency(&self) -> f64 {
        if self.cpu_core_request_average > 0.0 {
            self.cpu_core_usage_average / self.cpu_core_request_average
        } else if self.cpu_core_usage_average > 0.0 {
            1.0
        } else {
            0.0
        }
    }

    pub fn ram_efficiency(&self) -> f64 {
        if self.ram_bytes_request_average > 0.0 {
            self.ram_byte_usage_average / self.ram_bytes_request_average
        } else if self.ram_byte_usage_average > 0.0 {
            1.0
        } else {
            0.0
        }
    }

    /// Cost-weighted blend of CPU and RAM efficiency.
    pub fn total_efficiency(&self) -> f64 {
        let weight = self.cpu_cost + self.ram_cost;
        if weight <= 0.0 {
            return 0.0;
        }
        (self.cpu_efficiency() * self.cpu_cost + self.ram_efficiency() * self.ram_cost) / weight
    }

    pub fn gib_hours(&self) -> f64 {
        bytes_to_gib(self.ram_byte_hours)
    }

    /// Fold `other` into this allocation. Averages are re-weighted by each
    /// side's active minutes; identity fields that disagree blank out and
    /// non-scalar properties drop (the batching layer reattaches them).
    pub fn add(&mut self, other: &Allocation) {
        let self_minutes = self.minutes();
        let other_minutes = other.minutes();
        let total_minutes = self_minutes + other_minutes;

        let weigh = |a: f64, b: f64| {
            if total_minutes > 0.0 {
                (a * self_minutes + b * other_minutes) / total_minutes
            } else {
                0.0
            }
        };

        self.cpu_core_request_average =
            weigh(self.cpu_core_request_average, other.cpu_core_request_average);
        self.cpu_core_usage_average =
            weigh(self.cpu_core_usage_average, other.cpu_core_usage_average);
        self.cpu_core_limit_average =
            weigh(self.cpu_core_limit_average, other.cpu_core_limit_average);
        self.ram_bytes_request_average = weigh(
            self.ram_bytes_request_average,
            other.ram_bytes_request_average,
        );
        self.ram_byte_usage_average =
            weigh(self.ram_byte_usage_average, other.ram_byte_usage_average);
        self.ram_byte_limit_average =
            weigh(self.ram_byte_limit_average, other.ram_byte_limit_average);
        self.gpu_request_average = weigh(self.gpu_request_average, other.gpu_request_average);
        self.gpu_usage_average = weigh(self.gpu_usage_average, other.gpu_usage_average);

        self.cpu_core_hours += other.cpu_core_hours;
        self.cpu_cost += other.cpu_cost;
        self.gpu_hours += other.gpu_hours;
        self.gpu_cost += other.gpu_cost;
        self.ram_byte_hours += other.ram_byte_hours;
        self.ram_cost += other.ram_cost;
        self.network_transfer_bytes += other.network_transfer_bytes;
        self.network_receive_bytes += other.network_receive_bytes;
        self.network_cross_zone_cost += other.network_cross_zone_cost;
        self.network_cross_region_cost += other.network_cross_region_cost;
        self.network_internet_cost += other.network_internet_cost;
        self.network_cost += other.network_cost;
        self.load_balancer_cost += other.load_balancer_cost;
        self.shared_cost += other.shared_cost;
        self.external_cost += other.external_cost;

        for (key, pv) in &other.pvs {
            let entry = self.pvs.entry(key.clone()).or_default();
            entry.byte_hours += pv.byte_hours;
            entry.cost += pv.cost;
        }

        self.start = match (self.start, other.start) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.end = match (self.end, other.end) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        match (&mut self.window, &other.window) {
            (Some(w), Some(o)) => w.expand_to(o),
            (w @ None, Some(o)) => *w = Some(*o),
            _ => {}
        }

        match (&mut self.raw_allocation_only, &other.raw_allocation_only) {
            (Some(a), Some(b)) => {
                a.cpu_core_usage_max = a.cpu_core_usage_max.max(b.cpu_core_usage_max);
                a.ram_byte_usage_max = a.ram_byte_usage_max.max(b.ram_byte_usage_max);
                a.gpu_usage_max = a.gpu_usage_max.max(b.gpu_usage_max);
                for (lb, cost) in &b.load_balancers {
                    *a.load_balancers.entry(lb.clone()).or_default() += cost;
                }
            }
            (raw @ None, Some(b)) => *raw = Some(b.clone()),
            _ => {}
        }

        if self.gpu != other.gpu {
            self.gpu = None;
        }
        self.properties.merge(&other.properties);
    }

    /// Replace every non-finite number with zero. Runs during finalization,
    /// before serialization.
    pub fn sanitize(&mut self) {
        for v in [
            &mut self.cpu_core_hours,
            &mut self.cpu_core_request_average,
            &mut self.cpu_core_usage_average,
            &mut self.cpu_core_limit_average,
            &mut self.cpu_cost,
            &mut self.gpu_hours,
            &mut self.gpu_request_average,
            &mut self.gpu_usage_average,
            &mut self.gpu_cost,
            &mut self.ram_byte_hours,
            &mut self.ram_bytes_request_average,
            &mut self.ram_byte_usage_average,
            &mut self.ram_byte_limit_average,
            &mut self.ram_cost,
            &mut self.network_transfer_bytes,
            &mut self.network_receive_bytes,
            &mut self.network_cross_zone_cost,
            &mut self.network_cross_region_cost,
            &mut self.network_internet_cost,
            &mut self.network_cost,
            &mut self.load_balancer_cost,
            &mut self.shared_cost,
            &mut self.external_cost,
        ] {
            *v = sanitize(*v);
        }
        for pv in self.pvs.values_mut() {
            pv.byte_hours = sanitize(pv.byte_hours);
            pv.cost = sanitize(pv.cost);
        }
        if let Some(raw) = &mut self.raw_allocation_only {
            raw.cpu_core_usage_max = sanitize(raw.cpu_core_usage_max);
            raw.ram_byte_usage_max = sanitize(raw.ram_byte_usage_max);
            raw.gpu_usage_max = sanitize(raw.gpu_usage_max);
            for cost in raw.load_balancers.values_mut() {
                *cost = sanitize(*cost);
            }
        }
    }
}
