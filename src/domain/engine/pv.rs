use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::core::interval::{active_interval, hours_between};
use crate::core::keys::{NamespaceKey, PodKey, PvcKey, PvKey};
use crate::core::math::bytes_to_gib;
use crate::core::window::Window;
use crate::domain::allocation::allocation::{
    Allocation, AllocationProperties, PvAllocation, UNMOUNTED,
};
use crate::domain::engine::pod_map::PodMap;
use crate::source::rows::{PvcMountRow, PvcRow, PvRow};
use crate::source::types::warn_once;

/// Persistent volume with its unit price and active interval.
#[derive(Clone, Debug)]
pub struct Pv {
    pub key: PvKey,
    pub bytes: f64,
    pub cost_per_gib_hour: f64,
    pub provider_id: Option<String>,
    pub storage_class: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Pv {
    pub fn hours(&self) -> f64 {
        hours_between(self.start, self.end)
    }

    /// Full cost of the volume over its active interval.
    pub fn cost(&self) -> f64 {
        self.cost_per_gib_hour * bytes_to_gib(self.bytes) * self.hours()
    }

    pub fn byte_hours(&self) -> f64 {
        self.bytes * self.hours()
    }
}

/// Claim binding pods to a volume. A claim that never resolves to a volume
/// is dropped at build time; a claim no pod mounts lands in the namespace
/// unmounted bucket.
#[derive(Clone, Debug)]
pub struct Pvc {
    pub key: PvcKey,
    pub bytes: f64,
    pub volume: PvKey,
    pub mounted: bool,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Pvc {
    pub fn hours(&self) -> f64 {
        hours_between(self.start, self.end)
    }
}

/// Assemble the PV map from the price / bytes / active / info row streams.
pub fn build_pv_map(
    price_rows: &[PvRow],
    bytes_rows: &[PvRow],
    active_rows: &[PvRow],
    info_rows: &[PvRow],
    resolution: Duration,
    window: &Window,
    now: DateTime<Utc>,
) -> HashMap<PvKey, Pv> {
    let mut pvs: HashMap<PvKey, Pv> = HashMap::new();

    for row in active_rows {
        let (start, end) = match active_interval(&row.row.samples, resolution, window, now) {
            Some(interval) => interval,
            None => continue,
        };
        pvs.insert(
            row.key.clone(),
            Pv {
                key: row.key.clone(),
                bytes: 0.0,
                cost_per_gib_hour: 0.0,
                provider_id: row.provider_id.clone(),
                storage_class: row.storage_class.clone(),
                start,
                end,
            },
        );
    }
    for row in price_rows {
        if let Some(pv) = pvs.get_mut(&row.key) {
            pv.cost_per_gib_hour = row.row.average();
        }
    }
    for row in bytes_rows {
        if let Some(pv) = pvs.get_mut(&row.key) {
            pv.bytes = row.row.average();
        }
    }
    for row in info_rows {
        if let Some(pv) = pvs.get_mut(&row.key) {
            if pv.storage_class.is_none() {
                pv.storage_class = row.storage_class.clone();
            }
            if pv.provider_id.is_none() {
                pv.provider_id = row.provider_id.clone();
            }
        }
    }

    debug!("pv map: {} volume(s)", pvs.len());
    pvs
}

/// Assemble the PVC map. A claim referencing a volume absent from the PV
/// map is dropped; the pods query is authoritative for pods, the PV map
/// for volumes.
pub fn build_pvc_map(
    info_rows: &[PvcRow],
    bytes_rows: &[PvcRow],
    pvs: &HashMap<PvKey, Pv>,
    resolution: Duration,
    window: &Window,
    now: DateTime<Utc>,
) -> HashMap<PvcKey, Pvc> {
    let mut pvcs: HashMap<PvcKey, Pvc> = HashMap::new();

    for row in info_rows {
        let volume = match &row.volume {
            Some(v) => v.clone(),
            None => {
                warn_once(
                    "pvc_info",
                    "volumename",
                    format!("pvc {} has no volume reference, dropped", row.key),
                );
                continue;
            }
        };
        if !pvs.contains_key(&volume) {
            warn_once(
                "pvc_info",
                "missing_pv",
                format!("pvc {} references unknown pv {}, dropped", row.key, volume),
            );
            continue;
        }
        let (start, end) = match active_interval(&row.row.samples, resolution, window, now) {
            Some(interval) => interval,
            None => continue,
        };
        pvcs.insert(
            row.key.clone(),
            Pvc {
                key: row.key.clone(),
                bytes: 0.0,
                volume,
                mounted: false,
                start,
                end,
            },
        );
    }
    for row in bytes_rows {
        if let Some(pvc) = pvcs.get_mut(&row.key) {
            pvc.bytes = row.row.average();
        }
    }

    debug!("pvc map: {} claim(s)", pvcs.len());
    pvcs
}

/// Per-pod share of a claim's active interval, weighted by the reciprocal
/// of the concurrent mount count: an endpoint sweep builds the step
/// function of mounters over time, and each pod collects
/// `segment / claim_duration / count` for every segment it covers.
///
/// Coefficients sum to the mounted fraction of the claim interval; any
/// remainder is the unmounted residual the caller routes to a bucket.
pub fn sharing_coefficients(
    pvc_start: DateTime<Utc>,
    pvc_end: DateTime<Utc>,
    mounts: &[(PodKey, DateTime<Utc>, DateTime<Utc>)],
) -> Vec<(PodKey, f64)> {
    let total = hours_between(pvc_start, pvc_end);
    if total <= 0.0 {
        return Vec::new();
    }

    let clamped: Vec<(PodKey, DateTime<Utc>, DateTime<Utc>)> = mounts
        .iter()
        .filter_map(|(key, s, e)| {
            let s = (*s).max(pvc_start);
            let e = (*e).min(pvc_end);
            if e > s {
                Some((key.clone(), s, e))
            } else {
                None
            }
        })
        .collect();

    let mut points: Vec<DateTime<Utc>> = clamped
        .iter()
        .flat_map(|(_, s, e)| [*s, *e])
        .collect();
    points.sort();
    points.dedup();

    let mut coefficients: HashMap<PodKey, f64> = HashMap::new();
    for segment in points.windows(2) {
        let (seg_start, seg_end) = (segment[0], segment[1]);
        let present: Vec<&PodKey> = clamped
            .iter()
            .filter(|(_, s, e)| *s <= seg_start && *e >= seg_end)
            .map(|(key, _, _)| key)
            .collect();
        if present.is_empty() {
            continue;
        }
        let weight = hours_between(seg_start, seg_end) / total / present.len() as f64;
        for key in present {
            *coefficients.entry(key.clone()).or_default() += weight;
        }
    }

    let mut out: Vec<(PodKey, f64)> = coefficients.into_iter().collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

/// Distribute volume cost to mounting pods and materialize unmounted
/// buckets for orphan claims, orphan volumes, and unmounted residuals.
/// Returns the synthetic unmounted allocations for the set.
pub fn apply_pv_costs(
    map: &mut PodMap,
    pvs: &HashMap<PvKey, Pv>,
    pvcs: &mut HashMap<PvcKey, Pvc>,
    mounts: &[PvcMountRow],
    window: &Window,
) -> Vec<Allocation> {
    // pvc -> [(pod, overlap start, overlap end)]
    let mut mounters: HashMap<PvcKey, Vec<(PodKey, DateTime<Utc>, DateTime<Utc>)>> =
        HashMap::new();
    for mount in mounts {
        let pvc = match pvcs.get(&mount.claim) {
            Some(p) => p,
            None => continue,
        };
        for key in map.resolve(&mount.pod) {
            let entry = match map.get(&key) {
                Some(e) => e,
                None => continue,
            };
            let s = entry.start.max(pvc.start);
            let e = entry.end.min(pvc.end);
            if e > s {
                mounters.entry(mount.claim.clone()).or_default().push((key, s, e));
            }
        }
    }

    let mut unmounted: Vec<Allocation> = Vec::new();
    let mut namespace_residuals: HashMap<(NamespaceKey, PvKey), PvAllocation> = HashMap::new();

    for (claim_key, claim_mounters) in &mounters {
        let pvc = match pvcs.get_mut(claim_key) {
            Some(p) => p,
            None => continue,
        };
        pvc.mounted = true;
        let pv = match pvs.get(&pvc.volume) {
            Some(pv) => pv,
            None => continue,
        };

        let pvc_hours = pvc.hours();
        let full_cost = pv.cost_per_gib_hour * bytes_to_gib(pvc.bytes) * pvc_hours;
        let full_byte_hours = pvc.bytes * pvc_hours;

        let coefficients = sharing_coefficients(pvc.start, pvc.end, claim_mounters);
        let mut attributed = 0.0;
        for (pod_key, coefficient) in &coefficients {
            let entry = match map.get_mut(pod_key) {
                Some(e) => e,
                None => continue,
            };
            let containers = entry.allocations.len() as f64;
            if containers == 0.0 {
                continue;
            }
            for alloc in entry.allocations.values_mut() {
                let slot = alloc.pvs.entry(pv.key.to_string()).or_default();
                slot.cost += full_cost * coefficient / containers;
                slot.byte_hours += full_byte_hours * coefficient / containers;
            }
            attributed += coefficient;
        }

        // Unmounted time, plus shares of pods with no container slot to
        // carry the cost.
        let residual = 1.0 - attributed;
        if residual > 1e-9 {
            let slot = namespace_residuals
                .entry((claim_key.namespace_key(), pv.key.clone()))
                .or_default();
            slot.cost += full_cost * residual;
            slot.byte_hours += full_byte_hours * residual;
        }
    }

    // Claims no pod ever mounted.
    for pvc in pvcs.values().filter(|p| !p.mounted) {
        let pv = match pvs.get(&pvc.volume) {
            Some(pv) => pv,
            None => continue,
        };
        let slot = namespace_residuals
            .entry((pvc.key.namespace_key(), pv.key.clone()))
            .or_default();
        slot.cost += pv.cost_per_gib_hour * bytes_to_gib(pvc.bytes) * pvc.hours();
        slot.byte_hours += pvc.bytes * pvc.hours();
    }

    for ((ns_key, pv_key), slot) in namespace_residuals {
        let mut alloc = namespace_unmounted_allocation(&ns_key, window);
        alloc.pvs.insert(pv_key.to_string(), slot);
        unmounted.push(alloc);
    }

    // Volumes no claim references at all.
    let referenced: HashSet<&PvKey> = pvcs.values().map(|p| &p.volume).collect();
    for pv in pvs.values() {
        if referenced.contains(&pv.key) {
            continue;
        }
        let mut alloc = cluster_unmounted_allocation(&pv.key.cluster, window);
        alloc.pvs.insert(
            pv.key.to_string(),
            PvAllocation {
                byte_hours: pv.byte_hours(),
                cost: pv.cost(),
            },
        );
        unmounted.push(alloc);
    }

    unmounted
}

impl PvcKey {
    fn namespace_key(&self) -> NamespaceKey {
        NamespaceKey::new(&self.cluster, &self.namespace)
    }
}

/// Cluster-level `__unmounted__` bucket allocation.
pub fn cluster_unmounted_allocation(cluster: &str, window: &Window) -> Allocation {
    Allocation::new(
        AllocationProperties {
            cluster: cluster.to_string(),
            pod: UNMOUNTED.to_string(),
            container: UNMOUNTED.to_string(),
            ..Default::default()
        },
        *window,
    )
}

/// Namespace-level `<namespace>-unmounted-pvcs` bucket allocation.
pub fn namespace_unmounted_allocation(key: &NamespaceKey, window: &Window) -> Allocation {
    Allocation::new(
        AllocationProperties {
            cluster: key.cluster.clone(),
            namespace: key.namespace.clone(),
            pod: format!("{}-unmounted-pvcs", key.namespace),
            container: UNMOUNTED.to_string(),
            ..Default::default()
        },
        *window,
    )
}
