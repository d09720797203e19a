use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::OnceLock;

use crate::core::keys::{ControllerKey, NamespaceKey, PodKey};
use crate::domain::engine::pod_map::PodMap;
use crate::source::data_source::AllocationQuery;
use crate::source::rows::OwnerRow;
use crate::source::types::MetricRow;

/// Controller resolution: Deployment → StatefulSet → DaemonSet → Job →
/// ReplicaSet/Rollout, later layers overwriting earlier ones.

pub const KIND_DEPLOYMENT: &str = "deployment";
pub const KIND_STATEFULSET: &str = "statefulset";
pub const KIND_DAEMONSET: &str = "daemonset";
pub const KIND_JOB: &str = "job";
pub const KIND_REPLICASET: &str = "replicaset";
pub const KIND_ROLLOUT: &str = "rollout";

/// Selector label sets per controller, keyed by namespace.
pub type SelectorMap = HashMap<NamespaceKey, Vec<(String, BTreeMap<String, String>)>>;

/// Build a controller → selector map from selector-label rows.
///
/// Names that differ only in `_` vs `-` with identical selectors are
/// duplicates from sanitized metric labels; the hyphenated spelling wins
/// and the other is pruned here, at build time.
pub fn selector_map(
    rows: &[MetricRow],
    default_cluster: &str,
    name_label: &str,
    query: AllocationQuery,
) -> SelectorMap {
    let mut map: SelectorMap = HashMap::new();
    for row in rows {
        let namespace = match row.required("namespace", query.name()) {
            Some(ns) => ns,
            None => continue,
        };
        let name = match row.required(name_label, query.name()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        let selector = row.prefixed_labels("label_");
        if selector.is_empty() {
            continue;
        }
        let key = NamespaceKey::new(row.cluster_or(default_cluster), namespace);
        let entries = map.entry(key).or_default();

        let normalized = name.replace('_', "-");
        if let Some(existing) = entries
            .iter_mut()
            .find(|(n, s)| n.replace('_', "-") == normalized && *s == selector)
        {
            if existing.0.contains('_') && !name.contains('_') {
                existing.0 = name;
            }
            continue;
        }
        entries.push((name, selector));
    }
    map
}

fn selector_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    !selector.is_empty() && selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

fn cronjob_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // CronJob-created Jobs carry a trailing scheduled-time suffix: unix
    // seconds (10 digits) or scheduled minutes (8 digits).
    RE.get_or_init(|| Regex::new(r"^(.+)-(\d{10}|\d{8})$").unwrap())
}

/// Strip the CronJob run suffix from a Job name, yielding the CronJob as
/// the controller; plain Job names pass through unchanged.
pub fn normalize_job_name(name: &str) -> String {
    match cronjob_suffix_re().captures(name) {
        Some(c) => c[1].to_string(),
        None => name.to_string(),
    }
}

/// Row-derived controller ownership inputs.
#[derive(Default)]
pub struct ControllerInputs {
    pub deployment_selectors: SelectorMap,
    pub statefulset_selectors: SelectorMap,
    pub daemonset_pods: Vec<OwnerRow>,
    pub job_pods: Vec<OwnerRow>,
    pub replicaset_pods: Vec<OwnerRow>,
    /// ReplicaSets with no owner of their own.
    pub unowned_replicasets: HashSet<ControllerKey>,
    /// ReplicaSets owned by a Rollout, mapped to the rollout name.
    pub rollout_replicasets: HashMap<ControllerKey, String>,
}

/// Write controller kind and name onto every allocation of every matched
/// pod. Layers run in fixed order; the last matching layer wins.
pub fn resolve_controllers(
    map: &mut PodMap,
    pod_labels: &HashMap<PodKey, BTreeMap<String, String>>,
    inputs: &ControllerInputs,
) {
    apply_selector_layer(map, pod_labels, &inputs.deployment_selectors, KIND_DEPLOYMENT);
    apply_selector_layer(map, pod_labels, &inputs.statefulset_selectors, KIND_STATEFULSET);

    apply_owner_layer(map, &inputs.daemonset_pods, |owner| {
        (KIND_DAEMONSET.to_string(), owner.to_string())
    });
    apply_owner_layer(map, &inputs.job_pods, |owner| {
        (KIND_JOB.to_string(), normalize_job_name(owner))
    });

    // Only owner-less ReplicaSets, or ones fronted by a Rollout, control
    // their pods directly; the rest already belong to a Deployment above.
    for row in &inputs.replicaset_pods {
        let rs_id = ControllerKey::new(
            &row.pod.cluster,
            &row.pod.namespace,
            KIND_REPLICASET,
            &row.owner,
        );
        let resolved = if let Some(rollout) = inputs.rollout_replicasets.get(&rs_id) {
            Some((KIND_ROLLOUT.to_string(), rollout.clone()))
        } else if inputs.unowned_replicasets.contains(&rs_id) {
            Some((KIND_REPLICASET.to_string(), row.owner.clone()))
        } else {
            None
        };
        if let Some((kind, controller)) = resolved {
            set_controller(map, &row.pod, &kind, &controller);
        }
    }
}

/// Tag every allocation with the services whose label selectors match its
/// pod. Runs on the same selector machinery as the controller layers.
pub fn resolve_services(
    map: &mut PodMap,
    pod_labels: &HashMap<PodKey, BTreeMap<String, String>>,
    service_selectors: &SelectorMap,
) {
    let pod_keys: Vec<PodKey> = map.keys().cloned().collect();
    for pod_key in pod_keys {
        let labels = match lookup_labels(pod_labels, &pod_key) {
            Some(l) => l,
            None => continue,
        };
        let candidates = match service_selectors.get(&pod_key.namespace_key()) {
            Some(c) => c,
            None => continue,
        };
        let services: Vec<String> = candidates
            .iter()
            .filter(|(_, selector)| selector_matches(selector, labels))
            .map(|(name, _)| name.clone())
            .collect();
        if services.is_empty() {
            continue;
        }
        if let Some(entry) = map.get_mut(&pod_key) {
            for alloc in entry.allocations.values_mut() {
                for service in &services {
                    if !alloc.properties.services.contains(service) {
                        alloc.properties.services.push(service.clone());
                    }
                }
            }
        }
    }
}

fn apply_selector_layer(
    map: &mut PodMap,
    pod_labels: &HashMap<PodKey, BTreeMap<String, String>>,
    selectors: &SelectorMap,
    kind: &str,
) {
    let pod_keys: Vec<PodKey> = map.keys().cloned().collect();
    for pod_key in pod_keys {
        let labels = match lookup_labels(pod_labels, &pod_key) {
            Some(l) => l,
            None => continue,
        };
        let ns_key = pod_key.namespace_key();
        let candidates = match selectors.get(&ns_key) {
            Some(c) => c,
            None => continue,
        };
        let matched = candidates
            .iter()
            .find(|(_, selector)| selector_matches(selector, labels));
        if let Some((name, _)) = matched {
            let name = name.clone();
            set_controller(map, &pod_key, kind, &name);
        }
    }
}

/// Label rows may be keyed without UID while the pod map is UID-ful.
fn lookup_labels<'a>(
    pod_labels: &'a HashMap<PodKey, BTreeMap<String, String>>,
    key: &PodKey,
) -> Option<&'a BTreeMap<String, String>> {
    if let Some(labels) = pod_labels.get(key) {
        return Some(labels);
    }
    // UID-ful key: strip the " <uid>" suffix and retry.
    let base_pod = key.pod.split(' ').next()?;
    pod_labels.get(&PodKey::new(&key.cluster, &key.namespace, base_pod))
}

fn apply_owner_layer<F>(map: &mut PodMap, rows: &[OwnerRow], resolve: F)
where
    F: Fn(&str) -> (String, String),
{
    for row in rows {
        let (kind, controller) = resolve(&row.owner);
        set_controller(map, &row.pod, &kind, &controller);
    }
}

fn set_controller(map: &mut PodMap, key: &PodKey, kind: &str, controller: &str) {
    for resolved in map.resolve(key) {
        if let Some(entry) = map.get_mut(&resolved) {
            for alloc in entry.allocations.values_mut() {
                alloc.properties.controller_kind = kind.to_string();
                alloc.properties.controller = controller.to_string();
            }
        }
    }
}
