use serde::{Deserialize, Serialize};
use std::fmt;

/// Composite value keys for the in-memory entity graphs.
///
/// Object references travel as keys, never as pointers, which keeps the
/// pod/PVC/PV graph acyclic. Every key carries a canonical slash-joined
/// string form used for logging and for allocation names.

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodKey {
    pub cluster: String,
    pub namespace: String,
    pub pod: String,
}

impl PodKey {
    pub fn new(cluster: &str, namespace: &str, pod: &str) -> Self {
        PodKey {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            pod: pod.to_string(),
        }
    }

    /// Key variant used when pod-UID ingestion is on: the pod segment becomes
    /// `"<name> <uid>"`, disambiguating recycled pod names.
    pub fn with_uid(&self, uid: &str) -> Self {
        PodKey {
            cluster: self.cluster.clone(),
            namespace: self.namespace.clone(),
            pod: format!("{} {}", self.pod, uid),
        }
    }

    pub fn namespace_key(&self) -> NamespaceKey {
        NamespaceKey {
            cluster: self.cluster.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster, self.namespace, self.pod)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespaceKey {
    pub cluster: String,
    pub namespace: String,
}

impl NamespaceKey {
    pub fn new(cluster: &str, namespace: &str) -> Self {
        NamespaceKey {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
        }
    }
}

impl fmt::Display for NamespaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.namespace)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ControllerKey {
    pub cluster: String,
    pub namespace: String,
    pub kind: String,
    pub controller: String,
}

impl ControllerKey {
    pub fn new(cluster: &str, namespace: &str, kind: &str, controller: &str) -> Self {
        ControllerKey {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            controller: controller.to_string(),
        }
    }
}

impl fmt::Display for ControllerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.cluster, self.namespace, self.kind, self.controller
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub cluster: String,
    pub namespace: String,
    pub service: String,
}

impl ServiceKey {
    pub fn new(cluster: &str, namespace: &str, service: &str) -> Self {
        ServiceKey {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            service: service.to_string(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster, self.namespace, self.service)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub cluster: String,
    pub node: String,
}

impl NodeKey {
    pub fn new(cluster: &str, node: &str) -> Self {
        NodeKey {
            cluster: cluster.to_string(),
            node: node.to_string(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.node)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PvKey {
    pub cluster: String,
    pub persistent_volume: String,
}

impl PvKey {
    pub fn new(cluster: &str, persistent_volume: &str) -> Self {
        PvKey {
            cluster: cluster.to_string(),
            persistent_volume: persistent_volume.to_string(),
        }
    }
}

impl fmt::Display for PvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.persistent_volume)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PvcKey {
    pub cluster: String,
    pub namespace: String,
    pub persistent_volume_claim: String,
}

impl PvcKey {
    pub fn new(cluster: &str, namespace: &str, claim: &str) -> Self {
        PvcKey {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            persistent_volume_claim: claim.to_string(),
        }
    }
}

impl fmt::Display for PvcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.cluster, self.namespace, self.persistent_volume_claim
        )
    }
}
