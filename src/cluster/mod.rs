use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Catalogue entry for one known cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterEntry {
    pub id: String,
    pub name: String,
    pub provider: Option<String>,
    pub region: Option<String>,
}

/// Seam supplying the default cluster id for rows that omit one, plus a
/// remote catalogue for multi-cluster views.
pub trait ClusterInfo: Send + Sync {
    fn cluster_id(&self) -> String;

    fn clusters(&self) -> Vec<ClusterEntry> {
        Vec::new()
    }

    fn cluster_name(&self, id: &str) -> Option<String> {
        self.clusters()
            .into_iter()
            .find(|c| c.id == id)
            .map(|c| c.name)
    }
}

/// Fixed catalogue, good for single-cluster installs and tests.
pub struct StaticClusterInfo {
    id: String,
    entries: HashMap<String, ClusterEntry>,
}

impl StaticClusterInfo {
    pub fn new(id: &str) -> Self {
        StaticClusterInfo {
            id: id.to_string(),
            entries: HashMap::new(),
        }
    }

    pub fn with_entry(mut self, entry: ClusterEntry) -> Self {
        self.entries.insert(entry.id.clone(), entry);
        self
    }
}

impl ClusterInfo for StaticClusterInfo {
    fn cluster_id(&self) -> String {
        self.id.clone()
    }

    fn clusters(&self) -> Vec<ClusterEntry> {
        let mut entries: Vec<ClusterEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }
}
